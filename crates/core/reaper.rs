//! Reaper component for stale claim recovery.
//!
//! A worker that dies mid-job leaves its job `running` forever. When enabled,
//! the reaper periodically returns claims that have not been touched within the
//! stale threshold to `pending`. Attempts are left unchanged.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::Engine;
use crate::error::Result;
use crate::store::{ConfigStore, JobStore};
use crate::worker::PoolSignals;

/// Reaper that releases stale claims.
pub struct Reaper<S> {
    engine: Engine<S>,
    interval: Duration,
    stale_threshold: Duration,
    signals: Arc<PoolSignals>,
}

impl<S> Reaper<S>
where
    S: JobStore + ConfigStore + Clone + 'static,
{
    /// Create a new reaper.
    pub fn new(
        engine: Engine<S>,
        interval: Duration,
        stale_threshold: Duration,
        signals: Arc<PoolSignals>,
    ) -> Self {
        Self {
            engine,
            interval,
            stale_threshold,
            signals,
        }
    }

    /// Run the reaper loop.
    pub async fn run(&self) -> Result<()> {
        tracing::debug!(
            stale_secs = self.stale_threshold.as_secs(),
            "Reaper started"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.signals.is_running() {
            interval.tick().await;

            if !self.signals.is_running() {
                break;
            }

            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "Failed to release stale claims");
            }
        }

        tracing::debug!("Reaper stopped");
        Ok(())
    }

    /// Release stale claims once. Returns how many jobs were released.
    pub async fn tick(&self) -> Result<usize> {
        let released = self.engine.release_stale(self.stale_threshold).await?;
        if !released.is_empty() {
            tracing::info!(count = released.len(), "Recovered stale claims");
        }
        Ok(released.len())
    }
}
