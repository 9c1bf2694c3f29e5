//! Worker pool for processing jobs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::config::WorkerConfig;
use crate::engine::Engine;
use crate::error::{QueueError, Result};
use crate::reaper::Reaper;
use crate::settings::Settings;
use crate::store::{ConfigStore, JobStore};
use crate::worker::{worker_identity, Executor, PoolSignals, Worker};

/// Upper bound on one wait while draining, so the deadline is rechecked.
const DRAIN_TICK: Duration = Duration::from_millis(100);

/// A set of workers sharing one engine and executor.
pub struct WorkerPool<S, E> {
    config: WorkerConfig,
    engine: Engine<S>,
    executor: Arc<E>,
    signals: Arc<PoolSignals>,
}

impl<S, E> WorkerPool<S, E>
where
    S: JobStore + ConfigStore + Clone + 'static,
    E: Executor + 'static,
{
    pub fn new(config: WorkerConfig, engine: Engine<S>, executor: E) -> Self {
        Self {
            config,
            engine,
            executor: Arc::new(executor),
            signals: Arc::new(PoolSignals::new()),
        }
    }

    /// Run until Ctrl+C.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }

    /// Run until `shutdown` resolves, then drain and wait for every worker.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        if self.config.num_workers == 0 {
            return Err(QueueError::InvalidConfig {
                key: "num_workers".to_string(),
                reason: "worker count must be at least 1".to_string(),
            });
        }

        self.signals.start();

        let reaper = self.config.stale_after.map(|stale_after| {
            let reaper = Reaper::new(
                self.engine.clone(),
                self.config.reaper_interval,
                stale_after,
                self.signals.clone(),
            );
            tokio::spawn(async move { reaper.run().await })
        });

        let mut workers = JoinSet::new();
        for index in 0..self.config.num_workers {
            let mut worker = Worker::new(
                worker_identity(self.config.worker_prefix.as_deref(), index),
                self.engine.clone(),
                self.executor.clone(),
                self.config.poll_interval,
                self.config.error_backoff,
                self.signals.clone(),
            );
            if let Some(every) = self.config.heartbeat_interval() {
                worker = worker.with_heartbeat(every);
            }
            workers.spawn(async move { worker.run().await });
        }

        tracing::info!(
            workers = self.config.num_workers,
            reaper = self.config.stale_after.is_some(),
            "Worker pool started"
        );

        shutdown.await;
        tracing::info!(
            in_progress = self.in_progress_count(),
            "Stopping, draining in-flight jobs"
        );

        self.shutdown().await;

        // Past the drain deadline: stop waiting on executors. Their jobs stay
        // `running` in the store.
        if self.signals.in_progress() > 0 {
            workers.abort_all();
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Worker exited with error"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::error!(error = %e, "Worker task panicked"),
            }
        }

        // The reaper may be parked on a long interval tick.
        if let Some(reaper) = reaper {
            reaper.abort();
            let _ = reaper.await;
        }

        tracing::info!("Worker pool stopped");
        Ok(())
    }

    /// Stop claiming and give in-flight jobs up to `shutdown_timeout` to finish.
    ///
    /// Jobs still executing after the deadline stay `running` in the store.
    pub async fn shutdown(&self) {
        self.signals.begin_drain();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        while self.signals.in_progress() > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    in_progress = self.signals.in_progress(),
                    "Drain deadline passed, abandoning in-flight jobs"
                );
                break;
            }
            self.signals.wait_for_job(DRAIN_TICK).await;
        }

        self.signals.stop();
    }

    pub fn in_progress_count(&self) -> usize {
        self.signals.in_progress()
    }

    pub fn is_draining(&self) -> bool {
        self.signals.is_draining()
    }
}

/// Resolve once a `worker stop` request newer than the one seen at startup lands.
///
/// Storage errors are logged and polling continues.
pub async fn wait_for_stop_request<C: ConfigStore>(settings: &Settings<C>, poll: Duration) {
    let baseline = match settings.stop_requested_at().await {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read stop marker");
            None
        }
    };

    loop {
        tokio::time::sleep(poll).await;
        match settings.stop_requested_at().await {
            Ok(current) if current.is_some() && current != baseline => {
                tracing::info!("Stop requested");
                return;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to read stop marker"),
        }
    }
}
