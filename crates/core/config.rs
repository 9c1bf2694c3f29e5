//! Configuration types for worker pools.

use std::time::Duration;

/// Configuration for the WorkerPool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Sleep between claim attempts when the queue is empty.
    pub poll_interval: Duration,
    /// Sleep after an engine or storage error before trying again.
    pub error_backoff: Duration,
    /// How long to wait for in-flight jobs on shutdown.
    pub shutdown_timeout: Duration,
    /// Release `running` jobs without a heartbeat for this long. `None` disables the reaper.
    pub stale_after: Option<Duration>,
    /// Interval for the reaper loop.
    pub reaper_interval: Duration,
    /// Prefix for worker identities. Defaults to `host-pid`.
    pub worker_prefix: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
            stale_after: None,
            reaper_interval: Duration::from_secs(30),
            worker_prefix: None,
        }
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers.
    pub fn num_workers(mut self, num: usize) -> Self {
        self.config.num_workers = num;
        self
    }

    /// Set the empty-queue poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the pause after an engine error.
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.config.error_backoff = backoff;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Enable the reaper for claims older than `threshold`.
    pub fn stale_after(mut self, threshold: Duration) -> Self {
        self.config.stale_after = Some(threshold);
        self
    }

    /// Set the reaper interval.
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.config.reaper_interval = interval;
        self
    }

    /// Set the worker identity prefix.
    pub fn worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.worker_prefix = Some(prefix.into());
        self
    }

    /// Build the WorkerConfig.
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

/// Floor for the heartbeat period derived from `stale_after`.
const MIN_HEARTBEAT: Duration = Duration::from_millis(50);

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }

    /// Heartbeat period for running jobs, a third of `stale_after`.
    ///
    /// `None` when the reaper is disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.stale_after.map(|stale| (stale / 3).max(MIN_HEARTBEAT))
    }
}
