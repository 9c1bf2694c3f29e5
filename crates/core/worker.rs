//! Workers that claim, execute and report jobs.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::engine::{Engine, FailOutcome};
use crate::error::{QueueError, Result};
use crate::job::Job;
use crate::store::{ConfigStore, JobStore};

/// Result type for executors.
pub type JobResult = std::result::Result<(), JobError>;

/// Failure reported by an executor for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    /// Error message, recorded as the job's `last_error`.
    pub message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Runs a job's command and reports success or failure.
///
/// Timeouts and process handling are the executor's business; the worker only
/// sees the final outcome.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, command: &str) -> JobResult;
}

/// Build the identity of worker `index` under `prefix`, or `host-pid` by default.
pub fn worker_identity(prefix: Option<&str>, index: usize) -> String {
    match prefix {
        Some(prefix) => format!("{}-{}", prefix, index),
        None => {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            format!("{}-{}-{}", host, std::process::id(), index)
        }
    }
}

/// Run state shared by a pool, its workers and its reaper.
#[derive(Debug, Default)]
pub struct PoolSignals {
    running: AtomicBool,
    draining: AtomicBool,
    in_progress: AtomicUsize,
    job_finished: Notify,
}

impl PoolSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.draining.store(false, Ordering::SeqCst);
    }

    /// Stop claiming new jobs. In-flight jobs keep running.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn in_progress(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }

    fn job_started(&self) {
        self.in_progress.fetch_add(1, Ordering::SeqCst);
    }

    fn job_done(&self) {
        self.in_progress.fetch_sub(1, Ordering::SeqCst);
        self.job_finished.notify_one();
    }

    /// Wait until some in-flight job finishes, or `max_wait` elapses.
    pub async fn wait_for_job(&self, max_wait: Duration) {
        tokio::select! {
            _ = self.job_finished.notified() => {}
            _ = tokio::time::sleep(max_wait) => {}
        }
    }
}

/// A single claim-execute-report loop.
pub struct Worker<S, E> {
    id: String,
    engine: Engine<S>,
    executor: Arc<E>,
    poll_interval: Duration,
    error_backoff: Duration,
    heartbeat_interval: Option<Duration>,
    signals: Arc<PoolSignals>,
}

impl<S, E> Worker<S, E>
where
    S: JobStore + ConfigStore + Clone + 'static,
    E: Executor + 'static,
{
    pub fn new(
        id: String,
        engine: Engine<S>,
        executor: Arc<E>,
        poll_interval: Duration,
        error_backoff: Duration,
        signals: Arc<PoolSignals>,
    ) -> Self {
        Self {
            id,
            engine,
            executor,
            poll_interval,
            error_backoff,
            heartbeat_interval: None,
            signals,
        }
    }

    /// Refresh the claim every `interval` while a job executes.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn run(&self) -> Result<()> {
        tracing::info!(worker_id = %self.id, "Worker started");

        while self.signals.is_running() {
            if self.signals.is_draining() {
                tracing::debug!(worker_id = %self.id, "Draining, no new claims");
                break;
            }

            match self.fetch_and_process().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    tracing::error!(worker_id = %self.id, error = %e, "Worker error");
                    tokio::time::sleep(self.error_backoff).await;
                }
            }
        }

        tracing::info!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }

    /// Claim and run at most one job. Returns `false` when the queue was empty.
    pub async fn fetch_and_process(&self) -> Result<bool> {
        let job = match self.engine.claim(&self.id).await? {
            Some(job) => job,
            None => return Ok(false),
        };

        self.signals.job_started();

        tracing::info!(
            worker_id = %self.id,
            job_id = %job.id,
            command = %job.command,
            "Processing job"
        );

        let result = match self.heartbeat_interval {
            Some(every) => self.execute_with_heartbeat(&job, every).await,
            None => self.executor.execute(&job.command).await,
        };
        let reported = self.report(&job, result).await;

        self.signals.job_done();

        reported.map(|()| true)
    }

    async fn execute_with_heartbeat(&self, job: &Job, every: Duration) -> JobResult {
        let execution = self.executor.execute(&job.command);
        tokio::pin!(execution);

        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The claim itself stamped the first heartbeat.
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut execution => return result,
                _ = ticker.tick() => match self.engine.heartbeat(&job.id, job.version).await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        "Heartbeat found the claim gone"
                    ),
                    Err(e) => tracing::warn!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        error = %e,
                        "Heartbeat failed"
                    ),
                },
            }
        }
    }

    async fn report(&self, job: &Job, result: JobResult) -> Result<()> {
        let reported = match result {
            Ok(()) => self.engine.complete(&job.id, job.version).await.map(|_| ()),
            Err(err) => self
                .engine
                .fail(&job.id, job.version, Some(&err.message))
                .await
                .map(|outcome| {
                    if let FailOutcome::Dead(dead) = outcome {
                        tracing::warn!(
                            worker_id = %self.id,
                            job_id = %dead.id,
                            attempts = dead.attempts,
                            "Job exhausted its retries"
                        );
                    }
                }),
        };

        match reported {
            Err(QueueError::VersionConflict { .. }) => {
                // The claim was released underneath us; whoever holds it now reports.
                tracing::warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    "Claim lost before the result could be recorded"
                );
                Ok(())
            }
            other => other,
        }
    }
}
