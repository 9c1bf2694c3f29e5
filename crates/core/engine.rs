//! Job lifecycle engine.
//!
//! Drives jobs through `pending -> running -> {done | pending (backing off) | dead}`.
//! Mutual exclusion between workers comes from [`JobStore::claim`]; every later
//! transition is a conditional write against the version the caller holds.

use std::time::Duration;

use crate::backoff::RetryDecision;
use crate::dlq::DeadLetterQueue;
use crate::error::{QueueError, Result};
use crate::job::{unix_now, Job, JobState, NewJob};
use crate::settings::Settings;
use crate::store::{ConfigStore, JobStore, QueueStats};

/// Result of reporting a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job is pending again and becomes claimable after `delay`.
    Retrying { job: Job, delay: Duration },
    /// Retries are exhausted; the job is in the dead letter queue.
    Dead(Job),
}

impl FailOutcome {
    pub fn job(&self) -> &Job {
        match self {
            FailOutcome::Retrying { job, .. } => job,
            FailOutcome::Dead(job) => job,
        }
    }
}

/// Lifecycle engine over a store that holds both jobs and settings.
#[derive(Debug, Clone)]
pub struct Engine<S> {
    store: S,
    settings: Settings<S>,
}

impl<S> Engine<S>
where
    S: JobStore + ConfigStore + Clone,
{
    pub fn new(store: S) -> Self {
        Self {
            settings: Settings::new(store.clone()),
            store,
        }
    }

    /// Get a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> &Settings<S> {
        &self.settings
    }

    /// Dead letter queue view over the same store.
    pub fn dlq(&self) -> DeadLetterQueue<S> {
        DeadLetterQueue::new(self.store.clone())
    }

    /// Submit a job. A missing `max_retries` takes the `default_max_retries` setting.
    pub async fn enqueue(&self, mut job: NewJob) -> Result<Job> {
        job.validate()?;
        if job.max_retries.is_none() {
            job.max_retries = Some(self.settings.default_max_retries().await?);
        }

        let job = self.store.insert(&job, unix_now()).await?;
        tracing::info!(job_id = %job.id, max_retries = job.max_retries, "Job enqueued");
        Ok(job)
    }

    /// Claim the oldest eligible job for `worker_id`.
    ///
    /// `Ok(None)` means the queue has nothing eligible right now.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        let job = self.store.claim(worker_id, unix_now()).await?;
        if let Some(job) = &job {
            tracing::debug!(
                job_id = %job.id,
                worker_id = %worker_id,
                attempts = job.attempts,
                "Job claimed"
            );
        }
        Ok(job)
    }

    /// Mark a running job as done.
    pub async fn complete(&self, id: &str, expected_version: i64) -> Result<Job> {
        let job = self.load_running(id, expected_version, "complete").await?;

        let now = unix_now();
        let mut update = job.to_update(now);
        update.state = JobState::Done;
        update.claimed_by = None;
        update.last_error = None;

        let job = self.store.update_state(id, expected_version, &update).await?;
        tracing::info!(job_id = %job.id, "Job completed");
        Ok(job)
    }

    /// Record a failed attempt and either reschedule the job or move it to the DLQ.
    pub async fn fail(
        &self,
        id: &str,
        expected_version: i64,
        reason: Option<&str>,
    ) -> Result<FailOutcome> {
        let job = self.load_running(id, expected_version, "fail").await?;
        let backoff = self.settings.backoff().await?;

        let now = unix_now();
        let attempts = job.attempts.saturating_add(1);
        let mut update = job.to_update(now);
        update.attempts = attempts;
        update.claimed_by = None;
        update.last_error = reason.map(str::to_string);

        match backoff.decide(attempts, job.max_retries) {
            RetryDecision::RetryAfter(delay) => {
                let delay_secs = i64::try_from(delay.as_secs()).unwrap_or(i64::MAX);
                update.state = JobState::Pending;
                update.next_run_at = now.saturating_add(delay_secs);

                let job = self.store.update_state(id, expected_version, &update).await?;
                tracing::warn!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    max_retries = job.max_retries,
                    delay_secs = delay.as_secs(),
                    "Job failed, scheduled for retry"
                );
                Ok(FailOutcome::Retrying { job, delay })
            }
            RetryDecision::GiveUp => {
                update.state = JobState::Dead;

                let job = self.store.update_state(id, expected_version, &update).await?;
                tracing::warn!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    error = job.last_error.as_deref().unwrap_or(""),
                    "Job moved to dead letter queue"
                );
                Ok(FailOutcome::Dead(job))
            }
        }
    }

    /// Get a job by id, failing with `JobNotFound` if it does not exist.
    pub async fn get(&self, id: &str) -> Result<Job> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))
    }

    /// List jobs, optionally restricted to one persisted state.
    pub async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        self.store.list(state).await
    }

    /// Pending jobs that are backing off after a failure.
    pub async fn list_waiting(&self) -> Result<Vec<Job>> {
        let now = unix_now();
        let jobs = self.store.list(Some(JobState::Pending)).await?;
        Ok(jobs.into_iter().filter(|job| job.is_waiting(now)).collect())
    }

    /// Job counts per observable bucket.
    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.stats(unix_now()).await
    }

    /// Refresh the liveness stamp of a claim the caller still holds.
    ///
    /// Returns `false` once the claim was released or the job moved on.
    pub async fn heartbeat(&self, id: &str, expected_version: i64) -> Result<bool> {
        self.store.heartbeat(id, expected_version, unix_now()).await
    }

    /// Return running jobs without a heartbeat for longer than `older_than` to pending.
    ///
    /// The version bump makes any late report from the previous claimant fail
    /// with `VersionConflict`.
    pub async fn release_stale(&self, older_than: Duration) -> Result<Vec<Job>> {
        let now = unix_now();
        let age = i64::try_from(older_than.as_secs()).unwrap_or(i64::MAX);
        let jobs = self.store.release_stale(now.saturating_sub(age), now).await?;
        for job in &jobs {
            tracing::warn!(job_id = %job.id, "Released stale claim");
        }
        Ok(jobs)
    }

    async fn load_running(&self, id: &str, expected_version: i64, action: &'static str) -> Result<Job> {
        let job = self.get(id).await?;
        if job.version != expected_version {
            return Err(QueueError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
            });
        }
        if job.state != JobState::Running {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                state: job.state,
                action,
            });
        }
        Ok(job)
    }
}
