//! Storage abstraction for jobs and settings.
//!
//! The engine never touches persisted state directly. Everything goes through
//! [`JobStore`] and [`ConfigStore`], so an implementation only has to make each
//! operation atomic against its own backing store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::job::{Job, JobState, JobUpdate, NewJob};

/// Job counts per observable bucket, as reported by `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Pending jobs that can be claimed now.
    pub pending: usize,
    /// Pending jobs backing off after a failure (`failed_retry_wait`).
    pub waiting: usize,
    pub running: usize,
    pub done: usize,
    pub dead: usize,
    /// Distinct workers currently holding a claim.
    pub active_workers: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.waiting + self.running + self.done + self.dead
    }
}

/// Durable job table with an atomic claim primitive.
///
/// Implementations must be safe to share between threads and between
/// processes opening the same backing store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new pending job with `attempts = 0` and `version = 1`.
    ///
    /// Fails with `DuplicateId` if the id is taken.
    async fn insert(&self, job: &NewJob, now: i64) -> Result<Job>;

    /// Atomically move the oldest eligible pending job to `running`.
    ///
    /// Eligible means `state = pending AND next_run_at <= now`; ties are broken
    /// by `created_at` and then insertion order. Returns `None` when nothing is
    /// eligible. No two concurrent claims may return the same job.
    async fn claim(&self, worker_id: &str, now: i64) -> Result<Option<Job>>;

    /// Write `update` only if the job's version still equals `expected_version`.
    ///
    /// Bumps the version and returns the updated job. Fails with
    /// `VersionConflict` on a stale version and `JobNotFound` for unknown ids.
    async fn update_state(&self, id: &str, expected_version: i64, update: &JobUpdate)
        -> Result<Job>;

    /// Get a job by id.
    async fn get(&self, id: &str) -> Result<Option<Job>>;

    /// List jobs, optionally restricted to one state, most recently updated first.
    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>>;

    /// Move a dead job back to pending with `attempts = 0`, eligible at `now`.
    ///
    /// Fails with `NotInDlq` if the job is not dead.
    async fn requeue(&self, id: &str, now: i64) -> Result<Job>;

    /// Count jobs per observable bucket at `now`.
    async fn stats(&self, now: i64) -> Result<QueueStats>;

    /// Stamp a liveness heartbeat on a running claim at `now`.
    ///
    /// Applies only while the job is `running` at `expected_version` and does
    /// not bump the version. Returns `false` when the claim is gone.
    async fn heartbeat(&self, id: &str, expected_version: i64, now: i64) -> Result<bool>;

    /// Return every `running` job whose last heartbeat is older than `cutoff` to pending.
    ///
    /// Claiming stamps the first heartbeat.
    async fn release_stale(&self, cutoff: i64, now: i64) -> Result<Vec<Job>>;
}

/// Persistent key/value settings.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Get a raw setting value.
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace a raw setting value.
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    /// All stored settings, ordered by key.
    async fn list_settings(&self) -> Result<BTreeMap<String, String>>;
}
