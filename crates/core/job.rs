//! Job definition and related types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{QueueError, Result};

/// Retry ceiling used when neither the submission nor the settings provide one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Persisted state of a job.
///
/// A `Pending` job whose `next_run_at` lies in the future is reported as
/// `failed_retry_wait`; it is not a separate persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Completed successfully. Terminal.
    Done,
    /// Exhausted its retries; lives in the dead letter queue.
    Dead,
}

impl JobState {
    /// All persisted states, in lifecycle order.
    pub const ALL: [JobState; 4] = [
        JobState::Pending,
        JobState::Running,
        JobState::Done,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Dead => "dead",
        }
    }

    /// Whether no further transition is possible without operator action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Dead)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "done" => Ok(JobState::Done),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::InvalidJob(format!("unknown job state '{}'", other))),
        }
    }
}

/// A job row as persisted by a [`JobStore`](crate::JobStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Caller-supplied identifier.
    pub id: String,
    /// Command handed to the executor verbatim.
    pub command: String,
    pub state: JobState,
    /// Failed execution attempts so far.
    pub attempts: u32,
    pub max_retries: u32,
    /// Earliest time (Unix seconds) the job may be claimed.
    pub next_run_at: i64,
    /// Worker holding the current claim. Diagnostic only.
    pub claimed_by: Option<String>,
    /// Failure reason reported by the last failed attempt.
    pub last_error: Option<String>,
    /// Optimistic concurrency token, bumped on every mutation.
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    /// Whether a worker may claim this job at `now`.
    pub fn is_claimable(&self, now: i64) -> bool {
        self.state == JobState::Pending && self.next_run_at <= now
    }

    /// Whether the job is pending but backing off after a failure.
    pub fn is_waiting(&self, now: i64) -> bool {
        self.state == JobState::Pending && self.next_run_at > now
    }

    /// State name as shown to operators, splitting waiting jobs out of `pending`.
    pub fn display_state(&self, now: i64) -> &'static str {
        if self.is_waiting(now) {
            "failed_retry_wait"
        } else {
            self.state.as_str()
        }
    }

    /// Start an update that carries this job's current fields forward.
    pub fn to_update(&self, now: i64) -> JobUpdate {
        JobUpdate {
            state: self.state,
            attempts: self.attempts,
            next_run_at: self.next_run_at,
            claimed_by: self.claimed_by.clone(),
            last_error: self.last_error.clone(),
            updated_at: now,
        }
    }
}

/// Fields written by a conditional update. `version` is bumped by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUpdate {
    pub state: JobState,
    pub attempts: u32,
    pub next_run_at: i64,
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: i64,
}

/// Job submission payload.
///
/// ```json
/// {"id": "job1", "command": "echo hello", "max_retries": 2}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub id: String,
    pub command: String,
    /// Falls back to the `default_max_retries` setting when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl NewJob {
    /// Create a submission using the default retry ceiling.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            max_retries: None,
        }
    }

    /// Override the retry ceiling for this job.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Parse and validate a submission from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let job: NewJob = serde_json::from_str(json)?;
        job.validate()?;
        Ok(job)
    }

    /// Reject submissions with a blank id or command.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(QueueError::InvalidJob("'id' must not be empty".to_string()));
        }
        if self.command.trim().is_empty() {
            return Err(QueueError::InvalidJob(
                "'command' must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Get current Unix timestamp in seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
