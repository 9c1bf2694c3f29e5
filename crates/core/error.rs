//! Error types for the queuectl job queue.

use thiserror::Error;

use crate::job::JobState;

/// The main error type for queuectl.
///
/// An empty queue is not an error: claims return `Ok(None)` instead.
#[derive(Error, Debug)]
pub enum QueueError {
    /// A job with this id already exists.
    #[error("Duplicate job id: {0}")]
    DuplicateId(String),

    /// A conditional write observed a stale version.
    #[error("Version conflict on job {id}: expected version {expected}")]
    VersionConflict { id: String, expected: i64 },

    /// The backing store failed; the attempted mutation was not applied.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A setting value was rejected; the previous value is kept.
    #[error("Invalid config value for '{key}': {reason}")]
    InvalidConfig { key: String, reason: String },

    /// DLQ retry on a job that is not dead.
    #[error("Job {id} is not in the dead letter queue (state: {state})")]
    NotInDlq { id: String, state: JobState },

    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The job is not in a state that allows this transition.
    #[error("Job {id} cannot {action} from state {state}")]
    InvalidTransition {
        id: String,
        state: JobState,
        action: &'static str,
    },

    /// Malformed job submission.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether the error was caused by the backing store rather than the caller.
    pub fn is_storage(&self) -> bool {
        matches!(self, QueueError::StorageUnavailable(_))
    }
}

/// Result type alias using QueueError.
pub type Result<T> = std::result::Result<T, QueueError>;
