//! # queuectl-core - Job lifecycle engine
//!
//! This crate provides the storage-independent core of the queuectl job queue:
//! - `JobStore` and `ConfigStore` traits for storage implementations
//! - `Job`, `JobState`, `NewJob` types
//! - `BackoffPolicy` for exponential retry delays
//! - `Engine` driving claim, completion, failure and DLQ transitions
//! - `WorkerPool` running workers against an `Executor`
//! - Error types

mod backoff;
mod config;
mod dlq;
mod engine;
mod error;
mod job;
mod pool;
mod reaper;
mod settings;
mod store;
mod worker;

// Re-export main types
pub use backoff::{BackoffPolicy, RetryDecision, DEFAULT_RETRY_BASE};
pub use config::{WorkerConfig, WorkerConfigBuilder};
pub use dlq::DeadLetterQueue;
pub use engine::{Engine, FailOutcome};
pub use error::{QueueError, Result};
pub use job::{unix_now, Job, JobState, JobUpdate, NewJob, DEFAULT_MAX_RETRIES};
pub use pool::{wait_for_stop_request, WorkerPool};
pub use reaper::Reaper;
pub use settings::{Settings, DEFAULT_MAX_RETRIES_KEY, RETRY_BASE, STOP_REQUESTED_AT};
pub use store::{ConfigStore, JobStore, QueueStats};
pub use worker::{worker_identity, Executor, JobError, JobResult, PoolSignals, Worker};
