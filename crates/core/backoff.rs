//! Exponential retry backoff.

use std::time::Duration;

use crate::error::{QueueError, Result};

/// Default exponential base for retry delays.
pub const DEFAULT_RETRY_BASE: u64 = 2;

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue the job once the delay has elapsed.
    RetryAfter(Duration),
    /// Retries are exhausted; move the job to the dead letter queue.
    GiveUp,
}

/// Exponential backoff: the n-th retry waits `base^n` seconds.
///
/// The exponent is the attempt count itself, so the first retry already waits
/// `base` seconds. A base of 1 gives a constant one-second delay, which is how
/// backoff is turned off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_RETRY_BASE,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with the given base. Fails if `base` is zero.
    pub fn new(base: u64) -> Result<Self> {
        if base == 0 {
            return Err(invalid_base("must be an integer >= 1"));
        }
        Ok(Self { base })
    }

    /// Parse a stored `retry_base` setting.
    pub fn parse(value: &str) -> Result<Self> {
        let base = value
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid_base("must be an integer >= 1"))?;
        Self::new(base)
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Delay in seconds before the retry following failure number `attempts`.
    ///
    /// Saturates at `u64::MAX` instead of overflowing.
    pub fn delay_secs(&self, attempts: u32) -> u64 {
        self.base.checked_pow(attempts).unwrap_or(u64::MAX)
    }

    /// Delay before the retry following failure number `attempts`.
    pub fn delay(&self, attempts: u32) -> Duration {
        Duration::from_secs(self.delay_secs(attempts))
    }

    /// Decide the next step for a job that has now failed `attempts` times.
    pub fn decide(&self, attempts: u32, max_retries: u32) -> RetryDecision {
        if attempts > max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.delay(attempts))
        }
    }
}

fn invalid_base(reason: &str) -> QueueError {
    QueueError::InvalidConfig {
        key: "retry_base".to_string(),
        reason: reason.to_string(),
    }
}
