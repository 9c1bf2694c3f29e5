//! Shell command executor.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use queuectl_core::{Executor, JobError, JobResult};
use tokio::process::Command;

/// Longest stderr excerpt kept in a failure message.
const MAX_ERROR_LEN: usize = 512;

/// Runs each job command through `sh -c`. Exit code 0 is success.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    timeout: Option<Duration>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that run longer than `timeout` and count them as failed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, command: &str) -> JobResult {
        let start = Instant::now();

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, cmd.output()).await {
                Ok(output) => output,
                Err(_) => {
                    return Err(JobError::new(format!(
                        "timed out after {}s",
                        limit.as_secs_f64()
                    )))
                }
            },
            None => cmd.output().await,
        }
        .map_err(|e| JobError::new(format!("failed to spawn command: {}", e)))?;

        let elapsed_ms = start.elapsed().as_millis() as u64;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            tracing::debug!(output = %stdout.trim_end(), "Command output");
        }

        if output.status.success() {
            tracing::debug!(elapsed_ms, "Command succeeded");
            return Ok(());
        }

        let status = match output.status.code() {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();

        tracing::debug!(elapsed_ms, status = %status, "Command failed");

        if stderr.is_empty() {
            Err(JobError::new(status))
        } else {
            Err(JobError::new(format!("{}: {}", status, truncate(stderr, MAX_ERROR_LEN))))
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exit_zero_is_success() {
        let executor = ShellExecutor::new();
        assert!(executor.execute("echo hello").await.is_ok());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let executor = ShellExecutor::new();
        let err = executor.execute("exit 3").await.unwrap_err();
        assert_eq!(err.message, "exit status 3");
    }

    #[tokio::test]
    async fn test_failure_includes_stderr() {
        let executor = ShellExecutor::new();
        let err = executor.execute("echo broken >&2; exit 1").await.unwrap_err();
        assert_eq!(err.message, "exit status 1: broken");
    }

    #[tokio::test]
    async fn test_unknown_command_fails() {
        let executor = ShellExecutor::new();
        let err = executor
            .execute("definitely-not-a-real-command-xyz")
            .await
            .unwrap_err();
        assert!(err.message.starts_with("exit status 127"));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let executor = ShellExecutor::new().with_timeout(Duration::from_millis(100));
        let start = Instant::now();
        let err = executor.execute("sleep 5").await.unwrap_err();
        assert!(err.message.starts_with("timed out"));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("héllo", 2), "h");
    }
}
