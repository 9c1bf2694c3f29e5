//! Dead letter queue view.

use crate::error::Result;
use crate::job::{unix_now, Job, JobState};
use crate::store::JobStore;

/// Read/requeue projection over the jobs that exhausted their retries.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue<S> {
    store: S,
}

impl<S: JobStore> DeadLetterQueue<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// All dead jobs, most recently failed first.
    pub async fn list(&self) -> Result<Vec<Job>> {
        self.store.list(Some(JobState::Dead)).await
    }

    /// Number of dead jobs.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.store.stats(unix_now()).await?.dead)
    }

    /// Move a dead job back to the queue.
    ///
    /// The job starts over with `attempts = 0` and is claimable immediately.
    /// Fails with `NotInDlq` if the job is not dead.
    pub async fn retry(&self, id: &str) -> Result<Job> {
        let job = self.store.requeue(id, unix_now()).await?;
        tracing::info!(job_id = %job.id, "Dead job re-queued");
        Ok(job)
    }
}
