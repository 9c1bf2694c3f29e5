//! Claim protocol tests against real SQLite databases.

use std::collections::HashSet;

use queuectl_core::{JobState, JobStore, NewJob, QueueError};
use queuectl_sqlite::{SqliteConfig, SqliteStore};

async fn file_store(dir: &tempfile::TempDir) -> SqliteStore {
    SqliteStore::connect(SqliteConfig::file(dir.path().join("queue.db")).max_connections(8))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_claim_empty_queue_returns_none() {
    let store = SqliteStore::in_memory().await.unwrap();
    assert!(store.claim("w1", 100).await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_transitions_to_running() {
    let store = SqliteStore::in_memory().await.unwrap();
    store.insert(&NewJob::new("job1", "echo hi"), 100).await.unwrap();

    let job = store.claim("w1", 100).await.unwrap().unwrap();
    assert_eq!(job.id, "job1");
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.claimed_by.as_deref(), Some("w1"));
    assert_eq!(job.version, 2);

    assert!(store.claim("w2", 100).await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_skips_future_jobs() {
    let store = SqliteStore::in_memory().await.unwrap();
    store.insert(&NewJob::new("later", "true"), 500).await.unwrap();

    assert!(store.claim("w1", 499).await.unwrap().is_none());
    let job = store.claim("w1", 500).await.unwrap().unwrap();
    assert_eq!(job.id, "later");
}

#[tokio::test]
async fn test_claim_order_oldest_eligible_first() {
    let store = SqliteStore::in_memory().await.unwrap();
    // Same second: insertion order breaks the tie.
    store.insert(&NewJob::new("b", "true"), 100).await.unwrap();
    store.insert(&NewJob::new("a", "true"), 100).await.unwrap();
    // Older next_run_at wins regardless of insertion order.
    store.insert(&NewJob::new("early", "true"), 50).await.unwrap();

    let order: Vec<String> = {
        let mut ids = Vec::new();
        while let Some(job) = store.claim("w1", 200).await.unwrap() {
            ids.push(job.id);
        }
        ids
    };
    assert_eq!(order, vec!["early", "b", "a"]);
}

#[tokio::test]
async fn test_claim_ignores_non_pending_states() {
    let store = SqliteStore::in_memory().await.unwrap();
    store.insert(&NewJob::new("job1", "true"), 100).await.unwrap();
    let running = store.claim("w1", 100).await.unwrap().unwrap();

    let mut update = running.to_update(101);
    update.state = JobState::Done;
    update.claimed_by = None;
    store.update_state("job1", running.version, &update).await.unwrap();

    assert!(store.claim("w2", 1_000).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_claims_are_disjoint() {
    for (workers, jobs) in [(0usize, 3usize), (5, 0), (8, 3), (3, 8), (12, 12)] {
        let dir = tempfile::tempdir().unwrap();
        // Two independent pools on one file stand in for two worker processes.
        let first = file_store(&dir).await;
        let second = file_store(&dir).await;

        for i in 0..jobs {
            first
                .insert(&NewJob::new(format!("job-{}", i), "true"), 100)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..workers {
            let store = if w % 2 == 0 { first.clone() } else { second.clone() };
            handles.push(tokio::spawn(async move {
                store.claim(&format!("worker-{}", w), 200).await
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap().unwrap() {
                claimed.push(job.id);
            }
        }

        let unique: HashSet<_> = claimed.iter().cloned().collect();
        assert_eq!(claimed.len(), workers.min(jobs), "workers={} jobs={}", workers, jobs);
        assert_eq!(unique.len(), claimed.len(), "a job was claimed twice");

        let running = first.list(Some(JobState::Running)).await.unwrap();
        assert_eq!(running.len(), workers.min(jobs));
        for job in running {
            assert_eq!(job.version, 2);
        }

        first.close().await;
        second.close().await;
    }
}

#[tokio::test]
async fn test_update_state_version_conflict() {
    let store = SqliteStore::in_memory().await.unwrap();
    store.insert(&NewJob::new("job1", "true"), 100).await.unwrap();
    let job = store.claim("w1", 100).await.unwrap().unwrap();

    let mut update = job.to_update(101);
    update.state = JobState::Done;

    let err = store.update_state("job1", 1, &update).await.unwrap_err();
    assert!(matches!(err, QueueError::VersionConflict { expected: 1, .. }));

    let unchanged = store.get("job1").await.unwrap().unwrap();
    assert_eq!(unchanged.state, JobState::Running);
    assert_eq!(unchanged.version, 2);
}

#[tokio::test]
async fn test_update_state_unknown_job() {
    let store = SqliteStore::in_memory().await.unwrap();
    let job = store.insert(&NewJob::new("job1", "true"), 100).await.unwrap();

    let err = store
        .update_state("missing", 1, &job.to_update(101))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::JobNotFound(ref id) if id == "missing"));
}

#[tokio::test]
async fn test_requeue_only_dead_jobs() {
    let store = SqliteStore::in_memory().await.unwrap();
    store.insert(&NewJob::new("job1", "false"), 100).await.unwrap();

    let err = store.requeue("job1", 150).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::NotInDlq {
            state: JobState::Pending,
            ..
        }
    ));
    assert_eq!(store.get("job1").await.unwrap().unwrap().version, 1);

    let err = store.requeue("missing", 150).await.unwrap_err();
    assert!(matches!(err, QueueError::JobNotFound(_)));

    let running = store.claim("w1", 100).await.unwrap().unwrap();
    let mut update = running.to_update(120);
    update.state = JobState::Dead;
    update.attempts = 4;
    update.claimed_by = None;
    update.last_error = Some("exit status 1".to_string());
    store.update_state("job1", running.version, &update).await.unwrap();

    let job = store.requeue("job1", 150).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.next_run_at, 150);
    assert!(job.last_error.is_none());
    assert_eq!(job.version, 4);

    let claimed = store.claim("w2", 150).await.unwrap().unwrap();
    assert_eq!(claimed.id, "job1");
}

#[tokio::test]
async fn test_list_filters_by_state() {
    let store = SqliteStore::in_memory().await.unwrap();
    store.insert(&NewJob::new("job1", "true"), 100).await.unwrap();
    store.insert(&NewJob::new("job2", "true"), 101).await.unwrap();
    store.claim("w1", 200).await.unwrap().unwrap();

    assert_eq!(store.list(None).await.unwrap().len(), 2);

    let pending = store.list(Some(JobState::Pending)).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "job2");

    assert!(store.list(Some(JobState::Dead)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stats_buckets() {
    let store = SqliteStore::in_memory().await.unwrap();
    store.insert(&NewJob::new("ready", "true"), 100).await.unwrap();
    store.insert(&NewJob::new("waiting", "true"), 900).await.unwrap();
    store.insert(&NewJob::new("run1", "true"), 10).await.unwrap();
    store.insert(&NewJob::new("run2", "true"), 20).await.unwrap();

    store.claim("w1", 200).await.unwrap().unwrap();
    store.claim("w1", 200).await.unwrap().unwrap();

    let stats = store.stats(200).await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.waiting, 1);
    assert_eq!(stats.running, 2);
    assert_eq!(stats.done, 0);
    assert_eq!(stats.dead, 0);
    assert_eq!(stats.active_workers, 1);
    assert_eq!(stats.total(), 4);
}

#[tokio::test]
async fn test_release_stale_returns_old_claims() {
    let store = SqliteStore::in_memory().await.unwrap();
    store.insert(&NewJob::new("old", "true"), 10).await.unwrap();
    store.insert(&NewJob::new("fresh", "true"), 20).await.unwrap();
    store.claim("w1", 100).await.unwrap().unwrap();
    store.claim("w2", 500).await.unwrap().unwrap();

    let released = store.release_stale(300, 600).await.unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].id, "old");
    assert_eq!(released[0].state, JobState::Pending);
    assert!(released[0].claimed_by.is_none());
    assert_eq!(released[0].version, 3);

    let fresh = store.get("fresh").await.unwrap().unwrap();
    assert_eq!(fresh.state, JobState::Running);
}

#[tokio::test]
async fn test_heartbeat_keeps_claim_out_of_release() {
    let store = SqliteStore::in_memory().await.unwrap();
    store.insert(&NewJob::new("job1", "true"), 10).await.unwrap();
    let claimed = store.claim("w1", 100).await.unwrap().unwrap();

    assert!(store.heartbeat("job1", claimed.version, 550).await.unwrap());
    assert!(store.release_stale(300, 600).await.unwrap().is_empty());

    let job = store.get("job1").await.unwrap().unwrap();
    assert_eq!(job.version, claimed.version);
    assert_eq!(job.state, JobState::Running);

    // A stamp exactly at the cutoff is not yet stale.
    assert!(store.release_stale(550, 600).await.unwrap().is_empty());
    assert_eq!(store.release_stale(551, 600).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_heartbeat_rejects_lost_claim() {
    let store = SqliteStore::in_memory().await.unwrap();
    store.insert(&NewJob::new("job1", "true"), 10).await.unwrap();
    let claimed = store.claim("w1", 100).await.unwrap().unwrap();

    assert!(!store.heartbeat("job1", claimed.version - 1, 120).await.unwrap());
    assert!(!store.heartbeat("missing", 1, 120).await.unwrap());

    let mut update = claimed.to_update(130);
    update.state = JobState::Done;
    update.claimed_by = None;
    let done = store.update_state("job1", claimed.version, &update).await.unwrap();
    assert!(!store.heartbeat("job1", done.version, 140).await.unwrap());
}
