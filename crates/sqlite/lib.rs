//! SQLite job store for queuectl.
//!
//! This crate provides the SQLite-based [`JobStore`] and [`ConfigStore`] used by
//! the queuectl engine. Several processes may open the same database file; every
//! mutation runs in a `BEGIN IMMEDIATE` transaction so the write lock is taken
//! before any row is read.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use queuectl_core::{Engine, NewJob};
//! use queuectl_sqlite::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> queuectl_core::Result<()> {
//!     let store = SqliteStore::open("queuectl.db").await?;
//!     let engine = Engine::new(store);
//!     engine.enqueue(NewJob::new("job1", "echo hello")).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use queuectl_core::{
    ConfigStore, Job, JobState, JobStore, JobUpdate, NewJob, QueueError, QueueStats, Result,
    DEFAULT_MAX_RETRIES,
};

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, next_run_at, \
                           claimed_by, last_error, version, created_at, updated_at";

/// Connection settings for [`SqliteStore`].
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database url, e.g. `sqlite://queuectl.db` or `sqlite::memory:`.
    pub url: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// How long a connection waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl SqliteConfig {
    /// Create a config for a database url with default pool settings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Config for a database file, created if missing.
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::new(format!("sqlite://{}", path.as_ref().display()))
    }

    /// Set the maximum number of pooled connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the busy timeout.
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// SQLite store for jobs and settings.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store from a database url.
    ///
    /// The url should be in the format `sqlite:path/to/db.sqlite` or `sqlite::memory:`.
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(SqliteConfig::new(database_url)).await
    }

    /// Open (or create) a database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect(SqliteConfig::file(path)).await
    }

    /// Create an in-memory SQLite store (useful for testing).
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    /// Connect with explicit settings and make sure the tables exist.
    pub async fn connect(config: SqliteConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(storage("Invalid SQLite url"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout);

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
        if config.is_memory() {
            // Each connection to :memory: is its own database, so keep exactly one alive.
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(storage("Failed to connect to SQLite"))?;

        let store = Self { pool };
        store.init_tables().await?;

        tracing::debug!(url = %config.url, "SQLite store ready");
        Ok(store)
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Initialize the required tables.
    async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                command TEXT NOT NULL,
                state TEXT NOT NULL
                    CHECK (state IN ('pending', 'running', 'done', 'dead')),
                attempts INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                next_run_at INTEGER NOT NULL,
                claimed_by TEXT,
                last_error TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                heartbeat_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage("Failed to create jobs table"))?;

        let (has_heartbeat,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pragma_table_info('jobs') WHERE name = 'heartbeat_at'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(storage("Failed to inspect jobs table"))?;
        if has_heartbeat == 0 {
            sqlx::query("ALTER TABLE jobs ADD COLUMN heartbeat_at INTEGER")
                .execute(&self.pool)
                .await
                .map_err(storage("Failed to add heartbeat column"))?;
        }

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (state, next_run_at, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage("Failed to create claim index"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage("Failed to create config table"))?;

        Ok(())
    }

    /// Start a transaction that holds the database write lock from the first statement.
    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(storage("Failed to begin write transaction"))
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert(&self, job: &NewJob, now: i64) -> Result<Job> {
        let mut tx = self.begin_write().await?;

        let row = sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO jobs
                (id, command, state, attempts, max_retries, next_run_at, version, created_at, updated_at)
            VALUES (?1, ?2, 'pending', 0, ?3, ?4, 1, ?4, ?4)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(&job.id)
        .bind(&job.command)
        .bind(i64::from(job.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage("Failed to insert job"))?;

        let row = match row {
            Some(row) => row,
            None => return Err(QueueError::DuplicateId(job.id.clone())),
        };
        let inserted = job_from_row(&row)?;

        tx.commit().await.map_err(storage("Failed to commit insert"))?;
        Ok(inserted)
    }

    async fn claim(&self, worker_id: &str, now: i64) -> Result<Option<Job>> {
        let mut tx = self.begin_write().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'running', claimed_by = ?1, version = version + 1,
                updated_at = ?2, heartbeat_at = ?2
            WHERE rowid = (
                SELECT rowid FROM jobs
                WHERE state = 'pending' AND next_run_at <= ?2
                ORDER BY next_run_at ASC, created_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage("Failed to claim job"))?;

        let claimed = row.as_ref().map(job_from_row).transpose()?;

        tx.commit().await.map_err(storage("Failed to commit claim"))?;
        Ok(claimed)
    }

    async fn update_state(
        &self,
        id: &str,
        expected_version: i64,
        update: &JobUpdate,
    ) -> Result<Job> {
        let mut tx = self.begin_write().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = ?1, attempts = ?2, next_run_at = ?3, claimed_by = ?4,
                last_error = ?5, updated_at = ?6, version = version + 1
            WHERE id = ?7 AND version = ?8
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(update.state.as_str())
        .bind(i64::from(update.attempts))
        .bind(update.next_run_at)
        .bind(update.claimed_by.as_deref())
        .bind(update.last_error.as_deref())
        .bind(update.updated_at)
        .bind(id)
        .bind(expected_version)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage("Failed to update job"))?;

        let row = match row {
            Some(row) => row,
            None => {
                let exists: Option<(i64,)> = sqlx::query_as("SELECT version FROM jobs WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(storage("Failed to read job version"))?;
                return Err(match exists {
                    Some(_) => QueueError::VersionConflict {
                        id: id.to_string(),
                        expected: expected_version,
                    },
                    None => QueueError::JobNotFound(id.to_string()),
                });
            }
        };
        let updated = job_from_row(&row)?;

        tx.commit().await.map_err(storage("Failed to commit update"))?;
        Ok(updated)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("Failed to get job"))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let rows = match state {
            Some(state) => sqlx::query(&format!(
                "SELECT {} FROM jobs WHERE state = ? ORDER BY updated_at DESC, rowid DESC",
                JOB_COLUMNS
            ))
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query(&format!(
                "SELECT {} FROM jobs ORDER BY updated_at DESC, rowid DESC",
                JOB_COLUMNS
            ))
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(storage("Failed to list jobs"))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn requeue(&self, id: &str, now: i64) -> Result<Job> {
        let mut tx = self.begin_write().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'pending', attempts = 0, next_run_at = ?1, claimed_by = NULL,
                last_error = NULL, updated_at = ?1, version = version + 1
            WHERE id = ?2 AND state = 'dead'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(now)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage("Failed to requeue job"))?;

        let row = match row {
            Some(row) => row,
            None => {
                let current: Option<(String,)> = sqlx::query_as("SELECT state FROM jobs WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(storage("Failed to read job state"))?;
                return Err(match current {
                    Some((state,)) => QueueError::NotInDlq {
                        id: id.to_string(),
                        state: state.parse()?,
                    },
                    None => QueueError::JobNotFound(id.to_string()),
                });
            }
        };
        let requeued = job_from_row(&row)?;

        tx.commit().await.map_err(storage("Failed to commit requeue"))?;
        Ok(requeued)
    }

    async fn stats(&self, now: i64) -> Result<QueueStats> {
        let (pending, waiting, running, done, dead, active_workers): (i64, i64, i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COALESCE(SUM(CASE WHEN state = 'pending' AND next_run_at <= ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN state = 'pending' AND next_run_at > ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN state = 'running' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN state = 'done' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN state = 'dead' THEN 1 ELSE 0 END), 0),
                    COUNT(DISTINCT CASE WHEN state = 'running' THEN claimed_by END)
                FROM jobs
                "#,
            )
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(storage("Failed to get queue stats"))?;

        Ok(QueueStats {
            pending: pending as usize,
            waiting: waiting as usize,
            running: running as usize,
            done: done as usize,
            dead: dead as usize,
            active_workers: active_workers as usize,
        })
    }

    async fn heartbeat(&self, id: &str, expected_version: i64, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET heartbeat_at = ?1 WHERE id = ?2 AND version = ?3 AND state = 'running'",
        )
        .bind(now)
        .bind(id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(storage("Failed to record heartbeat"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_stale(&self, cutoff: i64, now: i64) -> Result<Vec<Job>> {
        let mut tx = self.begin_write().await?;

        let rows = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'pending', claimed_by = NULL, updated_at = ?2, version = version + 1
            WHERE state = 'running' AND COALESCE(heartbeat_at, updated_at) < ?1
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(cutoff)
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage("Failed to release stale jobs"))?;

        let released = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;

        tx.commit()
            .await
            .map_err(storage("Failed to commit stale release"))?;
        Ok(released)
    }
}

#[async_trait]
impl ConfigStore for SqliteStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("Failed to get setting"))?;

        Ok(row.map(|(value,)| value))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let mut tx = self.begin_write().await?;

        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await
        .map_err(storage("Failed to set setting"))?;

        tx.commit().await.map_err(storage("Failed to commit setting"))?;
        Ok(())
    }

    async fn list_settings(&self) -> Result<BTreeMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM config ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(storage("Failed to list settings"))?;

        Ok(rows.into_iter().collect())
    }
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let state: String = row.try_get("state").map_err(storage("Failed to decode job"))?;
    let attempts: i64 = row.try_get("attempts").map_err(storage("Failed to decode job"))?;
    let max_retries: i64 = row
        .try_get("max_retries")
        .map_err(storage("Failed to decode job"))?;

    Ok(Job {
        id: row.try_get("id").map_err(storage("Failed to decode job"))?,
        command: row.try_get("command").map_err(storage("Failed to decode job"))?,
        state: state.parse()?,
        attempts: to_u32("attempts", attempts)?,
        max_retries: to_u32("max_retries", max_retries)?,
        next_run_at: row
            .try_get("next_run_at")
            .map_err(storage("Failed to decode job"))?,
        claimed_by: row
            .try_get("claimed_by")
            .map_err(storage("Failed to decode job"))?,
        last_error: row
            .try_get("last_error")
            .map_err(storage("Failed to decode job"))?,
        version: row.try_get("version").map_err(storage("Failed to decode job"))?,
        created_at: row
            .try_get("created_at")
            .map_err(storage("Failed to decode job"))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(storage("Failed to decode job"))?,
    })
}

fn to_u32(column: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        QueueError::StorageUnavailable(format!("Column {} out of range: {}", column, value))
    })
}

fn storage(context: &'static str) -> impl Fn(sqlx::Error) -> QueueError {
    move |e| QueueError::StorageUnavailable(format!("{}: {}", context, e))
}
