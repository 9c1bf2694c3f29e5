//! `queuectl` - command line front end for the job queue.

mod executor;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use queuectl_core::{
    unix_now, wait_for_stop_request, Engine, Job, JobState, NewJob, QueueStats, WorkerConfig,
    WorkerPool,
};
use queuectl_sqlite::SqliteStore;
use tracing_subscriber::EnvFilter;

use crate::executor::ShellExecutor;

/// How often a running pool checks for `worker stop`.
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "queuectl", version, about = "A background job queue backed by SQLite")]
struct Cli {
    /// Path to the queue database.
    #[arg(long, env = "QUEUECTL_DB", default_value = "queuectl.db", global = true)]
    db: PathBuf,

    /// Log debug output to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a job, e.g. '{"id":"job1","command":"echo hi","max_retries":2}'
    Enqueue {
        /// Job as JSON with `id`, `command` and optional `max_retries`.
        job: String,
    },
    /// Run or stop workers.
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
    /// Summary of job states and active workers.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List jobs.
    List {
        /// pending, running, done, dead or failed_retry_wait.
        #[arg(long)]
        state: Option<StateFilter>,
        #[arg(long)]
        json: bool,
    },
    /// Inspect or retry dead jobs.
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
    /// Read and change persisted settings.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum WorkerAction {
    /// Start workers in the foreground until Ctrl+C or `worker stop`.
    Start {
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Sleep between polls of an empty queue.
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,
        /// Kill commands running longer than this.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Return running jobs without a heartbeat for this long to the queue.
        #[arg(long)]
        stale_after_secs: Option<u64>,
        /// Seconds to wait for in-flight jobs when stopping.
        #[arg(long, default_value_t = 10)]
        shutdown_secs: u64,
    },
    /// Ask running workers to finish their current job and exit.
    Stop,
}

#[derive(Subcommand, Debug)]
enum DlqAction {
    /// List dead jobs.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Move a dead job back to pending with attempts reset.
    Retry { id: String },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Get { key: String },
    Set { key: String, value: String },
    List,
}

/// `list --state` accepts the persisted states plus the derived backoff state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateFilter {
    State(JobState),
    Waiting,
}

impl FromStr for StateFilter {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "failed_retry_wait" | "waiting" => Ok(StateFilter::Waiting),
            other => JobState::from_str(other)
                .map(StateFilter::State)
                .map_err(|e| e.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, matches!(cli.command, Commands::Worker { .. }));

    let store = SqliteStore::open(&cli.db)
        .await
        .with_context(|| format!("failed to open queue database {}", cli.db.display()))?;
    let engine = Engine::new(store);

    let result = run(cli.command, &engine).await;
    engine.store().close().await;
    result
}

fn init_logging(verbose: bool, worker: bool) {
    let default = match (verbose, worker) {
        (true, _) => "debug",
        (false, true) => "info",
        (false, false) => "warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Commands, engine: &Engine<SqliteStore>) -> Result<()> {
    match command {
        Commands::Enqueue { job } => {
            let job = NewJob::from_json(&job).context("invalid job")?;
            let job = engine.enqueue(job).await?;
            println!(
                "Enqueued job {} (max_retries: {})",
                job.id, job.max_retries
            );
        }
        Commands::Worker { action } => match action {
            WorkerAction::Start {
                count,
                poll_ms,
                timeout_secs,
                stale_after_secs,
                shutdown_secs,
            } => {
                let mut builder = WorkerConfig::builder()
                    .num_workers(count)
                    .poll_interval(Duration::from_millis(poll_ms))
                    .shutdown_timeout(Duration::from_secs(shutdown_secs));
                if let Some(secs) = stale_after_secs {
                    builder = builder.stale_after(Duration::from_secs(secs));
                }

                let mut executor = ShellExecutor::new();
                if let Some(secs) = timeout_secs {
                    executor = executor.with_timeout(Duration::from_secs(secs));
                }

                let pool = WorkerPool::new(builder.build(), engine.clone(), executor);
                println!("Starting {} worker(s). Press Ctrl+C to stop.", count);

                let settings = engine.settings();
                pool.run_until(async {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = wait_for_stop_request(settings, STOP_POLL_INTERVAL) => {}
                    }
                })
                .await?;
                println!("Workers stopped.");
            }
            WorkerAction::Stop => {
                engine.settings().request_stop().await?;
                println!("Stop requested. Running workers exit after their current job.");
            }
        },
        Commands::Status { json } => {
            let stats = engine.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_stats(&stats);
            }
        }
        Commands::List { state, json } => {
            let jobs = match state {
                None => engine.list(None).await?,
                Some(StateFilter::State(state)) => engine.list(Some(state)).await?,
                Some(StateFilter::Waiting) => engine.list_waiting().await?,
            };
            print_jobs(&jobs, json)?;
        }
        Commands::Dlq { action } => match action {
            DlqAction::List { json } => {
                let jobs = engine.dlq().list().await?;
                print_jobs(&jobs, json)?;
            }
            DlqAction::Retry { id } => {
                let job = engine.dlq().retry(&id).await?;
                println!("Job {} moved from the DLQ back to pending", job.id);
            }
        },
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => match engine.settings().get(&key).await? {
                Some(value) => println!("{}", value),
                None => anyhow::bail!("setting '{}' is not set", key),
            },
            ConfigAction::Set { key, value } => {
                engine.settings().set(&key, &value).await?;
                println!("{} = {}", key.trim().to_lowercase(), value.trim());
            }
            ConfigAction::List => {
                for (key, value) in engine.settings().list().await? {
                    println!("{} = {}", key, value);
                }
            }
        },
    }
    Ok(())
}

fn print_stats(stats: &QueueStats) {
    println!("pending:           {}", stats.pending);
    println!("failed_retry_wait: {}", stats.waiting);
    println!("running:           {}", stats.running);
    println!("done:              {}", stats.done);
    println!("dead:              {}", stats.dead);
    println!("active workers:    {}", stats.active_workers);
}

fn print_jobs(jobs: &[Job], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    let now = unix_now();
    for job in jobs {
        println!("{}", format_job(job, now));
    }
    Ok(())
}

fn format_job(job: &Job, now: i64) -> String {
    let mut line = format!(
        "[{:<17}] {} | Attempts: {}/{} | Command: '{}'",
        job.display_state(now).to_uppercase(),
        job.id,
        job.attempts,
        job.max_retries,
        job.command
    );
    if job.is_waiting(now) {
        line.push_str(&format!(" | Retry in: {}s", job.next_run_at - now));
    }
    if let Some(err) = &job.last_error {
        line.push_str(&format!(" | Last error: {}", err));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn job(state: JobState, next_run_at: i64) -> Job {
        Job {
            id: "job1".to_string(),
            command: "echo hi".to_string(),
            state,
            attempts: 1,
            max_retries: 3,
            next_run_at,
            claimed_by: None,
            last_error: None,
            version: 3,
            created_at: 100,
            updated_at: 100,
        }
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_worker_start() {
        let cli = Cli::try_parse_from([
            "queuectl", "--db", "/tmp/q.db", "worker", "start", "--count", "3",
            "--stale-after-secs", "60",
        ])
        .unwrap();
        assert_eq!(cli.db, PathBuf::from("/tmp/q.db"));
        match cli.command {
            Commands::Worker {
                action:
                    WorkerAction::Start {
                        count,
                        poll_ms,
                        stale_after_secs,
                        timeout_secs,
                        ..
                    },
            } => {
                assert_eq!(count, 3);
                assert_eq!(poll_ms, 1000);
                assert_eq!(stale_after_secs, Some(60));
                assert_eq!(timeout_secs, None);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_state_filter_parsing() {
        assert_eq!(
            "failed_retry_wait".parse::<StateFilter>().unwrap(),
            StateFilter::Waiting
        );
        assert_eq!(
            "DEAD".parse::<StateFilter>().unwrap(),
            StateFilter::State(JobState::Dead)
        );
        assert!("bogus".parse::<StateFilter>().is_err());
    }

    #[test]
    fn test_format_job_line() {
        let line = format_job(&job(JobState::Done, 100), 200);
        assert_eq!(
            line,
            "[DONE             ] job1 | Attempts: 1/3 | Command: 'echo hi'"
        );
    }

    #[test]
    fn test_format_waiting_job() {
        let mut waiting = job(JobState::Pending, 210);
        waiting.last_error = Some("exit status 1".to_string());
        let line = format_job(&waiting, 200);
        assert!(line.starts_with("[FAILED_RETRY_WAIT] job1"));
        assert!(line.ends_with("| Retry in: 10s | Last error: exit status 1"));
    }
}
