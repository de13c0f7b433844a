use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crmsync::clock::SystemClock;
use crmsync::config::Config;
use crmsync::crm::HttpCrmSync;
use crmsync::db;
use crmsync::jobs::classify::{classify, SyncFailure};
use crmsync::jobs::maintenance::MAX_RETENTION_DAYS;
use crmsync::jobs::metrics::QueueSnapshot;
use crmsync::jobs::model::NewSyncJob;
use crmsync::jobs::runner::Dispatcher;
use crmsync::telemetry;

/// Operator tool for the CRM sync retry queue. Every command prints JSON.
#[derive(Parser, Debug)]
#[command(name = "crmsyncctl", version, about)]
struct Cli {
    /// Overrides CRMSYNC_DATABASE_URL / DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending migrations.
    Migrate,
    /// Queue a failed sync for retry.
    Enqueue {
        #[arg(long)]
        subject_id: String,
        /// Payload as a JSON document.
        #[arg(long)]
        payload: String,
        /// Failure message from the inline attempt.
        #[arg(long)]
        error: String,
        /// HTTP status of the failed attempt, if any.
        #[arg(long)]
        status: Option<u16>,
        /// Error code, e.g. ETIMEDOUT or rate_limit.
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        retry_after: Option<i64>,
        #[arg(long)]
        max_retries: Option<i32>,
        #[arg(long)]
        priority: Option<i32>,
    },
    /// Show one job.
    Show { id: Uuid },
    /// Pending jobs in claim order.
    Pending {
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
    },
    /// Permanently failed jobs, newest first.
    DeadLetter {
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
    },
    /// Status counts and error breakdown.
    Stats,
    /// Re-enqueue a dead-lettered job.
    Replay { id: Uuid },
    /// Drain one batch against the configured CRM endpoint.
    Process {
        #[arg(short, long)]
        batch_size: Option<i64>,
    },
    /// Return jobs with expired leases to pending.
    Reclaim,
    /// Delete completed/failed jobs older than N days.
    Cleanup {
        #[arg(long)]
        older_than_days: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Some(url) = &cli.database_url {
        std::env::set_var("CRMSYNC_DATABASE_URL", url);
    }

    let cfg = Config::from_env()?;
    telemetry::init(cfg.log_json);

    let clock = Arc::new(SystemClock);
    let migrate = matches!(cli.command, Command::Migrate) || cfg.migrate_on_startup;
    let store = db::open_store_from_config(&cfg, clock.clone(), migrate).await?;

    match cli.command {
        Command::Migrate => print_json(&serde_json::json!({ "migrated": true }))?,
        Command::Enqueue {
            subject_id,
            payload,
            error,
            status,
            code,
            retry_after,
            max_retries,
            priority,
        } => {
            let payload: Value = serde_json::from_str(&payload).context("--payload is not JSON")?;

            let mut failure = SyncFailure::new(error);
            failure.status = status;
            failure.code = code;
            if let Some(secs) = retry_after {
                failure = failure.with_retry_after(secs);
            }

            let mut job = NewSyncJob::new(subject_id, payload, classify(&failure));
            if let Some(n) = max_retries {
                job = job.max_retries(n);
            }
            if let Some(p) = priority {
                job = job.priority(p);
            }
            print_json(&store.enqueue(job).await?)?;
        }
        Command::Show { id } => print_json(&store.get_job(id).await?)?,
        Command::Pending { limit } => print_json(&store.list_pending(limit).await?)?,
        Command::DeadLetter { limit } => print_json(&store.list_dead_letter(limit).await?)?,
        Command::Stats => {
            let snapshot = QueueSnapshot {
                at: chrono::Utc::now(),
                statuses: store.status_counts().await?,
                errors: store.error_stats().await?,
            };
            print_json(&snapshot)?;
        }
        Command::Replay { id } => print_json(&store.replay(id).await?)?,
        Command::Process { batch_size } => {
            let endpoint = cfg
                .crm_endpoint
                .clone()
                .context("CRMSYNC_CRM_ENDPOINT must be set to process the queue")?;
            let crm = HttpCrmSync::new(endpoint, cfg.crm_token.clone(), cfg.sync_timeout())?;
            let dispatcher = Dispatcher::new(store.clone(), Arc::new(crm), cfg.dispatcher_config());

            let result = dispatcher
                .process_pending_queue(batch_size.unwrap_or(cfg.batch_size))
                .await?;
            print_json(&result)?;
        }
        Command::Reclaim => {
            let reclaimed = store.reclaim_expired_leases().await?;
            print_json(&serde_json::json!({ "reclaimed": reclaimed }))?;
        }
        Command::Cleanup { older_than_days } => {
            let days = older_than_days.unwrap_or(cfg.retention_days);
            anyhow::ensure!(
                (0..=MAX_RETENTION_DAYS).contains(&days),
                "--older-than-days must be between 0 and {MAX_RETENTION_DAYS}"
            );
            let deleted = store.cleanup(days).await?;
            print_json(&serde_json::json!({ "deleted": deleted, "older_than_days": days }))?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
