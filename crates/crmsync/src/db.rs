use anyhow::Context;
use sqlx::{
    postgres::PgPoolOptions,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    PgPool, SqlitePool,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::clock::Clock;
use crate::config::Config;
use crate::jobs::pg_store::PgQueueStore;
use crate::jobs::sqlite_store::SqliteQueueStore;
use crate::jobs::store::{QueueSettings, QueueStore};

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok())
}

pub async fn make_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let max_connections = env_u64("CRMSYNC_DB_MAX_CONNECTIONS").unwrap_or(4).clamp(1, 32) as u32;
    let acquire_timeout_secs = env_u64("CRMSYNC_DB_ACQUIRE_TIMEOUT_SECS")
        .unwrap_or(10)
        .clamp(1, 60);
    let disable_jit = env_bool("CRMSYNC_DISABLE_JIT", true);

    let mut opts = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(acquire_timeout_secs));

    opts = opts.after_connect(move |conn, _meta| {
        Box::pin(async move {
            if disable_jit {
                sqlx::query("SET jit = OFF").execute(&mut *conn).await?;
            }
            Ok(())
        })
    });

    let pool = opts
        .connect(database_url)
        .await
        .context("connecting to postgres")?;

    Ok(pool)
}

/// File databases get WAL and a busy timeout so several writers queue up
/// instead of failing. `sqlite::memory:` is pinned to one connection, since
/// every new connection would otherwise see its own empty database.
pub async fn make_sqlite_pool(database_url: &str) -> anyhow::Result<SqlitePool> {
    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

    let mut opts = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid sqlite url {database_url}"))?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        opts = opts.journal_mode(SqliteJournalMode::Wal);
    }

    let max_connections = if in_memory {
        1
    } else {
        env_u64("CRMSYNC_DB_MAX_CONNECTIONS").unwrap_or(4).clamp(1, 32) as u32
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(opts)
        .await
        .context("opening sqlite database")?;

    Ok(pool)
}

pub fn is_sqlite_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite:")
}

/// Open the store the URL points at, running migrations first when asked.
pub async fn open_store(
    database_url: &str,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
    migrate: bool,
) -> anyhow::Result<Arc<dyn QueueStore>> {
    if is_sqlite_url(database_url) {
        let store = SqliteQueueStore::new(make_sqlite_pool(database_url).await?, settings, clock);
        if migrate {
            store.migrate().await.context("running sqlite migrations")?;
        }
        info!(backend = "sqlite", migrated = migrate, "queue store ready");
        Ok(Arc::new(store))
    } else {
        let store = PgQueueStore::new(make_pool(database_url).await?, settings, clock);
        if migrate {
            store.migrate().await.context("running postgres migrations")?;
        }
        info!(backend = "postgres", migrated = migrate, "queue store ready");
        Ok(Arc::new(store))
    }
}

pub async fn open_store_from_config(
    cfg: &Config,
    clock: Arc<dyn Clock>,
    migrate: bool,
) -> anyhow::Result<Arc<dyn QueueStore>> {
    open_store(&cfg.database_url, cfg.queue_settings(), clock, migrate).await
}
