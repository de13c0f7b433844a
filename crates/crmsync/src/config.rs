use std::time::Duration;

use crate::jobs::maintenance::{DEFAULT_RETENTION_DAYS, MAX_RETENTION_DAYS};
use crate::jobs::retry::BackoffPolicy;
use crate::jobs::runner::{DispatcherConfig, DEFAULT_BATCH_SIZE};
use crate::jobs::store::{QueueSettings, DEFAULT_LEASE_SECONDS};

/// Runtime configuration, read from `CRMSYNC_*` variables (with unprefixed
/// fallbacks) after loading `.env`.
#[derive(Clone, Debug)]
pub struct Config {
    /// `postgres://...` or `sqlite:...`
    pub database_url: String,
    pub worker_id: String,
    pub batch_size: i64,
    pub poll_interval_secs: u64,
    pub lease_seconds: i64,
    pub sync_timeout_secs: u64,
    pub retention_days: i64,
    pub maintenance_interval_secs: u64,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub immediate_first_retry: bool,
    pub backoff_jitter_pct: f64,
    pub crm_endpoint: Option<String>,
    pub crm_token: Option<String>,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env_or_fallback("CRMSYNC_DATABASE_URL", "DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("CRMSYNC_DATABASE_URL (or DATABASE_URL) is missing"))?;

        let worker_id = env_or_fallback("CRMSYNC_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let batch_size = env_parse("CRMSYNC_BATCH_SIZE", "BATCH_SIZE")
            .filter(|n: &i64| *n > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE);

        let poll_interval_secs = env_parse("CRMSYNC_POLL_INTERVAL_SECS", "POLL_INTERVAL_SECS")
            .filter(|n: &u64| *n > 0)
            .unwrap_or(60);

        let lease_seconds = env_parse("CRMSYNC_LEASE_SECONDS", "LEASE_SECONDS")
            .filter(|n: &i64| *n > 0)
            .unwrap_or(DEFAULT_LEASE_SECONDS);

        let sync_timeout_secs = env_parse("CRMSYNC_SYNC_TIMEOUT_SECS", "SYNC_TIMEOUT_SECS")
            .filter(|n: &u64| *n > 0)
            .unwrap_or(30);

        let retention_days = env_parse("CRMSYNC_RETENTION_DAYS", "RETENTION_DAYS")
            .filter(|n: &i64| (0..=MAX_RETENTION_DAYS).contains(n))
            .unwrap_or(DEFAULT_RETENTION_DAYS);

        let maintenance_interval_secs =
            env_parse("CRMSYNC_MAINTENANCE_INTERVAL_SECS", "MAINTENANCE_INTERVAL_SECS")
                .filter(|n: &u64| *n > 0)
                .unwrap_or(3600);

        let admin_addr = env_or_fallback("CRMSYNC_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("CRMSYNC_MIGRATE_ON_STARTUP").unwrap_or(false);
        let immediate_first_retry = env_bool("CRMSYNC_IMMEDIATE_FIRST_RETRY").unwrap_or(false);
        let log_json = env_bool("CRMSYNC_LOG_JSON").unwrap_or(false);

        let backoff_jitter_pct = env_parse("CRMSYNC_BACKOFF_JITTER", "BACKOFF_JITTER")
            .filter(|n: &f64| n.is_finite())
            .unwrap_or(0.0);

        let crm_endpoint = env_or_fallback("CRMSYNC_CRM_ENDPOINT", "CRM_ENDPOINT");
        let crm_token = env_or_fallback("CRMSYNC_CRM_TOKEN", "CRM_TOKEN");

        Ok(Self {
            database_url,
            worker_id,
            batch_size,
            poll_interval_secs,
            lease_seconds,
            sync_timeout_secs,
            retention_days,
            maintenance_interval_secs,
            admin_addr,
            migrate_on_startup,
            immediate_first_retry,
            backoff_jitter_pct,
            crm_endpoint,
            crm_token,
            log_json,
        })
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            backoff: BackoffPolicy::with_jitter(self.backoff_jitter_pct),
            lease_seconds: self.lease_seconds,
            immediate_first_retry: self.immediate_first_retry,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            worker_id: self.worker_id.clone(),
            batch_size: self.batch_size,
            sync_timeout: self.sync_timeout(),
        }
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(primary: &str, fallback: &str) -> Option<T> {
    env_or_fallback(primary, fallback).and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
