#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use crmsync::clock::{Clock, ManualClock};
use crmsync::db;
use crmsync::jobs::classify::{ErrorRecord, SyncFailure};
use crmsync::jobs::error_codes::ErrorCategory;
use crmsync::jobs::model::NewSyncJob;
use crmsync::jobs::pg_store::PgQueueStore;
use crmsync::jobs::runner::{CrmSync, SyncSuccess};
use crmsync::jobs::sqlite_store::SqliteQueueStore;
use crmsync::jobs::store::QueueSettings;

/// Fixed start instant so schedules are easy to assert on.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub struct TestQueue {
    pub store: Arc<SqliteQueueStore>,
    pub clock: ManualClock,
    // keeps the database file alive for the test
    _dir: TempDir,
}

pub async fn sqlite_queue() -> TestQueue {
    sqlite_queue_with(QueueSettings::default()).await
}

pub async fn sqlite_queue_with(settings: QueueSettings) -> TestQueue {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("queue.db").display());

    let pool = db::make_sqlite_pool(&url)
        .await
        .expect("failed to open sqlite test db");
    let clock = ManualClock::new(t0());
    let store = SqliteQueueStore::new(pool, settings, Arc::new(clock.clone()));
    store.migrate().await.expect("migrations failed");

    TestQueue {
        store: Arc::new(store),
        clock,
        _dir: dir,
    }
}

/// Put one specific job under `worker_id`'s lease, skipping claim order.
pub async fn lease(q: &TestQueue, id: Uuid, worker_id: &str) {
    let now = q.clock.now();
    let expires = now + chrono::Duration::seconds(300);
    sqlx::query(
        r#"
        UPDATE sync_jobs
        SET status = 'processing',
            locked_by = ?2,
            locked_at = ?3,
            lease_expires_at = ?4,
            updated_at = ?3
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(worker_id)
    .bind(now.timestamp_millis())
    .bind(expires.timestamp_millis())
    .execute(q.store.pool())
    .await
    .expect("failed to lease job");
}

/// Postgres store on TEST_DATABASE_URL, or `None` when it is not set.
pub async fn pg_queue() -> Option<(PgQueueStore, ManualClock)> {
    let _ = dotenvy::dotenv();
    let url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => url,
        _ => {
            eprintln!("TEST_DATABASE_URL not set; skipping postgres test");
            return None;
        }
    };

    let pool = db::make_pool(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");
    let clock = ManualClock::new(t0());
    let store = PgQueueStore::new(pool, QueueSettings::default(), Arc::new(clock.clone()));
    store.migrate().await.expect("migrations failed");

    sqlx::query("TRUNCATE TABLE sync_jobs")
        .execute(store.pool())
        .await
        .expect("truncate failed");

    Some((store, clock))
}

pub fn rate_limited() -> ErrorRecord {
    ErrorRecord::new(ErrorCategory::RateLimit, "HTTP 429: too many requests")
}

pub fn server_error() -> ErrorRecord {
    ErrorRecord::new(ErrorCategory::ServerError, "HTTP 503: unavailable")
}

pub fn validation_error() -> ErrorRecord {
    ErrorRecord::new(ErrorCategory::ValidationError, "HTTP 422: email is invalid")
}

pub fn new_job(subject_id: &str, initial: ErrorRecord) -> NewSyncJob {
    NewSyncJob::new(
        subject_id,
        json!({ "email": format!("{subject_id}@example.com"), "score": 87 }),
        initial,
    )
}

pub fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

#[derive(Debug, Clone)]
pub enum Script {
    Ok(&'static str),
    Fail(SyncFailure),
    Panic,
    Hang,
}

/// CRM stand-in keyed by subject id. Unknown subjects succeed.
#[derive(Clone, Default)]
pub struct ScriptedCrm {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedCrm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, subject_id: &str, script: Script) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(subject_id.to_string(), script);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CrmSync for ScriptedCrm {
    async fn sync(&self, subject_id: &str, _payload: &Value) -> Result<SyncSuccess, SyncFailure> {
        self.calls.lock().unwrap().push(subject_id.to_string());
        let script = self.scripts.lock().unwrap().get(subject_id).cloned();

        match script {
            None => Ok(SyncSuccess::with_id(format!("crm-{subject_id}"))),
            Some(Script::Ok(id)) => Ok(SyncSuccess::with_id(id)),
            Some(Script::Fail(failure)) => Err(failure),
            Some(Script::Panic) => panic!("scripted panic for {subject_id}"),
            Some(Script::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(SyncSuccess::default())
            }
        }
    }
}
