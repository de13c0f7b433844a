use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::classify::ErrorRecord;
use crate::jobs::metrics::{ErrorStats, StatusCounts};
use crate::jobs::model::{NewSyncJob, SyncJob, SyncStatus};
use crate::jobs::retry::{retry_at, BackoffPolicy};

/// Five minutes: comfortably longer than the default 30s CRM call timeout.
pub const DEFAULT_LEASE_SECONDS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sync job {0} not found")]
    NotFound(Uuid),

    #[error("sync job {id} is {status}; cannot {action}")]
    InvalidTransition {
        id: Uuid,
        status: SyncStatus,
        action: &'static str,
    },

    #[error("sync job {id} is not leased to {worker_id}")]
    LeaseNotHeld { id: Uuid, worker_id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row for sync job: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub backoff: BackoffPolicy,
    pub lease_seconds: i64,
    /// Debug/test mode: newly enqueued jobs are due right away instead of
    /// after the first backoff step.
    pub immediate_first_retry: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            lease_seconds: DEFAULT_LEASE_SECONDS,
            immediate_first_retry: false,
        }
    }
}

impl QueueSettings {
    /// When a freshly enqueued job first becomes due.
    pub fn initial_retry_at(&self, error: &ErrorRecord, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.immediate_first_retry {
            return now;
        }
        let delay = error
            .retry_after_hint
            .unwrap_or_else(|| BackoffPolicy::delay_seconds(0));
        retry_at(now, delay)
    }

    pub fn lease_expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        retry_at(now, self.lease_seconds.max(1))
    }
}

/// The only thing allowed to mutate sync jobs.
///
/// Implementations must make `claim_due_jobs` exclusive across concurrent
/// callers and must read time from their injected clock.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(&self, job: NewSyncJob) -> StoreResult<SyncJob>;

    async fn get_job(&self, id: Uuid) -> StoreResult<SyncJob>;

    /// Atomically move up to `limit` due pending jobs to `processing`,
    /// ordered by `(priority ASC, next_retry_at ASC)`.
    async fn claim_due_jobs(&self, worker_id: &str, limit: i64) -> StoreResult<Vec<SyncJob>>;

    /// Only the worker holding the lease may complete a job. Idempotent: an
    /// already completed job is returned unchanged.
    async fn record_success(
        &self,
        id: Uuid,
        worker_id: &str,
        result: Option<Value>,
    ) -> StoreResult<SyncJob>;

    /// Only the worker holding the lease may record a failed attempt.
    async fn record_failure(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &ErrorRecord,
    ) -> StoreResult<SyncJob>;

    /// Revert `processing` jobs whose lease ran out back to `pending`.
    async fn reclaim_expired_leases(&self) -> StoreResult<u64>;

    async fn list_pending(&self, limit: i64) -> StoreResult<Vec<SyncJob>>;

    async fn list_dead_letter(&self, limit: i64) -> StoreResult<Vec<SyncJob>>;

    async fn error_stats(&self) -> StoreResult<ErrorStats>;

    async fn status_counts(&self) -> StoreResult<StatusCounts>;

    /// Delete terminal jobs processed strictly before `now - older_than_days`.
    async fn cleanup(&self, older_than_days: i64) -> StoreResult<u64>;

    /// Re-enqueue a dead-lettered job's payload as a new job.
    async fn replay(&self, id: Uuid) -> StoreResult<SyncJob>;
}

pub(crate) fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(1, 500)
}

/// Outcomes are only accepted from the worker that currently holds the lease.
/// A stale worker whose lease was reclaimed gets `LeaseNotHeld`.
pub(crate) fn ensure_lease_held(
    job: &SyncJob,
    worker_id: &str,
    action: &'static str,
) -> StoreResult<()> {
    if job.status != SyncStatus::Processing {
        return Err(StoreError::InvalidTransition {
            id: job.id,
            status: job.status,
            action,
        });
    }
    if job.locked_by.as_deref() != Some(worker_id) {
        return Err(StoreError::LeaseNotHeld {
            id: job.id,
            worker_id: worker_id.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn ensure_can_replay(job: &SyncJob) -> StoreResult<()> {
    if job.status != SyncStatus::Failed {
        return Err(StoreError::InvalidTransition {
            id: job.id,
            status: job.status,
            action: "replay",
        });
    }
    Ok(())
}

/// Claimed rows come back from `RETURNING` in no particular order.
pub(crate) fn sort_claimed(jobs: &mut [SyncJob]) {
    jobs.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.next_retry_at.cmp(&b.next_retry_at))
            .then(a.created_at.cmp(&b.created_at))
    });
}
