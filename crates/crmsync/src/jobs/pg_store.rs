// crates/crmsync/src/jobs/pg_store.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::jobs::classify::ErrorRecord;
use crate::jobs::error_codes::ErrorCategory;
use crate::jobs::maintenance::cutoff_days;
use crate::jobs::metrics::{ErrorStats, StatusCounts};
use crate::jobs::model::{DeadLetterReason, NewSyncJob, SyncJob, SyncStatus};
use crate::jobs::retry::{plan_failure, FailurePlan};
use crate::jobs::store::{
    clamp_limit, ensure_can_replay, ensure_lease_held, sort_claimed, QueueSettings, QueueStore,
    StoreError, StoreResult,
};

#[derive(Debug, Clone, sqlx::FromRow)]
struct SyncJobRow {
    id: Uuid,
    subject_id: String,
    payload: Value,
    status: String,
    retry_count: i32,
    max_retries: i32,
    priority: i32,
    next_retry_at: DateTime<Utc>,
    last_error: Option<String>,
    error_type: Option<String>,
    dead_letter_reason: Option<String>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
    result: Option<Value>,
    replay_of: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<SyncJobRow> for SyncJob {
    type Error = StoreError;

    fn try_from(row: SyncJobRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let status = SyncStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("{id}: status {}", row.status)))?;
        let error_type = row
            .error_type
            .as_deref()
            .map(|name| {
                ErrorCategory::parse(name)
                    .ok_or_else(|| StoreError::Corrupt(format!("{id}: error_type {name}")))
            })
            .transpose()?;
        let dead_letter_reason = row
            .dead_letter_reason
            .as_deref()
            .map(|code| {
                DeadLetterReason::parse(code)
                    .ok_or_else(|| StoreError::Corrupt(format!("{id}: dead_letter_reason {code}")))
            })
            .transpose()?;

        Ok(SyncJob {
            id,
            subject_id: row.subject_id,
            payload: row.payload,
            status,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            priority: row.priority,
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
            error_type,
            dead_letter_reason,
            locked_by: row.locked_by,
            locked_at: row.locked_at,
            lease_expires_at: row.lease_expires_at,
            result: row.result,
            replay_of: row.replay_of,
            created_at: row.created_at,
            updated_at: row.updated_at,
            processed_at: row.processed_at,
        })
    }
}

fn into_jobs(rows: Vec<SyncJobRow>) -> StoreResult<Vec<SyncJob>> {
    rows.into_iter().map(SyncJob::try_from).collect()
}

/// A guarded transition that matched nothing lost its lease.
fn fenced(id: Uuid, worker_id: &str, row: Option<SyncJobRow>) -> StoreResult<SyncJobRow> {
    row.ok_or_else(|| StoreError::LeaseNotHeld {
        id,
        worker_id: worker_id.to_string(),
    })
}

/// Production store. Claiming uses `FOR UPDATE SKIP LOCKED`, so any number of
/// dispatchers can share one table without handing out the same job twice.
#[derive(Clone)]
pub struct PgQueueStore {
    pool: PgPool,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
}

impl PgQueueStore {
    pub fn new(pool: PgPool, settings: QueueSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            settings,
            clock,
        }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn plan(&self, job: &SyncJob, error: &ErrorRecord, now: DateTime<Utc>) -> FailurePlan {
        plan_failure(job, error, &self.settings.backoff, now, &mut rand::thread_rng())
    }

    /// Row-locks the job for the rest of the transaction.
    async fn lock_job(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> StoreResult<SyncJob> {
        let row = sqlx::query_as::<_, SyncJobRow>(
            r#"
            SELECT *
            FROM sync_jobs
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        match row {
            Some(row) => SyncJob::try_from(row),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn enqueue(&self, job: NewSyncJob) -> StoreResult<SyncJob> {
        let now = self.clock.now();
        let next_retry_at = self.settings.initial_retry_at(&job.initial_error, now);

        let row = sqlx::query_as::<_, SyncJobRow>(
            r#"
            INSERT INTO sync_jobs (
                id, subject_id, payload, status, retry_count, max_retries, priority,
                next_retry_at, last_error, error_type, created_at, updated_at
            )
            VALUES ($1, $2, $3, 'pending', 0, $4, $5, $6, $7, $8, $9, $9)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&job.subject_id)
        .bind(&job.payload)
        .bind(job.resolved_max_retries())
        .bind(job.resolved_priority())
        .bind(next_retry_at)
        .bind(&job.initial_error.message)
        .bind(job.initial_error.category.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let created = SyncJob::try_from(row)?;
        info!(
            job_id = %created.id,
            subject_id = %created.subject_id,
            error_type = %job.initial_error.category,
            next_retry_at = %created.next_retry_at,
            "sync job queued for retry"
        );
        Ok(created)
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<SyncJob> {
        let row = sqlx::query_as::<_, SyncJobRow>("SELECT * FROM sync_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => SyncJob::try_from(row),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn claim_due_jobs(&self, worker_id: &str, limit: i64) -> StoreResult<Vec<SyncJob>> {
        let now = self.clock.now();

        let rows = sqlx::query_as::<_, SyncJobRow>(
            r#"
            WITH due AS (
                SELECT id
                FROM sync_jobs
                WHERE status = 'pending'
                  AND next_retry_at <= $2
                ORDER BY priority ASC, next_retry_at ASC, created_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE sync_jobs j
            SET status = 'processing',
                locked_by = $1,
                locked_at = $2,
                lease_expires_at = $3,
                updated_at = $2
            FROM due
            WHERE j.id = due.id
            RETURNING j.*
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(self.settings.lease_expires_at(now))
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = into_jobs(rows)?;
        sort_claimed(&mut jobs);
        Ok(jobs)
    }

    async fn record_success(
        &self,
        id: Uuid,
        worker_id: &str,
        result: Option<Value>,
    ) -> StoreResult<SyncJob> {
        let mut tx = self.pool.begin().await?;

        let job = Self::lock_job(&mut tx, id).await?;
        if job.status == SyncStatus::Completed {
            tx.commit().await?;
            debug!(job_id = %id, worker_id, "record_success on completed job is a no-op");
            return Ok(job);
        }
        ensure_lease_held(&job, worker_id, "record success")?;

        let row = sqlx::query_as::<_, SyncJobRow>(
            r#"
            UPDATE sync_jobs
            SET status = 'completed',
                result = $3,
                processed_at = $4,
                updated_at = $4,
                locked_by = NULL,
                locked_at = NULL,
                lease_expires_at = NULL
            WHERE id = $1
              AND status = 'processing'
              AND locked_by = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(result)
        .bind(self.clock.now())
        .fetch_optional(&mut *tx)
        .await?;

        let row = fenced(id, worker_id, row)?;
        tx.commit().await?;
        SyncJob::try_from(row)
    }

    async fn record_failure(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &ErrorRecord,
    ) -> StoreResult<SyncJob> {
        let mut tx = self.pool.begin().await?;

        let job = Self::lock_job(&mut tx, id).await?;
        ensure_lease_held(&job, worker_id, "record failure")?;

        let now = self.clock.now();
        let row = match self.plan(&job, error, now) {
            FailurePlan::Reschedule {
                retry_count,
                next_retry_at,
            } => {
                sqlx::query_as::<_, SyncJobRow>(
                    r#"
                    UPDATE sync_jobs
                    SET status = 'pending',
                        retry_count = $3,
                        next_retry_at = $4,
                        last_error = $5,
                        error_type = $6,
                        updated_at = $7,
                        locked_by = NULL,
                        locked_at = NULL,
                        lease_expires_at = NULL
                    WHERE id = $1
                      AND status = 'processing'
                      AND locked_by = $2
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(worker_id)
                .bind(retry_count)
                .bind(next_retry_at)
                .bind(&error.message)
                .bind(error.category.as_str())
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?
            }
            FailurePlan::DeadLetter {
                retry_count,
                reason,
            } => {
                sqlx::query_as::<_, SyncJobRow>(
                    r#"
                    UPDATE sync_jobs
                    SET status = 'failed',
                        retry_count = $3,
                        last_error = $4,
                        error_type = $5,
                        dead_letter_reason = $6,
                        processed_at = $7,
                        updated_at = $7,
                        locked_by = NULL,
                        locked_at = NULL,
                        lease_expires_at = NULL
                    WHERE id = $1
                      AND status = 'processing'
                      AND locked_by = $2
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(worker_id)
                .bind(retry_count)
                .bind(&error.message)
                .bind(error.category.as_str())
                .bind(reason.as_str())
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?
            }
        };

        let row = fenced(id, worker_id, row)?;
        tx.commit().await?;
        SyncJob::try_from(row)
    }

    async fn reclaim_expired_leases(&self) -> StoreResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'pending',
                next_retry_at = $1,
                locked_by = NULL,
                locked_at = NULL,
                lease_expires_at = NULL,
                updated_at = $1
            WHERE status = 'processing'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < $1
            "#,
        )
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn list_pending(&self, limit: i64) -> StoreResult<Vec<SyncJob>> {
        let rows = sqlx::query_as::<_, SyncJobRow>(
            r#"
            SELECT *
            FROM sync_jobs
            WHERE status = 'pending'
            ORDER BY priority ASC, next_retry_at ASC
            LIMIT $1
            "#,
        )
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        into_jobs(rows)
    }

    async fn list_dead_letter(&self, limit: i64) -> StoreResult<Vec<SyncJob>> {
        let rows = sqlx::query_as::<_, SyncJobRow>(
            r#"
            SELECT *
            FROM sync_jobs
            WHERE status = 'failed'
            ORDER BY processed_at DESC NULLS LAST, updated_at DESC
            LIMIT $1
            "#,
        )
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        into_jobs(rows)
    }

    async fn error_stats(&self) -> StoreResult<ErrorStats> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT error_type, COUNT(*)
            FROM sync_jobs
            WHERE error_type IS NOT NULL
            GROUP BY error_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ErrorStats::from_rows(rows))
    }

    async fn status_counts(&self) -> StoreResult<StatusCounts> {
        let (pending, due, processing, completed, failed) =
            sqlx::query_as::<_, (i64, i64, i64, i64, i64)>(
                r#"
                SELECT
                  COUNT(*) FILTER (WHERE status = 'pending'),
                  COUNT(*) FILTER (WHERE status = 'pending' AND next_retry_at <= $1),
                  COUNT(*) FILTER (WHERE status = 'processing'),
                  COUNT(*) FILTER (WHERE status = 'completed'),
                  COUNT(*) FILTER (WHERE status = 'failed')
                FROM sync_jobs
                "#,
            )
            .bind(self.clock.now())
            .fetch_one(&self.pool)
            .await?;

        Ok(StatusCounts {
            pending,
            due,
            processing,
            completed,
            failed,
        })
    }

    async fn cleanup(&self, older_than_days: i64) -> StoreResult<u64> {
        let cutoff = cutoff_days(self.clock.now(), older_than_days);
        if cutoff == DateTime::<Utc>::MIN_UTC {
            return Ok(0);
        }

        let res = sqlx::query(
            r#"
            DELETE FROM sync_jobs
            WHERE status IN ('completed', 'failed')
              AND processed_at IS NOT NULL
              AND processed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn replay(&self, id: Uuid) -> StoreResult<SyncJob> {
        let mut tx = self.pool.begin().await?;

        let src = Self::lock_job(&mut tx, id).await?;
        ensure_can_replay(&src)?;

        let now = self.clock.now();
        let row = sqlx::query_as::<_, SyncJobRow>(
            r#"
            INSERT INTO sync_jobs (
                id, subject_id, payload, status, retry_count, max_retries, priority,
                next_retry_at, replay_of, created_at, updated_at
            )
            VALUES ($1, $2, $3, 'pending', 0, $4, $5, $6, $7, $6, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&src.subject_id)
        .bind(&src.payload)
        .bind(src.max_retries)
        .bind(src.priority)
        .bind(now)
        .bind(src.id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        SyncJob::try_from(row)
    }
}
