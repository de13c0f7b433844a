// crates/crmsync/src/jobs/sqlite_store.rs

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info, warn};
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

/// Embedded store for single-node deployments and tests.
///
/// Timestamps are stored as unix milliseconds so range predicates compare
/// integers. Read-modify-write transitions run under `BEGIN IMMEDIATE`, which
/// takes the database write lock up front.
#[derive(Clone)]
pub struct SqliteQueueStore {
    pool: SqlitePool,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
}

impl SqliteQueueStore {
    pub fn new(pool: SqlitePool, settings: QueueSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            settings,
            clock,
        }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn plan(&self, job: &SyncJob, error: &ErrorRecord, now: DateTime<Utc>) -> FailurePlan {
        plan_failure(job, error, &self.settings.backoff, now, &mut rand::thread_rng())
    }

    async fn enqueue_in(
        &self,
        conn: &mut SqliteConnection,
        job: &NewSyncJob,
    ) -> StoreResult<SyncJob> {
        let now = self.clock.now();
        let next_retry_at = self.settings.initial_retry_at(&job.initial_error, now);
        let id = Uuid::new_v4();

        let rows = sqlx::query(
            r#"
            INSERT INTO sync_jobs (
                id, subject_id, payload, status, retry_count, max_retries, priority,
                next_retry_at, last_error, error_type, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&job.subject_id)
        .bind(job.payload.to_string())
        .bind(job.resolved_max_retries())
        .bind(job.resolved_priority())
        .bind(to_ms(next_retry_at))
        .bind(&job.initial_error.message)
        .bind(job.initial_error.category.as_str())
        .bind(to_ms(now))
        .fetch_all(&mut *conn)
        .await?;

        returned(id, rows)
    }

    async fn record_success_in(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
        worker_id: &str,
        result: Option<Value>,
    ) -> StoreResult<SyncJob> {
        let job = fetch_job(conn, id).await?;
        if job.status == SyncStatus::Completed {
            debug!(job_id = %id, worker_id, "record_success on completed job is a no-op");
            return Ok(job);
        }
        ensure_lease_held(&job, worker_id, "record success")?;

        let now = to_ms(self.clock.now());
        let result = result.map(|v| v.to_string());

        let rows = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'completed',
                result = ?3,
                processed_at = ?4,
                updated_at = ?4,
                locked_by = NULL,
                locked_at = NULL,
                lease_expires_at = NULL
            WHERE id = ?1
              AND status = 'processing'
              AND locked_by = ?2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(result)
        .bind(now)
        .fetch_all(&mut *conn)
        .await?;

        fenced(id, worker_id, rows)
    }

    async fn record_failure_in(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
        worker_id: &str,
        error: &ErrorRecord,
    ) -> StoreResult<SyncJob> {
        let job = fetch_job(conn, id).await?;
        ensure_lease_held(&job, worker_id, "record failure")?;

        let now = self.clock.now();
        let rows = match self.plan(&job, error, now) {
            FailurePlan::Reschedule {
                retry_count,
                next_retry_at,
            } => {
                sqlx::query(
                    r#"
                    UPDATE sync_jobs
                    SET status = 'pending',
                        retry_count = ?3,
                        next_retry_at = ?4,
                        last_error = ?5,
                        error_type = ?6,
                        updated_at = ?7,
                        locked_by = NULL,
                        locked_at = NULL,
                        lease_expires_at = NULL
                    WHERE id = ?1
                      AND status = 'processing'
                      AND locked_by = ?2
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(worker_id)
                .bind(retry_count)
                .bind(to_ms(next_retry_at))
                .bind(&error.message)
                .bind(error.category.as_str())
                .bind(to_ms(now))
                .fetch_all(&mut *conn)
                .await?
            }
            FailurePlan::DeadLetter {
                retry_count,
                reason,
            } => {
                sqlx::query(
                    r#"
                    UPDATE sync_jobs
                    SET status = 'failed',
                        retry_count = ?3,
                        last_error = ?4,
                        error_type = ?5,
                        dead_letter_reason = ?6,
                        processed_at = ?7,
                        updated_at = ?7,
                        locked_by = NULL,
                        locked_at = NULL,
                        lease_expires_at = NULL
                    WHERE id = ?1
                      AND status = 'processing'
                      AND locked_by = ?2
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(worker_id)
                .bind(retry_count)
                .bind(&error.message)
                .bind(error.category.as_str())
                .bind(reason.as_str())
                .bind(to_ms(now))
                .fetch_all(&mut *conn)
                .await?
            }
        };

        fenced(id, worker_id, rows)
    }

    async fn replay_in(&self, conn: &mut SqliteConnection, id: Uuid) -> StoreResult<SyncJob> {
        let src = fetch_job(conn, id).await?;
        ensure_can_replay(&src)?;

        let now = to_ms(self.clock.now());
        let new_id = Uuid::new_v4();
        let rows = sqlx::query(
            r#"
            INSERT INTO sync_jobs (
                id, subject_id, payload, status, retry_count, max_retries, priority,
                next_retry_at, replay_of, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6, ?7, ?6, ?6)
            RETURNING *
            "#,
        )
        .bind(new_id)
        .bind(&src.subject_id)
        .bind(src.payload.to_string())
        .bind(src.max_retries)
        .bind(src.priority)
        .bind(now)
        .bind(src.id)
        .fetch_all(&mut *conn)
        .await?;

        returned(new_id, rows)
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn enqueue(&self, job: NewSyncJob) -> StoreResult<SyncJob> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;
        let outcome = self.enqueue_in(&mut conn, &job).await;
        let created = finish(&mut conn, outcome).await?;

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
        let mut conn = self.pool.acquire().await?;
        fetch_job(&mut conn, id).await
    }

    async fn claim_due_jobs(&self, worker_id: &str, limit: i64) -> StoreResult<Vec<SyncJob>> {
        let now = self.clock.now();

        // One UPDATE ... RETURNING: SQLite takes the write lock before the
        // subquery runs, so concurrent claimers never see the same row.
        let rows = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'processing',
                locked_by = ?1,
                locked_at = ?2,
                lease_expires_at = ?3,
                updated_at = ?2
            WHERE id IN (
                SELECT id
                FROM sync_jobs
                WHERE status = 'pending'
                  AND next_retry_at <= ?2
                ORDER BY priority ASC, next_retry_at ASC, created_at ASC
                LIMIT ?4
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(to_ms(now))
        .bind(to_ms(self.settings.lease_expires_at(now)))
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows.iter().map(row_to_job).collect::<StoreResult<Vec<_>>>()?;
        sort_claimed(&mut jobs);
        Ok(jobs)
    }

    async fn record_success(
        &self,
        id: Uuid,
        worker_id: &str,
        result: Option<Value>,
    ) -> StoreResult<SyncJob> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;
        let outcome = self.record_success_in(&mut conn, id, worker_id, result).await;
        finish(&mut conn, outcome).await
    }

    async fn record_failure(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &ErrorRecord,
    ) -> StoreResult<SyncJob> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;
        let outcome = self.record_failure_in(&mut conn, id, worker_id, error).await;
        finish(&mut conn, outcome).await
    }

    async fn reclaim_expired_leases(&self) -> StoreResult<u64> {
        let now = to_ms(self.clock.now());

        let res = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'pending',
                next_retry_at = ?1,
                locked_by = NULL,
                locked_at = NULL,
                lease_expires_at = NULL,
                updated_at = ?1
            WHERE status = 'processing'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < ?1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn list_pending(&self, limit: i64) -> StoreResult<Vec<SyncJob>> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM sync_jobs
            WHERE status = 'pending'
            ORDER BY priority ASC, next_retry_at ASC
            LIMIT ?1
            "#,
        )
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    async fn list_dead_letter(&self, limit: i64) -> StoreResult<Vec<SyncJob>> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM sync_jobs
            WHERE status = 'failed'
            ORDER BY processed_at DESC, updated_at DESC
            LIMIT ?1
            "#,
        )
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
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
                  COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                  COALESCE(SUM(CASE WHEN status = 'pending' AND next_retry_at <= ?1 THEN 1 ELSE 0 END), 0),
                  COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0),
                  COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                  COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
                FROM sync_jobs
                "#,
            )
            .bind(to_ms(self.clock.now()))
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
              AND processed_at < ?1
            "#,
        )
        .bind(to_ms(cutoff))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn replay(&self, id: Uuid) -> StoreResult<SyncJob> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;
        let outcome = self.replay_in(&mut conn, id).await;
        finish(&mut conn, outcome).await
    }
}

async fn begin_immediate(conn: &mut SqliteConnection) -> StoreResult<()> {
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(())
}

async fn finish<T>(conn: &mut SqliteConnection, outcome: StoreResult<T>) -> StoreResult<T> {
    match outcome {
        Ok(value) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

async fn fetch_job(conn: &mut SqliteConnection, id: Uuid) -> StoreResult<SyncJob> {
    let row = sqlx::query("SELECT * FROM sync_jobs WHERE id = ?1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => row_to_job(&row),
        None => Err(StoreError::NotFound(id)),
    }
}

/// `RETURNING` statements are always driven with `fetch_all`: a statement
/// left mid-step keeps its implicit transaction open.
fn returned(id: Uuid, rows: Vec<SqliteRow>) -> StoreResult<SyncJob> {
    match rows.first() {
        Some(row) => row_to_job(row),
        None => Err(StoreError::Corrupt(format!("{id}: write returned no row"))),
    }
}

/// A guarded transition that matched nothing lost its lease.
fn fenced(id: Uuid, worker_id: &str, rows: Vec<SqliteRow>) -> StoreResult<SyncJob> {
    match rows.first() {
        Some(row) => row_to_job(row),
        None => Err(StoreError::LeaseNotHeld {
            id,
            worker_id: worker_id.to_string(),
        }),
    }
}

fn row_to_job(row: &SqliteRow) -> StoreResult<SyncJob> {
    let id: Uuid = row.try_get("id")?;

    let status: String = row.try_get("status")?;
    let status = SyncStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("{id}: status {status}")))?;

    let error_type: Option<String> = row.try_get("error_type")?;
    let error_type = match error_type {
        Some(name) => Some(
            ErrorCategory::parse(&name)
                .ok_or_else(|| StoreError::Corrupt(format!("{id}: error_type {name}")))?,
        ),
        None => None,
    };

    let dead_letter_reason: Option<String> = row.try_get("dead_letter_reason")?;
    let dead_letter_reason = match dead_letter_reason {
        Some(code) => Some(
            DeadLetterReason::parse(&code)
                .ok_or_else(|| StoreError::Corrupt(format!("{id}: dead_letter_reason {code}")))?,
        ),
        None => None,
    };

    let payload: String = row.try_get("payload")?;
    let result: Option<String> = row.try_get("result")?;

    Ok(SyncJob {
        id,
        subject_id: row.try_get("subject_id")?,
        payload: parse_json(id, &payload)?,
        status,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        priority: row.try_get("priority")?,
        next_retry_at: from_ms(id, row.try_get("next_retry_at")?)?,
        last_error: row.try_get("last_error")?,
        error_type,
        dead_letter_reason,
        locked_by: row.try_get("locked_by")?,
        locked_at: opt_from_ms(id, row.try_get("locked_at")?)?,
        lease_expires_at: opt_from_ms(id, row.try_get("lease_expires_at")?)?,
        result: result.as_deref().map(|r| parse_json(id, r)).transpose()?,
        replay_of: row.try_get("replay_of")?,
        created_at: from_ms(id, row.try_get("created_at")?)?,
        updated_at: from_ms(id, row.try_get("updated_at")?)?,
        processed_at: opt_from_ms(id, row.try_get("processed_at")?)?,
    })
}

fn parse_json(id: Uuid, raw: &str) -> StoreResult<Value> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(format!("{id}: json: {e}")))
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(id: Uuid, ms: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("{id}: timestamp {ms}")))
}

fn opt_from_ms(id: Uuid, ms: Option<i64>) -> StoreResult<Option<DateTime<Utc>>> {
    ms.map(|ms| from_ms(id, ms)).transpose()
}
