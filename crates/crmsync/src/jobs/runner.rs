use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::jobs::classify::{classify, SyncFailure};
use crate::jobs::error_codes::ErrorCategory;
use crate::jobs::model::{SyncJob, SyncStatus};
use crate::jobs::store::{QueueStore, StoreError};

pub const DEFAULT_BATCH_SIZE: i64 = 25;
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// The outbound call being retried. Implemented over HTTP by
/// [`crate::crm::HttpCrmSync`]; tests plug in scripted fakes.
#[async_trait]
pub trait CrmSync: Send + Sync {
    async fn sync(&self, subject_id: &str, payload: &Value) -> Result<SyncSuccess, SyncFailure>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSuccess {
    /// Identifier the CRM assigned, e.g. the created contact id.
    pub external_id: Option<String>,
    pub metadata: Value,
}

impl SyncSuccess {
    pub fn with_id(external_id: impl Into<String>) -> Self {
        Self {
            external_id: Some(external_id.into()),
            metadata: Value::Null,
        }
    }

    fn into_result(self) -> Option<Value> {
        if self.external_id.is_none() && self.metadata.is_null() {
            return None;
        }
        Some(json!({
            "external_id": self.external_id,
            "metadata": self.metadata,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_id: String,
    pub batch_size: i64,
    pub sync_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchError {
    pub job_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchProcessResult {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failures that went back to `pending`.
    pub rescheduled: usize,
    /// Failures that ended in `failed`.
    pub dead_lettered: usize,
    /// Outcomes dropped because the lease had already moved to another
    /// worker or the job was gone.
    pub lost: usize,
    pub errors: Vec<BatchError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub reclaimed: u64,
    pub batch: BatchProcessResult,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn QueueStore>,
    crm: Arc<dyn CrmSync>,
    cfg: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn QueueStore>, crm: Arc<dyn CrmSync>, cfg: DispatcherConfig) -> Self {
        Self { store, crm, cfg }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.cfg
    }

    /// Reclaim stale leases, then drain one batch of the configured size.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        let reclaimed = self
            .store
            .reclaim_expired_leases()
            .await
            .context("reclaiming expired leases")?;
        if reclaimed > 0 {
            warn!(worker_id = %self.cfg.worker_id, reclaimed, "reclaimed jobs with expired leases");
        }

        let batch = self.process_pending_queue(self.cfg.batch_size).await?;
        Ok(CycleReport { reclaimed, batch })
    }

    /// Claim up to `batch_size` due jobs and push each one to the CRM.
    ///
    /// Sync calls run concurrently and each is bounded by the sync timeout.
    /// A failing or panicking job never stops the rest of the batch; only a
    /// store error does, since it means retry bookkeeping could be lost.
    pub async fn process_pending_queue(&self, batch_size: i64) -> anyhow::Result<BatchProcessResult> {
        let worker_id = self.cfg.worker_id.as_str();
        let jobs = self
            .store
            .claim_due_jobs(worker_id, batch_size)
            .await
            .context("claiming due jobs")?;

        let mut result = BatchProcessResult::default();
        if jobs.is_empty() {
            debug!(worker_id, "no due sync jobs");
            return Ok(result);
        }

        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let id = job.id;
                (id, tokio::spawn(run_sync(self.crm.clone(), job, self.cfg.sync_timeout)))
            })
            .collect();

        for (job_id, handle) in handles {
            result.processed += 1;

            let outcome = handle.await.unwrap_or_else(|e| Err(join_failure(e)));
            match outcome {
                Ok(success) => {
                    match self
                        .store
                        .record_success(job_id, worker_id, success.into_result())
                        .await
                    {
                        Ok(_) => {
                            result.succeeded += 1;
                            debug!(worker_id, job_id = %job_id, "sync job completed");
                        }
                        Err(e) => self.lost_race(&mut result, job_id, e)?,
                    }
                }
                Err(failure) => {
                    let record = classify(&failure);
                    match self.store.record_failure(job_id, worker_id, &record).await {
                        Ok(job) => {
                            result.failed += 1;
                            result.errors.push(BatchError {
                                job_id,
                                message: failure.to_string(),
                            });
                            if job.status == SyncStatus::Failed {
                                result.dead_lettered += 1;
                                warn!(
                                    worker_id,
                                    job_id = %job_id,
                                    error_type = %record.category,
                                    retry_count = job.retry_count,
                                    reason = job.dead_letter_reason.map(|r| r.as_str()),
                                    "sync job dead-lettered"
                                );
                            } else {
                                result.rescheduled += 1;
                                info!(
                                    worker_id,
                                    job_id = %job_id,
                                    error_type = %record.category,
                                    retry_count = job.retry_count,
                                    next_retry_at = %job.next_retry_at,
                                    "sync job rescheduled"
                                );
                            }
                        }
                        Err(e) => self.lost_race(&mut result, job_id, e)?,
                    }
                }
            }
        }

        info!(
            worker_id,
            processed = result.processed,
            succeeded = result.succeeded,
            failed = result.failed,
            rescheduled = result.rescheduled,
            dead_lettered = result.dead_lettered,
            lost = result.lost,
            "sync batch finished"
        );
        Ok(result)
    }

    /// The job moved under us (lease reclaimed by another worker, or the job
    /// already finished). That is a per-job problem; anything else from the
    /// store ends the cycle.
    fn lost_race(
        &self,
        result: &mut BatchProcessResult,
        job_id: Uuid,
        err: StoreError,
    ) -> anyhow::Result<()> {
        match err {
            StoreError::NotFound(_)
            | StoreError::InvalidTransition { .. }
            | StoreError::LeaseNotHeld { .. } => {
                warn!(worker_id = %self.cfg.worker_id, job_id = %job_id, error = %err, "outcome not recorded");
                result.lost += 1;
                result.errors.push(BatchError {
                    job_id,
                    message: err.to_string(),
                });
                Ok(())
            }
            other => Err(anyhow::Error::new(other)
                .context(format!("recording outcome for sync job {job_id}"))),
        }
    }
}

async fn run_sync(
    crm: Arc<dyn CrmSync>,
    job: SyncJob,
    timeout: Duration,
) -> Result<SyncSuccess, SyncFailure> {
    match tokio::time::timeout(timeout, crm.sync(&job.subject_id, &job.payload)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(SyncFailure::network(
            "ETIMEDOUT",
            format!("CRM sync timed out after {}ms", timeout.as_millis()),
        )),
    }
}

fn join_failure(err: JoinError) -> SyncFailure {
    let message = if err.is_panic() {
        "sync task panicked".to_string()
    } else {
        format!("sync task did not finish: {err}")
    };
    SyncFailure::category(ErrorCategory::ServerError, message)
}
