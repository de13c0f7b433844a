// crates/crmsync/src/api/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::classify::SyncFailure;
use crate::jobs::error_codes::ErrorCategory;
use crate::jobs::model::SyncJob;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub subject_id: String,
    pub payload: Value,
    /// The failure from the inline sync attempt; classified on arrival.
    pub error: SyncFailure,
    pub max_retries: Option<i32>,
    pub priority: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: Uuid,
    pub status: &'static str,
    pub error_type: ErrorCategory,
    pub next_retry_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub new_job_id: Uuid,
    pub replay_of: Uuid,
}

#[derive(Debug, Serialize)]
pub struct DeadLetterItem {
    #[serde(flatten)]
    pub job: SyncJob,
    pub suggested_action: Option<&'static str>,
}

impl From<SyncJob> for DeadLetterItem {
    fn from(job: SyncJob) -> Self {
        let suggested_action = job.error_type.map(|c| c.suggested_action());
        Self {
            job,
            suggested_action,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ProcessQuery {
    pub batch_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    pub older_than_days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub deleted: u64,
    pub older_than_days: i64,
}
