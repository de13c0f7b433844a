use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::classify::ErrorRecord;
use crate::jobs::error_codes::ErrorCategory;

pub const DEFAULT_MAX_RETRIES: i32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncJob {
    pub id: Uuid,
    pub subject_id: String,
    /// Snapshot taken at enqueue time. Never rewritten.
    pub payload: Value,
    pub status: SyncStatus,

    pub retry_count: i32,
    pub max_retries: i32,
    pub priority: i32,
    pub next_retry_at: DateTime<Utc>,

    pub last_error: Option<String>,
    pub error_type: Option<ErrorCategory>,
    pub dead_letter_reason: Option<DeadLetterReason>,

    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Whatever the CRM returned on success (e.g. created contact id).
    pub result: Option<Value>,
    pub replay_of: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl SyncJob {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SyncStatus::Pending && self.next_retry_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Processing => "processing",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "processing" => Some(SyncStatus::Processing),
            "completed" => Some(SyncStatus::Completed),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Completed | SyncStatus::Failed)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended up in the dead letter bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterReason {
    NonRetryable,
    MaxRetriesExceeded,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::NonRetryable => "NON_RETRYABLE",
            DeadLetterReason::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NON_RETRYABLE" => Some(DeadLetterReason::NonRetryable),
            "MAX_RETRIES_EXCEEDED" => Some(DeadLetterReason::MaxRetriesExceeded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub max_retries: Option<i32>,
    pub priority: Option<i32>,
}

/// Input to `QueueStore::enqueue`: the job plus the failure that caused it.
#[derive(Debug, Clone)]
pub struct NewSyncJob {
    pub subject_id: String,
    pub payload: Value,
    pub initial_error: ErrorRecord,
    pub options: EnqueueOptions,
}

impl NewSyncJob {
    pub fn new(subject_id: impl Into<String>, payload: Value, initial_error: ErrorRecord) -> Self {
        Self {
            subject_id: subject_id.into(),
            payload,
            initial_error,
            options: EnqueueOptions::default(),
        }
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.options.max_retries = Some(max_retries);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.options.priority = Some(priority);
        self
    }

    pub fn resolved_max_retries(&self) -> i32 {
        self.options.max_retries.unwrap_or(DEFAULT_MAX_RETRIES).max(0)
    }

    pub fn resolved_priority(&self) -> i32 {
        self.options
            .priority
            .unwrap_or_else(|| self.initial_error.category.default_priority())
    }
}
