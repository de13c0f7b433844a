use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

use crate::jobs::error_codes::ErrorCategory;

/// Jobs grouped by their last recorded error category. A job that failed
/// and later succeeded still counts under the category of its last failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorStats {
    pub total: i64,
    pub by_category: BTreeMap<ErrorCategory, i64>,
}

impl ErrorStats {
    pub fn from_rows(rows: impl IntoIterator<Item = (String, i64)>) -> Self {
        let mut stats = ErrorStats::default();
        for (name, count) in rows {
            // Rows written by an older build may carry names we no longer know.
            let Some(category) = ErrorCategory::parse(&name) else {
                tracing::warn!(error_type = %name, count, "unknown error_type in sync_jobs");
                continue;
            };
            *stats.by_category.entry(category).or_insert(0) += count;
            stats.total += count;
        }
        stats
    }

    pub fn count(&self, category: ErrorCategory) -> i64 {
        self.by_category.get(&category).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    /// Pending and already past `next_retry_at`.
    pub due: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Debug, Serialize)]
pub struct QueueSnapshot {
    pub at: DateTime<Utc>,
    pub statuses: StatusCounts,
    pub errors: ErrorStats,
}

/// Prometheus text exposition format. Small enough not to need a crate.
pub fn render_prometheus(statuses: &StatusCounts, errors: &ErrorStats) -> String {
    let mut out = String::new();

    out.push_str("# HELP crmsync_jobs Sync jobs by status\n");
    out.push_str("# TYPE crmsync_jobs gauge\n");
    for (status, value) in [
        ("pending", statuses.pending),
        ("processing", statuses.processing),
        ("completed", statuses.completed),
        ("failed", statuses.failed),
    ] {
        let _ = writeln!(out, "crmsync_jobs{{status=\"{status}\"}} {value}");
    }

    out.push_str("# HELP crmsync_jobs_due Pending jobs whose retry time has passed\n");
    out.push_str("# TYPE crmsync_jobs_due gauge\n");
    let _ = writeln!(out, "crmsync_jobs_due {}", statuses.due);

    out.push_str("# HELP crmsync_job_errors Jobs by last error category\n");
    out.push_str("# TYPE crmsync_job_errors gauge\n");
    for category in ErrorCategory::ALL {
        let _ = writeln!(
            out,
            "crmsync_job_errors{{category=\"{}\",retryable=\"{}\"}} {}",
            category.as_str(),
            category.is_retryable(),
            errors.count(category)
        );
    }

    out
}
