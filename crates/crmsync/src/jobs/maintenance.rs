use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use crate::jobs::store::{QueueStore, StoreResult};

pub const DEFAULT_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub reclaimed: u64,
    pub deleted: u64,
}

/// One maintenance pass: hand stale leases back to the queue, then drop
/// terminal jobs older than the retention window.
pub async fn run_maintenance(
    store: &dyn QueueStore,
    retention_days: i64,
) -> StoreResult<MaintenanceReport> {
    let reclaimed = store.reclaim_expired_leases().await?;
    let deleted = store.cleanup(retention_days).await?;

    if reclaimed > 0 || deleted > 0 {
        info!(reclaimed, deleted, retention_days, "maintenance pass");
    }

    Ok(MaintenanceReport { reclaimed, deleted })
}

/// Longest retention window accepted from operators: about 100 years.
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// `now - days`. Negative values count as zero. A window reaching past the
/// earliest representable instant keeps everything.
pub fn cutoff_days(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    Duration::try_days(days.max(0))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

