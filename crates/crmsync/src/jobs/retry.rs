use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::jobs::classify::ErrorRecord;
use crate::jobs::error_codes::ErrorCategory;
use crate::jobs::model::{DeadLetterReason, SyncJob};

/// 1m, 5m, 15m, 30m, 1h. Index = retry count, capped at the last entry.
pub const BACKOFF_SCHEDULE_SECS: [i64; 5] = [60, 300, 900, 1800, 3600];
pub const MAX_DELAY_SECS: i64 = 3600;
/// Upper bound on a server-supplied retry-after hint: one day.
pub const MAX_RETRY_AFTER_SECS: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Symmetric jitter as a fraction of the base delay. 0 keeps the
    /// schedule exact.
    pub jitter_pct: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { jitter_pct: 0.0 }
    }
}

impl BackoffPolicy {
    pub fn with_jitter(jitter_pct: f64) -> Self {
        Self {
            jitter_pct: jitter_pct.clamp(0.0, 0.5),
        }
    }

    /// Base delay before attempt `retry_count + 1`.
    pub fn delay_seconds(retry_count: i32) -> i64 {
        let idx = (retry_count.max(0) as usize).min(BACKOFF_SCHEDULE_SECS.len() - 1);
        BACKOFF_SCHEDULE_SECS[idx]
    }

    pub fn next_delay_seconds(&self, retry_count: i32, rng: &mut impl Rng) -> i64 {
        let delay = Self::delay_seconds(retry_count);
        if self.jitter_pct <= 0.0 {
            return delay;
        }

        // jitter in range [-jitter_pct, +jitter_pct]
        let jitter_range = (delay as f64) * self.jitter_pct;
        let jitter = rng.gen_range(-jitter_range..=jitter_range);

        let jittered = (delay as f64 + jitter).round() as i64;
        jittered.clamp(0, MAX_DELAY_SECS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailurePlan {
    Reschedule {
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
    },
    DeadLetter {
        retry_count: i32,
        reason: DeadLetterReason,
    },
}

impl FailurePlan {
    pub fn retry_count(&self) -> i32 {
        match self {
            FailurePlan::Reschedule { retry_count, .. } => *retry_count,
            FailurePlan::DeadLetter { retry_count, .. } => *retry_count,
        }
    }
}

/// Retry vs dead letter for one failed attempt of `job`.
///
/// The ceiling is checked against the count *before* this failure, so a job
/// with `max_retries = n` is rescheduled n times and dead-lettered on the
/// failure after that. The delay is indexed by the count *after* it.
pub fn plan_failure(
    job: &SyncJob,
    error: &ErrorRecord,
    policy: &BackoffPolicy,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> FailurePlan {
    let retry_count = job.retry_count.saturating_add(1);

    if !error.is_retryable {
        return FailurePlan::DeadLetter {
            retry_count,
            reason: DeadLetterReason::NonRetryable,
        };
    }
    if job.retry_count >= job.max_retries {
        return FailurePlan::DeadLetter {
            retry_count,
            reason: DeadLetterReason::MaxRetriesExceeded,
        };
    }

    let computed = policy.next_delay_seconds(retry_count, rng);
    let delay = effective_delay(job.error_type, error, computed);

    FailurePlan::Reschedule {
        retry_count,
        next_retry_at: retry_at(now, delay),
    }
}

/// `now + delay_secs`, saturating at the latest representable instant.
pub fn retry_at(now: DateTime<Utc>, delay_secs: i64) -> DateTime<Utc> {
    Duration::try_seconds(delay_secs.max(0))
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A retry-after hint wins for this one reschedule. When the previous
/// failure was also a rate limit, take the larger of hint and schedule.
pub fn effective_delay(
    previous: Option<ErrorCategory>,
    error: &ErrorRecord,
    computed: i64,
) -> i64 {
    match error.retry_after_hint {
        Some(hint)
            if error.category == ErrorCategory::RateLimit
                && previous == Some(ErrorCategory::RateLimit) =>
        {
            hint.max(computed)
        }
        Some(hint) => hint,
        None => computed,
    }
}
