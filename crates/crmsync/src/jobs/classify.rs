use serde::{Deserialize, Serialize};

use crate::jobs::error_codes::ErrorCategory;
use crate::jobs::retry::MAX_RETRY_AFTER_SECS;

/// Whatever the CRM call gave back when it failed. Every field is optional
/// except the message, because callers rarely know more than that.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    /// HTTP-like status code, when there was a response.
    pub status: Option<u16>,
    /// Machine code: transport errno (`ETIMEDOUT`), vendor code, or a bare
    /// category name such as `rate_limit`.
    pub code: Option<String>,
    pub message: String,
    /// Explicit "retry after N seconds" from the failing service.
    pub retry_after_secs: Option<i64>,
}

impl SyncFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(message)
        }
    }

    pub fn network(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.to_string()),
            ..Self::new(message)
        }
    }

    pub fn category(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            code: Some(category.as_str().to_string()),
            ..Self::new(message)
        }
    }

    pub fn with_retry_after(mut self, secs: i64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }
}

impl std::fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.status, self.code.as_deref()) {
            (Some(status), _) => write!(f, "HTTP {status}: {}", self.message),
            (None, Some(code)) => write!(f, "{code}: {}", self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

/// A failure after classification. Retry logic only ever looks at this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub is_retryable: bool,
    pub retry_after_hint: Option<i64>,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            is_retryable: category.is_retryable(),
            retry_after_hint: None,
            message: message.into(),
        }
    }

    /// Non-positive hints are dropped; large ones are capped at
    /// [`MAX_RETRY_AFTER_SECS`].
    pub fn with_retry_after(mut self, secs: i64) -> Self {
        self.retry_after_hint = (secs > 0).then(|| secs.min(MAX_RETRY_AFTER_SECS));
        self
    }
}

const NETWORK_CODES: &[&str] = &[
    "ETIMEDOUT",
    "ECONNREFUSED",
    "ECONNRESET",
    "ECONNABORTED",
    "EHOSTUNREACH",
    "ENETUNREACH",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EPIPE",
];

const NETWORK_PHRASES: &[&str] = &[
    "timed out",
    "timeout",
    "connection refused",
    "connection reset",
    "connection closed",
    "dns",
    "name resolution",
    "network",
    "socket hang up",
];

const RATE_LIMIT_PHRASES: &[&str] = &["rate limit", "ratelimit", "too many requests", "throttl"];

const QUOTA_PHRASES: &[&str] = &["quota", "limit exceeded", "plan limit", "usage limit"];

const AUTH_PHRASES: &[&str] = &[
    "unauthorized",
    "forbidden",
    "invalid token",
    "expired token",
    "invalid credentials",
    "authentication",
];

const PROPERTY_PHRASES: &[&str] = &["property", "unknown field", "schema"];

/// Map a raw failure onto the closed taxonomy.
///
/// Order of precedence: an explicit category name in `code`, then the status
/// code, then transport codes, then message text. Anything unrecognized is a
/// `server_error` so the job keeps retrying instead of being dropped.
pub fn classify(failure: &SyncFailure) -> ErrorRecord {
    let category = categorize(failure);
    let record = ErrorRecord::new(category, failure.to_string());

    match failure.retry_after_secs {
        Some(secs) => record.with_retry_after(secs),
        None => record,
    }
}

fn categorize(failure: &SyncFailure) -> ErrorCategory {
    let code = failure.code.as_deref().map(str::trim).unwrap_or("");
    let message = failure.message.to_lowercase();

    if let Some(category) = ErrorCategory::parse(code) {
        return category;
    }

    if let Some(status) = failure.status {
        if let Some(category) = from_status(status, &message) {
            return category;
        }
    }

    if NETWORK_CODES.iter().any(|c| code.eq_ignore_ascii_case(c)) {
        return ErrorCategory::NetworkError;
    }

    if contains_any(&message, RATE_LIMIT_PHRASES) {
        return ErrorCategory::RateLimit;
    }
    if contains_any(&message, QUOTA_PHRASES) {
        return ErrorCategory::QuotaExceeded;
    }
    if contains_any(&message, AUTH_PHRASES) {
        return ErrorCategory::AuthError;
    }
    if contains_any(&message, NETWORK_PHRASES) {
        return ErrorCategory::NetworkError;
    }

    ErrorCategory::ServerError
}

fn from_status(status: u16, message: &str) -> Option<ErrorCategory> {
    match status {
        429 => Some(ErrorCategory::RateLimit),
        401 | 403 => {
            // Some CRMs answer throttling and plan limits with 403.
            if contains_any(message, RATE_LIMIT_PHRASES) {
                Some(ErrorCategory::RateLimit)
            } else if contains_any(message, QUOTA_PHRASES) {
                Some(ErrorCategory::QuotaExceeded)
            } else {
                Some(ErrorCategory::AuthError)
            }
        }
        402 => Some(ErrorCategory::QuotaExceeded),
        400 | 409 | 422 => {
            if contains_any(message, PROPERTY_PHRASES) {
                Some(ErrorCategory::InvalidProperty)
            } else {
                Some(ErrorCategory::ValidationError)
            }
        }
        408 | 504 => Some(ErrorCategory::NetworkError),
        500..=599 => Some(ErrorCategory::ServerError),
        _ => None,
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}
