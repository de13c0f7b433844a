// crates/crmsync/src/jobs/error_codes.rs
use serde::{Deserialize, Serialize};

/// Priority used when the caller does not pick one. Lower runs first.
pub const DEFAULT_PRIORITY: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    AuthError,
    ValidationError,
    ServerError,
    NetworkError,
    QuotaExceeded,
    InvalidProperty,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 7] = [
        Self::RateLimit,
        Self::AuthError,
        Self::ValidationError,
        Self::ServerError,
        Self::NetworkError,
        Self::QuotaExceeded,
        Self::InvalidProperty,
    ];

    /// Exact match on the stored/wire name. Unknown names return `None`;
    /// the classifier decides what an unknown failure becomes.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "rate_limit" => Some(Self::RateLimit),
            "auth_error" => Some(Self::AuthError),
            "validation_error" => Some(Self::ValidationError),
            "server_error" => Some(Self::ServerError),
            "network_error" => Some(Self::NetworkError),
            "quota_exceeded" => Some(Self::QuotaExceeded),
            "invalid_property" => Some(Self::InvalidProperty),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::AuthError => "auth_error",
            Self::ValidationError => "validation_error",
            Self::ServerError => "server_error",
            Self::NetworkError => "network_error",
            Self::QuotaExceeded => "quota_exceeded",
            Self::InvalidProperty => "invalid_property",
        }
    }

    /// Fixed per category. Nothing downstream may override it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::ServerError | Self::NetworkError
        )
    }

    /// Rate-limited jobs go back in line ahead of generic failures.
    pub fn default_priority(&self) -> i32 {
        match self {
            Self::RateLimit => 2,
            _ => DEFAULT_PRIORITY,
        }
    }

    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::RateLimit => {
                "Back off. Respect Retry-After, lower dispatcher batch size or poll frequency."
            }
            Self::AuthError => {
                "Non-retryable. Rotate or re-issue the CRM API credentials, then replay the job."
            }
            Self::ValidationError => {
                "Non-retryable. Inspect the payload snapshot; fix the producer and replay."
            }
            Self::ServerError => {
                "Retry is OK. Check CRM status page; escalate if it persists across retries."
            }
            Self::NetworkError => {
                "Retry is OK. Check DNS/egress and CRM endpoint reachability from the worker."
            }
            Self::QuotaExceeded => {
                "Non-retryable. Raise the CRM plan/quota limit, then replay dead-lettered jobs."
            }
            Self::InvalidProperty => {
                "Non-retryable. A field is missing in the CRM schema; create the property or fix the mapping."
            }
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
