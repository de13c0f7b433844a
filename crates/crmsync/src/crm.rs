use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::jobs::classify::SyncFailure;
use crate::jobs::retry::MAX_RETRY_AFTER_SECS;
use crate::jobs::runner::{CrmSync, SyncSuccess};

/// Longest response body carried into a failure message.
const MAX_ERROR_BODY: usize = 512;

/// Pushes a payload to a CRM ingestion endpoint as
/// `POST {endpoint}` with body `{"subject_id": .., "payload": ..}`.
#[derive(Clone)]
pub struct HttpCrmSync {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpCrmSync {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building CRM http client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CrmSync for HttpCrmSync {
    async fn sync(&self, subject_id: &str, payload: &Value) -> Result<SyncSuccess, SyncFailure> {
        let mut req = self.client.post(&self.endpoint).json(&json!({
            "subject_id": subject_id,
            "payload": payload,
        }));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(transport_failure)?;
        let status = resp.status();

        if status.is_success() {
            // Some CRMs answer 204 or plain text; only a JSON object with `id` is captured.
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            let external_id = match body.get("id") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            };
            debug!(subject_id, status = status.as_u16(), ?external_id, "crm accepted payload");
            return Ok(SyncSuccess {
                external_id,
                metadata: body,
            });
        }

        let retry_after = parse_retry_after(resp.headers(), Utc::now());
        let mut text = resp.text().await.unwrap_or_default();
        if text.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        let message = if text.trim().is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            text
        };

        let mut failure = SyncFailure::http(status.as_u16(), message);
        if let Some(secs) = retry_after {
            failure = failure.with_retry_after(secs);
        }
        Err(failure)
    }
}

fn transport_failure(err: reqwest::Error) -> SyncFailure {
    let code = if err.is_timeout() {
        "ETIMEDOUT"
    } else if err.is_connect() {
        "ECONNREFUSED"
    } else {
        "ECONNRESET"
    };
    SyncFailure::network(code, err.to_string())
}

/// `Retry-After` as whole seconds from `now`; accepts delta-seconds or an
/// HTTP date. Dates in the past give `None`, and anything beyond
/// [`MAX_RETRY_AFTER_SECS`] is capped.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<i64> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    let secs = match raw.parse::<i64>() {
        Ok(secs) => secs,
        Err(_) => {
            let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
            at.signed_duration_since(now).num_seconds()
        }
    };
    (secs > 0).then(|| secs.min(MAX_RETRY_AFTER_SECS))
}
