use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::{TimeZone, Utc};
use reqwest::header::{HeaderValue, RETRY_AFTER};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crmsync::crm::{parse_retry_after, HttpCrmSync};
use crmsync::jobs::classify::classify;
use crmsync::jobs::error_codes::ErrorCategory;
use crmsync::jobs::retry::MAX_RETRY_AFTER_SECS;
use crmsync::jobs::runner::CrmSync;

#[derive(Clone, Default)]
struct Seen {
    bodies: Arc<Mutex<Vec<Value>>>,
    auth: Arc<Mutex<Vec<Option<String>>>>,
}

struct MockCrm {
    base_url: String,
    seen: Seen,
    handle: tokio::task::JoinHandle<()>,
}

impl MockCrm {
    async fn spawn() -> Self {
        let seen = Seen::default();
        let app = Router::new()
            .route("/contacts", post(create_contact))
            .route("/throttled", post(throttled))
            .route("/broken", post(broken))
            .route("/slow", post(slow))
            .with_state(seen.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            seen,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for MockCrm {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn create_contact(
    State(seen): State<Seen>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    seen.auth.lock().unwrap().push(auth);
    seen.bodies.lock().unwrap().push(body);
    (StatusCode::CREATED, Json(json!({ "id": 90210, "created": true })))
}

async fn throttled() -> impl IntoResponse {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("retry-after", "17")],
        "rate limit exceeded",
    )
}

async fn broken() -> impl IntoResponse {
    (StatusCode::UNPROCESSABLE_ENTITY, "Property \"lead_score\" does not exist")
}

async fn slow() -> impl IntoResponse {
    tokio::time::sleep(Duration::from_secs(5)).await;
    StatusCode::OK
}

fn client(url: String, token: Option<&str>) -> HttpCrmSync {
    HttpCrmSync::new(url, token.map(str::to_string), Duration::from_millis(500)).unwrap()
}

#[tokio::test]
async fn success_captures_external_id_and_sends_token() {
    let crm = MockCrm::spawn().await;
    let sync = client(crm.url("/contacts"), Some("s3cret"));

    let payload = json!({ "email": "ada@example.com" });
    let ok = sync.sync("lead-1", &payload).await.unwrap();

    assert_eq!(ok.external_id.as_deref(), Some("90210"));
    assert_eq!(ok.metadata["created"], json!(true));

    let bodies = crm.seen.bodies.lock().unwrap().clone();
    assert_eq!(
        bodies,
        vec![json!({ "subject_id": "lead-1", "payload": payload })]
    );
    let auth = crm.seen.auth.lock().unwrap().clone();
    assert_eq!(auth, vec![Some("Bearer s3cret".to_string())]);
}

#[tokio::test]
async fn rate_limit_response_carries_retry_after() {
    let crm = MockCrm::spawn().await;
    let sync = client(crm.url("/throttled"), None);

    let failure = sync.sync("lead-1", &json!({})).await.unwrap_err();
    assert_eq!(failure.status, Some(429));
    assert_eq!(failure.retry_after_secs, Some(17));

    let record = classify(&failure);
    assert_eq!(record.category, ErrorCategory::RateLimit);
    assert_eq!(record.retry_after_hint, Some(17));
}

#[tokio::test]
async fn client_error_body_drives_classification() {
    let crm = MockCrm::spawn().await;
    let sync = client(crm.url("/broken"), None);

    let failure = sync.sync("lead-1", &json!({})).await.unwrap_err();
    assert_eq!(failure.status, Some(422));
    assert_eq!(classify(&failure).category, ErrorCategory::InvalidProperty);
}

#[tokio::test]
async fn transport_failures_are_network_errors() {
    let crm = MockCrm::spawn().await;

    let timed_out = client(crm.url("/slow"), None)
        .sync("lead-1", &json!({}))
        .await
        .unwrap_err();
    assert_eq!(timed_out.code.as_deref(), Some("ETIMEDOUT"));
    assert_eq!(classify(&timed_out).category, ErrorCategory::NetworkError);

    // nothing listens on port 9 locally
    let refused = client("http://127.0.0.1:9/contacts".into(), None)
        .sync("lead-1", &json!({}))
        .await
        .unwrap_err();
    assert_eq!(classify(&refused).category, ErrorCategory::NetworkError);
}

#[test]
fn retry_after_accepts_seconds_and_http_dates() {
    let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
    let mut headers = reqwest::header::HeaderMap::new();

    headers.insert(RETRY_AFTER, HeaderValue::from_static("120"));
    assert_eq!(parse_retry_after(&headers, now), Some(120));

    headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
    assert_eq!(parse_retry_after(&headers, now), Some(60));

    headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:00:00 GMT"));
    assert_eq!(parse_retry_after(&headers, now), None);

    headers.insert(RETRY_AFTER, HeaderValue::from_static("99999999999999"));
    assert_eq!(parse_retry_after(&headers, now), Some(MAX_RETRY_AFTER_SECS));

    headers.insert(RETRY_AFTER, HeaderValue::from_static("Fri, 31 Dec 9999 23:59:59 GMT"));
    assert_eq!(parse_retry_after(&headers, now), Some(MAX_RETRY_AFTER_SECS));

    headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
    assert_eq!(parse_retry_after(&headers, now), None);

    assert_eq!(parse_retry_after(&reqwest::header::HeaderMap::new(), now), None);
}
