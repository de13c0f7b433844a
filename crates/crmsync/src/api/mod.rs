use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::api::models::{
    CleanupQuery, CleanupResponse, DeadLetterItem, EnqueueRequest, EnqueueResponse, ErrorBody,
    LimitQuery, ProcessQuery, ReplayResponse,
};
use crate::clock::Clock;
use crate::jobs::classify::classify;
use crate::jobs::maintenance::MAX_RETENTION_DAYS;
use crate::jobs::metrics::{render_prometheus, ErrorStats, QueueSnapshot};
use crate::jobs::model::{NewSyncJob, SyncJob};
use crate::jobs::runner::{BatchProcessResult, Dispatcher};
use crate::jobs::store::{QueueStore, StoreError};

pub mod models;

const DEFAULT_LIST_LIMIT: i64 = 50;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn QueueStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub clock: Arc<dyn Clock>,
    pub retention_days: i64,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Jobs
        .route("/jobs", post(enqueue_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/replay", post(replay_job))
        .route("/pending", get(list_pending))
        .route("/dead-letter", get(list_dead_letter))
        // Stats
        .route("/stats", get(stats))
        .route("/stats/errors", get(error_stats))
        .route("/metrics/prom", get(metrics_prom))
        // Operator actions
        .route("/queue/process", post(process_queue))
        .route("/maintenance/cleanup", post(cleanup))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn bad_request(msg: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error: msg.into() }))
}

fn internal_err(e: anyhow::Error) -> ApiError {
    error!(error = %e, "admin api request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: format!("internal error: {e}"),
        }),
    )
}

fn store_err(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: e.to_string(),
            }),
        ),
        StoreError::InvalidTransition { .. } | StoreError::LeaseNotHeld { .. } => (
            StatusCode::CONFLICT,
            Json(ErrorBody {
                error: e.to_string(),
            }),
        ),
        other => internal_err(other.into()),
    }
}

pub async fn enqueue_job(
    State(state): State<ApiState>,
    Json(body): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let EnqueueRequest {
        subject_id,
        payload,
        error,
        max_retries,
        priority,
    } = body;

    if subject_id.trim().is_empty() {
        return Err(bad_request("subject_id is required"));
    }
    if matches!(max_retries, Some(n) if n < 0) {
        return Err(bad_request("max_retries must be >= 0"));
    }

    let record = classify(&error);
    let mut new_job = NewSyncJob::new(subject_id, payload, record);
    if let Some(n) = max_retries {
        new_job = new_job.max_retries(n);
    }
    if let Some(p) = priority {
        new_job = new_job.priority(p);
    }

    let job = state.store.enqueue(new_job).await.map_err(store_err)?;
    let error_type = job
        .error_type
        .ok_or_else(|| internal_err(anyhow::anyhow!("enqueued job {} has no error_type", job.id)))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: job.id,
            status: "queued_for_retry",
            error_type,
            next_retry_at: job.next_retry_at,
        }),
    ))
}

pub async fn get_job(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiResult<SyncJob> {
    let job = state.store.get_job(id).await.map_err(store_err)?;
    Ok(Json(job))
}

pub async fn replay_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ReplayResponse> {
    let job = state.store.replay(id).await.map_err(store_err)?;
    Ok(Json(ReplayResponse {
        new_job_id: job.id,
        replay_of: id,
    }))
}

pub async fn list_pending(
    State(state): State<ApiState>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Vec<SyncJob>> {
    let jobs = state
        .store
        .list_pending(q.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await
        .map_err(store_err)?;
    Ok(Json(jobs))
}

pub async fn list_dead_letter(
    State(state): State<ApiState>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Vec<DeadLetterItem>> {
    let jobs = state
        .store
        .list_dead_letter(q.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await
        .map_err(store_err)?;
    Ok(Json(jobs.into_iter().map(DeadLetterItem::from).collect()))
}

pub async fn stats(State(state): State<ApiState>) -> ApiResult<QueueSnapshot> {
    let statuses = state.store.status_counts().await.map_err(store_err)?;
    let errors = state.store.error_stats().await.map_err(store_err)?;
    Ok(Json(QueueSnapshot {
        at: state.clock.now(),
        statuses,
        errors,
    }))
}

pub async fn error_stats(State(state): State<ApiState>) -> ApiResult<ErrorStats> {
    let errors = state.store.error_stats().await.map_err(store_err)?;
    Ok(Json(errors))
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Response {
    let snapshot = async {
        let statuses = state.store.status_counts().await?;
        let errors = state.store.error_stats().await?;
        Ok::<_, StoreError>(render_prometheus(&statuses, &errors))
    };

    match snapshot.await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics error: {e}"),
        )
            .into_response(),
    }
}

pub async fn process_queue(
    State(state): State<ApiState>,
    Query(q): Query<ProcessQuery>,
) -> ApiResult<BatchProcessResult> {
    let batch_size = q
        .batch_size
        .unwrap_or(state.dispatcher.config().batch_size);
    if batch_size <= 0 {
        return Err(bad_request("batch_size must be > 0"));
    }

    let result = state
        .dispatcher
        .process_pending_queue(batch_size)
        .await
        .map_err(internal_err)?;
    Ok(Json(result))
}

pub async fn cleanup(
    State(state): State<ApiState>,
    Query(q): Query<CleanupQuery>,
) -> ApiResult<CleanupResponse> {
    let older_than_days = q.older_than_days.unwrap_or(state.retention_days);
    if !(0..=MAX_RETENTION_DAYS).contains(&older_than_days) {
        return Err(bad_request(format!(
            "older_than_days must be between 0 and {MAX_RETENTION_DAYS}"
        )));
    }

    let deleted = state
        .store
        .cleanup(older_than_days)
        .await
        .map_err(store_err)?;
    Ok(Json(CleanupResponse {
        deleted,
        older_than_days,
    }))
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
