mod common;

use common::{lease, new_job, rate_limited, secs, server_error, sqlite_queue, validation_error};

use crmsync::clock::Clock;
use crmsync::jobs::classify::ErrorRecord;
use crmsync::jobs::error_codes::ErrorCategory;
use crmsync::jobs::model::{DeadLetterReason, SyncStatus};
use crmsync::jobs::retry::MAX_RETRY_AFTER_SECS;
use crmsync::jobs::store::{QueueStore, StoreError};

#[tokio::test]
async fn retry_ceiling_dead_letters_on_third_failure() {
    let q = sqlite_queue().await;
    let job = q
        .store
        .enqueue(new_job("lead-1", server_error()).max_retries(2))
        .await
        .unwrap();

    let mut expected_delays = vec![300, 900].into_iter();
    for attempt in 1..=3 {
        q.clock.set(q.store.get_job(job.id).await.unwrap().next_retry_at);
        let claimed = q.store.claim_due_jobs("worker-a", 1).await.unwrap();
        assert_eq!(claimed.len(), 1, "attempt {attempt} not claimable");

        let after = q.store.record_failure(job.id, "worker-a", &server_error()).await.unwrap();
        assert_eq!(after.retry_count, attempt);

        match expected_delays.next() {
            Some(delay) => {
                assert_eq!(after.status, SyncStatus::Pending);
                assert_eq!(after.next_retry_at, q.clock.now() + secs(delay));
            }
            None => {
                assert_eq!(after.status, SyncStatus::Failed);
                assert_eq!(
                    after.dead_letter_reason,
                    Some(DeadLetterReason::MaxRetriesExceeded)
                );
                assert_eq!(after.processed_at, Some(q.clock.now()));
            }
        }
    }

    let final_job = q.store.get_job(job.id).await.unwrap();
    assert_eq!(final_job.status, SyncStatus::Failed);
    assert_eq!(final_job.retry_count, 3);
    assert_eq!(final_job.locked_by, None);
}

#[tokio::test]
async fn non_retryable_failure_dead_letters_immediately() {
    let q = sqlite_queue().await;
    let job = q
        .store
        .enqueue(new_job("lead-1", server_error()).max_retries(10))
        .await
        .unwrap();
    q.clock.advance(secs(60));
    q.store.claim_due_jobs("worker-a", 1).await.unwrap();

    let after = q
        .store
        .record_failure(job.id, "worker-a", &validation_error())
        .await
        .unwrap();

    assert_eq!(after.status, SyncStatus::Failed);
    assert_eq!(after.retry_count, 1);
    assert_eq!(after.error_type, Some(ErrorCategory::ValidationError));
    assert_eq!(after.dead_letter_reason, Some(DeadLetterReason::NonRetryable));
    assert_eq!(after.last_error.as_deref(), Some("HTTP 422: email is invalid"));
}

#[tokio::test]
async fn rate_limited_job_end_to_end() {
    let q = sqlite_queue().await;
    let job = q
        .store
        .enqueue(new_job("lead-1", rate_limited()).max_retries(5))
        .await
        .unwrap();

    // not due yet
    assert!(q.store.claim_due_jobs("worker-a", 10).await.unwrap().is_empty());

    q.clock.set(job.next_retry_at + secs(1));
    let claimed = q.store.claim_due_jobs("worker-a", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, job.id);

    let failed_at = q.clock.now();
    let after = q.store.record_failure(job.id, "worker-a", &server_error()).await.unwrap();

    assert_eq!(after.status, SyncStatus::Pending);
    assert_eq!(after.retry_count, 1);
    assert_eq!(after.error_type, Some(ErrorCategory::ServerError));
    assert_eq!(after.next_retry_at, failed_at + secs(300));
    assert_eq!(after.locked_by, None);
    assert_eq!(after.lease_expires_at, None);
}

#[tokio::test]
async fn retry_after_hint_wins_for_one_reschedule() {
    let q = sqlite_queue().await;
    let job = q.store.enqueue(new_job("lead-1", server_error())).await.unwrap();
    q.clock.advance(secs(60));
    q.store.claim_due_jobs("worker-a", 1).await.unwrap();

    let hinted = rate_limited().with_retry_after(20);
    let after = q.store.record_failure(job.id, "worker-a", &hinted).await.unwrap();
    assert_eq!(after.next_retry_at, q.clock.now() + secs(20));

    // second consecutive rate limit: hint is smaller than the schedule
    q.clock.set(after.next_retry_at);
    q.store.claim_due_jobs("worker-a", 1).await.unwrap();
    let after = q.store.record_failure(job.id, "worker-a", &hinted).await.unwrap();
    assert_eq!(after.retry_count, 2);
    assert_eq!(after.next_retry_at, q.clock.now() + secs(900));
}

#[tokio::test]
async fn record_success_is_idempotent() {
    let q = sqlite_queue().await;
    let job = q.store.enqueue(new_job("lead-1", server_error())).await.unwrap();
    q.clock.advance(secs(60));
    q.store.claim_due_jobs("worker-a", 1).await.unwrap();

    let result = serde_json::json!({ "external_id": "crm-77" });
    let first = q
        .store
        .record_success(job.id, "worker-a", Some(result.clone()))
        .await
        .unwrap();
    assert_eq!(first.status, SyncStatus::Completed);
    assert_eq!(first.result, Some(result.clone()));
    assert_eq!(first.processed_at, Some(q.clock.now()));
    assert_eq!(first.locked_by, None);

    q.clock.advance(secs(30));
    let second = q.store.record_success(job.id, "worker-a", None).await.unwrap();
    assert_eq!(second.status, SyncStatus::Completed);
    assert_eq!(second.result, Some(result));
    assert_eq!(second.processed_at, first.processed_at);
}

#[tokio::test]
async fn terminal_jobs_reject_further_failures() {
    let q = sqlite_queue().await;
    let job = q.store.enqueue(new_job("lead-1", server_error())).await.unwrap();
    lease(&q, job.id, "worker-a").await;
    q.store.record_success(job.id, "worker-a", None).await.unwrap();

    let err = q
        .store
        .record_failure(job.id, "worker-a", &server_error())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }), "{err}");

    let unchanged = q.store.get_job(job.id).await.unwrap();
    assert_eq!(unchanged.status, SyncStatus::Completed);
}

#[tokio::test]
async fn success_on_dead_lettered_job_is_rejected() {
    let q = sqlite_queue().await;
    let job = q.store.enqueue(new_job("lead-1", server_error())).await.unwrap();
    lease(&q, job.id, "worker-a").await;
    q.store
        .record_failure(job.id, "worker-a", &validation_error())
        .await
        .unwrap();

    let err = q.store.record_success(job.id, "worker-a", None).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }), "{err}");
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let q = sqlite_queue().await;
    let id = uuid::Uuid::new_v4();

    assert!(matches!(
        q.store.get_job(id).await,
        Err(StoreError::NotFound(missing)) if missing == id
    ));
    assert!(matches!(
        q.store.record_failure(id, "worker-a", &server_error()).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        q.store.record_success(id, "worker-a", None).await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn zero_max_retries_dead_letters_first_retryable_failure() {
    let q = sqlite_queue().await;
    let job = q
        .store
        .enqueue(new_job("lead-1", server_error()).max_retries(0))
        .await
        .unwrap();
    lease(&q, job.id, "worker-a").await;

    let after = q
        .store
        .record_failure(
            job.id,
            "worker-a",
            &ErrorRecord::new(ErrorCategory::NetworkError, "ECONNRESET"),
        )
        .await
        .unwrap();
    assert_eq!(after.status, SyncStatus::Failed);
    assert_eq!(after.retry_count, 1);
    assert_eq!(
        after.dead_letter_reason,
        Some(DeadLetterReason::MaxRetriesExceeded)
    );
}

#[tokio::test]
async fn outcomes_require_a_claimed_job() {
    let q = sqlite_queue().await;
    let job = q.store.enqueue(new_job("lead-1", server_error())).await.unwrap();

    let err = q
        .store
        .record_success(job.id, "worker-a", None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }), "{err}");

    let err = q
        .store
        .record_failure(job.id, "worker-a", &server_error())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }), "{err}");

    let untouched = q.store.get_job(job.id).await.unwrap();
    assert_eq!(untouched.status, SyncStatus::Pending);
    assert_eq!(untouched.retry_count, 0);
}

#[tokio::test]
async fn absurd_retry_after_is_capped_at_one_day() {
    let q = sqlite_queue().await;

    let queued = q
        .store
        .enqueue(new_job(
            "lead-1",
            rate_limited().with_retry_after(10_000_000_000_000),
        ))
        .await
        .unwrap();
    assert_eq!(queued.next_retry_at, q.clock.now() + secs(MAX_RETRY_AFTER_SECS));

    q.clock.set(queued.next_retry_at);
    assert_eq!(q.store.claim_due_jobs("worker-a", 1).await.unwrap().len(), 1);

    let after = q
        .store
        .record_failure(
            queued.id,
            "worker-a",
            &server_error().with_retry_after(i64::MAX),
        )
        .await
        .unwrap();
    assert_eq!(after.status, SyncStatus::Pending);
    assert_eq!(after.next_retry_at, q.clock.now() + secs(MAX_RETRY_AFTER_SECS));
}
