mod common;

use common::{
    SESSION, StubLlm, fixture_invoice_json, fresh_lock, make_pdf, seed_job, stale_lock,
    stub_state, stub_state_with_llms, test_config,
};
use invoice_job_coordinator::module::invoice_job::crud;
use invoice_job_coordinator::module::invoice_job::schema::JobStatus;
use invoice_job_coordinator::service::blob_service::BlobStore;
use invoice_job_coordinator::service::llm_service::LlmError;
use invoice_job_coordinator::service::pipeline_service::{TaskOutcome, process_invoice_job};
use serde_json::json;

async fn upload_input_blob(harness: &common::TestHarness, blob_path: &str) {
    harness
        .blobs
        .upload(blob_path, make_pdf(&["Invoice INV-001"]), "application/pdf")
        .await
        .unwrap();
}

#[tokio::test]
async fn happy_path_sync_tier_completes() {
    let harness = stub_state(test_config());
    let job = seed_job(&harness.state, SESSION, 2);
    upload_input_blob(&harness, &job.blob_path).await;

    let outcome = process_invoice_job(&harness.state, &job.job_id, SESSION).await;
    assert!(matches!(outcome, TaskOutcome::Completed(JobStatus::Done)));

    let stored = harness.state.store.get_job(&job.job_id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Done);
    assert_eq!(stored.attempt, 1);
    assert!(stored.processing_lock.is_none());
    assert_eq!(stored.ocr_method.as_deref(), Some("vision_sync"));
    let result = stored.result_json.unwrap();
    assert_eq!(result["invoiceNumber"], json!("INV-001"));
    let confidence = stored.confidence_score.unwrap();
    assert!((0.0..=1.0).contains(&confidence));

    // Input blob deleted on terminal success.
    assert!(!harness.blobs.exists(&job.blob_path).await.unwrap());
}

#[tokio::test]
async fn stage_timestamps_are_non_decreasing() {
    let harness = stub_state(test_config());
    let job = seed_job(&harness.state, SESSION, 2);
    upload_input_blob(&harness, &job.blob_path).await;

    process_invoice_job(&harness.state, &job.job_id, SESSION).await;
    let stored = harness.state.store.get_job(&job.job_id).unwrap().unwrap();
    let order = ["uploaded", "queued", "processing", "extracting", "llm", "done"];
    for pair in order.windows(2) {
        let earlier = stored.stages.get(pair[0]).unwrap();
        let later = stored.stages.get(pair[1]).unwrap();
        assert!(earlier <= later, "{} later than {}", pair[0], pair[1]);
    }
}

#[tokio::test]
async fn duplicate_delivery_for_terminal_job_is_a_noop() {
    let harness = stub_state(test_config());
    let job = seed_job(&harness.state, SESSION, 2);
    upload_input_blob(&harness, &job.blob_path).await;

    let first = process_invoice_job(&harness.state, &job.job_id, SESSION).await;
    assert!(matches!(first, TaskOutcome::Completed(_)));
    let after_first = harness.state.store.get_job(&job.job_id).unwrap().unwrap();

    let second = process_invoice_job(&harness.state, &job.job_id, SESSION).await;
    assert!(matches!(second, TaskOutcome::Noop(_)));
    let after_second = harness.state.store.get_job(&job.job_id).unwrap().unwrap();
    assert_eq!(after_second.attempt, after_first.attempt);
    assert_eq!(after_second.updated_at, after_first.updated_at);
    assert_eq!(after_second.result_json, after_first.result_json);
}

#[tokio::test]
async fn live_foreign_lock_is_contention_without_side_effects() {
    let harness = stub_state(test_config());
    let mut job = seed_job(&harness.state, SESSION, 2);
    job.status = JobStatus::Processing;
    job.processing_lock = Some(fresh_lock("worker-other"));
    job.attempt = 1;
    harness.state.store.create_job(job.clone()).unwrap();

    let outcome = process_invoice_job(&harness.state, &job.job_id, SESSION).await;
    assert!(matches!(outcome, TaskOutcome::Noop(_)));

    let stored = harness.state.store.get_job(&job.job_id).unwrap().unwrap();
    assert_eq!(stored.attempt, 1);
    assert_eq!(stored.status, JobStatus::Processing);
    assert_eq!(
        stored.processing_lock.unwrap().locked_by,
        "worker-other".to_string()
    );
}

#[tokio::test]
async fn stale_lock_takeover_resumes_async_operation_without_resubmit() {
    let mut config = test_config();
    config.ocr_sync_max_pages = 2;
    let harness = stub_state(config);

    // A previous worker crashed mid async OCR: operation name persisted,
    // shards already written, lock stale.
    let mut job = seed_job(&harness.state, SESSION, 10);
    job.status = JobStatus::Extracting;
    job.processing_lock = Some(stale_lock("worker-dead"));
    job.attempt = 1;
    job.ocr_operation_name = Some("operations/prior-attempt".to_string());
    harness.state.store.create_job(job.clone()).unwrap();
    upload_input_blob(&harness, &job.blob_path).await;
    harness
        .vision
        .write_shard(&format!("vision/{}/", job.job_id), "Invoice INV-001")
        .await;

    let outcome = process_invoice_job(&harness.state, &job.job_id, SESSION).await;
    assert!(matches!(outcome, TaskOutcome::Completed(JobStatus::Done)));

    let stored = harness.state.store.get_job(&job.job_id).unwrap().unwrap();
    assert_eq!(stored.attempt, 2);
    assert_eq!(stored.ocr_operation_name, None);
    assert_eq!(stored.ocr_method.as_deref(), Some("vision_async"));
    // Resume polled the existing operation instead of submitting a new one.
    assert_eq!(
        harness
            .vision
            .submit_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
    assert!(
        harness
            .vision
            .poll_calls
            .load(std::sync::atomic::Ordering::SeqCst)
            >= 1
    );
    // Intermediate shards are cleaned up before the lock is released.
    let shards = harness
        .blobs
        .list_prefix(&format!("vision/{}/", job.job_id))
        .await
        .unwrap();
    assert!(shards.is_empty());
}

#[tokio::test]
async fn primary_llm_failure_falls_back_without_client_visible_error() {
    let primary = StubLlm::scripted(
        "primary",
        vec![Err(LlmError::Transient("provider returned 500".to_string()))],
    );
    let fallback = StubLlm::ok("fallback");
    let harness = stub_state_with_llms(test_config(), primary.clone(), fallback.clone());

    let job = seed_job(&harness.state, SESSION, 2);
    upload_input_blob(&harness, &job.blob_path).await;

    let outcome = process_invoice_job(&harness.state, &job.job_id, SESSION).await;
    assert!(matches!(outcome, TaskOutcome::Completed(JobStatus::Done)));
    assert_eq!(primary.call_count(), 1);
    assert_eq!(fallback.call_count(), 1);

    let stored = harness.state.store.get_job(&job.job_id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Done);
    assert!(stored.error.is_none());
}

#[tokio::test]
async fn both_llms_unparseable_is_a_permanent_failure() {
    let primary = StubLlm::scripted(
        "primary",
        vec![Err(LlmError::Permanent("primary returned non-JSON".to_string()))],
    );
    let fallback = StubLlm::scripted(
        "fallback",
        vec![Err(LlmError::Permanent("fallback returned non-JSON".to_string()))],
    );
    let harness = stub_state_with_llms(test_config(), primary, fallback);

    let job = seed_job(&harness.state, SESSION, 2);
    upload_input_blob(&harness, &job.blob_path).await;

    let outcome = process_invoice_job(&harness.state, &job.job_id, SESSION).await;
    assert!(matches!(outcome, TaskOutcome::FailedPermanent(_)));

    let stored = harness.state.store.get_job(&job.job_id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.error.unwrap().contains("both providers"));
    assert!(stored.processing_lock.is_none());
    assert!(stored.stages.contains_key("failed"));
}

#[tokio::test]
async fn transient_llm_failure_is_not_recorded_and_redelivery_succeeds() {
    let primary = StubLlm::scripted(
        "primary",
        vec![Err(LlmError::Transient("timeout".to_string()))],
    );
    let fallback = StubLlm::scripted(
        "fallback",
        vec![Err(LlmError::Transient("timeout".to_string()))],
    );
    let harness = stub_state_with_llms(test_config(), primary.clone(), fallback);

    let job = seed_job(&harness.state, SESSION, 2);
    upload_input_blob(&harness, &job.blob_path).await;

    let first = process_invoice_job(&harness.state, &job.job_id, SESSION).await;
    assert!(matches!(first, TaskOutcome::Transient(_)));

    let stored = harness.state.store.get_job(&job.job_id).unwrap().unwrap();
    assert_ne!(stored.status, JobStatus::Failed);
    assert!(stored.error.is_none());
    assert!(stored.processing_lock.is_none());

    // Redelivery: the scripted failures are exhausted, so both providers
    // now answer, and the job completes on attempt two.
    let second = process_invoice_job(&harness.state, &job.job_id, SESSION).await;
    assert!(matches!(second, TaskOutcome::Completed(JobStatus::Done)));
    let stored = harness.state.store.get_job(&job.job_id).unwrap().unwrap();
    assert_eq!(stored.attempt, 2);
    assert!(stored.stages.contains_key("processing"));
    assert!(stored.stages.contains_key("processing#2"));
}

#[tokio::test]
async fn existing_result_skips_llm_entirely() {
    let primary = StubLlm::ok("primary");
    let fallback = StubLlm::ok("fallback");
    let harness = stub_state_with_llms(test_config(), primary.clone(), fallback.clone());

    let mut job = seed_job(&harness.state, SESSION, 2);
    job.result_json = Some(fixture_invoice_json());
    job.confidence_score = Some(0.9);
    harness.state.store.create_job(job.clone()).unwrap();
    upload_input_blob(&harness, &job.blob_path).await;

    let outcome = process_invoice_job(&harness.state, &job.job_id, SESSION).await;
    assert!(matches!(outcome, TaskOutcome::Completed(JobStatus::Done)));
    assert_eq!(primary.call_count(), 0);
    assert_eq!(fallback.call_count(), 0);

    let stored = harness.state.store.get_job(&job.job_id).unwrap().unwrap();
    assert_eq!(stored.result_json.unwrap(), fixture_invoice_json());
    assert_eq!(stored.confidence_score, Some(0.9));
}

#[tokio::test]
async fn delivery_for_deleted_job_is_a_silent_noop() {
    let harness = stub_state(test_config());
    let job = seed_job(&harness.state, SESSION, 2);
    crud::delete_session_data(&harness.state, SESSION)
        .await
        .unwrap();

    let outcome = process_invoice_job(&harness.state, &job.job_id, SESSION).await;
    assert!(matches!(outcome, TaskOutcome::Noop(_)));
    assert!(harness.state.store.get_job(&job.job_id).unwrap().is_none());
}

#[tokio::test]
async fn session_mismatch_fails_the_job() {
    let harness = stub_state(test_config());
    let job = seed_job(&harness.state, SESSION, 2);
    upload_input_blob(&harness, &job.blob_path).await;

    let other_session = "99999999-8888-4777-8666-555555555555";
    let outcome = process_invoice_job(&harness.state, &job.job_id, other_session).await;
    assert!(matches!(outcome, TaskOutcome::FailedPermanent(_)));
}

#[tokio::test]
async fn retry_after_failure_reaches_identical_result() {
    let primary = StubLlm::scripted(
        "primary",
        vec![Err(LlmError::Permanent("primary returned non-JSON".to_string()))],
    );
    let fallback = StubLlm::scripted(
        "fallback",
        vec![Err(LlmError::Permanent("fallback returned non-JSON".to_string()))],
    );
    let harness = stub_state_with_llms(test_config(), primary, fallback);

    let job = seed_job(&harness.state, SESSION, 2);
    upload_input_blob(&harness, &job.blob_path).await;

    let first = process_invoice_job(&harness.state, &job.job_id, SESSION).await;
    assert!(matches!(first, TaskOutcome::FailedPermanent(_)));
    let failed = harness.state.store.get_job(&job.job_id).unwrap().unwrap();
    let first_failed_stamp = *failed.stages.get("failed").unwrap();

    let retried = crud::retry_job(&harness.state, &job.job_id, SESSION, None)
        .await
        .unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    let queued = harness.state.store.get_job(&job.job_id).unwrap().unwrap();
    assert_eq!(queued.manual_retries, 1);
    assert!(queued.error.is_none());

    let second = process_invoice_job(&harness.state, &job.job_id, SESSION).await;
    assert!(matches!(second, TaskOutcome::Completed(JobStatus::Done)));
    let done = harness.state.store.get_job(&job.job_id).unwrap().unwrap();
    assert_eq!(done.result_json.unwrap(), fixture_invoice_json());
    // History survives the retry: the first failure marker is untouched.
    assert_eq!(*done.stages.get("failed").unwrap(), first_failed_stamp);
}
