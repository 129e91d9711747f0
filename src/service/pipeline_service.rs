use crate::app::AppState;
use crate::module::invoice_job::model::{JobRecord, PreprocessStats};
use crate::module::invoice_job::schema::{JobStatus, TaskProcessResponse};
use crate::service::blob_service::{BlobError, ocr_output_prefix};
use crate::service::ocr_service::{OcrError, OcrOperationState, OcrText, collect_async_output};
use crate::service::{
    evaluation_service, invoice_service, llm_service, metrics_service, sanitize_service,
    store_service::{GuardedWrite, LockOutcome},
};
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info, warn};

const OCR_POLL_INITIAL: Duration = Duration::from_secs(2);
const OCR_POLL_MAX: Duration = Duration::from_secs(30);

/// How one task delivery ended. Contention, takeover, and deletion all
/// surface as `Noop`: the delivery is acknowledged and the competing worker
/// (or nobody) continues.
#[derive(Debug)]
pub enum TaskOutcome {
    Completed(JobStatus),
    Noop(&'static str),
    FailedPermanent(String),
    /// Not recorded on the job; the caller answers 503 so the queue
    /// redelivers with backoff.
    Transient(String),
}

impl TaskOutcome {
    pub fn to_response(&self, job_id: &str) -> TaskProcessResponse {
        match self {
            Self::Completed(status) => TaskProcessResponse {
                ok: true,
                job_id: job_id.to_string(),
                status: Some(*status),
                note: None,
            },
            Self::Noop(note) => TaskProcessResponse {
                ok: true,
                job_id: job_id.to_string(),
                status: None,
                note: Some((*note).to_string()),
            },
            Self::FailedPermanent(message) => TaskProcessResponse {
                ok: false,
                job_id: job_id.to_string(),
                status: Some(JobStatus::Failed),
                note: Some(message.clone()),
            },
            Self::Transient(message) => TaskProcessResponse {
                ok: false,
                job_id: job_id.to_string(),
                status: None,
                note: Some(message.clone()),
            },
        }
    }
}

enum StageFailure {
    /// Lock lost or job deleted mid-flight; silent abort.
    Contention,
    Transient(String),
    Permanent(String),
}

impl From<OcrError> for StageFailure {
    fn from(e: OcrError) -> Self {
        match e {
            OcrError::Transient(m) => Self::Transient(m),
            OcrError::Permanent(m) => Self::Permanent(m),
        }
    }
}

/// Entry point for one task delivery: acquire the lock, run the stages,
/// classify the outcome. Safe under duplicate deliveries and concurrent
/// workers; at most one makes progress on a given job.
pub async fn process_invoice_job(
    state: &AppState,
    job_id: &str,
    session_id: &str,
) -> TaskOutcome {
    let worker_id = state.worker_id.clone();
    let job = match state.store.acquire_processing_lock(
        job_id,
        &worker_id,
        state.config.lock_stale_seconds(),
    ) {
        Ok(LockOutcome::Acquired(job)) => *job,
        Ok(LockOutcome::Terminal(status)) => {
            info!(job_id = %job_id, status = status.as_str(), "redelivery for terminal job, no-op");
            return TaskOutcome::Noop("already terminal");
        }
        Ok(LockOutcome::Contended) => {
            info!(job_id = %job_id, "lock contended, another worker owns the job");
            return TaskOutcome::Noop("lock not acquired");
        }
        Ok(LockOutcome::NotFound) => {
            info!(job_id = %job_id, "job not found, likely deleted");
            return TaskOutcome::Noop("job not found");
        }
        Err(e) => return TaskOutcome::Transient(format!("job store unavailable: {e}")),
    };

    let queue_wait = Utc::now() - job.created_at;
    if let Ok(ms) = u64::try_from(queue_wait.num_milliseconds()) {
        metrics_service::record_queue_latency_ms(ms);
    }

    if job.session_id != session_id {
        warn!(job_id = %job_id, "task payload session does not match job");
        return fail_permanent(state, job_id, &worker_id, "session mismatch for job").await;
    }

    let budget = Duration::from_secs(state.config.attempt_budget_seconds.max(1));
    let result = tokio::time::timeout(budget, run_stages(state, &worker_id, job)).await;

    match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(StageFailure::Contention)) => {
            info!(job_id = %job_id, "lock lost mid-stage, another worker took over");
            TaskOutcome::Noop("lock lost")
        }
        Ok(Err(StageFailure::Transient(message))) => {
            warn!(job_id = %job_id, error = %message, "transient failure, leaving for redelivery");
            metrics_service::set_last_error_ts(Utc::now().timestamp());
            if let Err(e) = state.store.release_lock(job_id, &worker_id) {
                warn!(job_id = %job_id, error = %e, "lock release failed");
            }
            TaskOutcome::Transient(message)
        }
        Ok(Err(StageFailure::Permanent(message))) => {
            fail_permanent(state, job_id, &worker_id, &message).await
        }
        Err(_) => {
            warn!(job_id = %job_id, "attempt budget exceeded");
            metrics_service::set_last_error_ts(Utc::now().timestamp());
            if let Err(e) = state.store.release_lock(job_id, &worker_id) {
                warn!(job_id = %job_id, error = %e, "lock release failed");
            }
            TaskOutcome::Transient("attempt budget exceeded".to_string())
        }
    }
}

async fn fail_permanent(
    state: &AppState,
    job_id: &str,
    worker_id: &str,
    message: &str,
) -> TaskOutcome {
    error!(job_id = %job_id, error = %message, "job failed permanently");
    metrics_service::set_last_error_ts(Utc::now().timestamp());
    match state.store.set_error(job_id, worker_id, message) {
        Ok(GuardedWrite::Applied(_)) => {
            metrics_service::inc_jobs_failed();
            TaskOutcome::FailedPermanent(message.to_string())
        }
        Ok(_) => TaskOutcome::Noop("lock lost"),
        Err(e) => TaskOutcome::Transient(format!("job store unavailable: {e}")),
    }
}

async fn run_stages(
    state: &AppState,
    worker_id: &str,
    job: JobRecord,
) -> Result<TaskOutcome, StageFailure> {
    let job_id = job.job_id.clone();

    // A prior attempt already extracted a result; never re-invoke the LLM.
    if let Some(result) = job.result_json.clone() {
        info!(job_id = %job_id, "result already present, finalizing without llm");
        let confidence = job.confidence_score.unwrap_or(0.0);
        return finalize(state, worker_id, &job, result, confidence).await;
    }

    let ocr_started = Instant::now();
    let (ocr, method) = run_ocr_stage(state, worker_id, &job).await?;
    metrics_service::record_ocr_duration_ms(ocr_started.elapsed().as_millis() as u64);
    ensure_applied(state.store.guarded_update(&job_id, worker_id, |j| {
        j.ocr_method = Some(method.to_string());
    }))?;
    info!(job_id = %job_id, method = method, pages = ocr.pages, "ocr complete");

    let text_for_llm = sanitize_service::sanitize_for_llm(
        &ocr.text,
        state.config.preprocess_max_chars,
        state.config.zone_strip_top,
        state.config.zone_strip_bottom,
    );
    let reduction = if ocr.text.is_empty() {
        0.0
    } else {
        let base = ocr.text.chars().count().max(1) as f64;
        ((1.0 - text_for_llm.chars().count() as f64 / base).max(0.0) * 1000.0).round() / 1000.0
    };
    ensure_applied(state.store.guarded_update(&job_id, worker_id, |j| {
        j.preprocess = Some(PreprocessStats { reduction });
    }))?;

    ensure_applied(
        state
            .store
            .advance_status(&job_id, worker_id, JobStatus::Llm),
    )?;
    touch_heartbeat(state, &job_id, worker_id)?;

    info!(
        job_id = %job_id,
        prompt_version = %state.config.llm_prompt_version,
        "starting llm extraction"
    );
    let llm_started = Instant::now();
    let raw = llm_service::extract_invoice(
        state.llm_primary.as_ref(),
        state.llm_fallback.as_ref(),
        &text_for_llm,
    )
    .await
    .map_err(|e| match e {
        llm_service::LlmError::Transient(m) => StageFailure::Transient(m),
        llm_service::LlmError::Permanent(m) => StageFailure::Permanent(m),
    })?;
    metrics_service::record_llm_duration_ms(llm_started.elapsed().as_millis() as u64);

    let invoice = invoice_service::parse_invoice(&raw).map_err(|e| {
        StageFailure::Permanent(format!("validation error: invoice schema mismatch ({e})"))
    })?;

    let confidence = evaluation_service::compute_confidence(&invoice, None);
    let result_value = serde_json::to_value(&invoice)
        .map_err(|e| StageFailure::Permanent(format!("result encoding failed: {e}")))?;

    finalize(state, worker_id, &job, result_value, confidence).await
}

/// Terminal success write plus best-effort input cleanup. The blob delete
/// must never regress status; retention sweeps anything left behind.
async fn finalize(
    state: &AppState,
    worker_id: &str,
    job: &JobRecord,
    result: serde_json::Value,
    confidence: f64,
) -> Result<TaskOutcome, StageFailure> {
    match state
        .store
        .set_result(&job.job_id, worker_id, result, confidence)
    {
        Ok(GuardedWrite::Applied(_)) => {}
        Ok(_) => return Err(StageFailure::Contention),
        Err(e) => return Err(StageFailure::Transient(format!("job store unavailable: {e}"))),
    }
    metrics_service::inc_jobs_done();

    match state.blobs.delete(&job.blob_path).await {
        Ok(()) | Err(BlobError::NotFound(_)) => {}
        Err(e) => {
            warn!(job_id = %job.job_id, error = %e, "input blob cleanup failed, retention will sweep");
        }
    }

    info!(job_id = %job.job_id, confidence = confidence, "job done");
    Ok(TaskOutcome::Completed(JobStatus::Done))
}

/// OCR stage: synchronous tier for short documents, resumable async
/// operation for the rest.
async fn run_ocr_stage(
    state: &AppState,
    worker_id: &str,
    job: &JobRecord,
) -> Result<(OcrText, &'static str), StageFailure> {
    let job_id = &job.job_id;

    if job.page_count <= state.config.ocr_sync_max_pages {
        let text = state
            .vision
            .annotate_sync(&job.blob_path, job.page_count)
            .await?;
        ensure_applied(
            state
                .store
                .advance_status(job_id, worker_id, JobStatus::Extracting),
        )?;
        return Ok((text, "vision_sync"));
    }

    let output_prefix = ocr_output_prefix(job_id);
    let operation_name = match &job.ocr_operation_name {
        // Resume: an operation from a previous attempt is still the single
        // source of truth for this document.
        Some(name) => {
            info!(job_id = %job_id, operation = %name, "resuming async ocr operation");
            name.clone()
        }
        None => {
            let batch_size = job.page_count.min(state.config.max_pages).max(1);
            let name = state
                .vision
                .submit_async(&job.blob_path, &output_prefix, batch_size)
                .await?;
            ensure_applied(state.store.guarded_update(job_id, worker_id, |j| {
                j.ocr_operation_name = Some(name.clone());
            }))?;
            ensure_applied(
                state
                    .store
                    .advance_status(job_id, worker_id, JobStatus::Extracting),
            )?;
            info!(job_id = %job_id, operation = %name, "submitted async ocr operation");
            name
        }
    };

    poll_operation(state, worker_id, job_id, &operation_name).await?;

    let text = collect_async_output(state.blobs.as_ref(), &output_prefix).await?;
    ensure_applied(state.store.guarded_update(job_id, worker_id, |j| {
        j.ocr_operation_name = None;
    }))?;
    ensure_applied(
        state
            .store
            .advance_status(job_id, worker_id, JobStatus::Extracting),
    )?;
    Ok((text, "vision_async"))
}

/// Exponential-backoff polling bounded by the stage timeout, with
/// heartbeats so the lock stays observably live during long operations.
async fn poll_operation(
    state: &AppState,
    worker_id: &str,
    job_id: &str,
    operation_name: &str,
) -> Result<(), StageFailure> {
    let deadline = Instant::now() + Duration::from_secs(state.config.ocr_poll_timeout_seconds);
    let heartbeat_every = Duration::from_secs(state.config.heartbeat_interval_seconds.max(1) as u64);
    let mut last_heartbeat = Instant::now();
    let mut delay = OCR_POLL_INITIAL;

    loop {
        match state.vision.poll_operation(operation_name).await? {
            OcrOperationState::Done => return Ok(()),
            OcrOperationState::Failed(message) => {
                // Known-terminal operation: drop the handle so a fresh
                // delivery may submit a new one.
                ensure_applied(state.store.guarded_update(job_id, worker_id, |j| {
                    j.ocr_operation_name = None;
                }))?;
                return Err(StageFailure::Transient(format!(
                    "ocr operation failed: {message}"
                )));
            }
            OcrOperationState::Running => {}
        }

        if Instant::now() >= deadline {
            return Err(StageFailure::Transient(
                "ocr operation poll timed out".to_string(),
            ));
        }
        if last_heartbeat.elapsed() >= heartbeat_every {
            touch_heartbeat(state, job_id, worker_id)?;
            last_heartbeat = Instant::now();
        }
        sleep(delay.min(deadline.saturating_duration_since(Instant::now()))).await;
        delay = (delay * 2).min(OCR_POLL_MAX);
    }
}

fn touch_heartbeat(state: &AppState, job_id: &str, worker_id: &str) -> Result<(), StageFailure> {
    ensure_applied(state.store.touch_heartbeat(job_id, worker_id)).map(|_| ())
}

fn ensure_applied(write: Result<GuardedWrite, String>) -> Result<JobRecord, StageFailure> {
    match write {
        Ok(GuardedWrite::Applied(job)) => Ok(*job),
        Ok(GuardedWrite::LockLost) | Ok(GuardedWrite::NotFound) => Err(StageFailure::Contention),
        Err(e) => Err(StageFailure::Transient(format!(
            "job store unavailable: {e}"
        ))),
    }
}
