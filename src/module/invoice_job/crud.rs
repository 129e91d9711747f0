use super::error::{AppError, RateLimitInfo};
use super::model::JobRecord;
use super::schema::{
    JobItemView, JobStatus, JobStatusResponse, JobsCreateResponse, Limits, RetryJobResponse,
    SessionJobView, SessionJobsResponse,
};
use crate::app::AppState;
use crate::service::blob_service::input_blob_path;
use crate::service::{
    dispatch_service, invoice_service, metrics_service, pdf_service, rate_limit_service,
};
use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use tracing::{error, info, warn};
use uuid::Uuid;

/// One part of the multipart upload, already buffered.
#[derive(Debug)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

struct ValidatedFile {
    filename: String,
    bytes: Vec<u8>,
    page_count: usize,
}

/// Upload intake: rate-limit, validate every file, store blobs, create job
/// documents, enqueue. Any invalid file fails the whole request before a
/// single blob is written.
pub async fn create_upload_jobs(
    state: &AppState,
    session_id: &str,
    files: Vec<UploadedFile>,
    client_ip: Option<&str>,
) -> Result<JobsCreateResponse, AppError> {
    if files.is_empty() {
        return Err(AppError::file_validation("No files provided"));
    }
    if files.len() > state.config.max_files {
        return Err(AppError::file_validation(format!(
            "Too many files in one request (max {})",
            state.config.max_files
        )));
    }

    rate_limit_service::enforce_upload(state, session_id, files.len(), client_ip)?;

    let mut validated = Vec::with_capacity(files.len());
    for file in files {
        validated.push(validate_file(state, file)?);
    }

    let mut jobs = Vec::with_capacity(validated.len());
    for file in validated {
        let job_id = Uuid::new_v4().to_string();
        let blob_path = input_blob_path(session_id, &job_id);
        if let Err(e) = state
            .blobs
            .upload(&blob_path, file.bytes.clone(), "application/pdf")
            .await
        {
            error!(session_id = %session_id, error = %e, "blob upload failed");
            return Err(AppError::external_service(
                "Storage error while uploading file",
            ));
        }

        let now = Utc::now();
        let record = JobRecord {
            job_id: job_id.clone(),
            session_id: session_id.to_string(),
            filename: file.filename.clone(),
            size_bytes: file.bytes.len() as u64,
            page_count: file.page_count,
            blob_path,
            status: JobStatus::Uploaded,
            stages: BTreeMap::from([("uploaded".to_string(), now)]),
            processing_lock: None,
            attempt: 0,
            manual_retries: 0,
            ocr_operation_name: None,
            ocr_method: None,
            preprocess: None,
            result_json: None,
            confidence_score: None,
            error: None,
            heartbeat_at: None,
            created_at: now,
            updated_at: now,
        };
        state
            .store
            .create_job(record)
            .map_err(|e| AppError::internal(format!("job store unavailable: {e}")))?;

        if let Err(e) = dispatch_service::enqueue_job(state, &job_id, session_id).await {
            error!(job_id = %job_id, error = %e, "task enqueue failed");
            return Err(AppError::external_service(
                "Task queue error while enqueuing job",
            ));
        }
        state
            .store
            .set_status(&job_id, JobStatus::Queued)
            .map_err(|e| AppError::internal(format!("job store unavailable: {e}")))?;
        metrics_service::inc_jobs_queued();
        info!(job_id = %job_id, session_id = %session_id, filename = %file.filename, "job queued");

        jobs.push(JobItemView {
            job_id,
            filename: file.filename,
            status: JobStatus::Queued,
            size_bytes: Some(file.bytes.len() as u64),
            page_count: Some(file.page_count),
        });
    }

    Ok(JobsCreateResponse {
        session_id: session_id.to_string(),
        jobs,
        limits: Limits {
            max_files: state.config.max_files,
            max_size_mb: state.config.max_size_mb,
            max_pages: state.config.max_pages,
        },
        note: state
            .config
            .tasks_emulate
            .then(|| "tasks emulated in-process".to_string()),
    })
}

fn validate_file(state: &AppState, file: UploadedFile) -> Result<ValidatedFile, AppError> {
    if !state.config.accepted_mime.contains(&file.content_type) {
        return Err(AppError::file_validation(format!(
            "Unsupported MIME type: {}",
            file.content_type
        )));
    }
    if file.bytes.is_empty() {
        return Err(AppError::file_validation(format!(
            "File {} is empty",
            file.filename
        )));
    }
    if file.bytes.len() as u64 > state.config.max_size_bytes() {
        return Err(AppError::payload_too_large(format!(
            "File {} exceeds size limit ({} MB)",
            file.filename, state.config.max_size_mb
        )));
    }
    let page_count = pdf_service::count_pdf_pages(&file.bytes)
        .map_err(|e| AppError::file_validation(format!("File {}: {e}", file.filename)))?;
    if page_count > state.config.max_pages {
        return Err(AppError::file_validation(format!(
            "File {} exceeds page limit ({} pages)",
            file.filename, state.config.max_pages
        )));
    }
    Ok(ValidatedFile {
        filename: file.filename,
        bytes: file.bytes,
        page_count,
    })
}

/// Client-initiated retry: only from terminal `failed` or a stale-abandoned
/// non-terminal state, capped, and only while the input blob still exists.
pub async fn retry_job(
    state: &AppState,
    job_id: &str,
    session_id: &str,
    client_ip: Option<&str>,
) -> Result<RetryJobResponse, AppError> {
    rate_limit_service::enforce_retry(state, session_id, client_ip)?;

    let job = state
        .store
        .get_job(job_id)
        .map_err(|e| AppError::internal(format!("job store unavailable: {e}")))?
        .filter(|j| j.session_id == session_id)
        .ok_or_else(|| AppError::not_found("Job not found"))?;

    if job.status == JobStatus::Done {
        return Err(AppError::conflict(
            "terminalState",
            "Job already completed; retry not applicable",
        ));
    }
    if job.status != JobStatus::Failed {
        let last_activity = job.liveness_at().unwrap_or(job.updated_at);
        let stale = Utc::now() - last_activity > Duration::seconds(state.config.lock_stale_seconds());
        if !stale {
            return Err(AppError::conflict(
                "inProgress",
                "Job is still being processed",
            ));
        }
    }

    if job.manual_retries >= state.config.manual_retry_cap {
        let now = Utc::now().timestamp();
        return Err(AppError::rate_limited(
            format!(
                "retry limit reached ({} per job)",
                state.config.manual_retry_cap
            ),
            RateLimitInfo {
                retry_after: 0,
                limit: i64::from(state.config.manual_retry_cap),
                remaining: 0,
                reset_epoch: now,
            },
        ));
    }

    let blob_present = state
        .blobs
        .exists(&job.blob_path)
        .await
        .map_err(|e| AppError::external_service(format!("blob store unavailable: {e}")))?;
    if !blob_present {
        return Err(AppError::conflict(
            "reuploadRequired",
            "Original PDF not available; re-upload required",
        ));
    }

    state
        .store
        .retry_reset(job_id)
        .map_err(|e| AppError::internal(format!("job store unavailable: {e}")))?
        .ok_or_else(|| AppError::not_found("Job not found"))?;

    if let Err(e) = dispatch_service::enqueue_job(state, job_id, session_id).await {
        error!(job_id = %job_id, error = %e, "retry enqueue failed");
        return Err(AppError::external_service(
            "Task queue error while enqueuing job",
        ));
    }
    metrics_service::inc_retries_requested();
    info!(job_id = %job_id, "job manually requeued");

    Ok(RetryJobResponse {
        job_id: job_id.to_string(),
        status: JobStatus::Queued,
    })
}

pub fn get_job(
    state: &AppState,
    job_id: &str,
    session_id: &str,
) -> Result<JobStatusResponse, AppError> {
    let job = state
        .store
        .get_job(job_id)
        .map_err(|e| AppError::internal(format!("job store unavailable: {e}")))?
        .filter(|j| j.session_id == session_id)
        .ok_or_else(|| AppError::not_found("Job not found"))?;

    Ok(JobStatusResponse {
        job_id: job.job_id,
        status: job.status,
        stages: job.stages,
        size_bytes: Some(job.size_bytes),
        page_count: Some(job.page_count),
        result_json: job.result_json,
        confidence_score: job.confidence_score,
        error: job.error,
    })
}

pub fn list_session_jobs(
    state: &AppState,
    session_id: &str,
) -> Result<SessionJobsResponse, AppError> {
    let jobs = state
        .store
        .list_jobs_by_session(session_id)
        .map_err(|e| AppError::internal(format!("job store unavailable: {e}")))?;
    Ok(SessionJobsResponse {
        session_id: session_id.to_string(),
        jobs: jobs
            .into_iter()
            .map(|job| SessionJobView {
                job_id: job.job_id,
                filename: job.filename,
                status: job.status,
                stages: job.stages,
                size_bytes: Some(job.size_bytes),
                page_count: Some(job.page_count),
            })
            .collect(),
    })
}

/// Session export: completed jobs (createdAt descending), one CSV row per
/// line item. Jobs whose stored result no longer parses are skipped.
pub fn export_session_csv(state: &AppState, session_id: &str) -> Result<String, AppError> {
    let jobs = state
        .store
        .list_done_jobs_by_session(session_id)
        .map_err(|e| AppError::internal(format!("job store unavailable: {e}")))?;

    let mut lines = vec![invoice_service::csv_header()];
    for job in jobs {
        let Some(result) = &job.result_json else {
            continue;
        };
        match invoice_service::parse_invoice(result) {
            Ok(invoice) => {
                lines.extend(invoice_service::csv_rows(
                    &invoice,
                    &job.filename,
                    job.confidence_score,
                ));
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "skipping unparseable stored result in export");
            }
        }
    }
    lines.push(String::new());
    Ok(lines.join("\r\n"))
}

/// Delete every job of the session and its input blob. Idempotent; a second
/// call reports zero. Used by both the HTTP surface and the retention loop.
pub async fn delete_session_data(state: &AppState, session_id: &str) -> Result<usize, String> {
    let jobs = state.store.list_jobs_by_session(session_id)?;
    let mut deleted = 0usize;
    for job in jobs {
        match state.blobs.delete(&job.blob_path).await {
            Ok(()) => {}
            Err(e) => {
                // Best-effort: the job document still goes away.
                tracing::debug!(job_id = %job.job_id, error = %e, "input blob delete skipped");
            }
        }
        if state.store.delete_job(&job.job_id)? {
            deleted += 1;
        }
    }
    info!(session_id = %session_id, deleted = deleted, "session data deleted");
    Ok(deleted)
}
