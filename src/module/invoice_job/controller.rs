use super::crud::{self, UploadedFile};
use super::error::AppError;
use super::schema::{
    ConfigResponse, DeleteSessionResponse, HealthMetricsView, HealthResponse, RootResponse,
    TaskPayload,
};
use crate::app::AppState;
use crate::service::{metrics_service, pipeline_service};
use axum::Json;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use chrono::Utc;

pub async fn root() -> impl IntoResponse {
    Json(RootResponse {
        name: "Invoice Processing API".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(ConfigResponse {
        max_files: state.config.max_files,
        max_size_mb: state.config.max_size_mb,
        max_pages: state.config.max_pages,
        accepted_mime: state.config.accepted_mime.clone(),
    })
}

pub async fn healthz() -> impl IntoResponse {
    let m = metrics_service::snapshot();
    Json(HealthResponse {
        status: "ok".to_string(),
        time: Utc::now(),
        metrics: HealthMetricsView {
            jobs_queued: m.jobs_queued,
            jobs_done: m.jobs_done,
            jobs_failed: m.jobs_failed,
            retries_requested: m.retries_requested,
            ocr_duration_count: m.ocr_duration_count,
            ocr_duration_avg_ms: m.ocr_duration_avg_ms,
            llm_duration_count: m.llm_duration_count,
            llm_duration_avg_ms: m.llm_duration_avg_ms,
            queue_latency_count: m.queue_latency_count,
            queue_latency_avg_ms: m.queue_latency_avg_ms,
            last_error_ts: m.last_error_ts,
        },
    })
}

pub async fn create_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let session_id = session_from_headers(&headers)?;
    let client_ip = client_ip(&headers);

    let mut files = Vec::new();
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| AppError::file_validation(format!("unreadable multipart body: {e}")))?;
        let Some(field) = field else { break };
        if field.file_name().is_none() {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.pdf").to_string();
        let content_type = field.content_type().unwrap_or("").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|_| AppError::payload_too_large("upload exceeds request size limit"))?;
        files.push(UploadedFile {
            filename,
            content_type,
            bytes: bytes.to_vec(),
        });
    }

    let response =
        crud::create_upload_jobs(&state, &session_id, files, client_ip.as_deref()).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn get_job_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session_id = session_from_headers(&headers)?;
    Ok(Json(crud::get_job(&state, &job_id, &session_id)?))
}

pub async fn list_session_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require_session_match(&headers, &session_id)?;
    Ok(Json(crud::list_session_jobs(&state, &session_id)?))
}

pub async fn retry_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session_id = session_from_headers(&headers)?;
    let client_ip = client_ip(&headers);
    let response = crud::retry_job(&state, &job_id, &session_id, client_ip.as_deref()).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn export_session_csv(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require_session_match(&headers, &session_id)?;
    let csv = crud::export_session_csv(&state, &session_id)?;
    let disposition = format!("attachment; filename=export-{session_id}.csv");
    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                "text/csv; charset=utf-8".to_string(),
            ),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        csv,
    ))
}

pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require_session_match(&headers, &session_id)?;
    let deleted = crud::delete_session_data(&state, &session_id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(DeleteSessionResponse {
        session_id,
        deleted,
    }))
}

/// Worker callback. Queue deliveries must present a valid OIDC token whose
/// audience is this endpoint; emulation mode bypasses the check for local
/// development only.
pub async fn process_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<TaskPayload>,
) -> Result<impl IntoResponse, AppError> {
    if !state.config.tasks_emulate {
        match &state.oidc {
            Some(verifier) => verifier.verify(&headers).await?,
            None => {
                return Err(AppError::unauthorized(
                    "worker endpoint auth is not configured",
                ));
            }
        }
    }
    if payload.job_id.is_empty() || payload.session_id.is_empty() {
        return Err(AppError::bad_request(
            "invalidPayload",
            "Missing jobId or sessionId",
        ));
    }

    let outcome =
        pipeline_service::process_invoice_job(&state, &payload.job_id, &payload.session_id).await;
    if let pipeline_service::TaskOutcome::Transient(message) = &outcome {
        // Non-2xx tells the queue to redeliver with backoff.
        return Err(AppError::external_service(message.clone()));
    }
    Ok(Json(outcome.to_response(&payload.job_id)))
}

/// The `X-Session-Id` header: client-generated UUIDv4, 36 chars.
fn session_from_headers(headers: &HeaderMap) -> Result<String, AppError> {
    let raw = headers
        .get("X-Session-Id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if raw.len() == 36 && raw.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
        Ok(raw.to_string())
    } else {
        Err(AppError::bad_request(
            "invalidSession",
            "Missing or invalid X-Session-Id header",
        ))
    }
}

fn require_session_match(headers: &HeaderMap, session_id: &str) -> Result<(), AppError> {
    let header_session = session_from_headers(headers)?;
    if header_session != session_id {
        return Err(AppError::bad_request("sessionMismatch", "Session mismatch"));
    }
    Ok(())
}

/// Coarse client IP for the optional per-IP backstop: left-most
/// `X-Forwarded-For` entry when present.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
