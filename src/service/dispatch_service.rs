use crate::app::AppState;
use crate::module::invoice_job::schema::TaskPayload;
use crate::service::pipeline_service;
use base64::Engine;
use gcp_auth::TokenProvider;
use reqwest::StatusCode;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// The queue's retry policy is applied once per process on first enqueue;
/// IaC-managed queues simply see an idempotent patch.
static QUEUE_RETRY_CONFIG_APPLIED: AtomicBool = AtomicBool::new(false);

/// Enqueue one processing task. Emulation schedules the lifecycle engine on
/// this process (asynchronously, never inline); queue mode creates an
/// HTTP-POST task against the worker callback, OIDC-signed. A transient
/// queue failure falls back to the in-process path so uploads stay live.
///
/// Returns the queue task name, or `None` when the work runs in-process.
pub async fn enqueue_job(
    state: &AppState,
    job_id: &str,
    session_id: &str,
) -> Result<Option<String>, String> {
    if state.config.tasks_emulate || !queue_configured(state) {
        spawn_emulated(state, job_id, session_id);
        return Ok(None);
    }

    match create_queue_task(state, job_id, session_id).await {
        Ok(task_name) => Ok(Some(task_name)),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "queue enqueue failed, falling back to in-process execution");
            spawn_emulated(state, job_id, session_id);
            Ok(None)
        }
    }
}

fn queue_configured(state: &AppState) -> bool {
    !state.config.tasks_queue_path.is_empty()
        && !state.config.tasks_target_url.is_empty()
        && !state.config.tasks_service_account_email.is_empty()
}

fn spawn_emulated(state: &AppState, job_id: &str, session_id: &str) {
    let state = state.clone();
    let job_id = job_id.to_string();
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        let outcome = pipeline_service::process_invoice_job(&state, &job_id, &session_id).await;
        info!(job_id = %job_id, outcome = ?outcome, "emulated task finished");
    });
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest {
    task: QueueTask,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueTask {
    /// Derived from the job id so redelivery within the queue's dedup
    /// window collapses onto one task.
    name: String,
    http_request: TaskHttpRequest,
    dispatch_deadline: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskHttpRequest {
    url: String,
    http_method: String,
    headers: std::collections::HashMap<String, String>,
    /// Base64-encoded JSON payload.
    body: String,
    oidc_token: OidcToken,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OidcToken {
    service_account_email: String,
    audience: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueuePatchRequest {
    name: String,
    retry_config: QueueRetryConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueRetryConfig {
    max_attempts: u32,
    min_backoff: String,
    max_backoff: String,
}

async fn ensure_queue_retry_config(
    state: &AppState,
    client: &reqwest::Client,
    access_token: &str,
) -> Result<(), String> {
    if QUEUE_RETRY_CONFIG_APPLIED.load(Ordering::Acquire) {
        return Ok(());
    }
    let request = QueuePatchRequest {
        name: state.config.tasks_queue_path.clone(),
        retry_config: QueueRetryConfig {
            max_attempts: state.config.tasks_max_attempts,
            min_backoff: format!("{}s", state.config.tasks_min_backoff_seconds),
            max_backoff: format!("{}s", state.config.tasks_max_backoff_seconds),
        },
    };
    let api_url = format!(
        "https://cloudtasks.googleapis.com/v2/{}?updateMask=retryConfig",
        state.config.tasks_queue_path
    );
    let response = client
        .patch(&api_url)
        .bearer_auth(access_token)
        .json(&request)
        .send()
        .await
        .map_err(|e| format!("queue retry config update failed: {e}"))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("queue retry config rejected: {status}: {body:.200}"));
    }
    QUEUE_RETRY_CONFIG_APPLIED.store(true, Ordering::Release);
    Ok(())
}

async fn create_queue_task(
    state: &AppState,
    job_id: &str,
    session_id: &str,
) -> Result<String, String> {
    let payload = TaskPayload {
        job_id: job_id.to_string(),
        session_id: session_id.to_string(),
    };
    let body = serde_json::to_vec(&payload).map_err(|e| format!("payload encode failed: {e}"))?;

    let task_name = format!("{}/tasks/job-{job_id}", state.config.tasks_queue_path);
    let request = CreateTaskRequest {
        task: QueueTask {
            name: task_name.clone(),
            http_request: TaskHttpRequest {
                url: state.config.tasks_target_url.clone(),
                http_method: "POST".to_string(),
                headers: [("Content-Type".to_string(), "application/json".to_string())]
                    .into_iter()
                    .collect(),
                body: base64::engine::general_purpose::STANDARD.encode(body),
                oidc_token: OidcToken {
                    service_account_email: state.config.tasks_service_account_email.clone(),
                    audience: state.config.tasks_target_url.clone(),
                },
            },
            dispatch_deadline: format!("{}s", state.config.attempt_budget_seconds),
        },
    };

    let provider = gcp_auth::provider()
        .await
        .map_err(|e| format!("queue auth init failed: {e}"))?;
    let token = provider
        .token(&["https://www.googleapis.com/auth/cloud-tasks"])
        .await
        .map_err(|e| format!("queue access token failed: {e}"))?;

    let api_url = format!(
        "https://cloudtasks.googleapis.com/v2/{}/tasks",
        state.config.tasks_queue_path
    );
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| format!("queue http client failed: {e}"))?;

    if let Err(e) = ensure_queue_retry_config(state, &client, token.as_str()).await {
        warn!(error = %e, "queue retry config not applied");
    }

    let response = client
        .post(&api_url)
        .bearer_auth(token.as_str())
        .json(&request)
        .send()
        .await
        .map_err(|e| format!("queue request failed: {e}"))?;

    let status = response.status();
    if status.is_success() {
        info!(job_id = %job_id, task = %task_name, "task enqueued");
        return Ok(task_name);
    }
    // The queue already holds a task with this name: redelivery dedup.
    if status == StatusCode::CONFLICT {
        info!(job_id = %job_id, task = %task_name, "task already enqueued, deduplicated");
        return Ok(task_name);
    }
    let body = response.text().await.unwrap_or_default();
    Err(format!("queue returned {status}: {body:.200}"))
}
