use super::controller;
use crate::app::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};

pub fn register_routes(state: AppState) -> Router {
    // Multipart bodies may carry up to max_files PDFs of max_size_mb each.
    let body_limit = (state.config.max_files as u64 * state.config.max_size_bytes()
        + 1024 * 1024) as usize;

    Router::new()
        .route("/", get(controller::root))
        .route("/api/config", get(controller::get_config))
        .route("/api/healthz", get(controller::healthz))
        .route("/api/jobs", post(controller::create_jobs))
        .route("/api/jobs/:job_id", get(controller::get_job_status))
        .route("/api/jobs/:job_id/retry", post(controller::retry_job))
        .route(
            "/api/sessions/:session_id/jobs",
            get(controller::list_session_jobs),
        )
        .route(
            "/api/sessions/:session_id/export.csv",
            get(controller::export_session_csv),
        )
        .route("/api/sessions/:session_id", delete(controller::delete_session))
        .route("/api/tasks/process", post(controller::process_task))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
