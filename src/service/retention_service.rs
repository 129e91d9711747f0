use crate::app::AppState;
use crate::module::invoice_job::crud;
use chrono::{Duration, Utc};
use std::collections::BTreeSet;
use tokio::time::sleep;
use tracing::{info, warn};

/// Background sweeper: sessions whose jobs outlived the retention window
/// are deleted wholesale. Runs as one process-wide task, so iterations
/// never overlap themselves.
pub async fn run_retention_loop(state: AppState) {
    let interval =
        std::time::Duration::from_secs(state.config.retention_loop_interval_min.max(1) * 60);
    info!(
        interval_min = state.config.retention_loop_interval_min,
        retention_hours = state.config.retention_hours,
        "retention loop started"
    );
    loop {
        match sweep_once(&state).await {
            Ok(deleted) if deleted > 0 => {
                info!(deleted = deleted, "retention sweep removed stale jobs");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "retention sweep failed");
            }
        }
        sleep(interval).await;
    }
}

/// One bounded sweep: collect stale jobs, group by session, delete each
/// session's data. Returns the number of jobs removed.
pub async fn sweep_once(state: &AppState) -> Result<usize, String> {
    let cutoff = Utc::now() - Duration::hours(state.config.retention_hours);
    let stale = state
        .store
        .list_stale_jobs(cutoff, state.config.retention_batch_size)?;
    if stale.is_empty() {
        return Ok(0);
    }

    let sessions: BTreeSet<String> = stale.into_iter().map(|j| j.session_id).collect();
    let mut deleted = 0usize;
    for session_id in sessions {
        match crud::delete_session_data(state, &session_id).await {
            Ok(count) => deleted += count,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "retention delete failed for session");
            }
        }
    }
    Ok(deleted)
}
