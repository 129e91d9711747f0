use crate::app::AppState;
use crate::module::invoice_job::error::{AppError, RateLimitInfo};
use crate::service::store_service::{BucketDoc, DailyDoc};
use chrono::Utc;
use tracing::warn;

/// Counter writes are transactional with bounded retries; after that the
/// limiter fails open rather than blocking uploads on its own persistence.
const MAX_TXN_RETRIES: usize = 3;

const SECONDS_PER_DAY: i64 = 86400;
/// CET fixed UTC+1, no DST.
const CET_OFFSET_SECONDS: i64 = 3600;

#[derive(Debug, Clone, Copy)]
struct BucketDecision {
    allowed: bool,
    retry_after: i64,
    remaining: i64,
    reset_epoch: i64,
}

/// Refill-then-consume on a token bucket. Pure so the arithmetic is
/// testable with explicit clocks.
fn bucket_consume(
    doc: Option<&BucketDoc>,
    now_unix: f64,
    capacity: u32,
    refill_per_sec: f64,
    cost: u32,
) -> (Option<BucketDoc>, BucketDecision) {
    let capacity_f = f64::from(capacity);
    let cost_f = f64::from(cost);
    let (mut tokens, updated_at) = match doc {
        Some(d) => (d.tokens, d.updated_at_unix),
        None => (capacity_f, now_unix),
    };
    let elapsed = (now_unix - updated_at).max(0.0);
    tokens = (tokens + elapsed * refill_per_sec).min(capacity_f);

    let reset_epoch = if refill_per_sec > 0.0 {
        now_unix as i64 + ((capacity_f - tokens) / refill_per_sec).ceil() as i64
    } else {
        now_unix as i64
    };

    if tokens + 1e-9 >= cost_f {
        let after = tokens - cost_f;
        let next = BucketDoc {
            tokens: after,
            updated_at_unix: now_unix,
        };
        (
            Some(next),
            BucketDecision {
                allowed: true,
                retry_after: 0,
                remaining: after.floor() as i64,
                reset_epoch,
            },
        )
    } else {
        let need = cost_f - tokens;
        let retry_after = if refill_per_sec > 0.0 {
            ((need / refill_per_sec) - 1e-9).ceil().max(1.0) as i64
        } else {
            60
        };
        (
            None,
            BucketDecision {
                allowed: false,
                retry_after,
                remaining: tokens.floor().max(0.0) as i64,
                reset_epoch,
            },
        )
    }
}

/// Calendar-day key in CET fixed UTC+1.
pub fn cet_day_key(unix: i64) -> i64 {
    (unix + CET_OFFSET_SECONDS).div_euclid(SECONDS_PER_DAY)
}

/// Seconds until the next CET midnight; the returned value added to `unix`
/// lands exactly on an epoch where `(epoch + 3600) % 86400 == 0`.
pub fn secs_until_cet_midnight(unix: i64) -> i64 {
    SECONDS_PER_DAY - (unix + CET_OFFSET_SECONDS).rem_euclid(SECONDS_PER_DAY)
}

fn consume_bucket(
    state: &AppState,
    key: &str,
    capacity: u32,
    cost: u32,
    reject_detail: &str,
) -> Result<(), AppError> {
    if cost == 0 {
        return Ok(());
    }
    let refill_per_sec = f64::from(capacity) / 60.0;
    for attempt in 0..MAX_TXN_RETRIES {
        let now_unix = Utc::now().timestamp() as f64;
        match state.store.bucket_transact(key, |doc| {
            bucket_consume(doc, now_unix, capacity, refill_per_sec, cost)
        }) {
            Ok(decision) => {
                if decision.allowed {
                    return Ok(());
                }
                return Err(AppError::rate_limited(
                    reject_detail,
                    RateLimitInfo {
                        retry_after: decision.retry_after,
                        limit: i64::from(capacity),
                        remaining: decision.remaining,
                        reset_epoch: decision.reset_epoch,
                    },
                ));
            }
            Err(e) if attempt + 1 < MAX_TXN_RETRIES => {
                warn!(key = %key, error = %e, "rate limit bucket write conflict, retrying");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "rate limit bucket unavailable, failing open");
                return Ok(());
            }
        }
    }
    Ok(())
}

fn increment_daily(
    state: &AppState,
    key_prefix: &str,
    limit: u64,
    cost: u64,
    reject_detail: &str,
) -> Result<(), AppError> {
    for attempt in 0..MAX_TXN_RETRIES {
        let now_unix = Utc::now().timestamp();
        let key = format!("{key_prefix}:{}", cet_day_key(now_unix));
        let retry_after = secs_until_cet_midnight(now_unix);
        match state.store.daily_transact(&key, |doc| {
            let used = doc.used;
            if used + cost > limit {
                (None, Err(used))
            } else {
                (Some(DailyDoc { used: used + cost }), Ok(()))
            }
        }) {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(used)) => {
                return Err(AppError::rate_limited(
                    reject_detail,
                    RateLimitInfo {
                        retry_after,
                        limit: limit as i64,
                        remaining: (limit.saturating_sub(used)) as i64,
                        reset_epoch: now_unix + retry_after,
                    },
                ));
            }
            Err(e) if attempt + 1 < MAX_TXN_RETRIES => {
                warn!(key = %key, error = %e, "daily counter write conflict, retrying");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "daily counter unavailable, failing open");
                return Ok(());
            }
        }
    }
    Ok(())
}

/// All mechanisms must pass for an upload: per-session `createJobs` and
/// `uploadFile` buckets, the optional per-IP backstop, then the global and
/// per-session daily caps (global first so a session is not charged against
/// a day the service has already exhausted).
pub fn enforce_upload(
    state: &AppState,
    session_id: &str,
    files_count: usize,
    client_ip: Option<&str>,
) -> Result<(), AppError> {
    if !state.config.rl_enabled {
        return Ok(());
    }
    let cost = files_count.max(1) as u32;

    consume_bucket(
        state,
        &format!("sess:{session_id}:createJobs"),
        state.config.rl_jobs_per_min,
        cost,
        &format!(
            "Rate limit: max {} jobs/min per session",
            state.config.rl_jobs_per_min
        ),
    )?;
    consume_bucket(
        state,
        &format!("sess:{session_id}:uploadFile"),
        state.config.rl_files_per_min,
        cost,
        &format!(
            "Rate limit: max {} files/min per session",
            state.config.rl_files_per_min
        ),
    )?;

    if state.config.rl_use_ip_fallback {
        if let Some(ip) = client_ip.filter(|ip| !ip.is_empty()) {
            consume_bucket(
                state,
                &format!("ip:{ip}:createJobs"),
                state.config.rl_ip_per_min,
                cost,
                "Too many requests from your network. Please slow down.",
            )?;
        }
    }

    increment_daily(
        state,
        "global",
        state.config.rl_daily_global,
        u64::from(cost),
        "Service is at today's capacity. Please try again tomorrow.",
    )?;
    increment_daily(
        state,
        &format!("sess:{session_id}:daily"),
        state.config.rl_daily_per_session,
        u64::from(cost),
        &format!(
            "Daily limit reached ({} jobs). Try again tomorrow (CET).",
            state.config.rl_daily_per_session
        ),
    )?;
    Ok(())
}

pub fn enforce_retry(
    state: &AppState,
    session_id: &str,
    client_ip: Option<&str>,
) -> Result<(), AppError> {
    if !state.config.rl_enabled {
        return Ok(());
    }
    consume_bucket(
        state,
        &format!("sess:{session_id}:retry"),
        state.config.rl_retries_per_min,
        1,
        &format!(
            "Retry rate limit: max {}/min per session",
            state.config.rl_retries_per_min
        ),
    )?;
    if state.config.rl_use_ip_fallback {
        if let Some(ip) = client_ip.filter(|ip| !ip.is_empty()) {
            consume_bucket(
                state,
                &format!("ip:{ip}:retry"),
                state.config.rl_ip_per_min.max(10),
                1,
                "Too many retry requests from your network. Please slow down.",
            )?;
        }
    }
    Ok(())
}
