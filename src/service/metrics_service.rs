use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

static JOBS_QUEUED: AtomicU64 = AtomicU64::new(0);
static JOBS_DONE: AtomicU64 = AtomicU64::new(0);
static JOBS_FAILED: AtomicU64 = AtomicU64::new(0);
static RETRIES_REQUESTED: AtomicU64 = AtomicU64::new(0);

static OCR_DURATION_COUNT: AtomicU64 = AtomicU64::new(0);
static OCR_DURATION_TOTAL_MS: AtomicU64 = AtomicU64::new(0);

static LLM_DURATION_COUNT: AtomicU64 = AtomicU64::new(0);
static LLM_DURATION_TOTAL_MS: AtomicU64 = AtomicU64::new(0);

static QUEUE_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);
static QUEUE_LATENCY_TOTAL_MS: AtomicU64 = AtomicU64::new(0);

static LAST_ERROR_TS: AtomicI64 = AtomicI64::new(0);

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_queued: u64,
    pub jobs_done: u64,
    pub jobs_failed: u64,
    pub retries_requested: u64,
    pub ocr_duration_count: u64,
    pub ocr_duration_avg_ms: u64,
    pub llm_duration_count: u64,
    pub llm_duration_avg_ms: u64,
    pub queue_latency_count: u64,
    pub queue_latency_avg_ms: u64,
    pub last_error_ts: i64,
}

pub fn inc_jobs_queued() {
    JOBS_QUEUED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_jobs_done() {
    JOBS_DONE.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_jobs_failed() {
    JOBS_FAILED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_retries_requested() {
    RETRIES_REQUESTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_ocr_duration_ms(duration_ms: u64) {
    OCR_DURATION_COUNT.fetch_add(1, Ordering::Relaxed);
    OCR_DURATION_TOTAL_MS.fetch_add(duration_ms, Ordering::Relaxed);
}

pub fn record_llm_duration_ms(duration_ms: u64) {
    LLM_DURATION_COUNT.fetch_add(1, Ordering::Relaxed);
    LLM_DURATION_TOTAL_MS.fetch_add(duration_ms, Ordering::Relaxed);
}

pub fn record_queue_latency_ms(duration_ms: u64) {
    QUEUE_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
    QUEUE_LATENCY_TOTAL_MS.fetch_add(duration_ms, Ordering::Relaxed);
}

pub fn set_last_error_ts(ts: i64) {
    LAST_ERROR_TS.store(ts, Ordering::Relaxed);
}

pub fn snapshot() -> MetricsSnapshot {
    let ocr_count = OCR_DURATION_COUNT.load(Ordering::Relaxed);
    let llm_count = LLM_DURATION_COUNT.load(Ordering::Relaxed);
    let queue_count = QUEUE_LATENCY_COUNT.load(Ordering::Relaxed);

    MetricsSnapshot {
        jobs_queued: JOBS_QUEUED.load(Ordering::Relaxed),
        jobs_done: JOBS_DONE.load(Ordering::Relaxed),
        jobs_failed: JOBS_FAILED.load(Ordering::Relaxed),
        retries_requested: RETRIES_REQUESTED.load(Ordering::Relaxed),
        ocr_duration_count: ocr_count,
        ocr_duration_avg_ms: if ocr_count > 0 {
            OCR_DURATION_TOTAL_MS.load(Ordering::Relaxed) / ocr_count
        } else {
            0
        },
        llm_duration_count: llm_count,
        llm_duration_avg_ms: if llm_count > 0 {
            LLM_DURATION_TOTAL_MS.load(Ordering::Relaxed) / llm_count
        } else {
            0
        },
        queue_latency_count: queue_count,
        queue_latency_avg_ms: if queue_count > 0 {
            QUEUE_LATENCY_TOTAL_MS.load(Ordering::Relaxed) / queue_count
        } else {
            0
        },
        last_error_ts: LAST_ERROR_TS.load(Ordering::Relaxed),
    }
}
