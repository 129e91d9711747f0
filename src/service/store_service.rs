use crate::module::invoice_job::model::{JobRecord, ProcessingLock};
use crate::module::invoice_job::schema::JobStatus;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Outcome of the transactional lock acquisition.
#[derive(Debug, Clone)]
pub enum LockOutcome {
    /// Lock set, attempt incremented, status moved to `processing`.
    Acquired(Box<JobRecord>),
    /// Job already terminal; redelivery is an idempotent no-op.
    Terminal(JobStatus),
    /// Another worker holds a live lock.
    Contended,
    /// Job deleted (expected for redelivery after session delete).
    NotFound,
}

/// Outcome of a write gated on lock ownership.
#[derive(Debug, Clone)]
pub enum GuardedWrite {
    Applied(Box<JobRecord>),
    /// Another worker legitimately took over; abort without error.
    LockLost,
    NotFound,
}

/// Token-bucket document persisted under a deterministic rate-limit key.
#[derive(Debug, Clone)]
pub struct BucketDoc {
    pub tokens: f64,
    pub updated_at_unix: f64,
}

/// Daily counter document. Counters only ever grow; a new CET day uses a
/// new key.
#[derive(Debug, Clone, Default)]
pub struct DailyDoc {
    pub used: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    jobs_by_id: HashMap<String, JobRecord>,
    rl_buckets: HashMap<String, BucketDoc>,
    rl_daily: HashMap<String, DailyDoc>,
}

/// Transactional document store for jobs and rate-limit state.
///
/// Every method is a single read-modify-write under the store mutex, which
/// gives the same atomicity the production document database provides per
/// transaction: concurrent lock attempts serialize, and at most one caller
/// observes the job in a claimable state.
#[derive(Debug, Default)]
pub struct JobStoreService {
    inner: Mutex<StoreInner>,
}

impl JobStoreService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>, String> {
        self.inner
            .lock()
            .map_err(|_| "job store mutex poisoned".to_string())
    }

    pub fn create_job(&self, record: JobRecord) -> Result<(), String> {
        let mut inner = self.lock()?;
        inner.jobs_by_id.insert(record.job_id.clone(), record);
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, String> {
        let inner = self.lock()?;
        Ok(inner.jobs_by_id.get(job_id).cloned())
    }

    /// Merge-style status transition with a write-once stage stamp. Used by
    /// the orchestration facade for `uploaded -> queued`; worker-side
    /// transitions go through the guarded variants below. Forward-only: if
    /// an emulated worker already moved the job past `status`, the write is
    /// skipped so status never regresses.
    pub fn set_status(&self, job_id: &str, status: JobStatus) -> Result<bool, String> {
        let mut inner = self.lock()?;
        let Some(job) = inner.jobs_by_id.get_mut(job_id) else {
            return Ok(false);
        };
        if job.status.rank() > status.rank() {
            return Ok(false);
        }
        let now = Utc::now();
        job.status = status;
        stamp_stage(job, status.as_str(), now);
        job.updated_at = now;
        Ok(true)
    }

    /// Transactional lock acquisition per the lifecycle contract:
    /// absent job or terminal status abort as no-ops, a live foreign lock
    /// aborts as contention, anything else claims the job, bumps `attempt`,
    /// and moves it to `processing`.
    pub fn acquire_processing_lock(
        &self,
        job_id: &str,
        worker_id: &str,
        stale_after_seconds: i64,
    ) -> Result<LockOutcome, String> {
        let mut inner = self.lock()?;
        let Some(job) = inner.jobs_by_id.get_mut(job_id) else {
            return Ok(LockOutcome::NotFound);
        };
        if job.status.is_terminal() {
            return Ok(LockOutcome::Terminal(job.status));
        }

        let now = Utc::now();
        if let Some(lock) = &job.processing_lock {
            let liveness = job.liveness_at().unwrap_or(lock.locked_at);
            let live = now - liveness < Duration::seconds(stale_after_seconds);
            if live && lock.locked_by != worker_id {
                return Ok(LockOutcome::Contended);
            }
        }

        job.processing_lock = Some(ProcessingLock {
            locked_by: worker_id.to_string(),
            locked_at: now,
        });
        job.attempt += 1;
        job.status = JobStatus::Processing;
        stamp_stage_attempt(job, "processing", job.attempt, now);
        job.updated_at = now;
        Ok(LockOutcome::Acquired(Box::new(job.clone())))
    }

    /// Apply `f` only while `worker_id` still owns the lock. Callers treat
    /// `LockLost` and `NotFound` as silent aborts: the competing worker (or
    /// a session delete) wins.
    pub fn guarded_update<F>(
        &self,
        job_id: &str,
        worker_id: &str,
        f: F,
    ) -> Result<GuardedWrite, String>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut inner = self.lock()?;
        let Some(job) = inner.jobs_by_id.get_mut(job_id) else {
            return Ok(GuardedWrite::NotFound);
        };
        match &job.processing_lock {
            Some(lock) if lock.locked_by == worker_id => {}
            _ => return Ok(GuardedWrite::LockLost),
        }
        f(job);
        job.updated_at = Utc::now();
        Ok(GuardedWrite::Applied(Box::new(job.clone())))
    }

    /// Guarded forward transition: refuses to move a job backwards.
    pub fn advance_status(
        &self,
        job_id: &str,
        worker_id: &str,
        status: JobStatus,
    ) -> Result<GuardedWrite, String> {
        let mut inner = self.lock()?;
        let Some(job) = inner.jobs_by_id.get_mut(job_id) else {
            return Ok(GuardedWrite::NotFound);
        };
        match &job.processing_lock {
            Some(lock) if lock.locked_by == worker_id => {}
            _ => return Ok(GuardedWrite::LockLost),
        }
        if job.status.rank() > status.rank() {
            return Ok(GuardedWrite::LockLost);
        }
        let now = Utc::now();
        if job.status != status {
            job.status = status;
        }
        stamp_stage_attempt(job, status.as_str(), job.attempt, now);
        job.updated_at = now;
        Ok(GuardedWrite::Applied(Box::new(job.clone())))
    }

    pub fn touch_heartbeat(&self, job_id: &str, worker_id: &str) -> Result<GuardedWrite, String> {
        self.guarded_update(job_id, worker_id, |job| {
            job.heartbeat_at = Some(Utc::now());
        })
    }

    /// Terminal success: result strictly accompanies `done` in one atomic
    /// write, stamps `llm` and `done`, and releases the lock.
    pub fn set_result(
        &self,
        job_id: &str,
        worker_id: &str,
        result_json: serde_json::Value,
        confidence: f64,
    ) -> Result<GuardedWrite, String> {
        let mut inner = self.lock()?;
        let Some(job) = inner.jobs_by_id.get_mut(job_id) else {
            return Ok(GuardedWrite::NotFound);
        };
        match &job.processing_lock {
            Some(lock) if lock.locked_by == worker_id => {}
            _ => return Ok(GuardedWrite::LockLost),
        }
        let now = Utc::now();
        if job.result_json.is_none() {
            job.result_json = Some(result_json);
        }
        job.confidence_score = Some(confidence);
        job.status = JobStatus::Done;
        stamp_stage_attempt(job, "llm", job.attempt, now);
        stamp_stage_attempt(job, "done", job.attempt, now);
        job.processing_lock = None;
        job.error = None;
        job.updated_at = now;
        Ok(GuardedWrite::Applied(Box::new(job.clone())))
    }

    /// Terminal failure: short human-readable error, lock released.
    pub fn set_error(
        &self,
        job_id: &str,
        worker_id: &str,
        message: &str,
    ) -> Result<GuardedWrite, String> {
        let mut inner = self.lock()?;
        let Some(job) = inner.jobs_by_id.get_mut(job_id) else {
            return Ok(GuardedWrite::NotFound);
        };
        match &job.processing_lock {
            Some(lock) if lock.locked_by == worker_id => {}
            _ => return Ok(GuardedWrite::LockLost),
        }
        let now = Utc::now();
        job.status = JobStatus::Failed;
        job.error = Some(message.chars().take(2000).collect());
        stamp_stage_attempt(job, "failed", job.attempt, now);
        job.processing_lock = None;
        job.updated_at = now;
        Ok(GuardedWrite::Applied(Box::new(job.clone())))
    }

    /// Release without a terminal transition (transient failures exit via
    /// queue redelivery; the job keeps its current stage).
    pub fn release_lock(&self, job_id: &str, worker_id: &str) -> Result<(), String> {
        let mut inner = self.lock()?;
        if let Some(job) = inner.jobs_by_id.get_mut(job_id) {
            if let Some(lock) = &job.processing_lock {
                if lock.locked_by == worker_id {
                    job.processing_lock = None;
                    job.updated_at = Utc::now();
                }
            }
        }
        Ok(())
    }

    /// Client-initiated retry: the one permitted regression, `failed` (or a
    /// stale-abandoned non-terminal state) back to `queued`.
    pub fn retry_reset(&self, job_id: &str) -> Result<Option<JobRecord>, String> {
        let mut inner = self.lock()?;
        let Some(job) = inner.jobs_by_id.get_mut(job_id) else {
            return Ok(None);
        };
        let now = Utc::now();
        job.status = JobStatus::Queued;
        job.error = None;
        job.processing_lock = None;
        job.manual_retries += 1;
        stamp_stage_attempt(job, "queued", job.attempt + 1, now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    pub fn list_jobs_by_session(&self, session_id: &str) -> Result<Vec<JobRecord>, String> {
        let inner = self.lock()?;
        let mut jobs: Vec<JobRecord> = inner
            .jobs_by_id
            .values()
            .filter(|j| j.session_id == session_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    /// The composite-index query: `(sessionId, status=done)` ordered by
    /// `createdAt` descending.
    pub fn list_done_jobs_by_session(&self, session_id: &str) -> Result<Vec<JobRecord>, String> {
        let inner = self.lock()?;
        let mut jobs: Vec<JobRecord> = inner
            .jobs_by_id
            .values()
            .filter(|j| j.session_id == session_id && j.status == JobStatus::Done)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    /// Jobs older than the cutoff, bounded, for the retention sweeper.
    pub fn list_stale_jobs(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, String> {
        let inner = self.lock()?;
        let mut jobs: Vec<JobRecord> = inner
            .jobs_by_id
            .values()
            .filter(|j| j.created_at < cutoff)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    pub fn delete_job(&self, job_id: &str) -> Result<bool, String> {
        let mut inner = self.lock()?;
        Ok(inner.jobs_by_id.remove(job_id).is_some())
    }

    /// Transactional read-modify-write on a token-bucket document. `f`
    /// receives the current document (if any) and returns the replacement
    /// plus a caller-defined verdict.
    pub fn bucket_transact<T, F>(&self, key: &str, f: F) -> Result<T, String>
    where
        F: FnOnce(Option<&BucketDoc>) -> (Option<BucketDoc>, T),
    {
        let mut inner = self.lock()?;
        let (next, verdict) = f(inner.rl_buckets.get(key));
        if let Some(doc) = next {
            inner.rl_buckets.insert(key.to_string(), doc);
        }
        Ok(verdict)
    }

    /// Transactional read-modify-write on a daily counter document.
    pub fn daily_transact<T, F>(&self, key: &str, f: F) -> Result<T, String>
    where
        F: FnOnce(&DailyDoc) -> (Option<DailyDoc>, T),
    {
        let mut inner = self.lock()?;
        let current = inner.rl_daily.get(key).cloned().unwrap_or_default();
        let (next, verdict) = f(&current);
        if let Some(doc) = next {
            inner.rl_daily.insert(key.to_string(), doc);
        }
        Ok(verdict)
    }
}

/// Write-once stage stamp on the plain stage name.
fn stamp_stage(job: &mut JobRecord, stage: &str, now: DateTime<Utc>) {
    job.stages.entry(stage.to_string()).or_insert(now);
}

/// Write-once stamp that keeps per-attempt history: the plain name belongs
/// to the first attempt that reached the stage; later attempts record
/// `"<stage>#<attempt>"` without touching earlier markers.
fn stamp_stage_attempt(job: &mut JobRecord, stage: &str, attempt: u32, now: DateTime<Utc>) {
    if !job.stages.contains_key(stage) {
        job.stages.insert(stage.to_string(), now);
    } else if attempt > 1 {
        job.stages.entry(format!("{stage}#{attempt}")).or_insert(now);
    }
}
