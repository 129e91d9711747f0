use super::schema::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Worker claim on a job. Present iff a worker is actively executing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLock {
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
}

/// The central aggregate: one PDF's processing lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub session_id: String,
    pub filename: String,
    pub size_bytes: u64,
    pub page_count: usize,
    pub blob_path: String,
    pub status: JobStatus,
    /// Stage name to wall-clock timestamp. Write-once per key; re-acquired
    /// attempts stamp `"<stage>#<attempt>"` keys instead of overwriting.
    pub stages: BTreeMap<String, DateTime<Utc>>,
    pub processing_lock: Option<ProcessingLock>,
    pub attempt: u32,
    pub manual_retries: u32,
    /// Handle to an in-flight async OCR operation; presence means resume,
    /// never resubmit, unless the operation is known terminal-failed.
    pub ocr_operation_name: Option<String>,
    pub ocr_method: Option<String>,
    pub preprocess: Option<PreprocessStats>,
    pub result_json: Option<Value>,
    pub confidence_score: Option<f64>,
    pub error: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Liveness timestamp for the stale-lock check: the later of lock
    /// acquisition and the most recent heartbeat.
    pub fn liveness_at(&self) -> Option<DateTime<Utc>> {
        let locked_at = self.processing_lock.as_ref().map(|l| l.locked_at);
        match (locked_at, self.heartbeat_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessStats {
    pub reduction: f64,
}

/// Structured invoice extracted by the LLM stage, after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceRecord {
    pub invoice_number: String,
    /// ISO yyyy-mm-dd.
    pub invoice_date: String,
    pub vendor_name: String,
    pub currency: String,
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    pub line_items: Vec<InvoiceLineItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceLineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub line_total: f64,
}
