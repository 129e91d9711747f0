#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use invoice_job_coordinator::app::AppState;
use invoice_job_coordinator::config::environment::AppConfig;
use invoice_job_coordinator::infra::InfraClients;
use invoice_job_coordinator::module::invoice_job::model::{JobRecord, ProcessingLock};
use invoice_job_coordinator::module::invoice_job::schema::JobStatus;
use invoice_job_coordinator::service::blob_service::{BlobStore, MemoryBlobStore, input_blob_path};
use invoice_job_coordinator::service::llm_service::{LlmError, LlmProvider};
use invoice_job_coordinator::service::ocr_service::{
    OcrError, OcrOperationState, OcrText, VisionClient,
};
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, Stream, dictionary};
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

pub const SESSION: &str = "11111111-2222-4333-8444-555555555555";

pub fn test_config() -> AppConfig {
    AppConfig {
        rust_env: "test".to_string(),
        api_host: "127.0.0.1".to_string(),
        api_port: 0,
        cors_origins: vec!["*".to_string()],
        max_files: 10,
        max_size_mb: 10,
        max_pages: 20,
        accepted_mime: vec!["application/pdf".to_string()],
        blob_bucket: "test-bucket".to_string(),
        tasks_emulate: true,
        tasks_queue_path: String::new(),
        tasks_target_url: String::new(),
        tasks_service_account_email: String::new(),
        tasks_max_attempts: 3,
        tasks_min_backoff_seconds: 30,
        tasks_max_backoff_seconds: 300,
        tasks_oidc_issuer: "https://accounts.google.com".to_string(),
        tasks_oidc_jwks_url: "https://www.googleapis.com/oauth2/v3/certs".to_string(),
        ocr_sync_max_pages: 2,
        ocr_lang_hints: vec!["en".to_string(), "nl".to_string()],
        ocr_poll_timeout_seconds: 5,
        preprocess_max_chars: 20000,
        zone_strip_top: 0,
        zone_strip_bottom: 0,
        gemini_api_key: None,
        gemini_model: "gemini-2.5-flash".to_string(),
        openrouter_api_key: None,
        openrouter_model: "test-model".to_string(),
        llm_prompt_version: "v1".to_string(),
        llm_timeout_seconds: 5,
        rl_enabled: true,
        rl_jobs_per_min: 100,
        rl_files_per_min: 100,
        rl_retries_per_min: 100,
        rl_ip_per_min: 100,
        rl_use_ip_fallback: false,
        rl_daily_per_session: 1000,
        rl_daily_global: 10000,
        lock_stale_minutes: 10,
        heartbeat_interval_seconds: 30,
        manual_retry_cap: 3,
        attempt_budget_seconds: 30,
        retention_hours: 24,
        retention_loop_enable: false,
        retention_loop_interval_min: 60,
        retention_batch_size: 500,
    }
}

/// Canonical extraction fixture used by the stub LLM.
pub fn fixture_invoice_json() -> Value {
    json!({
        "invoiceNumber": "INV-001",
        "invoiceDate": "2026-01-15",
        "vendorName": "ACME Supplies BV",
        "currency": "EUR",
        "subtotal": 100.0,
        "tax": 21.0,
        "total": 121.0,
        "dueDate": "2026-02-15",
        "lineItems": [
            {"description": "Widget", "quantity": 2, "unitPrice": 30.0, "lineTotal": 60.0},
            {"description": "Gadget", "quantity": 1, "unitPrice": 40.0, "lineTotal": 40.0}
        ],
        "notes": "Thank you"
    })
}

/// Stub LLM provider: scripted replies first, then the fixture forever.
pub struct StubLlm {
    name: &'static str,
    scripted: Mutex<VecDeque<Result<Value, LlmError>>>,
    pub calls: AtomicUsize,
}

impl StubLlm {
    pub fn ok(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            scripted: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn scripted(name: &'static str, replies: Vec<Result<Value, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            scripted: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn extract(&self, _text: &str) -> Result<Value, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut scripted = self.scripted.lock().unwrap();
        match scripted.pop_front() {
            Some(reply) => reply,
            None => Ok(fixture_invoice_json()),
        }
    }
}

/// Stub OCR provider with counters so resume semantics are observable.
pub struct StubVision {
    pub text: String,
    pub sync_calls: AtomicUsize,
    pub submit_calls: AtomicUsize,
    pub poll_calls: AtomicUsize,
    blobs: Arc<dyn BlobStore>,
}

impl StubVision {
    pub fn new(blobs: Arc<dyn BlobStore>, text: &str) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            sync_calls: AtomicUsize::new(0),
            submit_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
            blobs,
        })
    }

    pub async fn write_shard(&self, output_prefix: &str, text: &str) {
        let shard = json!({
            "responses": [{"fullTextAnnotation": {"text": text}}]
        });
        self.blobs
            .upload(
                &format!("{output_prefix}output-0001-to-0001.json"),
                serde_json::to_vec(&shard).unwrap(),
                "application/json",
            )
            .await
            .unwrap();
    }
}

#[async_trait]
impl VisionClient for StubVision {
    async fn annotate_sync(
        &self,
        _blob_path: &str,
        page_count: usize,
    ) -> Result<OcrText, OcrError> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        Ok(OcrText {
            text: self.text.clone(),
            pages: page_count,
        })
    }

    async fn submit_async(
        &self,
        _blob_path: &str,
        output_prefix: &str,
        _batch_size: usize,
    ) -> Result<String, OcrError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.write_shard(output_prefix, &self.text.clone()).await;
        Ok(format!("operations/{}", Uuid::new_v4()))
    }

    async fn poll_operation(&self, _operation_name: &str) -> Result<OcrOperationState, OcrError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        Ok(OcrOperationState::Done)
    }
}

pub struct TestHarness {
    pub state: AppState,
    pub blobs: Arc<MemoryBlobStore>,
    pub vision: Arc<StubVision>,
    pub llm_primary: Arc<StubLlm>,
    pub llm_fallback: Arc<StubLlm>,
}

pub fn stub_state(config: AppConfig) -> TestHarness {
    let blobs = Arc::new(MemoryBlobStore::new());
    let vision = StubVision::new(blobs.clone(), "Invoice INV-001\nTotal 121,00");
    let llm_primary = StubLlm::ok("primary");
    let llm_fallback = StubLlm::ok("fallback");
    let state = AppState::new(
        config,
        InfraClients {
            blobs: blobs.clone(),
            vision: vision.clone(),
            llm_primary: llm_primary.clone(),
            llm_fallback: llm_fallback.clone(),
            oidc: None,
        },
    );
    TestHarness {
        state,
        blobs,
        vision,
        llm_primary,
        llm_fallback,
    }
}

pub fn stub_state_with_llms(
    config: AppConfig,
    llm_primary: Arc<StubLlm>,
    llm_fallback: Arc<StubLlm>,
) -> TestHarness {
    let blobs = Arc::new(MemoryBlobStore::new());
    let vision = StubVision::new(blobs.clone(), "Invoice INV-001\nTotal 121,00");
    let state = AppState::new(
        config,
        InfraClients {
            blobs: blobs.clone(),
            vision: vision.clone(),
            llm_primary: llm_primary.clone(),
            llm_fallback: llm_fallback.clone(),
            oidc: None,
        },
    );
    TestHarness {
        state,
        blobs,
        vision,
        llm_primary,
        llm_fallback,
    }
}

/// Minimal JobRecord in `queued` state; the caller uploads the blob when
/// the scenario needs one.
pub fn seed_job(state: &AppState, session_id: &str, page_count: usize) -> JobRecord {
    let job_id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let record = JobRecord {
        job_id: job_id.clone(),
        session_id: session_id.to_string(),
        filename: "seeded.pdf".to_string(),
        size_bytes: 1234,
        page_count,
        blob_path: input_blob_path(session_id, &job_id),
        status: JobStatus::Queued,
        stages: BTreeMap::from([
            ("uploaded".to_string(), now - Duration::seconds(2)),
            ("queued".to_string(), now - Duration::seconds(1)),
        ]),
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
        created_at: now - Duration::seconds(2),
        updated_at: now,
    };
    state.store.create_job(record.clone()).unwrap();
    record
}

pub fn fresh_lock(worker: &str) -> ProcessingLock {
    ProcessingLock {
        locked_by: worker.to_string(),
        locked_at: Utc::now(),
    }
}

pub fn stale_lock(worker: &str) -> ProcessingLock {
    ProcessingLock {
        locked_by: worker.to_string(),
        locked_at: Utc::now() - Duration::hours(1),
    }
}

/// Build a small PDF with a text layer, one page per entry in `lines`.
pub fn make_pdf(lines: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for line in lines {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![50.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(*line)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("encode page content"),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).expect("serialize pdf");
    out
}
