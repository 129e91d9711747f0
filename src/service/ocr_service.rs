use crate::service::blob_service::{BlobError, BlobStore};
use crate::service::pdf_service;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    /// Network-class failure; queue redelivery retries the attempt.
    #[error("ocr transient error: {0}")]
    Transient(String),
    /// The provider rejected the document; retrying cannot help.
    #[error("ocr permanent error: {0}")]
    Permanent(String),
}

#[derive(Debug, Clone)]
pub struct OcrText {
    pub text: String,
    pub pages: usize,
}

#[derive(Debug, Clone)]
pub enum OcrOperationState {
    Running,
    Done,
    /// Terminal provider-side failure; the persisted operation handle is
    /// dead and a fresh attempt may submit a new one.
    Failed(String),
}

/// OCR provider boundary. The synchronous tier returns text directly; the
/// asynchronous tier writes JSON shards under an output prefix and exposes
/// an operation handle that survives worker crashes.
#[async_trait]
pub trait VisionClient: Send + Sync {
    async fn annotate_sync(&self, blob_path: &str, page_count: usize) -> Result<OcrText, OcrError>;

    /// Submit an async operation; the returned name is persisted on the job
    /// so a takeover resumes polling instead of resubmitting.
    async fn submit_async(
        &self,
        blob_path: &str,
        output_prefix: &str,
        batch_size: usize,
    ) -> Result<String, OcrError>;

    async fn poll_operation(&self, operation_name: &str) -> Result<OcrOperationState, OcrError>;
}

/// One output shard of the async tier, in the provider's response shape.
#[derive(Debug, Serialize, Deserialize)]
struct OutputShard {
    responses: Vec<ShardResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShardResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    full_text_annotation: Option<FullTextAnnotation>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FullTextAnnotation {
    text: String,
}

/// Read all shards under the output prefix in shard order, concatenate
/// their text, and delete them (not-found is ignored; intermediates are
/// owned by this attempt).
pub async fn collect_async_output(
    blobs: &dyn BlobStore,
    output_prefix: &str,
) -> Result<OcrText, OcrError> {
    let shard_paths = blobs
        .list_prefix(output_prefix)
        .await
        .map_err(|e| OcrError::Transient(format!("listing ocr output failed: {e}")))?;

    let mut text_parts: Vec<String> = Vec::new();
    let mut pages = 0usize;
    for path in &shard_paths {
        let data = match blobs.download(path).await {
            Ok(data) => data,
            Err(BlobError::NotFound(_)) => continue,
            Err(e) => {
                return Err(OcrError::Transient(format!(
                    "reading ocr shard {path} failed: {e}"
                )));
            }
        };
        let shard: OutputShard = serde_json::from_slice(&data)
            .map_err(|e| OcrError::Permanent(format!("malformed ocr shard {path}: {e}")))?;
        for response in shard.responses {
            pages += 1;
            if let Some(fta) = response.full_text_annotation {
                if !fta.text.is_empty() {
                    text_parts.push(fta.text);
                }
            }
        }
    }

    for path in &shard_paths {
        match blobs.delete(path).await {
            Ok(()) | Err(BlobError::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "ocr shard cleanup failed");
            }
        }
    }

    Ok(OcrText {
        text: text_parts.join("\n").trim().to_string(),
        pages,
    })
}

#[derive(Debug, Clone)]
enum DevOperation {
    Done,
}

/// Local development OCR tier: extracts the PDF text layer with `lopdf`
/// instead of calling the cloud provider. The async path writes real
/// shard files so resume and aggregation are exercised end to end.
pub struct DevVisionClient {
    blobs: std::sync::Arc<dyn BlobStore>,
    operations: Mutex<HashMap<String, DevOperation>>,
}

impl DevVisionClient {
    pub fn new(blobs: std::sync::Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            operations: Mutex::new(HashMap::new()),
        }
    }

    async fn extract_pages(&self, blob_path: &str) -> Result<Vec<String>, OcrError> {
        let data = match self.blobs.download(blob_path).await {
            Ok(data) => data,
            Err(BlobError::NotFound(p)) => {
                return Err(OcrError::Permanent(format!("input blob missing: {p}")));
            }
            Err(e) => return Err(OcrError::Transient(e.to_string())),
        };
        pdf_service::extract_text_layer(&data).map_err(OcrError::Permanent)
    }
}

#[async_trait]
impl VisionClient for DevVisionClient {
    async fn annotate_sync(
        &self,
        blob_path: &str,
        _page_count: usize,
    ) -> Result<OcrText, OcrError> {
        let pages = self.extract_pages(blob_path).await?;
        Ok(OcrText {
            text: pages.join("\n").trim().to_string(),
            pages: pages.len(),
        })
    }

    async fn submit_async(
        &self,
        blob_path: &str,
        output_prefix: &str,
        batch_size: usize,
    ) -> Result<String, OcrError> {
        let pages = self.extract_pages(blob_path).await?;
        let batch_size = batch_size.max(1);
        for (shard_index, chunk) in pages.chunks(batch_size).enumerate() {
            let start = shard_index * batch_size + 1;
            let end = start + chunk.len() - 1;
            let shard = OutputShard {
                responses: chunk
                    .iter()
                    .map(|text| ShardResponse {
                        full_text_annotation: Some(FullTextAnnotation { text: text.clone() }),
                    })
                    .collect(),
            };
            let body = serde_json::to_vec(&shard)
                .map_err(|e| OcrError::Permanent(format!("shard encode failed: {e}")))?;
            // Zero-padded page range keeps shard order lexicographic.
            let path = format!("{output_prefix}output-{start:04}-to-{end:04}.json");
            self.blobs
                .upload(&path, body, "application/json")
                .await
                .map_err(|e| OcrError::Transient(e.to_string()))?;
        }

        let name = format!("operations/{}", Uuid::new_v4());
        let mut ops = self
            .operations
            .lock()
            .map_err(|_| OcrError::Transient("operation registry poisoned".to_string()))?;
        ops.insert(name.clone(), DevOperation::Done);
        Ok(name)
    }

    async fn poll_operation(&self, operation_name: &str) -> Result<OcrOperationState, OcrError> {
        let ops = self
            .operations
            .lock()
            .map_err(|_| OcrError::Transient("operation registry poisoned".to_string()))?;
        match ops.get(operation_name) {
            Some(DevOperation::Done) => Ok(OcrOperationState::Done),
            // An unknown handle belongs to a previous process; with the
            // shards already durable, report it complete and let the
            // aggregation step decide.
            None => Ok(OcrOperationState::Done),
        }
    }
}
