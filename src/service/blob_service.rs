use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("blob storage error: {0}")]
    Storage(String),
}

/// Object-store gateway for input PDFs and OCR intermediate outputs.
///
/// The production backing store is external; everything in this crate talks
/// to it through this trait so the pipeline and tests run against the
/// in-memory implementation below.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, path: &str, data: Vec<u8>, content_type: &str)
        -> Result<(), BlobError>;
    async fn download(&self, path: &str) -> Result<Vec<u8>, BlobError>;
    async fn exists(&self, path: &str) -> Result<bool, BlobError>;
    async fn delete(&self, path: &str) -> Result<(), BlobError>;
    /// Paths under `prefix`, in lexicographic order (shard order for OCR
    /// output files).
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, BlobError>;
}

/// In-process blob store. The ordered map gives deterministic shard order
/// for `list_prefix`.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        path: &str,
        data: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), BlobError> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| BlobError::Storage("blob lock poisoned".to_string()))?;
        blobs.insert(path.to_string(), data);
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, BlobError> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| BlobError::Storage("blob lock poisoned".to_string()))?;
        blobs
            .get(path)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(path.to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool, BlobError> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| BlobError::Storage("blob lock poisoned".to_string()))?;
        Ok(blobs.contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<(), BlobError> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| BlobError::Storage("blob lock poisoned".to_string()))?;
        match blobs.remove(path) {
            Some(_) => Ok(()),
            None => Err(BlobError::NotFound(path.to_string())),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| BlobError::Storage("blob lock poisoned".to_string()))?;
        Ok(blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Blob layout helpers. Input PDFs are owned by their job; OCR intermediates
/// by a single processing attempt.
pub fn input_blob_path(session_id: &str, job_id: &str) -> String {
    format!("uploads/{session_id}/{job_id}.pdf")
}

pub fn ocr_output_prefix(job_id: &str) -> String {
    format!("vision/{job_id}/")
}
