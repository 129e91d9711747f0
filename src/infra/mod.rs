use crate::config::environment::AppConfig;
use crate::service::blob_service::{BlobStore, MemoryBlobStore};
use crate::service::llm_service::{GeminiClient, LlmProvider, OpenRouterClient};
use crate::service::ocr_service::{DevVisionClient, VisionClient};
use crate::service::oidc_service::OidcVerifier;
use std::sync::Arc;
use std::time::Duration;

/// Handles to the external collaborators. Constructed once at startup and
/// injected through `AppState`, so tests swap any of them for fakes.
#[derive(Clone)]
pub struct InfraClients {
    pub blobs: Arc<dyn BlobStore>,
    pub vision: Arc<dyn VisionClient>,
    pub llm_primary: Arc<dyn LlmProvider>,
    pub llm_fallback: Arc<dyn LlmProvider>,
    pub oidc: Option<Arc<OidcVerifier>>,
}

pub fn init_infra(config: &AppConfig) -> Result<InfraClients, String> {
    let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    let vision: Arc<dyn VisionClient> = Arc::new(DevVisionClient::new(blobs.clone()));

    let llm_timeout = Duration::from_secs(config.llm_timeout_seconds.max(1));
    let llm_primary: Arc<dyn LlmProvider> = Arc::new(GeminiClient::new(
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
        llm_timeout,
    ));
    let llm_fallback: Arc<dyn LlmProvider> = Arc::new(OpenRouterClient::new(
        config.openrouter_api_key.clone(),
        config.openrouter_model.clone(),
        llm_timeout,
    ));

    // Emulation mode serves local development without queue credentials;
    // everything else must verify the callback's OIDC token.
    let oidc = if config.tasks_emulate {
        None
    } else {
        if config.tasks_target_url.is_empty() {
            return Err("TASKS_TARGET_URL is required when TASKS_EMULATE is off".to_string());
        }
        Some(Arc::new(OidcVerifier::new(
            config.tasks_oidc_issuer.clone(),
            config.tasks_target_url.clone(),
            config.tasks_oidc_jwks_url.clone(),
        )))
    };

    Ok(InfraClients {
        blobs,
        vision,
        llm_primary,
        llm_fallback,
        oidc,
    })
}
