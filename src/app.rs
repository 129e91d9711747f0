use crate::config::environment::AppConfig;
use crate::infra::InfraClients;
use crate::module::invoice_job::route::register_routes;
use crate::service::blob_service::BlobStore;
use crate::service::llm_service::LlmProvider;
use crate::service::ocr_service::VisionClient;
use crate::service::oidc_service::OidcVerifier;
use crate::service::store_service::JobStoreService;
use axum::Router;
use axum::http::{HeaderValue, Method};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<JobStoreService>,
    pub blobs: Arc<dyn BlobStore>,
    pub vision: Arc<dyn VisionClient>,
    pub llm_primary: Arc<dyn LlmProvider>,
    pub llm_fallback: Arc<dyn LlmProvider>,
    pub oidc: Option<Arc<OidcVerifier>>,
    /// Identity recorded in `processingLock.lockedBy`; unique per process.
    pub worker_id: String,
}

impl AppState {
    pub fn new(config: AppConfig, infra: InfraClients) -> Self {
        Self {
            config,
            store: Arc::new(JobStoreService::new()),
            blobs: infra.blobs,
            vision: infra.vision,
            llm_primary: infra.llm_primary,
            llm_fallback: infra.llm_fallback,
            oidc: infra.oidc,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = if state.config.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers(Any)
    };

    register_routes(state).layer(cors)
}
