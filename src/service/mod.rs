pub mod blob_service;
pub mod dispatch_service;
pub mod evaluation_service;
pub mod invoice_service;
pub mod llm_service;
pub mod metrics_service;
pub mod ocr_service;
pub mod oidc_service;
pub mod pdf_service;
pub mod pipeline_service;
pub mod rate_limit_service;
pub mod retention_service;
pub mod sanitize_service;
pub mod store_service;
