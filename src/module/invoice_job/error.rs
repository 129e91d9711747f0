use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Headers attached to 429 responses so clients know when to come back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitInfo {
    pub retry_after: i64,
    pub limit: i64,
    pub remaining: i64,
    pub reset_epoch: i64,
}

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub rate_limit: Option<RateLimitInfo>,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            rate_limit: None,
        }
    }

    pub fn file_validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "fileValidation", message)
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, "payloadTooLarge", message)
    }

    pub fn rate_limited(message: impl Into<String>, info: RateLimitInfo) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            code: "rateLimit",
            message: message.into(),
            rate_limit: Some(info),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "notFound", message)
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn external_service(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "externalService", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "errorCode": self.code,
            "detail": self.message,
        }));
        let mut response = (self.status, body).into_response();
        if let Some(info) = self.rate_limit {
            let headers = response.headers_mut();
            if let Ok(v) = info.retry_after.to_string().parse() {
                headers.insert("Retry-After", v);
            }
            if let Ok(v) = info.limit.to_string().parse() {
                headers.insert("X-RateLimit-Limit", v);
            }
            if let Ok(v) = info.remaining.max(0).to_string().parse() {
                headers.insert("X-RateLimit-Remaining", v);
            }
            if let Ok(v) = info.reset_epoch.to_string().parse() {
                headers.insert("X-RateLimit-Reset", v);
            }
        }
        response
    }
}
