use axum::http::HeaderMap;
use axum::http::header;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::module::invoice_job::error::AppError;

const JWKS_REFRESH_TTL: Duration = Duration::from_secs(3600);
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Verifies the OIDC bearer token the task queue attaches to worker
/// callbacks: RS256, issuer pinned, audience equal to the callback URL.
pub struct OidcVerifier {
    issuer: String,
    audience: String,
    jwks_url: String,
    http: reqwest::Client,
    jwks: RwLock<JwksCache>,
}

#[derive(Debug, Default)]
struct JwksCache {
    jwks: Option<JwkSet>,
    fetched_at: Option<Instant>,
}

impl OidcVerifier {
    pub fn new(issuer: String, audience: String, jwks_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(JWKS_FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            issuer,
            audience,
            jwks_url,
            http,
            jwks: RwLock::new(JwksCache::default()),
        }
    }

    pub async fn verify(&self, headers: &HeaderMap) -> Result<(), AppError> {
        let token = bearer_token(headers)?;

        let header = decode_header(&token)
            .map_err(|_| AppError::unauthorized("invalid bearer token header"))?;
        if header.alg != Algorithm::RS256 {
            return Err(AppError::unauthorized("unsupported token algorithm"));
        }
        let kid = header
            .kid
            .ok_or_else(|| AppError::unauthorized("token header missing kid"))?;

        let decoding_key = self.decoding_key_for(&kid).await?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.audience.clone()]);
        validation.set_issuer(&[self.issuer.clone()]);

        decode::<serde_json::Value>(&token, &decoding_key, &validation)
            .map_err(|e| AppError::unauthorized(format!("token verification failed: {e}")))?;
        Ok(())
    }

    async fn decoding_key_for(&self, kid: &str) -> Result<DecodingKey, AppError> {
        if let Some(key) = self.cached_key(kid).await {
            return Ok(key);
        }
        self.refresh_jwks().await?;
        self.cached_key(kid)
            .await
            .ok_or_else(|| AppError::unauthorized("no signing key for token kid"))
    }

    async fn cached_key(&self, kid: &str) -> Option<DecodingKey> {
        let cache = self.jwks.read().await;
        let fresh = cache
            .fetched_at
            .is_some_and(|at| at.elapsed() < JWKS_REFRESH_TTL);
        if !fresh {
            return None;
        }
        let jwk = cache.jwks.as_ref()?.find(kid)?;
        DecodingKey::from_jwk(jwk).ok()
    }

    async fn refresh_jwks(&self) -> Result<(), AppError> {
        let jwks: JwkSet = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| AppError::external_service(format!("jwks fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| AppError::external_service(format!("jwks decode failed: {e}")))?;
        let mut cache = self.jwks.write().await;
        cache.jwks = Some(jwks);
        cache.fetched_at = Some(Instant::now());
        Ok(())
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<String, AppError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::unauthorized("missing Authorization header"))?;
    value
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::unauthorized("malformed Authorization header"))
}
