use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Structured-output instructions sent to both providers. Changes here must
/// bump `LLM_PROMPT_VERSION` in the environment so results stay comparable.
const JSON_INSTRUCTIONS: &str = "You are an information extraction engine. Extract invoice data as strict JSON with keys: \
invoiceNumber (string), invoiceDate (YYYY-MM-DD), vendorName (string), currency (ISO code), \
subtotal (number), tax (number), total (number), dueDate (YYYY-MM-DD or null), \
lineItems (array of {description, quantity, unitPrice, lineTotal}), notes (optional). \
Return ONLY JSON. No markdown, no prose.";

const GEMINI_INPUT_CAP: usize = 15000;
const OPENROUTER_INPUT_CAP: usize = 12000;

/// Client-level retry budget, distinct from queue-level redelivery.
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_CAP_MS: u64 = 5000;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm transient error: {0}")]
    Transient(String),
    #[error("llm permanent error: {0}")]
    Permanent(String),
}

/// One LLM provider. Each gets a single stage-level attempt; bounded
/// HTTP-level retries with jittered backoff live inside the adapter.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn extract(&self, text: &str) -> Result<Value, LlmError>;
}

/// Primary, then fallback. The result is the raw parsed JSON value; the
/// tolerant invoice parser runs downstream.
pub async fn extract_invoice(
    primary: &dyn LlmProvider,
    fallback: &dyn LlmProvider,
    text: &str,
) -> Result<Value, LlmError> {
    let primary_err = match primary.extract(text).await {
        Ok(value) => return Ok(value),
        Err(e) => {
            warn!(provider = primary.name(), error = %e, "primary llm failed, falling back");
            e
        }
    };
    match fallback.extract(text).await {
        Ok(value) => Ok(value),
        Err(fallback_err) => {
            warn!(provider = fallback.name(), error = %fallback_err, "fallback llm failed");
            // Only an unambiguous double rejection is permanent; anything
            // transient on either side leaves the attempt retryable.
            match (&primary_err, &fallback_err) {
                (LlmError::Permanent(a), LlmError::Permanent(b)) => Err(LlmError::Permanent(
                    format!("both providers failed: {a}; {b}"),
                )),
                _ => Err(LlmError::Transient(format!(
                    "llm providers unavailable: {primary_err}; {fallback_err}"
                ))),
            }
        }
    }
}

pub struct GeminiClient {
    api_key: Option<String>,
    model: String,
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: Option<String>, model: String, timeout: Duration) -> Self {
        Self {
            api_key,
            model,
            http: http_client(timeout),
        }
    }

    fn url(&self, key: &str) -> String {
        format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={key}",
            self.model
        )
    }
}

#[async_trait]
impl LlmProvider for GeminiClient {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn extract(&self, text: &str) -> Result<Value, LlmError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| LlmError::Permanent("missing GEMINI_API_KEY".to_string()))?;
        let input: String = text.chars().take(GEMINI_INPUT_CAP).collect();
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {"text": JSON_INSTRUCTIONS},
                    {"text": format!("\n---- OCR TEXT ----\n{input}")},
                ],
            }],
            "generationConfig": {
                "temperature": 0.2,
                "maxOutputTokens": 2048,
                "responseMimeType": "application/json",
            },
        });
        let data = post_json_with_retries(&self.http, &self.url(key), None, &payload).await?;
        let reply = data
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .ok_or_else(|| LlmError::Permanent("gemini reply missing candidate text".to_string()))?;
        parse_json_reply(reply, "gemini")
    }
}

pub struct OpenRouterClient {
    api_key: Option<String>,
    model: String,
    http: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new(api_key: Option<String>, model: String, timeout: Duration) -> Self {
        Self {
            api_key,
            model,
            http: http_client(timeout),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenRouterClient {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    async fn extract(&self, text: &str) -> Result<Value, LlmError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| LlmError::Permanent("missing OPENROUTER_API_KEY".to_string()))?;
        let input: String = text.chars().take(OPENROUTER_INPUT_CAP).collect();
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": JSON_INSTRUCTIONS},
                {"role": "user", "content": input},
            ],
            "temperature": 0.2,
        });
        let data = post_json_with_retries(
            &self.http,
            "https://openrouter.ai/api/v1/chat/completions",
            Some(key),
            &payload,
        )
        .await?;
        let reply = data
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                LlmError::Permanent("openrouter reply missing message content".to_string())
            })?;
        parse_json_reply(reply, "openrouter")
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_default()
}

async fn post_json_with_retries(
    http: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    payload: &Value,
) -> Result<Value, LlmError> {
    let mut last_err = LlmError::Transient("no attempt made".to_string());
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            sleep(backoff_with_jitter(attempt)).await;
        }
        let mut request = http.post(url).json(payload);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response
                        .json::<Value>()
                        .await
                        .map_err(|e| LlmError::Permanent(format!("non-JSON provider body: {e}")));
                }
                let retryable =
                    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                let body = response.text().await.unwrap_or_default();
                let message = format!("provider returned {status}: {body:.200}");
                if retryable {
                    last_err = LlmError::Transient(message);
                } else {
                    return Err(LlmError::Permanent(message));
                }
            }
            Err(e) => {
                last_err = LlmError::Transient(format!("request failed: {e}"));
            }
        }
    }
    Err(last_err)
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(1 << attempt.min(8)).min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

/// Parse the provider's textual reply as JSON, tolerating a markdown fence.
fn parse_json_reply(reply: &str, provider: &str) -> Result<Value, LlmError> {
    let trimmed = strip_code_fence(reply);
    serde_json::from_str::<Value>(trimmed)
        .map_err(|e| LlmError::Permanent(format!("{provider} returned non-JSON: {e}")))
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
