use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub rust_env: String,
    pub api_host: String,
    pub api_port: u16,
    pub cors_origins: Vec<String>,

    // Upload limits
    pub max_files: usize,
    pub max_size_mb: u64,
    pub max_pages: usize,
    pub accepted_mime: Vec<String>,

    // Blob layout
    pub blob_bucket: String,

    // Task queue
    pub tasks_emulate: bool,
    pub tasks_queue_path: String,
    pub tasks_target_url: String,
    pub tasks_service_account_email: String,
    pub tasks_max_attempts: u32,
    pub tasks_min_backoff_seconds: u64,
    pub tasks_max_backoff_seconds: u64,

    // Worker endpoint auth
    pub tasks_oidc_issuer: String,
    pub tasks_oidc_jwks_url: String,

    // OCR
    pub ocr_sync_max_pages: usize,
    pub ocr_lang_hints: Vec<String>,
    pub ocr_poll_timeout_seconds: u64,

    // Sanitizer
    pub preprocess_max_chars: usize,
    pub zone_strip_top: usize,
    pub zone_strip_bottom: usize,

    // LLM
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub llm_prompt_version: String,
    pub llm_timeout_seconds: u64,

    // Rate limits
    pub rl_enabled: bool,
    pub rl_jobs_per_min: u32,
    pub rl_files_per_min: u32,
    pub rl_retries_per_min: u32,
    pub rl_ip_per_min: u32,
    pub rl_use_ip_fallback: bool,
    pub rl_daily_per_session: u64,
    pub rl_daily_global: u64,

    // Lifecycle
    pub lock_stale_minutes: i64,
    pub heartbeat_interval_seconds: i64,
    pub manual_retry_cap: u32,
    pub attempt_budget_seconds: u64,

    // Retention
    pub retention_hours: i64,
    pub retention_loop_enable: bool,
    pub retention_loop_interval_min: u64,
    pub retention_batch_size: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, String> {
        load_dotenv_layers();
        Ok(Self {
            rust_env: read_optional_string("RUST_ENV", "development"),
            api_host: read_optional_string("API_HOST", "0.0.0.0"),
            api_port: read_optional_u64("API_PORT", 8080)? as u16,
            cors_origins: read_list("CORS_ORIGINS", "*"),

            max_files: read_optional_u64("MAX_FILES", 10)? as usize,
            max_size_mb: read_optional_u64("MAX_SIZE_MB", 10)?,
            max_pages: read_optional_u64("MAX_PAGES", 20)? as usize,
            accepted_mime: vec!["application/pdf".to_string()],

            blob_bucket: read_optional_string("BLOB_BUCKET", "invoice_processing_storage"),

            tasks_emulate: read_optional_bool("TASKS_EMULATE", true),
            tasks_queue_path: read_optional_string("TASKS_QUEUE_PATH", ""),
            tasks_target_url: read_optional_string("TASKS_TARGET_URL", ""),
            tasks_service_account_email: read_optional_string("TASKS_SERVICE_ACCOUNT_EMAIL", ""),
            tasks_max_attempts: read_optional_u64("TASKS_MAX_ATTEMPTS", 5)? as u32,
            tasks_min_backoff_seconds: read_optional_u64("TASKS_MIN_BACKOFF_SECONDS", 30)?,
            tasks_max_backoff_seconds: read_optional_u64("TASKS_MAX_BACKOFF_SECONDS", 300)?,

            tasks_oidc_issuer: read_optional_string(
                "TASKS_OIDC_ISSUER",
                "https://accounts.google.com",
            ),
            tasks_oidc_jwks_url: read_optional_string(
                "TASKS_OIDC_JWKS_URL",
                "https://www.googleapis.com/oauth2/v3/certs",
            ),

            ocr_sync_max_pages: read_optional_u64("OCR_SYNC_MAX_PAGES", 5)? as usize,
            ocr_lang_hints: read_list("OCR_LANG_HINTS", "en,nl"),
            ocr_poll_timeout_seconds: read_optional_u64("OCR_POLL_TIMEOUT_SECONDS", 300)?,

            preprocess_max_chars: read_optional_u64("PREPROCESS_MAX_CHARS", 20000)? as usize,
            zone_strip_top: read_optional_u64("ZONE_STRIP_TOP", 0)? as usize,
            zone_strip_bottom: read_optional_u64("ZONE_STRIP_BOTTOM", 0)? as usize,

            gemini_api_key: env::var("GEMINI_API_KEY").ok(),
            gemini_model: read_optional_string("GEMINI_MODEL", "gemini-2.5-flash"),
            openrouter_api_key: env::var("OPENROUTER_API_KEY").ok(),
            openrouter_model: read_optional_string(
                "OPENROUTER_MODEL",
                "meta-llama/llama-3.3-70b-instruct:free",
            ),
            llm_prompt_version: read_optional_string("LLM_PROMPT_VERSION", "v1"),
            llm_timeout_seconds: read_optional_u64("LLM_TIMEOUT_SECONDS", 60)?,

            rl_enabled: read_optional_bool("RL_ENABLED", true),
            rl_jobs_per_min: read_optional_u64("RL_JOBS_PER_MIN", 30)? as u32,
            rl_files_per_min: read_optional_u64("RL_FILES_PER_MIN", 60)? as u32,
            rl_retries_per_min: read_optional_u64("RL_RETRIES_PER_MIN", 10)? as u32,
            rl_ip_per_min: read_optional_u64("RL_IP_PER_MIN", 120)? as u32,
            rl_use_ip_fallback: read_optional_bool("RL_USE_IP_FALLBACK", false),
            rl_daily_per_session: read_optional_u64("RL_DAILY_PER_SESSION", 50)?,
            rl_daily_global: read_optional_u64("RL_DAILY_GLOBAL", 1000)?,

            lock_stale_minutes: read_optional_i64("LOCK_STALE_MINUTES", 10)?,
            heartbeat_interval_seconds: read_optional_i64("HEARTBEAT_INTERVAL_SECONDS", 30)?,
            manual_retry_cap: read_optional_u64("MANUAL_RETRY_CAP", 3)? as u32,
            attempt_budget_seconds: read_optional_u64("ATTEMPT_BUDGET_SECONDS", 900)?,

            retention_hours: read_optional_i64("RETENTION_HOURS", 24)?,
            retention_loop_enable: read_optional_bool("RETENTION_LOOP_ENABLE", true),
            retention_loop_interval_min: read_optional_u64("RETENTION_LOOP_INTERVAL_MIN", 60)?,
            retention_batch_size: read_optional_u64("RETENTION_BATCH_SIZE", 500)? as usize,
        })
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }

    /// Stale threshold per the lock contract: the configured floor or three
    /// heartbeat intervals, whichever is larger.
    pub fn lock_stale_seconds(&self) -> i64 {
        (self.lock_stale_minutes * 60).max(3 * self.heartbeat_interval_seconds)
    }
}

fn read_optional_i64(key: &str, default: i64) -> Result<i64, String> {
    match env::var(key) {
        Ok(v) => v.parse::<i64>().map_err(|e| format!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn read_optional_u64(key: &str, default: u64) -> Result<u64, String> {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map_err(|e| format!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn read_optional_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => default,
    }
}

fn read_optional_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn read_list(key: &str, default: &str) -> Vec<String> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        vec!["*".to_string()]
    } else {
        items
    }
}

fn load_dotenv_layers() {
    for path in [".env", "../.env", "../../.env"] {
        let _ = dotenvy::from_path_override(path);
    }
}
