use std::time::Duration;

/// Model identifiers for the cascade tiers.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub primary: String,
    pub cost: String,
    pub fallback: String,
    pub use_batch: bool,
    pub batch_threshold: usize,
}

impl ModelConfig {
    pub fn from_env() -> Self {
        let primary =
            std::env::var("LLM_MODEL_PRIMARY").unwrap_or_else(|_| "gemini-2.5-pro".to_owned());
        let cost =
            std::env::var("LLM_MODEL_COST").unwrap_or_else(|_| "gemini-2.5-flash".to_owned());
        let fallback = std::env::var("LLM_MODEL_FALLBACK")
            .unwrap_or_else(|_| "gemini-2.5-flash-lite".to_owned());
        let use_batch = env_bool("LLM_USE_BATCH", false);
        let batch_threshold = env_usize("LLM_BATCH_THRESHOLD", 5);
        Self {
            primary,
            cost,
            fallback,
            use_batch,
            batch_threshold,
        }
    }

    /// Preferred-first candidate order, deduplicated.
    pub fn candidates(&self, preferred: &str) -> Vec<String> {
        let mut out = Vec::with_capacity(3);
        for model in [preferred, &self.cost, &self.fallback] {
            if !out.iter().any(|m: &String| m == model) {
                out.push(model.to_owned());
            }
        }
        out
    }
}

/// Pipeline limits and validation thresholds.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_chunks_per_source: usize,
    pub cancellation_check_interval: usize,
    pub hebrew_ratio_threshold: f64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            max_chunks_per_source: env_usize("MAX_CHUNKS_PER_SOURCE", 15),
            cancellation_check_interval: env_usize("CANCELLATION_CHECK_INTERVAL", 3).max(1),
            hebrew_ratio_threshold: env_f64("HEBREW_RATIO_THRESHOLD", 0.7),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_chunks_per_source: 15,
            cancellation_check_interval: 3,
            hebrew_ratio_threshold: 0.7,
        }
    }
}

/// Per-call timeouts and retry counts. All values are defaults that the
/// environment may override; the polling intervals are fixed protocol
/// constants.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub explanation_call: Duration,
    pub explanation_retries: usize,
    pub explanation_repair: Duration,
    pub repair_retries: usize,
    pub summary_call: Duration,
    pub summary_retries: usize,
    pub summary_repair: Duration,
    pub alignment_wait: Duration,
    pub alignment_poll: Duration,
    pub alignment_lock_ttl: Duration,
    pub canonical_poll: Duration,
    pub canonical_poll_attempts: usize,
    pub canonical_lock_staleness: Duration,
    pub source_revalidation: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            explanation_call: Duration::from_secs(120),
            explanation_retries: 3,
            explanation_repair: Duration::from_secs(90),
            repair_retries: 2,
            summary_call: Duration::from_secs(120),
            summary_retries: 3,
            summary_repair: Duration::from_secs(45),
            alignment_wait: Duration::from_secs(180),
            alignment_poll: Duration::from_secs(2),
            alignment_lock_ttl: Duration::from_secs(300),
            canonical_poll: Duration::from_millis(1500),
            canonical_poll_attempts: 20,
            canonical_lock_staleness: Duration::from_secs(600),
            source_revalidation: Duration::from_secs(12 * 3600),
        }
    }
}

impl TimeoutConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = env_opt_u64("LLM_EXPLANATION_TIMEOUT_SECS") {
            cfg.explanation_call = Duration::from_secs(secs);
        }
        if let Some(secs) = env_opt_u64("LLM_SUMMARY_TIMEOUT_SECS") {
            cfg.summary_call = Duration::from_secs(secs);
        }
        if let Some(secs) = env_opt_u64("ALIGNMENT_WAIT_SECS") {
            cfg.alignment_wait = Duration::from_secs(secs);
        }
        cfg
    }
}

/// Store credentials; absent values fall back to ambient credentials of
/// the backing document database.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub project_id: Option<String>,
    pub client_email: Option<String>,
    pub private_key: Option<String>,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            project_id: std::env::var("STORE_PROJECT_ID").ok(),
            client_email: std::env::var("STORE_CLIENT_EMAIL").ok(),
            private_key: std::env::var("STORE_PRIVATE_KEY").ok(),
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(value.trim(), "1" | "true" | "TRUE" | "yes"),
        Err(_) => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
