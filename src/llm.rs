//! LLM provider client and the model cascade.
//!
//! The provider is text-in / text-out with a configurable model id.
//! Failures are classified by substring over the rendered error chain;
//! the cascade walks the candidate models, retrying transient failures
//! with exponential backoff and skipping straight to the next candidate
//! on unavailable/quota errors.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, model: &str, prompt: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> anyhow::Result<Self> {
        // No client-level timeout: per-attempt deadlines belong to the
        // cascade, which also owns abandonment logging.
        let client = reqwest::Client::builder()
            .build()
            .context("build llm http client")?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let base_url =
            std::env::var("LLM_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8089".to_owned());
        Self::new(base_url, std::env::var("LLM_API_KEY").ok())
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(&self, model: &str, prompt: &str) -> anyhow::Result<String> {
        #[derive(Debug, Deserialize)]
        struct GenerateResponse {
            text: String,
        }

        let url = format!("{}/v1/generate", self.base_url);
        let mut request = self.client.post(&url).json(&serde_json::json!({
            "model": model,
            "prompt": prompt,
        }));
        if let Some(api_key) = self.api_key.as_deref() {
            request = request.bearer_auth(api_key);
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("llm provider returned {status}: {body}");
        }

        let parsed: GenerateResponse = resp.json().await.context("parse llm response json")?;
        Ok(parsed.text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    ModelUnavailable,
    QuotaExhausted,
    Transient,
    Permanent,
}

/// Substring taxonomy over the rendered error chain.
pub fn classify_error(err: &anyhow::Error) -> LlmErrorKind {
    let text = format!("{err:#}").to_lowercase();

    if text.contains("model")
        && (text.contains("not found") || text.contains("not supported") || text.contains("404"))
    {
        return LlmErrorKind::ModelUnavailable;
    }
    if text.contains("429") || text.contains("quota") || text.contains("resource_exhausted") {
        return LlmErrorKind::QuotaExhausted;
    }
    if text.contains("503")
        || text.contains("timeout")
        || text.contains("temporar")
        || text.contains("rate limit")
    {
        return LlmErrorKind::Transient;
    }
    LlmErrorKind::Permanent
}

#[derive(Debug, Clone)]
pub struct CascadeOptions {
    /// Absolute deadline per attempt.
    pub timeout: Duration,
    /// Attempts per candidate model.
    pub max_retries: usize,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
}

const BACKOFF_BASE_MS: u64 = 400;

/// Walk the candidates in order, returning on the first success.
/// Unavailable/quota failures skip the candidate's remaining attempts;
/// transient failures back off and retry; anything else moves on.
pub async fn generate_with_fallback(
    client: &Arc<dyn LlmClient>,
    candidates: &[String],
    prompt: &str,
    opts: &CascadeOptions,
) -> anyhow::Result<LlmResponse> {
    if candidates.is_empty() {
        anyhow::bail!("no candidate models");
    }

    let mut last_error: Option<anyhow::Error> = None;

    'candidates: for model in candidates {
        for attempt in 1..=opts.max_retries.max(1) {
            match attempt_once(client, model, prompt, opts.timeout).await {
                Ok(text) => {
                    return Ok(LlmResponse {
                        text,
                        model: model.clone(),
                    });
                }
                Err(err) => {
                    let kind = classify_error(&err);
                    tracing::warn!(
                        target: "llm-retry",
                        model = model.as_str(),
                        attempt,
                        attempts = opts.max_retries,
                        kind = ?kind,
                        error = %format!("{err:#}"),
                        "llm attempt failed"
                    );
                    last_error = Some(err);

                    match kind {
                        LlmErrorKind::ModelUnavailable | LlmErrorKind::QuotaExhausted => {
                            // No point re-asking this model.
                            continue 'candidates;
                        }
                        LlmErrorKind::Transient => {
                            if attempt < opts.max_retries {
                                let delay = BACKOFF_BASE_MS << (attempt - 1);
                                tokio::time::sleep(Duration::from_millis(delay)).await;
                            }
                        }
                        LlmErrorKind::Permanent => continue 'candidates,
                    }
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| anyhow::anyhow!("no attempts were made"))
        .context("all candidate models failed"))
}

/// One bounded attempt. On timeout the in-flight call keeps running as a
/// detached task whose settlement is logged, never consumed.
async fn attempt_once(
    client: &Arc<dyn LlmClient>,
    model: &str,
    prompt: &str,
    timeout: Duration,
) -> anyhow::Result<String> {
    let abandoned = Arc::new(AtomicBool::new(false));

    let task = tokio::spawn({
        let client = Arc::clone(client);
        let model = model.to_owned();
        let prompt = prompt.to_owned();
        let abandoned = Arc::clone(&abandoned);
        async move {
            let result = client.generate(&model, &prompt).await;
            if abandoned.load(Ordering::Acquire) {
                tracing::warn!(
                    target: "llm-retry",
                    model = model.as_str(),
                    ok = result.is_ok(),
                    "abandoned llm call settled after timeout"
                );
                return None;
            }
            Some(result)
        }
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Some(result))) => result,
        Ok(Ok(None)) => anyhow::bail!("llm call settled after abandonment"),
        Ok(Err(join_err)) => Err(anyhow::anyhow!(join_err).context("join llm call task")),
        Err(_elapsed) => {
            abandoned.store(true, Ordering::Release);
            anyhow::bail!("llm call timeout after {}ms", timeout.as_millis())
        }
    }
}
