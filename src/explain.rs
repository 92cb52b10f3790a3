//! Per-fragment explanation memoizer.
//!
//! Cache-first: the structured archive key is authoritative, the legacy
//! opaque-hash collection is a read-migration source. A full miss runs
//! the model cascade, validates the Hebrew ratio, repairs once, and
//! writes back both the structured record and the forward-deflection
//! legacy keys.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use chrono::Utc;

use crate::config::{ModelConfig, TimeoutConfig};
use crate::hash;
use crate::hebrew;
use crate::llm::{self, CascadeOptions, LlmClient};
use crate::store::{ExplanationKey, ExplanationRecord, GuideStore};

/// Bumping this invalidates every cached explanation.
pub const PROMPT_VERSION: &str = "v3.4-rabbanut";

#[derive(Debug, Clone)]
pub struct ExplainRequest {
    pub key: ExplanationKey,
    /// Canonical provider ref; part of the legacy cache key.
    pub ref_canonical: String,
    pub current_text: String,
    /// Previous chunk of the same corpus and its explanation, for
    /// continuity.
    pub previous: Option<PreviousSegment>,
    /// Raw later-commentary text covering the same paragraph; only ever
    /// set for the primary corpus.
    pub companion_text: Option<String>,
    pub content_hash: String,
    pub preferred_model: String,
}

#[derive(Debug, Clone)]
pub struct PreviousSegment {
    pub text: String,
    pub explanation: String,
}

#[derive(Debug, Clone)]
pub struct ExplainOutcome {
    pub explanation: String,
    pub model_used: String,
    pub cache_hit: bool,
    pub prompt_version: String,
    pub validated: bool,
    pub duration_ms: u64,
}

pub struct Explainer {
    store: Arc<dyn GuideStore>,
    llm: Arc<dyn LlmClient>,
    models: ModelConfig,
    timeouts: TimeoutConfig,
    hebrew_ratio_threshold: f64,
}

impl Explainer {
    pub fn new(
        store: Arc<dyn GuideStore>,
        llm: Arc<dyn LlmClient>,
        models: ModelConfig,
        timeouts: TimeoutConfig,
        hebrew_ratio_threshold: f64,
    ) -> Self {
        Self {
            store,
            llm,
            models,
            timeouts,
            hebrew_ratio_threshold,
        }
    }

    pub async fn explain(&self, request: &ExplainRequest) -> anyhow::Result<ExplainOutcome> {
        let started = Instant::now();

        if let Some(hit) = self.lookup_structured(request).await? {
            return Ok(outcome_from_record(&hit, true, started));
        }
        if let Some(hit) = self.lookup_legacy_and_migrate(request).await? {
            return Ok(outcome_from_record(&hit, true, started));
        }

        let prompt = build_explanation_prompt(request);
        let candidates = self.models.candidates(&request.preferred_model);
        let response = llm::generate_with_fallback(
            &self.llm,
            &candidates,
            &prompt,
            &CascadeOptions {
                timeout: self.timeouts.explanation_call,
                max_retries: self.timeouts.explanation_retries,
            },
        )
        .await
        .context("generate explanation")?;

        let (explanation, validated) = self
            .validate_and_repair(&response.text, &response.model)
            .await;

        let now = Utc::now();
        let record = ExplanationRecord {
            raw_text: request.current_text.clone(),
            explanation_text: explanation,
            content_hash: request.content_hash.clone(),
            corpus: request.key.corpus,
            ordinal: request.key.ordinal,
            model_name: response.model.clone(),
            prompt_version: PROMPT_VERSION.to_owned(),
            validated,
            created_at: now,
            updated_at: now,
        };
        self.write_back(request, &record).await?;

        Ok(ExplainOutcome {
            explanation: record.explanation_text,
            model_used: record.model_name,
            cache_hit: false,
            prompt_version: PROMPT_VERSION.to_owned(),
            validated,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn lookup_structured(
        &self,
        request: &ExplainRequest,
    ) -> anyhow::Result<Option<ExplanationRecord>> {
        let record = self
            .store
            .get_explanation(&request.key)
            .await
            .context("read explanation archive")?;
        Ok(record.filter(|r| r.matches(&request.content_hash, PROMPT_VERSION)))
    }

    /// Legacy keys embed the model name, so each candidate model gets a
    /// probe. A hit migrates into the structured key.
    async fn lookup_legacy_and_migrate(
        &self,
        request: &ExplainRequest,
    ) -> anyhow::Result<Option<ExplanationRecord>> {
        for model in self.models.candidates(&request.preferred_model) {
            let key = legacy_cache_key(request, &model);
            let Some(record) = self
                .store
                .get_legacy_explanation(&key)
                .await
                .context("read legacy explanation cache")?
            else {
                continue;
            };
            if !record.matches(&request.content_hash, PROMPT_VERSION) {
                continue;
            }

            tracing::info!(
                target: "cache",
                model = model.as_str(),
                path = %request.key.archive_path(),
                "migrating legacy explanation into archive"
            );
            self.store
                .put_explanation(&request.key, &record)
                .await
                .context("migrate legacy explanation")?;
            return Ok(Some(record));
        }
        Ok(None)
    }

    /// Hebrew-ratio gate with one repair round. The repaired output is
    /// kept whatever its own validation says; a failed repair call keeps
    /// the original, unvalidated.
    async fn validate_and_repair(&self, text: &str, model: &str) -> (String, bool) {
        if self.is_valid(text) {
            return (text.to_owned(), true);
        }

        tracing::warn!(
            target: "llm-retry",
            model,
            ratio = hebrew::hebrew_ratio(text),
            "explanation failed hebrew-ratio validation; repairing"
        );

        let repair_prompt = build_repair_prompt(text);
        let repaired = llm::generate_with_fallback(
            &self.llm,
            &[model.to_owned()],
            &repair_prompt,
            &CascadeOptions {
                timeout: self.timeouts.explanation_repair,
                max_retries: self.timeouts.repair_retries,
            },
        )
        .await;

        match repaired {
            Ok(response) => {
                let validated = self.is_valid(&response.text);
                (response.text, validated)
            }
            Err(err) => {
                tracing::warn!(target: "llm-retry", model, error = %format!("{err:#}"), "repair round failed");
                (text.to_owned(), false)
            }
        }
    }

    fn is_valid(&self, text: &str) -> bool {
        !text.trim().is_empty() && hebrew::hebrew_ratio(text) >= self.hebrew_ratio_threshold
    }

    /// Structured record plus legacy keys for the model actually used
    /// and the originally preferred model, so future legacy-style
    /// lookups by the preferred model hit immediately.
    async fn write_back(
        &self,
        request: &ExplainRequest,
        record: &ExplanationRecord,
    ) -> anyhow::Result<()> {
        self.store
            .put_explanation(&request.key, record)
            .await
            .context("write explanation archive")?;

        self.store
            .put_legacy_explanation(&legacy_cache_key(request, &record.model_name), record)
            .await
            .context("write legacy explanation key")?;

        if request.preferred_model != record.model_name {
            self.store
                .put_legacy_explanation(&legacy_cache_key(request, &request.preferred_model), record)
                .await
                .context("write deflected legacy explanation key")?;
        }
        Ok(())
    }
}

fn outcome_from_record(
    record: &ExplanationRecord,
    cache_hit: bool,
    started: Instant,
) -> ExplainOutcome {
    ExplainOutcome {
        explanation: record.explanation_text.clone(),
        model_used: record.model_name.clone(),
        cache_hit,
        prompt_version: record.prompt_version.clone(),
        validated: record.validated,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

pub fn legacy_cache_key(request: &ExplainRequest, model: &str) -> String {
    hash::sha256_hex(&format!(
        "{}|{}|{}|{}|{}|{}",
        request.key.corpus.key(),
        request.ref_canonical,
        request.key.ordinal,
        request.content_hash,
        PROMPT_VERSION,
        model
    ))
}

fn build_explanation_prompt(request: &ExplainRequest) -> String {
    let mut prompt = String::from(
        "אתה מבאר מקורות הלכתיים לציבור הרחב.\n\
הנחיות מחייבות:\n\
- כתוב בעברית בלבד.\n\
- העתק כל מילה מן המקור כסדרה והדגש אותה בין ** ל-**.\n\
- באר מונח קשה מיד בתוך רצף הדברים, בלי סוגריים.\n\
- תרגם כל קטע ארמית לעברית.\n\
- פתח כל ראשי תיבות במקומם.\n\
- כשיש מחלוקת, הזכר כל דעה בשם אומרה.\n\
- בסוף ציין כיצד נפסק להלכה במחלוקות שהוזכרו.\n\
- אל תוסיף הקדמה או סיום מעבר לביאור עצמו.\n\n",
    );

    if let Some(previous) = &request.previous {
        prompt.push_str("הקטע הקודם:\n");
        prompt.push_str(&previous.text);
        prompt.push_str("\n\nביאור הקטע הקודם:\n");
        prompt.push_str(&previous.explanation);
        prompt.push_str("\n\n");
    }

    if let Some(companion) = &request.companion_text {
        prompt.push_str("דברי המשנה ברורה על סעיף זה, לסיוע בביאור:\n");
        prompt.push_str(companion);
        prompt.push_str("\n\n");
    }

    prompt.push_str(&format!(
        "המקור לביאור ({}):\n{}\n\nביאור:",
        request.key.corpus.label_he(),
        request.current_text
    ));
    prompt
}

fn build_repair_prompt(text: &str) -> String {
    format!(
        "הביאור הבא אינו כתוב בעברית תקינה במלואו. כתוב אותו מחדש בעברית בלבד, \
שמור על סדר מילות המקור המודגשות בין ** ל-**, ואל תוסיף הקדמה או סיום.\n\n\
הביאור לתיקון:\n{text}\n\nהביאור המתוקן:"
    )
}
