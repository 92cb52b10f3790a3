//! Consolidated-summary producer.
//!
//! Joins the per-corpus explanations into one Hebrew input under corpus
//! headers, asks the model for a structured summary, strips
//! meta-preamble lines, and validates shape before one repair round.

use std::sync::Arc;

use anyhow::Context as _;

use crate::config::TimeoutConfig;
use crate::corpus::CorpusId;
use crate::hebrew;
use crate::llm::{self, CascadeOptions, LlmClient};

/// Lines opening with any of these are model throat-clearing, not
/// summary content. Only the first few non-empty lines are examined.
const PREAMBLE_BLACKLIST: [&str; 8] = [
    "הנה",
    "להלן",
    "סיכום מתוקן",
    "ניסוח מחדש",
    "נוסח מחדש",
    "בוודאי",
    "כמובן",
    "בבקשה",
];

const PREAMBLE_SCAN_LINES: usize = 5;

#[derive(Debug, Clone)]
pub struct SummarySection {
    pub corpus: CorpusId,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct SummaryOutcome {
    pub summary: String,
    pub model_used: String,
    pub validated: bool,
    pub validation_errors: Vec<String>,
}

pub struct SummaryProducer {
    llm: Arc<dyn LlmClient>,
    timeouts: TimeoutConfig,
    hebrew_ratio_threshold: f64,
}

impl SummaryProducer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        timeouts: TimeoutConfig,
        hebrew_ratio_threshold: f64,
    ) -> Self {
        Self {
            llm,
            timeouts,
            hebrew_ratio_threshold,
        }
    }

    pub async fn produce(
        &self,
        sections: &[SummarySection],
        candidates: &[String],
    ) -> anyhow::Result<SummaryOutcome> {
        let prompt = build_summary_prompt(sections);
        let response = llm::generate_with_fallback(
            &self.llm,
            candidates,
            &prompt,
            &CascadeOptions {
                timeout: self.timeouts.summary_call,
                max_retries: self.timeouts.summary_retries,
            },
        )
        .await
        .context("generate summary")?;

        let mut summary = strip_meta_preamble(&response.text);
        let mut errors = self.validate(&summary);

        if !errors.is_empty() {
            tracing::warn!(
                target: "llm-retry",
                model = response.model.as_str(),
                errors = ?errors,
                "summary failed validation; repairing"
            );
            let repair_prompt = build_repair_prompt(&summary, &errors);
            match llm::generate_with_fallback(
                &self.llm,
                &[response.model.clone()],
                &repair_prompt,
                &CascadeOptions {
                    timeout: self.timeouts.summary_repair,
                    max_retries: self.timeouts.repair_retries,
                },
            )
            .await
            {
                Ok(repaired) => {
                    summary = strip_meta_preamble(&repaired.text);
                    errors = self.validate(&summary);
                }
                Err(err) => {
                    tracing::warn!(
                        target: "llm-retry",
                        model = response.model.as_str(),
                        error = %format!("{err:#}"),
                        "summary repair round failed"
                    );
                }
            }
        }

        Ok(SummaryOutcome {
            summary,
            model_used: response.model,
            validated: errors.is_empty(),
            validation_errors: errors,
        })
    }

    fn validate(&self, summary: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if summary.trim().is_empty() {
            errors.push("empty summary".to_owned());
            return errors;
        }
        let ratio = hebrew::hebrew_ratio(summary);
        if ratio < self.hebrew_ratio_threshold {
            errors.push(format!("hebrew ratio {ratio:.2} below threshold"));
        }
        if !has_bullet_line(summary) {
            errors.push("no bullet lines".to_owned());
        }
        errors
    }
}

fn has_bullet_line(text: &str) -> bool {
    text.lines().any(|line| {
        let trimmed = line.trim_start();
        trimmed.starts_with('-') || trimmed.starts_with('*') || trimmed.starts_with('•')
    })
}

/// Drop blacklist-prefixed lines among the first few non-empty lines.
pub fn strip_meta_preamble(text: &str) -> String {
    let mut kept = Vec::new();
    let mut examined = 0usize;

    for line in text.lines() {
        let trimmed = line.trim();
        if !trimmed.is_empty() && examined < PREAMBLE_SCAN_LINES {
            examined += 1;
            if PREAMBLE_BLACKLIST
                .iter()
                .any(|prefix| trimmed.starts_with(prefix))
            {
                continue;
            }
        }
        kept.push(line);
    }

    kept.join("\n").trim().to_owned()
}

fn build_combined_input(sections: &[SummarySection]) -> String {
    let mut out = String::new();
    for section in sections {
        out.push_str(&format!("== {} ==\n", section.corpus.label_he()));
        out.push_str(section.text.trim());
        out.push_str("\n\n");
    }
    out
}

fn build_summary_prompt(sections: &[SummarySection]) -> String {
    let has_primary = sections
        .iter()
        .any(|s| s.corpus == CorpusId::ShulchanArukh);
    let has_later_commentary = sections
        .iter()
        .any(|s| s.corpus == CorpusId::MishnahBerurah);

    let mut structure = String::new();
    if has_primary && sections.len() >= 2 {
        structure.push_str("- פתח בסעיף של ריבוי הדעות שהובאו במקורות.\n");
    }
    if has_primary {
        structure.push_str("- סעיף של הכרעת השולחן ערוך.\n");
    }
    if has_later_commentary {
        structure.push_str("- סעיף של תוספות המשנה ברורה.\n");
    }
    structure.push_str("- סיים בסעיף של ההלכה למעשה.\n");

    format!(
        "סכם את הביאורים הבאים לכדי סיכום הלכתי אחד.\n\
הנחיות מחייבות:\n\
- כתוב בעברית בלבד.\n\
- כל נקודה בשורת בולט נפרדת המתחילה ב'-'.\n\
- הדגש כל שם של פוסק בין ** ל-**.\n\
- אל תפתח במילים כגון 'הנה', 'להלן', 'סיכום מתוקן', 'בוודאי'.\n\
- אל תוסיף הקדמה או סיום מעבר לסיכום עצמו.\n\
מבנה הסיכום:\n{structure}\n\
הביאורים לסיכום:\n\n{input}\nהסיכום:",
        structure = structure,
        input = build_combined_input(sections)
    )
}

fn build_repair_prompt(summary: &str, errors: &[String]) -> String {
    format!(
        "הסיכום הבא נפסל בבדיקות האלה: {errors}. כתוב אותו מחדש בעברית בלבד, \
בשורות בולט המתחילות ב'-', עם שמות הפוסקים מודגשים בין ** ל-**, \
ובלי שום הקדמה.\n\nהסיכום לתיקון:\n{summary}\n\nהסיכום המתוקן:",
        errors = errors.join("; "),
        summary = summary
    )
}
