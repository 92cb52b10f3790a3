//! Lexical similarity over Hebrew-normalized text.
//!
//! Used by the alignment engine when the provider's link graph has no
//! answer for a paragraph: candidates are the secondary corpus's
//! fragments, the query is the primary paragraph's text.

use std::collections::HashSet;

use crate::hebrew;

const TOKEN_WEIGHT: f64 = 0.7;
const BIGRAM_WEIGHT: f64 = 0.3;

/// Scores below this never produce a match.
const MIN_BEST_SCORE: f64 = 0.05;
/// Floor of the keep threshold derived from the best score.
const MIN_KEEP_SCORE: f64 = 0.08;
const KEEP_RATIO: f64 = 0.6;
const MAX_SELECTED: usize = 12;

#[derive(Debug, Clone)]
pub struct TextSignature {
    tokens: HashSet<String>,
    bigrams: HashSet<String>,
}

impl TextSignature {
    pub fn of(text: &str) -> Self {
        let normalized = hebrew::normalize_for_similarity(text);
        let tokens = hebrew::similarity_tokens(&normalized);

        let mut bigrams = HashSet::new();
        for pair in tokens.windows(2) {
            bigrams.insert(format!("{} {}", pair[0], pair[1]));
        }

        Self {
            tokens: tokens.into_iter().map(str::to_owned).collect(),
            bigrams,
        }
    }

    /// Weighted overlap of `candidate` against this query signature.
    /// A zero denominator zeroes that term.
    pub fn score_against(&self, candidate: &TextSignature) -> f64 {
        let token_term = if self.tokens.is_empty() {
            0.0
        } else {
            let shared = self.tokens.intersection(&candidate.tokens).count();
            shared as f64 / self.tokens.len() as f64
        };
        let bigram_term = if self.bigrams.is_empty() {
            0.0
        } else {
            let shared = self.bigrams.intersection(&candidate.bigrams).count();
            shared as f64 / self.bigrams.len() as f64
        };
        TOKEN_WEIGHT * token_term + BIGRAM_WEIGHT * bigram_term
    }
}

#[derive(Debug, Clone)]
struct IndexedCandidate {
    fragment_ref: String,
    signature: TextSignature,
}

/// Immutable index over one corpus's candidate texts, in upstream order.
#[derive(Debug, Clone)]
pub struct SimilarityIndex {
    candidates: Vec<IndexedCandidate>,
}

#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Matching refs in upstream reading order, deduplicated.
    pub refs: Vec<String>,
    /// Best candidate score; 0 when nothing matched.
    pub score: f64,
}

impl SimilarityIndex {
    pub fn build<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let candidates = entries
            .into_iter()
            .map(|(fragment_ref, text)| IndexedCandidate {
                fragment_ref: fragment_ref.to_owned(),
                signature: TextSignature::of(text),
            })
            .collect();
        Self { candidates }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Best-refs selection for one query paragraph.
    pub fn select(&self, query_text: &str) -> Selection {
        let query = TextSignature::of(query_text);

        let mut scored = self
            .candidates
            .iter()
            .enumerate()
            .map(|(order, candidate)| (order, query.score_against(&candidate.signature)))
            .collect::<Vec<_>>();

        // Descending score; ties keep upstream reading order.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let Some(&(_, best)) = scored.first() else {
            return Selection::default();
        };
        if best < MIN_BEST_SCORE {
            return Selection::default();
        }

        let threshold = MIN_KEEP_SCORE.max(KEEP_RATIO * best);
        let mut kept = scored
            .into_iter()
            .filter(|&(_, score)| score >= threshold)
            .take(MAX_SELECTED)
            .collect::<Vec<_>>();
        kept.sort_by_key(|&(order, _)| order);

        let mut seen = HashSet::new();
        let refs = kept
            .into_iter()
            .filter_map(|(order, _)| {
                let fragment_ref = &self.candidates[order].fragment_ref;
                seen.insert(fragment_ref.clone())
                    .then(|| fragment_ref.clone())
            })
            .collect();

        Selection { refs, score: best }
    }
}
