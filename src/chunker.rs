//! Word-bounded fragment chunker.
//!
//! Two profiles drive it: the explanation profile feeds single LLM
//! calls, the alignment profile feeds the similarity index and adapts
//! its bounds to how fine-grained the upstream chapter is.

use serde::{Deserialize, Serialize};

use crate::corpus::CorpusId;
use crate::hash;
use crate::hebrew;
use crate::provider::Fragment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProfile {
    pub max_words: usize,
    pub min_words: usize,
}

pub const EXPLANATION_PROFILE: ChunkProfile = ChunkProfile {
    max_words: 180,
    min_words: 120,
};

/// Alignment profile adapts to the upstream fragment count for the
/// chapter: fewer, larger fragments get finer chunks.
pub fn alignment_profile(fragment_count: usize) -> ChunkProfile {
    if fragment_count <= 5 {
        ChunkProfile {
            max_words: 50,
            min_words: 25,
        }
    } else if fragment_count <= 20 {
        ChunkProfile {
            max_words: 100,
            min_words: 50,
        }
    } else {
        ChunkProfile {
            max_words: 150,
            min_words: 80,
        }
    }
}

pub const ALIGNMENT_TOTAL_CAP: usize = 60;

/// A clause may run this far past `max_words` before it is emitted as an
/// oversized standalone chunk rather than grouped.
const OVERSIZE_SLACK: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<usize>>,
}

/// Chunk every fragment under `profile`. Each chunk inherits its source
/// fragment's ref and path unchanged; ids are deterministic from
/// (corpus, normalized ref, path, per-fragment ordinal).
pub fn chunk_fragments(
    corpus: CorpusId,
    fragments: &[Fragment],
    profile: ChunkProfile,
    total_cap: Option<usize>,
) -> Vec<Chunk> {
    let mut out = Vec::new();
    let mut dropped = 0usize;

    'fragments: for fragment in fragments {
        let pieces = split_fragment_text(&fragment.text, profile);
        for (idx, piece) in pieces.into_iter().enumerate() {
            if let Some(cap) = total_cap
                && out.len() >= cap
            {
                dropped += 1;
                continue 'fragments;
            }
            out.push(Chunk {
                id: chunk_id(corpus, &fragment.fragment_ref, &fragment.path, idx + 1),
                content_hash: hash::content_hash(&piece),
                text: piece,
                fragment_ref: Some(fragment.fragment_ref.clone()),
                path: Some(fragment.path.clone()),
            });
        }
    }

    if dropped > 0 {
        tracing::warn!(
            target: "chunker",
            corpus = corpus.key(),
            cap = total_cap.unwrap_or(0),
            dropped,
            "chunk cap reached; dropping tail fragments"
        );
    }

    out
}

pub fn chunk_id(corpus: CorpusId, fragment_ref: &str, path: &[usize], ordinal: usize) -> String {
    let path_part = if path.is_empty() {
        "root".to_owned()
    } else {
        path.iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join("_")
    };
    format!(
        "{}_{}_{}_chunk_{}",
        corpus.key(),
        normalize_ref_for_id(fragment_ref),
        path_part,
        ordinal
    )
}

/// Lowercase, runs of non-alphanumerics collapsed to a single
/// underscore, truncated to the trailing 64 characters (the tail is the
/// discriminating part of a ref).
pub fn normalize_ref_for_id(fragment_ref: &str) -> String {
    let mut out = String::with_capacity(fragment_ref.len());
    let mut last_underscore = false;
    for ch in fragment_ref.to_lowercase().chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    let trimmed = out.trim_matches('_');
    let chars = trimmed.chars().collect::<Vec<_>>();
    if chars.len() <= 64 {
        trimmed.to_owned()
    } else {
        chars[chars.len() - 64..].iter().collect()
    }
}

/// Split one fragment's text into word-bounded pieces.
fn split_fragment_text(text: &str, profile: ChunkProfile) -> Vec<String> {
    if hebrew::count_words(text) <= profile.max_words {
        return vec![text.to_owned()];
    }

    let clauses = split_clauses(text);
    if clauses.len() <= 1 {
        return split_by_word_count(text, profile.max_words);
    }

    let mut groups: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_words = 0usize;

    let mut flush = |current: &mut String, current_words: &mut usize, groups: &mut Vec<String>| {
        if !current.trim().is_empty() {
            groups.push(std::mem::take(current).trim().to_owned());
        } else {
            current.clear();
        }
        *current_words = 0;
    };

    for clause in clauses {
        let words = hebrew::count_words(&clause);

        if words > profile.max_words + OVERSIZE_SLACK {
            flush(&mut current, &mut current_words, &mut groups);
            groups.push(clause.trim().to_owned());
            continue;
        }

        let would_be = current_words + words;
        if current_words > 0 && would_be > profile.max_words {
            if current_words >= profile.min_words {
                flush(&mut current, &mut current_words, &mut groups);
            } else if would_be > profile.max_words + OVERSIZE_SLACK {
                // The group is still below min_words so it may not be
                // emitted mid-fragment, and absorbing the clause would
                // break the hard cap. Word-split the combination; the
                // tail keeps accumulating.
                current.push_str(&clause);
                let pieces = split_by_word_count(&current, profile.max_words);
                current.clear();
                current_words = 0;
                if let Some((tail, full)) = pieces.split_last() {
                    groups.extend(full.iter().cloned());
                    current.push_str(tail);
                    current_words = hebrew::count_words(&current);
                }
                continue;
            }
        }

        current.push_str(&clause);
        current_words += words;
    }
    flush(&mut current, &mut current_words, &mut groups);

    groups
}

/// Sentence-or-clause split on {'.', ':', '\n'}, delimiters kept
/// attached to the preceding clause.
fn split_clauses(text: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | ':' | '\n') {
            clauses.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        clauses.push(current);
    }
    clauses.retain(|c| !c.trim().is_empty());
    clauses
}

fn split_by_word_count(text: &str, max_words: usize) -> Vec<String> {
    let tokens = text.split_whitespace().collect::<Vec<_>>();
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut words_in_piece = 0usize;
    let mut end = 0usize;

    while end < tokens.len() {
        if hebrew::is_word(tokens[end]) {
            words_in_piece += 1;
        }
        end += 1;
        if words_in_piece >= max_words {
            out.push(tokens[start..end].join(" "));
            start = end;
            words_in_piece = 0;
        }
    }
    if start < tokens.len() {
        out.push(tokens[start..].join(" "));
    }
    out
}
