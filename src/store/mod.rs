//! Persistent shared store.
//!
//! The production backing store is an external document database with
//! transactions and server timestamps; the core only depends on this
//! trait. The bundled backends are an in-memory store (tests, embedded
//! runs) and a local-filesystem store with atomic JSON writes.
//!
//! All records here are process-wide shared state: any request may read
//! them at any time, and the `building`/`processing` transitions are the
//! single-flight protocols the engines rely on.

mod local_fs;
mod memory;

pub use local_fs::LocalFsStore;
pub use memory::MemoryStore;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::corpus::{CorpusId, Section};

pub const ALIGNMENT_SCHEMA_VERSION: u32 = 2;
pub const GUIDE_SCHEMA_VERSION: u32 = 1;

pub fn alignment_key(section: Section, chapter: u32) -> String {
    format!("{}_{}", section.slug(), chapter)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentStatus {
    Building,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlignmentMode {
    LinkedPassages,
    FallbackSimilarity,
    None,
}

/// Alignment of one primary paragraph against one secondary corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceAlignment {
    pub refs: Vec<String>,
    pub mode: AlignmentMode,
    pub score: f64,
}

impl SourceAlignment {
    pub fn none() -> Self {
        Self {
            refs: Vec::new(),
            mode: AlignmentMode::None,
            score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParagraphAlignment {
    pub tur: SourceAlignment,
    pub beit_yosef: SourceAlignment,
    /// Mean of the per-source scores, rounded to 3 decimals.
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentRecord {
    pub status: AlignmentStatus,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub source_hash: BTreeMap<CorpusId, String>,
    /// Paragraph number (decimal string) to its alignment.
    pub paragraph_map: BTreeMap<String, ParagraphAlignment>,
    pub source_checked_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AlignmentRecord {
    pub fn building(now: DateTime<Utc>, lock_ttl: Duration) -> Self {
        Self {
            status: AlignmentStatus::Building,
            version: ALIGNMENT_SCHEMA_VERSION,
            lock_expires_at: Some(
                now + chrono::Duration::from_std(lock_ttl)
                    .unwrap_or_else(|_| chrono::Duration::zero()),
            ),
            source_hash: BTreeMap::new(),
            paragraph_map: BTreeMap::new(),
            source_checked_at: now,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn lock_expired(&self, now: DateTime<Utc>) -> bool {
        match self.lock_expires_at {
            Some(expires) => expires <= now,
            None => true,
        }
    }

    pub fn is_current_version(&self) -> bool {
        self.version >= ALIGNMENT_SCHEMA_VERSION
    }
}

#[derive(Debug)]
pub enum AlignmentLockOutcome {
    /// Caller holds the build lock and must finish with ready/failed.
    Acquired,
    /// Another worker holds an active lock. The record is always
    /// `building` with an unexpired `lock_expires_at`; any other state
    /// is taken over and reported as `Acquired`.
    Busy(AlignmentRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExplanationKey {
    pub section: Section,
    pub chapter: u32,
    pub paragraph: u32,
    pub corpus: CorpusId,
    pub ordinal: usize,
}

impl ExplanationKey {
    pub fn archive_path(&self) -> String {
        format!(
            "corpus-archive/{}/{}/{}/{}/{}",
            self.section.slug(),
            self.chapter,
            self.paragraph,
            self.corpus.key(),
            self.ordinal
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplanationRecord {
    pub raw_text: String,
    pub explanation_text: String,
    pub content_hash: String,
    pub corpus: CorpusId,
    pub ordinal: usize,
    pub model_name: String,
    pub prompt_version: String,
    pub validated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExplanationRecord {
    /// A stored record only counts as a hit when both the content hash
    /// and the prompt version match the requester's.
    pub fn matches(&self, content_hash: &str, prompt_version: &str) -> bool {
        self.content_hash == content_hash && self.prompt_version == prompt_version
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuideStatus {
    Processing,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalGuideRecord {
    pub status: GuideStatus,
    pub section: Section,
    pub chapter: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paragraph: Option<u32>,
    /// Requested corpora, sorted.
    pub corpora: Vec<CorpusId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_model: Option<String>,
    pub validated: bool,
    pub version: u32,
    pub chunk_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalGuideRecord {
    pub fn processing(
        section: Section,
        chapter: u32,
        paragraph: Option<u32>,
        corpora: Vec<CorpusId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: GuideStatus::Processing,
            section,
            chapter,
            paragraph,
            corpora,
            summary_text: None,
            summary_model: None,
            validated: false,
            version: GUIDE_SCHEMA_VERSION,
            chunk_count: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One per-fragment output attached to a guide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuideChunkRecord {
    pub chunk_id: String,
    pub corpus: CorpusId,
    pub ordinal: usize,
    pub source_text: String,
    pub explanation_text: String,
    pub model_name: String,
    pub validated: bool,
    pub cache_hit: bool,
    pub duration_ms: u64,
}

#[derive(Debug)]
pub enum GuideBegin {
    /// Caller owns the processing transition and must finish with
    /// ready/failed.
    Acquired,
    Ready(Box<(CanonicalGuideRecord, Vec<GuideChunkRecord>)>),
    /// Another worker is processing and its heartbeat is recent.
    Processing,
}

/// Domain-shaped persistent store. Every method is one atomic operation
/// against the backing database.
#[async_trait]
pub trait GuideStore: Send + Sync {
    async fn get_alignment(&self, key: &str) -> anyhow::Result<Option<AlignmentRecord>>;

    /// Conditional transaction: acquire the build lock iff the record is
    /// absent, not building, or holds an expired lock.
    async fn try_lock_alignment(
        &self,
        key: &str,
        lock_ttl: Duration,
    ) -> anyhow::Result<AlignmentLockOutcome>;

    /// Full overwrite; used for the terminal ready/failed transitions.
    async fn put_alignment(&self, key: &str, record: &AlignmentRecord) -> anyhow::Result<()>;

    async fn touch_alignment_checked(&self, key: &str) -> anyhow::Result<()>;

    async fn get_explanation(
        &self,
        key: &ExplanationKey,
    ) -> anyhow::Result<Option<ExplanationRecord>>;

    async fn put_explanation(
        &self,
        key: &ExplanationKey,
        record: &ExplanationRecord,
    ) -> anyhow::Result<()>;

    async fn get_legacy_explanation(
        &self,
        hash_key: &str,
    ) -> anyhow::Result<Option<ExplanationRecord>>;

    async fn put_legacy_explanation(
        &self,
        hash_key: &str,
        record: &ExplanationRecord,
    ) -> anyhow::Result<()>;

    /// Conditional transaction implementing the canonical single-flight:
    /// absent/failed/stale-processing acquires, ready returns the data,
    /// fresh processing yields [`GuideBegin::Processing`].
    async fn begin_guide(
        &self,
        fingerprint: &str,
        skeleton: &CanonicalGuideRecord,
        staleness: Duration,
    ) -> anyhow::Result<GuideBegin>;

    async fn get_guide(
        &self,
        fingerprint: &str,
    ) -> anyhow::Result<Option<(CanonicalGuideRecord, Vec<GuideChunkRecord>)>>;

    /// Replace all chunk sub-records and promote the canonical record to
    /// ready, as one batch.
    async fn put_guide_ready(
        &self,
        fingerprint: &str,
        record: &CanonicalGuideRecord,
        chunks: &[GuideChunkRecord],
    ) -> anyhow::Result<()>;

    async fn mark_guide_failed(&self, fingerprint: &str, error: &str) -> anyhow::Result<()>;

    /// Heartbeat while a worker holds the processing transition, so the
    /// staleness check measures inactivity rather than total runtime.
    async fn touch_guide_processing(&self, fingerprint: &str) -> anyhow::Result<()>;

    async fn init_progress(&self, scope: &str, total: usize) -> anyhow::Result<()>;

    async fn incr_progress(&self, scope: &str, delta: usize) -> anyhow::Result<()>;

    async fn get_progress(&self, scope: &str) -> anyhow::Result<Option<(usize, usize)>>;

    /// Cooperative cancellation flag on the caller-scoped record.
    async fn is_cancelled(&self, scope: &str) -> anyhow::Result<bool>;

    async fn set_cancelled(&self, scope: &str, cancelled: bool) -> anyhow::Result<()>;
}

pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
