//! Cross-corpus chapter alignment.
//!
//! For each paragraph of the primary work, records which refs of the
//! predecessor code (Tur) and the source compendium (Beit Yosef)
//! correspond to it. The provider's link graph is authoritative;
//! lexical similarity is the fallback. Results are persisted per
//! chapter behind a store-level single-flight lock, revalidated against
//! upstream content hashes, and deduplicated in-process.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use regex::Regex;
use tokio::sync::{Mutex, OnceCell};

use crate::chunker;
use crate::config::TimeoutConfig;
use crate::corpus::{CorpusId, Section, build_ref};
use crate::hash;
use crate::provider::{FetchResult, TextProvider};
use crate::similarity::SimilarityIndex;
use crate::store::{
    AlignmentLockOutcome, AlignmentRecord, AlignmentStatus, GuideStore, ParagraphAlignment,
    SourceAlignment, alignment_key, round3,
};
use crate::store::{ALIGNMENT_SCHEMA_VERSION, AlignmentMode};

/// Chapter text of the three source corpora, fetched once per build.
/// Their content hashes drive invalidation.
#[derive(Debug, Clone)]
pub struct ChapterPayload {
    pub primary: FetchResult,
    pub tur: FetchResult,
    pub beit_yosef: FetchResult,
}

impl ChapterPayload {
    pub fn source_hashes(&self) -> BTreeMap<CorpusId, String> {
        let mut out = BTreeMap::new();
        for (corpus, fetched) in [
            (CorpusId::ShulchanArukh, &self.primary),
            (CorpusId::Tur, &self.tur),
            (CorpusId::BeitYosef, &self.beit_yosef),
        ] {
            out.insert(corpus, hash::content_hash(&fetched.raw_he.join("\n")));
        }
        out
    }
}

pub struct AlignmentEngine {
    store: Arc<dyn GuideStore>,
    provider: TextProvider,
    timeouts: TimeoutConfig,
    /// In-process single flight, keyed like the store records; entries
    /// are cleared once the shared resolution settles.
    pending: Mutex<HashMap<String, Arc<OnceCell<AlignmentRecord>>>>,
}

impl AlignmentEngine {
    pub fn new(
        store: Arc<dyn GuideStore>,
        provider: TextProvider,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            store,
            provider,
            timeouts,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// The chapter's alignment record, building it if needed. Concurrent
    /// in-process callers share one resolution.
    pub async fn chapter_alignment(
        &self,
        section: Section,
        chapter: u32,
    ) -> anyhow::Result<AlignmentRecord> {
        let key = alignment_key(section, chapter);

        let cell = {
            let mut pending = self.pending.lock().await;
            Arc::clone(pending.entry(key.clone()).or_default())
        };

        let result = cell
            .get_or_try_init(|| self.resolve(section, chapter, &key))
            .await
            .map(AlignmentRecord::clone);

        self.pending.lock().await.remove(&key);
        result
    }

    async fn resolve(
        &self,
        section: Section,
        chapter: u32,
        key: &str,
    ) -> anyhow::Result<AlignmentRecord> {
        if let Some(record) = self
            .store
            .get_alignment(key)
            .await
            .context("read alignment record")?
            && record.status == AlignmentStatus::Ready
            && record.is_current_version()
        {
            return self.revalidate(section, chapter, key, record).await;
        }

        self.acquire_and_build(section, chapter, key, None).await
    }

    /// A ready record older than the revalidation window gets its source
    /// hashes re-checked; any drift forces a rebuild reusing the fresh
    /// payload.
    async fn revalidate(
        &self,
        section: Section,
        chapter: u32,
        key: &str,
        record: AlignmentRecord,
    ) -> anyhow::Result<AlignmentRecord> {
        let age = Utc::now()
            .signed_duration_since(record.source_checked_at)
            .to_std()
            .unwrap_or_default();
        if age < self.timeouts.source_revalidation {
            return Ok(record);
        }

        let payload = self.fetch_chapter_payload(section, chapter).await?;
        if payload.source_hashes() == record.source_hash {
            self.store
                .touch_alignment_checked(key)
                .await
                .context("touch alignment check timestamp")?;
            let mut record = record;
            record.source_checked_at = Utc::now();
            return Ok(record);
        }

        tracing::info!(
            target: "alignment",
            key,
            "upstream content changed; rebuilding chapter alignment"
        );
        self.acquire_and_build(section, chapter, key, Some(payload))
            .await
    }

    async fn acquire_and_build(
        &self,
        section: Section,
        chapter: u32,
        key: &str,
        payload: Option<ChapterPayload>,
    ) -> anyhow::Result<AlignmentRecord> {
        match self
            .store
            .try_lock_alignment(key, self.timeouts.alignment_lock_ttl)
            .await
            .context("acquire alignment lock")?
        {
            AlignmentLockOutcome::Acquired => match self.build(section, chapter, payload).await {
                Ok(record) => {
                    self.store
                        .put_alignment(key, &record)
                        .await
                        .context("persist alignment record")?;
                    Ok(record)
                }
                Err(err) => {
                    let now = Utc::now();
                    let failed = AlignmentRecord {
                        status: AlignmentStatus::Failed,
                        version: ALIGNMENT_SCHEMA_VERSION,
                        lock_expires_at: None,
                        source_hash: BTreeMap::new(),
                        paragraph_map: BTreeMap::new(),
                        source_checked_at: now,
                        created_at: now,
                        updated_at: now,
                        error: Some(format!("{err:#}")),
                    };
                    if let Err(store_err) = self.store.put_alignment(key, &failed).await {
                        tracing::error!(
                            target: "alignment",
                            key,
                            error = %format!("{store_err:#}"),
                            "failed to record alignment failure"
                        );
                    }
                    Err(err)
                }
            },
            // Busy always means an active build elsewhere; a ready
            // record would have been taken over by the lock.
            AlignmentLockOutcome::Busy(_) => self.wait_for_ready(key).await,
        }
    }

    /// Poll the store until another worker finishes the build.
    async fn wait_for_ready(&self, key: &str) -> anyhow::Result<AlignmentRecord> {
        let deadline = std::time::Instant::now() + self.timeouts.alignment_wait;

        while std::time::Instant::now() < deadline {
            tokio::time::sleep(self.timeouts.alignment_poll).await;

            let Some(record) = self
                .store
                .get_alignment(key)
                .await
                .context("poll alignment record")?
            else {
                continue;
            };
            match record.status {
                AlignmentStatus::Ready if record.is_current_version() => return Ok(record),
                AlignmentStatus::Failed => {
                    anyhow::bail!(
                        "alignment build failed in another worker: {}",
                        record.error.as_deref().unwrap_or("unknown error")
                    );
                }
                _ => {}
            }
        }

        anyhow::bail!(
            "timed out after {}s waiting for alignment {key}",
            self.timeouts.alignment_wait.as_secs()
        )
    }

    pub async fn fetch_chapter_payload(
        &self,
        section: Section,
        chapter: u32,
    ) -> anyhow::Result<ChapterPayload> {
        let chapter_str = chapter.to_string();

        let primary_ref = build_ref(CorpusId::ShulchanArukh, section, &chapter_str, None)?;
        let primary = self
            .provider
            .fetch_fragments(&primary_ref)
            .await
            .context("fetch primary chapter")?;

        let tur = self
            .fetch_secondary(CorpusId::Tur, section, &chapter_str)
            .await?;
        let beit_yosef = self
            .fetch_secondary(CorpusId::BeitYosef, section, &chapter_str)
            .await?;

        Ok(ChapterPayload {
            primary,
            tur,
            beit_yosef,
        })
    }

    /// A missing secondary chapter leaves that corpus with no
    /// candidates rather than failing the build.
    async fn fetch_secondary(
        &self,
        corpus: CorpusId,
        section: Section,
        chapter_str: &str,
    ) -> anyhow::Result<FetchResult> {
        let ref_str = build_ref(corpus, section, chapter_str, None)?;
        match self.provider.fetch_fragments(&ref_str).await {
            Ok(fetched) => Ok(fetched),
            Err(err) => {
                tracing::warn!(
                    target: "alignment",
                    corpus = corpus.key(),
                    error = %format!("{err:#}"),
                    "secondary chapter unavailable"
                );
                Ok(FetchResult {
                    provider_ref: ref_str,
                    fragments: Vec::new(),
                    raw_he: Vec::new(),
                })
            }
        }
    }

    async fn build(
        &self,
        section: Section,
        chapter: u32,
        payload: Option<ChapterPayload>,
    ) -> anyhow::Result<AlignmentRecord> {
        let payload = match payload {
            Some(payload) => payload,
            None => self.fetch_chapter_payload(section, chapter).await?,
        };
        let source_hash = payload.source_hashes();

        let paragraphs = partition_by_paragraph(&payload.primary);
        if paragraphs.is_empty() {
            anyhow::bail!(
                "primary chapter has no addressable paragraphs: {}",
                payload.primary.provider_ref
            );
        }

        let tur_index = build_candidate_index(CorpusId::Tur, &payload.tur);
        let beit_yosef_index = build_candidate_index(CorpusId::BeitYosef, &payload.beit_yosef);

        let mut paragraph_map = BTreeMap::new();
        for (paragraph, text) in &paragraphs {
            let chapter_str = chapter.to_string();
            let paragraph_ref = build_ref(
                CorpusId::ShulchanArukh,
                section,
                &chapter_str,
                Some(&paragraph.to_string()),
            )?;

            let linked = match self.provider.fetch_linked_refs(&paragraph_ref, section).await {
                Ok(linked) => linked,
                Err(err) => {
                    tracing::warn!(
                        target: "alignment",
                        paragraph_ref = paragraph_ref.as_str(),
                        error = %format!("{err:#}"),
                        "link endpoint unavailable; falling back to similarity"
                    );
                    Default::default()
                }
            };

            let tur = align_source(&linked.tur_refs, &tur_index, text);
            let beit_yosef = align_source(&linked.beit_yosef_refs, &beit_yosef_index, text);
            let confidence = round3((tur.score + beit_yosef.score) / 2.0);

            paragraph_map.insert(
                paragraph.to_string(),
                ParagraphAlignment {
                    tur,
                    beit_yosef,
                    confidence,
                },
            );
        }

        let now = Utc::now();
        Ok(AlignmentRecord {
            status: AlignmentStatus::Ready,
            version: ALIGNMENT_SCHEMA_VERSION,
            lock_expires_at: None,
            source_hash,
            paragraph_map,
            source_checked_at: now,
            created_at: now,
            updated_at: now,
            error: None,
        })
    }
}

/// Linked refs win outright with a full score; otherwise similarity
/// picks, and an empty pick records mode `none`.
fn align_source(
    linked_refs: &[String],
    index: &SimilarityIndex,
    paragraph_text: &str,
) -> SourceAlignment {
    if !linked_refs.is_empty() {
        return SourceAlignment {
            refs: linked_refs.to_vec(),
            mode: AlignmentMode::LinkedPassages,
            score: 1.0,
        };
    }
    if index.is_empty() {
        return SourceAlignment::none();
    }

    let selection = index.select(paragraph_text);
    if selection.refs.is_empty() {
        return SourceAlignment::none();
    }
    SourceAlignment {
        refs: selection.refs,
        mode: AlignmentMode::FallbackSimilarity,
        score: selection.score.clamp(0.0, 1.0),
    }
}

/// Group the primary chapter's fragments by paragraph and concatenate
/// their texts, in ascending paragraph order.
pub fn partition_by_paragraph(primary: &FetchResult) -> BTreeMap<u32, String> {
    let mut out: BTreeMap<u32, String> = BTreeMap::new();
    for fragment in &primary.fragments {
        let Some(paragraph) = paragraph_number(&fragment.fragment_ref, &fragment.path) else {
            continue;
        };
        let entry = out.entry(paragraph).or_default();
        if !entry.is_empty() {
            entry.push(' ');
        }
        entry.push_str(&fragment.text);
    }
    out
}

/// Paragraph number of a fragment: the leading path index when present,
/// else parsed off the provider ref. This is the only place the ref
/// shape `"<book>, <section> <chapter>:<paragraph>[:<sub>]"` is parsed.
pub fn paragraph_number(fragment_ref: &str, path: &[usize]) -> Option<u32> {
    if let Some(&first) = path.first() {
        return Some(first as u32 + 1);
    }

    static PARAGRAPH_RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = PARAGRAPH_RE
        .get_or_init(|| Regex::new(r"\d+:(\d+)(?::\d+)?\s*$").expect("paragraph regex"));
    re.captures(fragment_ref)
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Secondary fragments are re-chunked with the adaptive alignment
/// profile so a coarse upstream chapter still yields usable candidates;
/// every chunk keeps its fragment's ref.
fn build_candidate_index(corpus: CorpusId, fetched: &FetchResult) -> SimilarityIndex {
    let profile = chunker::alignment_profile(fetched.fragments.len());
    let chunks = chunker::chunk_fragments(
        corpus,
        &fetched.fragments,
        profile,
        Some(chunker::ALIGNMENT_TOTAL_CAP),
    );
    SimilarityIndex::build(
        chunks
            .iter()
            .map(|chunk| (chunk.fragment_ref.as_deref().unwrap_or_default(), chunk.text.as_str()))
            .collect::<Vec<_>>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Fragment;

    fn fetched(provider_ref: &str, texts: &[&str]) -> FetchResult {
        FetchResult {
            provider_ref: provider_ref.to_owned(),
            fragments: texts
                .iter()
                .enumerate()
                .map(|(idx, text)| Fragment {
                    fragment_ref: format!("{provider_ref}:{}", idx + 1),
                    path: vec![idx],
                    text: (*text).to_owned(),
                })
                .collect(),
            raw_he: texts.iter().map(|t| (*t).to_owned()).collect(),
        }
    }

    #[test]
    fn paragraph_number_prefers_path() {
        assert_eq!(paragraph_number("whatever", &[2]), Some(3));
        assert_eq!(paragraph_number("whatever", &[0, 4]), Some(1));
    }

    #[test]
    fn paragraph_number_falls_back_to_ref_regex() {
        assert_eq!(
            paragraph_number("Shulchan Arukh, Orach Chayim 24:3", &[]),
            Some(3)
        );
        assert_eq!(
            paragraph_number("Shulchan Arukh, Orach Chayim 24:3:2", &[]),
            Some(3)
        );
        assert_eq!(paragraph_number("Shulchan Arukh, Orach Chayim 24", &[]), None);
    }

    #[test]
    fn partition_concatenates_same_paragraph_fragments() {
        let mut primary = fetched("Shulchan Arukh, Orach Chayim 24", &["א", "ב"]);
        primary.fragments[1].path = vec![0];
        let partitioned = partition_by_paragraph(&primary);
        assert_eq!(partitioned.len(), 1);
        assert_eq!(partitioned.get(&1).map(String::as_str), Some("א ב"));
    }

    #[test]
    fn align_source_prefers_linked_refs() {
        let index = SimilarityIndex::build(vec![("Tur 24:1", "מתעטף בציצית ומברך")]);
        let linked = vec!["Tur, Orach Chayim 24".to_owned()];
        let aligned = align_source(&linked, &index, "מתעטף בציצית ומברך");
        assert_eq!(aligned.mode, AlignmentMode::LinkedPassages);
        assert_eq!(aligned.score, 1.0);
        assert_eq!(aligned.refs, linked);
    }

    #[test]
    fn align_source_falls_back_to_similarity() {
        let index = SimilarityIndex::build(vec![("Tur 24:1", "מתעטף בציצית ומברך עליה בבוקר")]);
        let aligned = align_source(&[], &index, "מתעטף בציצית ומברך עליה");
        assert_eq!(aligned.mode, AlignmentMode::FallbackSimilarity);
        assert!(!aligned.refs.is_empty());
        assert!(aligned.score > 0.0);
    }

    #[test]
    fn align_source_records_none_when_nothing_matches() {
        let index = SimilarityIndex::build(vec![("Tur 24:1", "עניין אחר לגמרי ללא שום דמיון")]);
        let aligned = align_source(&[], &index, "מתעטף בציצית ומברך עליה");
        assert_eq!(aligned.mode, AlignmentMode::None);
        assert!(aligned.refs.is_empty());
    }
}
