//! Guide orchestration.
//!
//! Top of the pipeline: canonical request cache with single-flight,
//! per-corpus fragment plans, chunking, parallel explanation fan-out
//! with sequential context inside each corpus, cooperative
//! cancellation, summary, and the atomic terminal write.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use tokio::task::JoinSet;

use crate::alignment::AlignmentEngine;
use crate::chunker::{self, Chunk, EXPLANATION_PROFILE};
use crate::config::{ModelConfig, PipelineConfig, TimeoutConfig};
use crate::corpus::{CorpusId, Section, build_ref};
use crate::explain::{ExplainRequest, Explainer, PreviousSegment};
use crate::hash;
use crate::hebrew;
use crate::llm::LlmClient;
use crate::provider::{Fragment, TextProvider};
use crate::store::{
    AlignmentMode, AlignmentRecord, CanonicalGuideRecord, ExplanationKey, GuideBegin,
    GuideChunkRecord, GuideStatus, GuideStore, SourceAlignment,
};
use crate::summary::{SummaryProducer, SummarySection};

#[derive(Debug, Clone)]
pub struct GuideRequest {
    pub section: Section,
    pub chapter: u32,
    pub paragraph: Option<u32>,
    pub corpora: BTreeSet<CorpusId>,
}

/// SHA-256 over the normalized request; the canonical cache key.
pub fn request_fingerprint(request: &GuideRequest) -> String {
    let corpora = request
        .corpora
        .iter()
        .map(|corpus| corpus.key())
        .collect::<Vec<_>>()
        .join(",");
    let paragraph = request
        .paragraph
        .map(|p| p.to_string())
        .unwrap_or_default();
    hash::sha256_hex(&format!(
        "v1|{}|{}|{}|{}",
        request.section.slug(),
        request.chapter,
        paragraph,
        corpora
    ))
}

#[derive(Debug, Clone)]
pub struct GuideData {
    pub record: CanonicalGuideRecord,
    pub chunks: Vec<GuideChunkRecord>,
}

/// The single discriminated outcome callers see. `error` is a
/// user-facing Hebrew message; internals only reach the logs.
#[derive(Debug, Clone)]
pub struct GuideOutcome {
    pub success: bool,
    pub cancelled: bool,
    pub guide: Option<GuideData>,
    pub error: Option<String>,
}

impl GuideOutcome {
    fn success(guide: GuideData) -> Self {
        Self {
            success: true,
            cancelled: false,
            guide: Some(guide),
            error: None,
        }
    }

    fn cancelled() -> Self {
        Self {
            success: false,
            cancelled: true,
            guide: None,
            error: None,
        }
    }

    fn failure(message: String) -> Self {
        Self {
            success: false,
            cancelled: false,
            guide: None,
            error: Some(message),
        }
    }
}

/// Known user-reportable failure conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuideFailure {
    NoSourceSelected,
    MissingIdentifiers,
    NoCorpusContent,
}

impl std::fmt::Display for GuideFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            GuideFailure::NoSourceSelected => "no source corpus selected",
            GuideFailure::MissingIdentifiers => "request is missing chapter/paragraph identifiers",
            GuideFailure::NoCorpusContent => "no corpus returned content",
        };
        f.write_str(text)
    }
}

impl std::error::Error for GuideFailure {}

fn hebrew_message(err: &anyhow::Error) -> String {
    match err.downcast_ref::<GuideFailure>() {
        Some(GuideFailure::NoSourceSelected) => "לא נבחר אף מקור ללימוד".to_owned(),
        Some(GuideFailure::MissingIdentifiers) => "חסרים פרטי הסימן או הסעיף בבקשה".to_owned(),
        Some(GuideFailure::NoCorpusContent) => {
            "לא נמצא תוכן באף אחד מהמקורות המבוקשים".to_owned()
        }
        None => "אירעה שגיאה בלתי צפויה ביצירת דף הלימוד".to_owned(),
    }
}

enum PipelineResult {
    Done(GuideData),
    Cancelled,
}

/// One corpus's fragments and the canonical ref they came from.
struct CorpusSource {
    corpus: CorpusId,
    canonical_ref: String,
    fragments: Vec<Fragment>,
}

struct CorpusRun {
    corpus: CorpusId,
    chunks: Vec<GuideChunkRecord>,
    cancelled: bool,
}

pub struct GuideOrchestrator {
    store: Arc<dyn GuideStore>,
    provider: TextProvider,
    alignment: AlignmentEngine,
    explainer: Arc<Explainer>,
    summarizer: SummaryProducer,
    models: ModelConfig,
    pipeline: PipelineConfig,
    timeouts: TimeoutConfig,
}

impl GuideOrchestrator {
    pub fn new(
        store: Arc<dyn GuideStore>,
        llm: Arc<dyn LlmClient>,
        provider: TextProvider,
        models: ModelConfig,
        pipeline: PipelineConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        let alignment =
            AlignmentEngine::new(Arc::clone(&store), provider.clone(), timeouts.clone());
        let explainer = Arc::new(Explainer::new(
            Arc::clone(&store),
            Arc::clone(&llm),
            models.clone(),
            timeouts.clone(),
            pipeline.hebrew_ratio_threshold,
        ));
        let summarizer =
            SummaryProducer::new(llm, timeouts.clone(), pipeline.hebrew_ratio_threshold);
        Self {
            store,
            provider,
            alignment,
            explainer,
            summarizer,
            models,
            pipeline,
            timeouts,
        }
    }

    /// Generate (or load) the guide for a request. `cancel_scope` names
    /// the caller-scoped record whose cancellation flag and progress
    /// counters this run observes and updates.
    pub async fn generate(&self, request: &GuideRequest, cancel_scope: &str) -> GuideOutcome {
        if request.corpora.is_empty() {
            return GuideOutcome::failure(hebrew_message(&anyhow::Error::new(
                GuideFailure::NoSourceSelected,
            )));
        }

        let fingerprint = request_fingerprint(request);

        // Canonical single-flight: ready loads, fresh processing polls,
        // anything else acquires.
        loop {
            let skeleton = CanonicalGuideRecord::processing(
                request.section,
                request.chapter,
                request.paragraph,
                request.corpora.iter().copied().collect(),
                Utc::now(),
            );
            let begin = match self
                .store
                .begin_guide(
                    &fingerprint,
                    &skeleton,
                    self.timeouts.canonical_lock_staleness,
                )
                .await
            {
                Ok(begin) => begin,
                Err(err) => {
                    tracing::error!(target: "cache", error = %format!("{err:#}"), "canonical cache check failed");
                    return GuideOutcome::failure(hebrew_message(&err));
                }
            };

            match begin {
                GuideBegin::Ready(data) => {
                    let (record, chunks) = *data;
                    tracing::info!(target: "cache", fingerprint = fingerprint.as_str(), "canonical guide cache hit");
                    return GuideOutcome::success(GuideData { record, chunks });
                }
                GuideBegin::Acquired => break,
                GuideBegin::Processing => {
                    tracing::info!(
                        target: "cache",
                        fingerprint = fingerprint.as_str(),
                        "another worker is generating; polling for ready"
                    );
                    match self.poll_for_ready(&fingerprint).await {
                        Ok(Some(data)) => return GuideOutcome::success(data),
                        Ok(None) => {} // retry the lock
                        Err(err) => return GuideOutcome::failure(hebrew_message(&err)),
                    }
                }
            }
        }

        match self
            .run_pipeline(request, &fingerprint, cancel_scope)
            .await
        {
            Ok(PipelineResult::Done(data)) => GuideOutcome::success(data),
            Ok(PipelineResult::Cancelled) => {
                if let Err(err) = self.store.mark_guide_failed(&fingerprint, "cancelled").await {
                    tracing::error!(target: "cache", error = %format!("{err:#}"), "failed to record cancellation");
                }
                GuideOutcome::cancelled()
            }
            Err(err) => {
                tracing::error!(target: "guide", error = %format!("{err:#}"), "guide pipeline failed");
                if let Err(mark_err) = self
                    .store
                    .mark_guide_failed(&fingerprint, &format!("{err:#}"))
                    .await
                {
                    tracing::error!(target: "cache", error = %format!("{mark_err:#}"), "failed to record guide failure");
                }
                GuideOutcome::failure(hebrew_message(&err))
            }
        }
    }

    async fn poll_for_ready(&self, fingerprint: &str) -> anyhow::Result<Option<GuideData>> {
        for _ in 0..self.timeouts.canonical_poll_attempts {
            tokio::time::sleep(self.timeouts.canonical_poll).await;

            let Some((record, chunks)) = self
                .store
                .get_guide(fingerprint)
                .await
                .context("poll canonical guide")?
            else {
                continue;
            };
            match record.status {
                GuideStatus::Ready => return Ok(Some(GuideData { record, chunks })),
                // The other worker gave up; go take the lock.
                GuideStatus::Failed => return Ok(None),
                GuideStatus::Processing => {}
            }
        }
        Ok(None)
    }

    async fn run_pipeline(
        &self,
        request: &GuideRequest,
        fingerprint: &str,
        cancel_scope: &str,
    ) -> anyhow::Result<PipelineResult> {
        let companion_text = self.fetch_companion_text(request).await;
        let sources = self.collect_sources(request).await?;

        // Chunk with the explanation profile, capped per corpus.
        let mut planned: Vec<(CorpusSource, Vec<Chunk>)> = Vec::new();
        for source in sources {
            let mut chunks = chunker::chunk_fragments(
                source.corpus,
                &source.fragments,
                EXPLANATION_PROFILE,
                None,
            );
            if chunks.len() > self.pipeline.max_chunks_per_source {
                tracing::warn!(
                    target: "guide",
                    corpus = source.corpus.key(),
                    total = chunks.len(),
                    cap = self.pipeline.max_chunks_per_source,
                    "per-corpus chunk cap reached; dropping tail"
                );
                chunks.truncate(self.pipeline.max_chunks_per_source);
            }
            planned.push((source, chunks));
        }

        let total_chunks: usize = planned.iter().map(|(_, chunks)| chunks.len()).sum();
        if total_chunks == 0 {
            return Err(anyhow::Error::new(GuideFailure::NoCorpusContent));
        }

        let preferred_model =
            if self.models.use_batch && total_chunks > self.models.batch_threshold {
                self.models.cost.clone()
            } else {
                self.models.primary.clone()
            };
        tracing::info!(
            target: "guide",
            fingerprint,
            total_chunks,
            model = preferred_model.as_str(),
            "starting explanation fan-out"
        );

        self.store
            .init_progress(cancel_scope, total_chunks)
            .await
            .context("initialize progress counter")?;

        // One task per corpus; chunks run sequentially inside a task so
        // each call carries its predecessor's output.
        let mut join_set = JoinSet::new();
        for (source, chunks) in planned {
            if chunks.is_empty() {
                continue;
            }
            let explainer = Arc::clone(&self.explainer);
            let store = Arc::clone(&self.store);
            let companion = (source.corpus == CorpusId::ShulchanArukh)
                .then(|| companion_text.clone())
                .flatten();
            let params = CorpusTaskParams {
                section: request.section,
                chapter: request.chapter,
                paragraph: request.paragraph.unwrap_or(0),
                preferred_model: preferred_model.clone(),
                fingerprint: fingerprint.to_owned(),
                cancel_scope: cancel_scope.to_owned(),
                cancellation_check_interval: self.pipeline.cancellation_check_interval,
            };
            join_set.spawn(run_corpus(explainer, store, source, chunks, companion, params));
        }

        let mut runs: Vec<CorpusRun> = Vec::new();
        let mut first_error: Option<anyhow::Error> = None;
        let mut any_cancelled = false;
        while let Some(joined) = join_set.join_next().await {
            match joined.context("join corpus task")? {
                Ok(run) => {
                    any_cancelled |= run.cancelled;
                    runs.push(run);
                }
                Err(err) => {
                    tracing::error!(target: "guide", error = %format!("{err:#}"), "corpus task failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        if any_cancelled {
            return Ok(PipelineResult::Cancelled);
        }

        let produced: usize = runs.iter().map(|run| run.chunks.len()).sum();
        if produced == 0 {
            return Err(first_error
                .unwrap_or_else(|| anyhow::Error::new(GuideFailure::NoCorpusContent)));
        }

        // Stable corpus order for the combined artifact.
        runs.sort_by_key(|run| run.corpus);

        let sections = runs
            .iter()
            .filter(|run| !run.chunks.is_empty())
            .map(|run| SummarySection {
                corpus: run.corpus,
                text: run
                    .chunks
                    .iter()
                    .map(|chunk| chunk.explanation_text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            })
            .collect::<Vec<_>>();

        let summary = self
            .summarizer
            .produce(&sections, &self.models.candidates(&preferred_model))
            .await
            .context("produce summary")?;

        let chunks: Vec<GuideChunkRecord> =
            runs.into_iter().flat_map(|run| run.chunks).collect();
        let all_validated =
            summary.validated && chunks.iter().all(|chunk| chunk.validated);

        let now = Utc::now();
        let mut record = CanonicalGuideRecord::processing(
            request.section,
            request.chapter,
            request.paragraph,
            request.corpora.iter().copied().collect(),
            now,
        );
        record.status = GuideStatus::Ready;
        record.summary_text = Some(summary.summary);
        record.summary_model = Some(summary.model_used);
        record.validated = all_validated;
        record.chunk_count = chunks.len();

        if let Err(err) = self
            .store
            .put_guide_ready(fingerprint, &record, &chunks)
            .await
        {
            // The in-memory result is still good for this caller; the
            // canonical record is left failed for the next attempt.
            tracing::error!(target: "cache", error = %format!("{err:#}"), "terminal guide write failed");
            if let Err(mark_err) = self
                .store
                .mark_guide_failed(fingerprint, "cache_write_failed")
                .await
            {
                tracing::error!(target: "cache", error = %format!("{mark_err:#}"), "failed to record cache write failure");
            }
        }

        Ok(PipelineResult::Done(GuideData { record, chunks }))
    }

    /// Later-commentary text for the requested paragraph; companion
    /// context only, never an explanation target.
    async fn fetch_companion_text(&self, request: &GuideRequest) -> Option<String> {
        if !request.corpora.contains(&CorpusId::MishnahBerurah)
            || !request.corpora.contains(&CorpusId::ShulchanArukh)
            || request.section != Section::OrachChayim
        {
            return None;
        }
        let paragraph = request.paragraph?;

        let ref_str = build_ref(
            CorpusId::MishnahBerurah,
            request.section,
            &request.chapter.to_string(),
            Some(&paragraph.to_string()),
        )
        .ok()?;
        match self.provider.fetch_fragments(&ref_str).await {
            Ok(fetched) => {
                let text = fetched
                    .fragments
                    .iter()
                    .map(|f| f.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                (!text.trim().is_empty()).then_some(text)
            }
            Err(err) => {
                tracing::warn!(
                    target: "guide",
                    error = %format!("{err:#}"),
                    "later-commentary text unavailable; continuing without companion"
                );
                None
            }
        }
    }

    async fn collect_sources(
        &self,
        request: &GuideRequest,
    ) -> anyhow::Result<Vec<CorpusSource>> {
        let needs_alignment = request
            .corpora
            .iter()
            .any(|corpus| matches!(corpus, CorpusId::Tur | CorpusId::BeitYosef));

        let alignment = if needs_alignment {
            if request.paragraph.is_none() {
                return Err(anyhow::Error::new(GuideFailure::MissingIdentifiers));
            }
            Some(
                self.alignment
                    .chapter_alignment(request.section, request.chapter)
                    .await
                    .context("resolve chapter alignment")?,
            )
        } else {
            None
        };

        let mut sources = Vec::new();
        for corpus in request.corpora.iter().copied() {
            match corpus {
                CorpusId::ShulchanArukh => {
                    sources.push(self.fetch_primary_source(request).await?);
                }
                CorpusId::Tur => {
                    let record = alignment.as_ref().expect("alignment resolved above");
                    sources.push(
                        self.fetch_tur_source(request, record)
                            .await
                            .context("fetch predecessor-code source")?,
                    );
                }
                CorpusId::BeitYosef => {
                    let record = alignment.as_ref().expect("alignment resolved above");
                    sources.push(
                        self.fetch_beit_yosef_source(request, record)
                            .await
                            .context("fetch source-compendium source")?,
                    );
                }
                // Companion only; handled separately.
                CorpusId::MishnahBerurah => {}
            }
        }
        Ok(sources)
    }

    async fn fetch_primary_source(
        &self,
        request: &GuideRequest,
    ) -> anyhow::Result<CorpusSource> {
        let ref_str = build_ref(
            CorpusId::ShulchanArukh,
            request.section,
            &request.chapter.to_string(),
            request.paragraph.map(|p| p.to_string()).as_deref(),
        )?;
        match self.provider.fetch_fragments(&ref_str).await {
            Ok(fetched) => Ok(CorpusSource {
                corpus: CorpusId::ShulchanArukh,
                canonical_ref: fetched.provider_ref,
                fragments: fetched.fragments,
            }),
            Err(err) => {
                tracing::warn!(
                    target: "guide",
                    ref_str = ref_str.as_str(),
                    error = %format!("{err:#}"),
                    "primary text unavailable"
                );
                Ok(CorpusSource {
                    corpus: CorpusId::ShulchanArukh,
                    canonical_ref: ref_str,
                    fragments: Vec::new(),
                })
            }
        }
    }

    /// Predecessor code: linked alignments first try paragraph slicing
    /// off the compendium's boundary passages, then fall back to the
    /// stored ref list. No refs means an empty synthetic source.
    async fn fetch_tur_source(
        &self,
        request: &GuideRequest,
        alignment: &AlignmentRecord,
    ) -> anyhow::Result<CorpusSource> {
        let paragraph = request
            .paragraph
            .ok_or(GuideFailure::MissingIdentifiers)?;
        let chapter_ref = build_ref(
            CorpusId::Tur,
            request.section,
            &request.chapter.to_string(),
            None,
        )?;

        let Some(para_alignment) = alignment.paragraph_map.get(&paragraph.to_string()) else {
            return Ok(CorpusSource {
                corpus: CorpusId::Tur,
                canonical_ref: chapter_ref,
                fragments: Vec::new(),
            });
        };
        let tur = &para_alignment.tur;
        if tur.refs.is_empty() {
            return Ok(CorpusSource {
                corpus: CorpusId::Tur,
                canonical_ref: chapter_ref,
                fragments: Vec::new(),
            });
        }

        if tur.mode == AlignmentMode::LinkedPassages
            && let Some(sliced) = self
                .try_paragraph_slicing(request, alignment, paragraph, &chapter_ref)
                .await
        {
            return Ok(sliced);
        }

        let fragments = self.fetch_ref_list(&tur.refs).await;
        Ok(CorpusSource {
            corpus: CorpusId::Tur,
            canonical_ref: tur.refs[0].clone(),
            fragments,
        })
    }

    /// The compendium only participates through its link graph; a
    /// similarity-mode alignment yields an empty source.
    async fn fetch_beit_yosef_source(
        &self,
        request: &GuideRequest,
        alignment: &AlignmentRecord,
    ) -> anyhow::Result<CorpusSource> {
        let paragraph = request
            .paragraph
            .ok_or(GuideFailure::MissingIdentifiers)?;
        let chapter_ref = build_ref(
            CorpusId::BeitYosef,
            request.section,
            &request.chapter.to_string(),
            None,
        )?;

        let aligned = alignment
            .paragraph_map
            .get(&paragraph.to_string())
            .map(|pa| &pa.beit_yosef);
        let Some(SourceAlignment {
            refs,
            mode: AlignmentMode::LinkedPassages,
            ..
        }) = aligned
        else {
            return Ok(CorpusSource {
                corpus: CorpusId::BeitYosef,
                canonical_ref: chapter_ref,
                fragments: Vec::new(),
            });
        };
        if refs.is_empty() {
            return Ok(CorpusSource {
                corpus: CorpusId::BeitYosef,
                canonical_ref: chapter_ref,
                fragments: Vec::new(),
            });
        }

        let fragments = self.fetch_ref_list(refs).await;
        Ok(CorpusSource {
            corpus: CorpusId::BeitYosef,
            canonical_ref: refs[0].clone(),
            fragments,
        })
    }

    /// Slice the paragraph's span out of a monolithic predecessor
    /// chapter, bounded by the opening words of the compendium passages
    /// linked to this paragraph and the next one.
    async fn try_paragraph_slicing(
        &self,
        request: &GuideRequest,
        alignment: &AlignmentRecord,
        paragraph: u32,
        chapter_ref: &str,
    ) -> Option<CorpusSource> {
        let chapter = self.provider.fetch_fragments(chapter_ref).await.ok()?;
        // Slicing only applies when the upstream returns the chapter as
        // one monolithic leaf.
        if chapter.fragments.len() != 1 {
            return None;
        }
        let monolith = &chapter.fragments[0];

        let boundary_current = self
            .boundary_text(alignment, paragraph)
            .await?;
        let boundary_next = self.boundary_text(alignment, paragraph + 1).await;

        let segment = slice_between_markers(
            &monolith.text,
            &boundary_current,
            boundary_next.as_deref(),
        )?;

        tracing::debug!(
            target: "guide",
            paragraph,
            len = segment.len(),
            "paragraph slicing selected a span from the monolithic chapter"
        );
        Some(CorpusSource {
            corpus: CorpusId::Tur,
            canonical_ref: chapter.provider_ref,
            fragments: vec![Fragment {
                fragment_ref: monolith.fragment_ref.clone(),
                path: monolith.path.clone(),
                text: segment,
            }],
        })
    }

    /// First linked compendium passage for a paragraph, if any.
    async fn boundary_text(
        &self,
        alignment: &AlignmentRecord,
        paragraph: u32,
    ) -> Option<String> {
        let aligned = alignment.paragraph_map.get(&paragraph.to_string())?;
        if aligned.beit_yosef.mode != AlignmentMode::LinkedPassages {
            return None;
        }
        let first_ref = aligned.beit_yosef.refs.first()?;
        let fetched = self.provider.fetch_fragments(first_ref).await.ok()?;
        let text = fetched
            .fragments
            .iter()
            .map(|f| f.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        (!text.trim().is_empty()).then_some(text)
    }

    async fn fetch_ref_list(&self, refs: &[String]) -> Vec<Fragment> {
        let mut fragments = Vec::new();
        for ref_str in refs {
            match self.provider.fetch_fragments(ref_str).await {
                Ok(fetched) => fragments.extend(fetched.fragments),
                Err(err) => {
                    tracing::warn!(
                        target: "guide",
                        ref_str = ref_str.as_str(),
                        error = %format!("{err:#}"),
                        "aligned ref unavailable; skipping"
                    );
                }
            }
        }
        fragments
    }
}

struct CorpusTaskParams {
    section: Section,
    chapter: u32,
    paragraph: u32,
    preferred_model: String,
    fingerprint: String,
    cancel_scope: String,
    cancellation_check_interval: usize,
}

/// Sequential chunk loop for one corpus: N-1 context threading, a
/// cancellation poll every few chunks, and a progress tick per chunk.
async fn run_corpus(
    explainer: Arc<Explainer>,
    store: Arc<dyn GuideStore>,
    source: CorpusSource,
    chunks: Vec<Chunk>,
    companion_text: Option<String>,
    params: CorpusTaskParams,
) -> anyhow::Result<CorpusRun> {
    let mut previous: Option<PreviousSegment> = None;
    let mut out = Vec::with_capacity(chunks.len());

    for (idx, chunk) in chunks.iter().enumerate() {
        if idx % params.cancellation_check_interval == 0
            && store
                .is_cancelled(&params.cancel_scope)
                .await
                .context("poll cancellation flag")?
        {
            tracing::info!(
                target: "guide",
                corpus = source.corpus.key(),
                done = idx,
                "cancellation requested; stopping corpus"
            );
            return Ok(CorpusRun {
                corpus: source.corpus,
                chunks: out,
                cancelled: true,
            });
        }

        let ordinal = idx + 1;
        let outcome = explainer
            .explain(&ExplainRequest {
                key: ExplanationKey {
                    section: params.section,
                    chapter: params.chapter,
                    paragraph: params.paragraph,
                    corpus: source.corpus,
                    ordinal,
                },
                ref_canonical: source.canonical_ref.clone(),
                current_text: chunk.text.clone(),
                previous: previous.clone(),
                companion_text: companion_text.clone(),
                content_hash: chunk.content_hash.clone(),
                preferred_model: params.preferred_model.clone(),
            })
            .await
            .with_context(|| format!("explain {} chunk {ordinal}", source.corpus.key()))?;

        if let Err(err) = store.incr_progress(&params.cancel_scope, 1).await {
            tracing::warn!(target: "guide", error = %format!("{err:#}"), "progress update failed");
        }
        if let Err(err) = store.touch_guide_processing(&params.fingerprint).await {
            tracing::warn!(target: "cache", error = %format!("{err:#}"), "processing heartbeat failed");
        }

        previous = Some(PreviousSegment {
            text: chunk.text.clone(),
            explanation: outcome.explanation.clone(),
        });
        out.push(GuideChunkRecord {
            chunk_id: chunk.id.clone(),
            corpus: source.corpus,
            ordinal,
            source_text: chunk.text.clone(),
            explanation_text: outcome.explanation,
            model_name: outcome.model_used,
            validated: outcome.validated,
            cache_hit: outcome.cache_hit,
            duration_ms: outcome.duration_ms,
        });
    }

    Ok(CorpusRun {
        corpus: source.corpus,
        chunks: out,
        cancelled: false,
    })
}

/// First occurrence of the boundary's opening Hebrew words marks the
/// start; the next paragraph's marker (searched after the start) marks
/// the end. Earlier duplicate occurrences win.
fn slice_between_markers(
    text: &str,
    boundary_current: &str,
    boundary_next: Option<&str>,
) -> Option<String> {
    let marker = opening_hebrew_words(boundary_current, 4)?;
    let start = text.find(&marker)?;

    let end = boundary_next
        .and_then(|next| opening_hebrew_words(next, 4))
        .and_then(|next_marker| {
            text[start + marker.len()..]
                .find(&next_marker)
                .map(|rel| start + marker.len() + rel)
        })
        .unwrap_or(text.len());

    let segment = text[start..end].trim();
    (!segment.is_empty()).then(|| segment.to_owned())
}

fn opening_hebrew_words(text: &str, count: usize) -> Option<String> {
    let words = text
        .split_whitespace()
        .filter(|word| word.chars().any(hebrew::is_hebrew_letter))
        .take(count)
        .collect::<Vec<_>>();
    if words.is_empty() {
        return None;
    }
    Some(words.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(corpora: &[CorpusId], paragraph: Option<u32>) -> GuideRequest {
        GuideRequest {
            section: Section::OrachChayim,
            chapter: 24,
            paragraph,
            corpora: corpora.iter().copied().collect(),
        }
    }

    #[test]
    fn fingerprint_is_stable_and_order_insensitive() {
        let a = request(&[CorpusId::ShulchanArukh, CorpusId::Tur], Some(1));
        let b = request(&[CorpusId::Tur, CorpusId::ShulchanArukh], Some(1));
        assert_eq!(request_fingerprint(&a), request_fingerprint(&b));
    }

    #[test]
    fn fingerprint_varies_with_request_fields() {
        let base = request(&[CorpusId::ShulchanArukh], Some(1));
        let other_paragraph = request(&[CorpusId::ShulchanArukh], Some(2));
        let no_paragraph = request(&[CorpusId::ShulchanArukh], None);
        let more_corpora = request(&[CorpusId::ShulchanArukh, CorpusId::Tur], Some(1));

        let fp = request_fingerprint(&base);
        assert_ne!(fp, request_fingerprint(&other_paragraph));
        assert_ne!(fp, request_fingerprint(&no_paragraph));
        assert_ne!(fp, request_fingerprint(&more_corpora));
    }

    #[test]
    fn hebrew_messages_cover_known_failures() {
        let err = anyhow::Error::new(GuideFailure::NoCorpusContent);
        assert!(hebrew_message(&err).contains("לא נמצא תוכן"));

        let err = anyhow::Error::new(GuideFailure::NoSourceSelected);
        assert!(hebrew_message(&err).contains("לא נבחר"));

        let err = anyhow::anyhow!("internal failure detail");
        let message = hebrew_message(&err);
        assert!(!message.contains("internal"), "{message}");
    }

    #[test]
    fn slice_between_markers_uses_consecutive_boundaries() {
        let chapter = "הלכות ציצית גדול עטיפתו כך הוא ומברך להתעטף \
ואחר כך דין הטלית קטן ושיעורו כמה";
        let current = "עטיפתו כך הוא ומברך כתב הבית יוסף";
        let next = "דין הטלית קטן ושיעורו";

        let segment = slice_between_markers(chapter, current, Some(next)).unwrap();
        assert!(segment.starts_with("עטיפתו כך הוא ומברך"));
        assert!(!segment.contains("הטלית קטן"));
    }

    #[test]
    fn slice_without_next_boundary_runs_to_end() {
        let chapter = "תחילת הסימן עטיפת הטלית ומברך עליה וסוף הסימן";
        let current = "עטיפת הטלית ומברך עליה";
        let segment = slice_between_markers(chapter, current, None).unwrap();
        assert!(segment.ends_with("וסוף הסימן"));
    }

    #[test]
    fn slice_with_unmatched_marker_returns_none() {
        assert!(slice_between_markers("טקסט כלשהו", "מילים שאינן שם", None).is_none());
    }

    #[test]
    fn opening_hebrew_words_skip_non_hebrew_tokens() {
        let words = opening_hebrew_words("12 34 כתב הטור עטיפתו כך הוא", 4).unwrap();
        assert_eq!(words, "כתב הטור עטיפתו כך");
        assert!(opening_hebrew_words("only latin words", 4).is_none());
    }
}
