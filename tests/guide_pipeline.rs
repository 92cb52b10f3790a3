mod provider_stub;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use mekorot::alignment::AlignmentEngine;
use mekorot::config::{ModelConfig, PipelineConfig, TimeoutConfig};
use mekorot::corpus::{CorpusId, Section};
use mekorot::explain::{ExplainRequest, Explainer, PROMPT_VERSION};
use mekorot::guide::{GuideOrchestrator, GuideRequest, request_fingerprint};
use mekorot::hash;
use mekorot::llm::{HttpLlmClient, LlmClient};
use mekorot::provider::TextProvider;
use mekorot::store::{
    ALIGNMENT_SCHEMA_VERSION, AlignmentMode, AlignmentRecord, AlignmentStatus, ExplanationKey,
    GuideStatus, GuideStore, MemoryStore, ParagraphAlignment, SourceAlignment, alignment_key,
};

use provider_stub::{LlmBehavior, LlmStub, ProviderStub};

const SA_PARAGRAPH: &str = "יש ללבוש טלית קטן כל היום ולברך עליו בבוקר קודם התפילה";
const TUR_PART_ONE: &str = "כתב הטור שחובה להתעטף בציצית בכל בוקר ולברך עליה";
const TUR_PART_TWO: &str = "ועוד כתב שהמהלך בשוק צריך שיהיה לבוש בטלית קטן";
const BY_PASSAGE: &str = "והבית יוסף הביא את מקור הדין מדברי הרמבם והראש";

const VALID_OUTPUT: &str = "- **המחבר** פוסק שחובה להתעטף בציצית ולברך עליה בכל בוקר.\n\
- למעשה מברכים להתעטף בציצית קודם התפילה.";

fn models() -> ModelConfig {
    ModelConfig {
        primary: "pro".to_owned(),
        cost: "flash".to_owned(),
        fallback: "lite".to_owned(),
        use_batch: false,
        batch_threshold: 5,
    }
}

fn fast_timeouts() -> TimeoutConfig {
    let mut timeouts = TimeoutConfig::default();
    timeouts.explanation_call = Duration::from_secs(10);
    timeouts.summary_call = Duration::from_secs(10);
    timeouts.explanation_repair = Duration::from_secs(10);
    timeouts.summary_repair = Duration::from_secs(10);
    timeouts.alignment_poll = Duration::from_millis(50);
    timeouts.alignment_wait = Duration::from_secs(5);
    timeouts.canonical_poll = Duration::from_millis(100);
    timeouts
}

fn orchestrator(
    store: Arc<dyn GuideStore>,
    llm: Arc<dyn LlmClient>,
    provider_url: &str,
) -> GuideOrchestrator {
    GuideOrchestrator::new(
        store,
        llm,
        TextProvider::new(provider_url).expect("build provider"),
        models(),
        PipelineConfig::default(),
        fast_timeouts(),
    )
}

fn ready_alignment() -> AlignmentRecord {
    let raw_for = |parts: &[&str]| parts.join("\n");
    let now = Utc::now();

    let mut source_hash = BTreeMap::new();
    source_hash.insert(
        CorpusId::ShulchanArukh,
        hash::content_hash(&raw_for(&[SA_PARAGRAPH])),
    );
    source_hash.insert(
        CorpusId::Tur,
        hash::content_hash(&raw_for(&[TUR_PART_ONE, TUR_PART_TWO])),
    );
    source_hash.insert(
        CorpusId::BeitYosef,
        hash::content_hash(&raw_for(&[BY_PASSAGE])),
    );

    let mut paragraph_map = BTreeMap::new();
    paragraph_map.insert(
        "1".to_owned(),
        ParagraphAlignment {
            tur: SourceAlignment {
                refs: vec!["Tur, Orach Chayim 24".to_owned()],
                mode: AlignmentMode::LinkedPassages,
                score: 1.0,
            },
            beit_yosef: SourceAlignment {
                refs: vec!["Beit Yosef, Orach Chayim 24".to_owned()],
                mode: AlignmentMode::LinkedPassages,
                score: 1.0,
            },
            confidence: 1.0,
        },
    );

    AlignmentRecord {
        status: AlignmentStatus::Ready,
        version: ALIGNMENT_SCHEMA_VERSION,
        lock_expires_at: None,
        source_hash,
        paragraph_map,
        source_checked_at: now,
        created_at: now,
        updated_at: now,
        error: None,
    }
}

fn seed_chapter_texts(provider: &ProviderStub) {
    provider.set_text("Shulchan Arukh, Orach Chayim 24:1", json!(SA_PARAGRAPH));
    provider.set_text(
        "Tur, Orach Chayim 24",
        json!([TUR_PART_ONE, TUR_PART_TWO]),
    );
    provider.set_text("Beit Yosef, Orach Chayim 24", json!([BY_PASSAGE]));
}

fn request(corpora: &[CorpusId]) -> GuideRequest {
    GuideRequest {
        section: Section::OrachChayim,
        chapter: 24,
        paragraph: Some(1),
        corpora: corpora.iter().copied().collect::<BTreeSet<_>>(),
    }
}

// Scenario: a pre-seeded ready alignment serves the secondary refs with
// no rebuild, and the LLM is called once per chunk plus once for the
// summary.
#[tokio::test]
async fn cached_chapter_alignment_drives_fetches() {
    let provider = ProviderStub::spawn();
    let llm_stub = LlmStub::spawn();
    seed_chapter_texts(&provider);
    llm_stub.set_default_response(VALID_OUTPUT);

    let store: Arc<dyn GuideStore> = Arc::new(MemoryStore::new());
    store
        .put_alignment(&alignment_key(Section::OrachChayim, 24), &ready_alignment())
        .await
        .unwrap();

    let llm: Arc<dyn LlmClient> =
        Arc::new(HttpLlmClient::new(&llm_stub.base_url, None).unwrap());
    let orchestrator = orchestrator(Arc::clone(&store), llm, &provider.base_url);

    let request = request(&[CorpusId::ShulchanArukh, CorpusId::Tur, CorpusId::BeitYosef]);
    let outcome = orchestrator.generate(&request, "test-scope").await;

    assert!(outcome.success, "error: {:?}", outcome.error);
    let guide = outcome.guide.unwrap();
    assert_eq!(guide.record.status, GuideStatus::Ready);
    // 1 primary + 2 predecessor + 1 compendium chunks.
    assert_eq!(guide.record.chunk_count, 4);
    assert!(guide.record.summary_text.is_some());

    // chunks + 1 summary call, nothing else.
    assert_eq!(llm_stub.calls().len(), 5);

    // The ready record was fresh: no link queries, no rebuild.
    assert!(
        provider
            .requests()
            .iter()
            .all(|path| !path.starts_with("/links/")),
        "unexpected link queries: {:?}",
        provider.requests()
    );

    let progress = store.get_progress("test-scope").await.unwrap();
    assert_eq!(progress, Some((4, 4)));
}

// Scenario: source hashes no longer match after the revalidation window
// elapses, so the chapter is rebuilt and the record is fresh.
#[tokio::test]
async fn stale_source_hash_forces_rebuild() {
    let provider = ProviderStub::spawn();
    provider.set_text(
        "Shulchan Arukh, Orach Chayim 24",
        json!([SA_PARAGRAPH, "סעיף שני העוסק בדין אחר של ציצית ותכלת"]),
    );
    provider.set_text(
        "Tur, Orach Chayim 24",
        json!([TUR_PART_ONE, TUR_PART_TWO]),
    );
    provider.set_text("Beit Yosef, Orach Chayim 24", json!([BY_PASSAGE]));
    provider.set_links(
        "Shulchan Arukh, Orach Chayim 24:1",
        json!([{ "refs": ["Tur, Orach Chayim 24:1"], "anchorRef": "Beit Yosef, Orach Chayim 24:1" }]),
    );

    let store: Arc<dyn GuideStore> = Arc::new(MemoryStore::new());
    let key = alignment_key(Section::OrachChayim, 24);

    let thirteen_hours_ago = Utc::now() - chrono::Duration::hours(13);
    let mut seeded = ready_alignment();
    seeded.source_checked_at = thirteen_hours_ago;
    seeded.updated_at = thirteen_hours_ago;
    seeded
        .source_hash
        .insert(CorpusId::Tur, "stale-hash".to_owned());
    store.put_alignment(&key, &seeded).await.unwrap();

    let engine = AlignmentEngine::new(
        Arc::clone(&store),
        TextProvider::new(&provider.base_url).unwrap(),
        fast_timeouts(),
    );

    let rebuilt = engine
        .chapter_alignment(Section::OrachChayim, 24)
        .await
        .unwrap();

    assert_eq!(rebuilt.status, AlignmentStatus::Ready);
    assert!(rebuilt.updated_at > seeded.updated_at);
    assert_eq!(rebuilt.paragraph_map.len(), 2);

    let first = rebuilt.paragraph_map.get("1").unwrap();
    assert_eq!(first.tur.mode, AlignmentMode::LinkedPassages);
    assert_eq!(first.tur.refs, vec!["Tur, Orach Chayim 24:1".to_owned()]);
    assert_eq!(first.beit_yosef.mode, AlignmentMode::LinkedPassages);

    // Paragraph 2 has no links and falls back to similarity or none.
    let second = rebuilt.paragraph_map.get("2").unwrap();
    assert_ne!(second.tur.mode, AlignmentMode::LinkedPassages);

    let stored = store.get_alignment(&key).await.unwrap().unwrap();
    assert_eq!(stored.status, AlignmentStatus::Ready);
    assert_ne!(
        stored.source_hash.get(&CorpusId::Tur).map(String::as_str),
        Some("stale-hash")
    );
}

// The provider client flattens nested arrays with descent paths and
// reads the chapter count off the index schema.
#[tokio::test]
async fn provider_flattening_and_chapter_count() {
    let stub = ProviderStub::spawn();
    stub.set_text(
        "Tur, Orach Chayim 24",
        json!([[TUR_PART_ONE, ""], TUR_PART_TWO]),
    );
    stub.set_chapter_count("Tur, Orach Chayim", 697);

    let provider = TextProvider::new(&stub.base_url).unwrap();

    let fetched = provider
        .fetch_fragments("Tur, Orach Chayim 24")
        .await
        .unwrap();
    assert_eq!(fetched.provider_ref, "Tur, Orach Chayim 24");
    // The empty leaf is dropped after cleanup.
    assert_eq!(fetched.fragments.len(), 2);
    assert_eq!(fetched.fragments[0].path, vec![0, 0]);
    assert_eq!(
        fetched.fragments[0].fragment_ref,
        "Tur, Orach Chayim 24:1:1"
    );
    assert_eq!(fetched.fragments[1].path, vec![1]);

    let count = provider
        .fetch_chapter_count(CorpusId::Tur, Section::OrachChayim)
        .await
        .unwrap();
    assert_eq!(count, 697);

    // Unknown refs surface as errors for the caller to map.
    assert!(provider.fetch_fragments("Tur, Orach Chayim 999").await.is_err());
}

// Property: concurrent callers for the same chapter share one build;
// the store sees a single building→ready transition and everyone gets
// the same paragraph map.
#[tokio::test]
async fn alignment_single_flight_in_process() {
    let provider = ProviderStub::spawn();
    provider.set_text(
        "Shulchan Arukh, Orach Chayim 24",
        json!([SA_PARAGRAPH]),
    );
    provider.set_text(
        "Tur, Orach Chayim 24",
        json!([TUR_PART_ONE, TUR_PART_TWO]),
    );
    provider.set_text("Beit Yosef, Orach Chayim 24", json!([BY_PASSAGE]));
    provider.set_links(
        "Shulchan Arukh, Orach Chayim 24:1",
        json!([{ "refs": ["Tur, Orach Chayim 24:1"] }]),
    );

    let store: Arc<dyn GuideStore> = Arc::new(MemoryStore::new());
    let engine = Arc::new(AlignmentEngine::new(
        Arc::clone(&store),
        TextProvider::new(&provider.base_url).unwrap(),
        fast_timeouts(),
    ));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine.chapter_alignment(Section::OrachChayim, 24).await
        }));
    }

    let mut records = Vec::new();
    for handle in handles {
        records.push(handle.await.unwrap().unwrap());
    }

    let reference = serde_json::to_string(&records[0].paragraph_map).unwrap();
    for record in &records {
        assert_eq!(
            serde_json::to_string(&record.paragraph_map).unwrap(),
            reference
        );
    }

    // The three-corpus chapter fetch ran exactly once.
    let primary_fetches = provider
        .requests()
        .iter()
        .filter(|path| path.as_str() == "/v3/texts/Shulchan Arukh, Orach Chayim 24")
        .count();
    assert_eq!(primary_fetches, 1);
}

// Scenario: the primary model 404s, the cost model answers, and the
// second identical call is served from the archive.
#[tokio::test]
async fn model_cascade_over_http_then_cache_hit() {
    let llm_stub = LlmStub::spawn();
    llm_stub.script(
        "pro",
        vec![LlmBehavior::Status(404, "model pro not found".to_owned())],
    );
    llm_stub.script(
        "flash",
        vec![LlmBehavior::Respond(VALID_OUTPUT.to_owned())],
    );

    let store: Arc<dyn GuideStore> = Arc::new(MemoryStore::new());
    let llm: Arc<dyn LlmClient> =
        Arc::new(HttpLlmClient::new(&llm_stub.base_url, None).unwrap());
    let explainer = Explainer::new(
        Arc::clone(&store),
        llm,
        models(),
        fast_timeouts(),
        PipelineConfig::default().hebrew_ratio_threshold,
    );

    let request = ExplainRequest {
        key: ExplanationKey {
            section: Section::OrachChayim,
            chapter: 24,
            paragraph: 1,
            corpus: CorpusId::ShulchanArukh,
            ordinal: 1,
        },
        ref_canonical: "Shulchan Arukh, Orach Chayim 24:1".to_owned(),
        current_text: SA_PARAGRAPH.to_owned(),
        previous: None,
        companion_text: None,
        content_hash: hash::content_hash(SA_PARAGRAPH),
        preferred_model: "pro".to_owned(),
    };

    let first = explainer.explain(&request).await.unwrap();
    assert_eq!(first.model_used, "flash");
    assert!(!first.cache_hit);
    assert_eq!(first.prompt_version, PROMPT_VERSION);

    let second = explainer.explain(&request).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.model_used, "flash");

    // pro 404 + flash success; the cache hit added nothing.
    assert_eq!(llm_stub.calls().len(), 2);
}

/// Returns valid Hebrew but flips the external cancellation flag on its
/// first call, like a client cancelling mid-run.
struct CancellingLlm {
    store: Arc<dyn GuideStore>,
    scope: String,
    calls: AtomicUsize,
}

#[async_trait]
impl LlmClient for CancellingLlm {
    async fn generate(&self, _model: &str, _prompt: &str) -> anyhow::Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            self.store.set_cancelled(&self.scope, true).await?;
        }
        Ok(VALID_OUTPUT.to_owned())
    }
}

// Scenario: cancellation mid-pipeline stops the corpus within the check
// interval and marks the canonical record failed with "cancelled".
#[tokio::test]
async fn cancellation_mid_pipeline_returns_cancelled() {
    let provider = ProviderStub::spawn();

    // Four ~150-word sentences make four chunks under the explanation
    // profile, so the idx-3 cancellation check fires mid-corpus.
    let long_words = |tag: usize| {
        (0..150)
            .map(|i| format!("מלה{tag}{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    };
    let long_text = (0..4)
        .map(|s| format!("{}.", long_words(s)))
        .collect::<Vec<_>>()
        .join(" ");
    provider.set_text("Shulchan Arukh, Orach Chayim 24:1", json!(long_text));

    let store: Arc<dyn GuideStore> = Arc::new(MemoryStore::new());
    let scope = "cancel-scope".to_owned();
    let llm: Arc<dyn LlmClient> = Arc::new(CancellingLlm {
        store: Arc::clone(&store),
        scope: scope.clone(),
        calls: AtomicUsize::new(0),
    });

    let orchestrator = orchestrator(Arc::clone(&store), llm, &provider.base_url);
    let request = request(&[CorpusId::ShulchanArukh]);
    let fingerprint = request_fingerprint(&request);

    let outcome = orchestrator.generate(&request, &scope).await;
    assert!(!outcome.success);
    assert!(outcome.cancelled);
    assert!(outcome.guide.is_none());

    let (record, chunks) = store.get_guide(&fingerprint).await.unwrap().unwrap();
    assert_eq!(record.status, GuideStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("cancelled"));
    assert!(chunks.is_empty());
}

/// Valid Hebrew with a small delay, counting calls.
struct SlowCountingLlm {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmClient for SlowCountingLlm {
    async fn generate(&self, _model: &str, _prompt: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(VALID_OUTPUT.to_owned())
    }
}

// Scenario: two callers race the same fingerprint; one does the work,
// the other polls to the same bytes.
#[tokio::test]
async fn single_flight_across_two_callers() {
    let provider = ProviderStub::spawn();
    provider.set_text("Shulchan Arukh, Orach Chayim 24:1", json!(SA_PARAGRAPH));

    let store: Arc<dyn GuideStore> = Arc::new(MemoryStore::new());
    let llm = Arc::new(SlowCountingLlm {
        calls: AtomicUsize::new(0),
    });
    let llm_dyn: Arc<dyn LlmClient> = llm.clone();
    let orchestrator = Arc::new(orchestrator(
        Arc::clone(&store),
        llm_dyn,
        &provider.base_url,
    ));

    let request = request(&[CorpusId::ShulchanArukh]);

    let a = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        let request = request.clone();
        async move { orchestrator.generate(&request, "caller-a").await }
    });
    let b = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        let request = request.clone();
        async move { orchestrator.generate(&request, "caller-b").await }
    });

    let outcome_a = a.await.unwrap();
    let outcome_b = b.await.unwrap();

    assert!(outcome_a.success, "a: {:?}", outcome_a.error);
    assert!(outcome_b.success, "b: {:?}", outcome_b.error);

    let summary_a = outcome_a.guide.unwrap().record.summary_text;
    let summary_b = outcome_b.guide.unwrap().record.summary_text;
    assert_eq!(summary_a, summary_b);

    // One explanation + one summary; the losing caller did no LLM work.
    assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
}

// Scenario: the first summary fails validation and the repair round
// fixes it; the guide still comes out validated.
#[tokio::test]
async fn summary_validation_repair_round_trips() {
    let provider = ProviderStub::spawn();
    let llm_stub = LlmStub::spawn();
    provider.set_text("Shulchan Arukh, Orach Chayim 24:1", json!(SA_PARAGRAPH));
    llm_stub.script(
        "pro",
        vec![
            // Explanation call: valid Hebrew.
            LlmBehavior::Respond(VALID_OUTPUT.to_owned()),
            // Summary call: invalid (English, no bullets).
            LlmBehavior::Respond("An English summary without bullets".to_owned()),
            // Repair call: valid.
            LlmBehavior::Respond(VALID_OUTPUT.to_owned()),
        ],
    );

    let store: Arc<dyn GuideStore> = Arc::new(MemoryStore::new());
    let llm: Arc<dyn LlmClient> =
        Arc::new(HttpLlmClient::new(&llm_stub.base_url, None).unwrap());
    let orchestrator = orchestrator(Arc::clone(&store), llm, &provider.base_url);

    let request = request(&[CorpusId::ShulchanArukh]);
    let outcome = orchestrator.generate(&request, "repair-scope").await;

    assert!(outcome.success, "error: {:?}", outcome.error);
    let guide = outcome.guide.unwrap();
    assert!(guide.record.validated);
    assert_eq!(
        guide.record.summary_text.as_deref(),
        Some(VALID_OUTPUT)
    );
    assert_eq!(llm_stub.calls().len(), 3);
}

// Later commentary is companion context for the primary, never its own
// explanation corpus.
#[tokio::test]
async fn later_commentary_is_companion_only() {
    let provider = ProviderStub::spawn();
    let llm_stub = LlmStub::spawn();
    provider.set_text("Shulchan Arukh, Orach Chayim 24:1", json!(SA_PARAGRAPH));
    provider.set_text(
        "Mishnah Berurah 24:1",
        json!(["המשנה ברורה מבאר שדין זה נוהג גם בזמן הזה"]),
    );
    llm_stub.set_default_response(VALID_OUTPUT);

    let store: Arc<dyn GuideStore> = Arc::new(MemoryStore::new());
    let llm: Arc<dyn LlmClient> =
        Arc::new(HttpLlmClient::new(&llm_stub.base_url, None).unwrap());
    let orchestrator = orchestrator(Arc::clone(&store), llm, &provider.base_url);

    let request = request(&[CorpusId::ShulchanArukh, CorpusId::MishnahBerurah]);
    let outcome = orchestrator.generate(&request, "companion-scope").await;

    assert!(outcome.success, "error: {:?}", outcome.error);
    let guide = outcome.guide.unwrap();
    // Only the primary produced chunks.
    assert_eq!(guide.record.chunk_count, 1);
    assert!(
        guide
            .chunks
            .iter()
            .all(|chunk| chunk.corpus == CorpusId::ShulchanArukh)
    );

    // The explanation prompt carried the companion text.
    let calls = llm_stub.calls();
    assert_eq!(calls.len(), 2);
    let (_, explanation_prompt) = &calls[0];
    assert!(explanation_prompt.contains("המשנה ברורה מבאר"));
}
