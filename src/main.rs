use std::collections::BTreeSet;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;

use mekorot::cli::{ChaptersArgs, Cli, Command, GenerateArgs, provider_base_url};
use mekorot::config::{ModelConfig, PipelineConfig, StoreConfig, TimeoutConfig};
use mekorot::corpus::{CorpusId, Section, parse_number};
use mekorot::guide::{GuideOrchestrator, GuideRequest, request_fingerprint};
use mekorot::llm::HttpLlmClient;
use mekorot::provider::TextProvider;
use mekorot::store::{GuideStore, LocalFsStore};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    mekorot::logging::init().context("init logging")?;

    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => generate(args).await.context("generate")?,
        Command::Chapters(args) => chapters(args).await.context("chapters")?,
    }

    Ok(())
}

async fn generate(args: GenerateArgs) -> anyhow::Result<()> {
    let section = Section::parse(&args.section).context("parse --section")?;
    let chapter = parse_number(&args.chapter).context("parse --chapter")?;
    let paragraph = args
        .paragraph
        .as_deref()
        .map(parse_number)
        .transpose()
        .context("parse --paragraph")?;

    let mut corpora = BTreeSet::new();
    for name in args.corpora.split(',') {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        corpora.insert(CorpusId::parse(name).context("parse --corpora")?);
    }

    let provider = TextProvider::new(provider_base_url(args.provider_url.as_deref()))
        .context("build text provider")?;
    let llm = Arc::new(HttpLlmClient::from_env().context("build llm client")?);

    // Explicit credentials matter for the hosted document database; the
    // filesystem backend only notes which mode it is running in.
    let store_config = StoreConfig::from_env();
    tracing::debug!(
        target: "cache",
        explicit_credentials = store_config.project_id.is_some(),
        store_dir = args.store_dir.as_str(),
        "store configured"
    );
    let store: Arc<dyn GuideStore> = Arc::new(LocalFsStore::new(&args.store_dir));

    let orchestrator = GuideOrchestrator::new(
        Arc::clone(&store),
        llm,
        provider,
        ModelConfig::from_env(),
        PipelineConfig::from_env(),
        TimeoutConfig::from_env(),
    );

    let request = GuideRequest {
        section,
        chapter,
        paragraph,
        corpora,
    };
    let scope = request_fingerprint(&request);

    let outcome = orchestrator.generate(&request, &scope).await;
    if outcome.cancelled {
        println!("cancelled");
        return Ok(());
    }
    let Some(guide) = outcome.guide else {
        anyhow::bail!(
            "guide generation failed: {}",
            outcome.error.unwrap_or_else(|| "unknown error".to_owned())
        );
    };

    if let Some(out) = &args.out {
        let artifact = serde_json::json!({
            "guide": guide.record,
            "chunks": guide.chunks,
        });
        write_artifact(out, &artifact).with_context(|| format!("write artifact: {out}"))?;
        tracing::info!(target: "guide", out = out.as_str(), "artifact written");
    }

    println!(
        "guide ready: {} {}{} | chunks={} validated={} model={}",
        section.provider_name(),
        chapter,
        paragraph.map(|p| format!(":{p}")).unwrap_or_default(),
        guide.record.chunk_count,
        guide.record.validated,
        guide.record.summary_model.as_deref().unwrap_or("-"),
    );
    if let Some(summary) = &guide.record.summary_text {
        println!("\n{summary}");
    }
    Ok(())
}

async fn chapters(args: ChaptersArgs) -> anyhow::Result<()> {
    let section = Section::parse(&args.section).context("parse --section")?;
    let corpus = CorpusId::parse(&args.corpus).context("parse --corpus")?;
    let provider = TextProvider::new(provider_base_url(args.provider_url.as_deref()))
        .context("build text provider")?;

    let count = provider
        .fetch_chapter_count(corpus, section)
        .await
        .context("fetch chapter count")?;
    println!("{} {}: {count} chapters", corpus.provider_prefix(), section.provider_name());
    Ok(())
}

fn write_artifact(path: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir: {}", parent.display()))?;
    }

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize artifact")?;
    std::fs::write(&tmp_path, &data)
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
