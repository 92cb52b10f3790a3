use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate a study guide for one location.
    Generate(GenerateArgs),
    /// Print the chapter count of a corpus section.
    Chapters(ChaptersArgs),
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Section name, e.g. "Orach Chayim".
    #[arg(long)]
    pub section: String,

    /// Chapter number; decimal or Hebrew numeral (e.g. 24 or כד).
    #[arg(long)]
    pub chapter: String,

    /// Paragraph number; decimal or Hebrew numeral.
    #[arg(long)]
    pub paragraph: Option<String>,

    /// Comma-separated corpora to include.
    #[arg(long, default_value = "shulchan_arukh,tur,beit_yosef,mishnah_berurah")]
    pub corpora: String,

    /// Store directory for cached alignments, explanations, and guides.
    #[arg(long, default_value = ".mekorot")]
    pub store_dir: String,

    /// Write the full guide artifact JSON here.
    #[arg(long)]
    pub out: Option<String>,

    /// Text provider base URL (overrides TEXT_PROVIDER_URL).
    #[arg(long)]
    pub provider_url: Option<String>,
}

#[derive(Debug, Args)]
pub struct ChaptersArgs {
    /// Section name, e.g. "Orach Chayim".
    #[arg(long)]
    pub section: String,

    /// Corpus key, e.g. "tur".
    #[arg(long, default_value = "shulchan_arukh")]
    pub corpus: String,

    /// Text provider base URL (overrides TEXT_PROVIDER_URL).
    #[arg(long)]
    pub provider_url: Option<String>,
}

pub fn provider_base_url(flag: Option<&str>) -> String {
    if let Some(url) = flag {
        return url.to_owned();
    }
    std::env::var("TEXT_PROVIDER_URL").unwrap_or_else(|_| "http://127.0.0.1:8088".to_owned())
}
