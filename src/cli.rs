//! Command-line interface definitions.
//!
//! Paths default to locations under `--root`, so a bare invocation from the
//! project directory archives everything new.

use clap::Parser;
use std::path::PathBuf;

/// Archive news articles linked from source READMEs.
///
/// # Examples
///
/// ```sh
/// # Preview what a run would fetch, grouped by domain
/// article_archiver --dry-run -v
///
/// # Archive up to 20 new URLs from one source
/// article_archiver --source HK01 --limit 20
///
/// # Only refresh the Original/Archive buttons
/// article_archiver --update-markdown-only
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Project root containing `content/news/`
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// YAML config file [default: <root>/config.yml]
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Registry file [default: <root>/scraped_urls.json]
    #[arg(long)]
    pub registry: Option<PathBuf>,

    /// Show what would be fetched without fetching
    #[arg(long)]
    pub dry_run: bool,

    /// Only process one source (case-insensitive, e.g. BBC, HK01)
    #[arg(long)]
    pub source: Option<String>,

    /// Process at most this many new URLs (0 means no limit)
    #[arg(long)]
    pub limit: Option<usize>,

    /// Show sample titles per domain in the dry-run report
    #[arg(short, long)]
    pub verbose: bool,

    /// List sources with their URL counts and exit
    #[arg(long)]
    pub list_sources: bool,

    /// Annotate source READMEs from the registry without fetching
    #[arg(long, conflicts_with = "dry_run")]
    pub update_markdown_only: bool,

    /// Leave source READMEs untouched after a run
    #[arg(long)]
    pub no_update_markdown: bool,
}

impl Cli {
    pub fn news_dir(&self) -> PathBuf {
        self.root.join("content").join("news")
    }

    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.root.join("config.yml"))
    }

    pub fn registry_path(&self) -> PathBuf {
        self.registry
            .clone()
            .unwrap_or_else(|| self.root.join("scraped_urls.json"))
    }

    /// Batch size cap; `--limit 0` is the same as no `--limit`.
    pub fn batch_limit(&self) -> Option<usize> {
        self.limit.filter(|&n| n > 0)
    }
}
