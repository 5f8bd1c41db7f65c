//! # Article Archiver
//!
//! Keeps local copies of news articles linked from a tree of source READMEs,
//! so the links keep working after the publishers take them down.
//!
//! ## Usage
//!
//! ```sh
//! article_archiver --root ./site --dry-run -v
//! article_archiver --root ./site --source BBC --limit 50
//! ```
//!
//! ## Architecture
//!
//! 1. **Discovery**: find `content/news/<Source>/README*.md` and extract article links
//! 2. **Filtering**: drop URLs already in the registry, then apply `--limit`
//! 3. **Fetching**: one worker per domain (bounded), URLs within a domain in sequence,
//!    each URL escalating through fetch strategies with exponential backoff
//! 4. **Archiving**: `archive/<slug>/index.html` plus `metadata.json`, recorded in the
//!    registry immediately
//! 5. **Annotation**: add `Original` / `Archive` buttons next to each archived link

use clap::Parser;
use itertools::Itertools;
use std::error::Error;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod annotate;
mod archive;
mod cli;
mod config;
mod domains;
mod fetch;
mod models;
mod registry;
mod scheduler;
mod sources;
mod utils;

use archive::ArchiveStore;
use cli::Cli;
use config::ScraperConfig;
use fetch::{BrowserFetcher, HttpFetcher, PageFetcher};
use models::DomainGroup;
use registry::Registry;
use scheduler::Scheduler;
use sources::{collect_candidates, discover_sources, extract_candidates};
use utils::{ensure_writable_dir, truncate_for_log};

const DRY_RUN_SAMPLE_TITLES: usize = 3;

#[tokio::main(flavor = "current_thread")]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    let args = Cli::parse();
    debug!(?args, "Parsed CLI arguments");

    let news_dir = args.news_dir();
    let store = ArchiveStore::new(&args.root, &news_dir);
    let sources = discover_sources(&news_dir).await;
    let registry = Registry::load(args.registry_path()).await;
    debug!(
        path = %registry.path().display(),
        entries = registry.len(),
        last_updated = registry.last_updated().unwrap_or("never"),
        "Registry ready"
    );

    if args.list_sources {
        return list_sources(&sources, &args, &registry).await;
    }

    if args.update_markdown_only {
        let stats = annotate::annotate(&registry, &store, args.source.as_deref()).await;
        println!(
            "Updated {} links in {} files ({} skipped)",
            stats.updated_links, stats.updated_files, stats.skipped
        );
        return Ok(());
    }

    let config = ScraperConfig::load(&args.config_path())?;

    let candidates = collect_candidates(&sources, &args.root, args.source.as_deref()).await?;
    info!(
        sources = sources.len(),
        urls = candidates.len(),
        "Collected candidate URLs"
    );
    let mut fresh = registry.filter_new(candidates);
    info!(new = fresh.len(), "Filtered against registry");
    if let Some(limit) = args.batch_limit() {
        fresh.truncate(limit);
        info!(limit, "Limited batch");
    }

    if args.dry_run {
        print_plan(&domains::partition(fresh), args.verbose);
        return Ok(());
    }

    if fresh.is_empty() {
        info!("No new URLs to archive");
        return Ok(());
    }

    // Early check: the registry directory must be writable before any fetch.
    let registry_dir = args
        .registry_path()
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| args.root.clone());
    if let Err(e) = ensure_writable_dir(&registry_dir).await {
        error!(
            path = %registry_dir.display(),
            error = %e,
            "Registry directory is not writable (fix perms or choose a different path)"
        );
        return Err(e);
    }

    let fetcher = PageFetcher::new(
        HttpFetcher::new(&config.user_agent)?,
        BrowserFetcher::new(&config.user_agent, config.settle()),
    );
    let scheduler = Scheduler::new(&fetcher, &config, &store, registry);
    let report = scheduler.run(fresh).await;
    let registry = scheduler.into_registry();
    fetcher.shutdown().await;

    info!(
        success = report.success_count,
        failed = report.fail_count,
        total = report.total(),
        "Run summary"
    );
    for url in &report.failed_urls {
        warn!(%url, "Failed to archive");
    }

    if !args.no_update_markdown {
        annotate::annotate(&registry, &store, args.source.as_deref()).await;
    }

    info!(
        elapsed_ms = start_time.elapsed().as_millis() as u64,
        "article_archiver finished"
    );
    Ok(())
}

/// Print every source with its URL count and how many are not yet archived.
async fn list_sources(
    sources: &std::collections::BTreeMap<String, std::path::PathBuf>,
    args: &Cli,
    registry: &Registry,
) -> Result<(), Box<dyn Error>> {
    println!("Available news sources:");
    for (name, readme) in sources {
        let candidates = extract_candidates(readme, &args.root, name).await?;
        let new_count = candidates.iter().filter(|c| !registry.contains(&c.url)).count();
        println!("  {name}: {} URLs ({new_count} new)", candidates.len());
    }
    Ok(())
}

/// Dry-run report: domains by descending URL count.
fn print_plan(groups: &[DomainGroup], verbose: bool) {
    println!("\n=== DRY RUN ===\n");
    for group in groups
        .iter()
        .sorted_by(|a, b| b.candidates.len().cmp(&a.candidates.len()))
    {
        println!("{}: {} URLs", group.domain, group.candidates.len());
        if verbose {
            for c in group.candidates.iter().take(DRY_RUN_SAMPLE_TITLES) {
                println!("  - {}", truncate_for_log(&c.title, 50));
            }
            if group.candidates.len() > DRY_RUN_SAMPLE_TITLES {
                println!(
                    "  ... and {} more",
                    group.candidates.len() - DRY_RUN_SAMPLE_TITLES
                );
            }
        }
    }
    let total: usize = groups.iter().map(|g| g.candidates.len()).sum();
    println!(
        "\nWould archive {total} URLs across {} domains",
        groups.len()
    );
}
