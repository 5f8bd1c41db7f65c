//! Domain-aware run scheduler.
//!
//! New candidates are grouped by host. Hosts are processed concurrently, up
//! to `max_concurrent_domains` at a time, while the URLs of one host are
//! fetched strictly one after another with a politeness delay between them.
//! Every successful archive is recorded in the registry before the worker
//! moves on, so an interrupted run keeps everything it finished.

use crate::archive::ArchiveStore;
use crate::config::{ScraperConfig, SiteSettings};
use crate::domains::partition;
use crate::fetch::{Fetcher, fetch_with_retries};
use crate::models::{DomainGroup, RegistryEntry, RunReport, UrlCandidate};
use crate::registry::Registry;
use futures::stream::{self, StreamExt};
use rand::{Rng, rng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// Pause between consecutive URLs of one domain.
pub fn politeness_delay(settings: &SiteSettings) -> Duration {
    let max_jitter = settings.delay_jitter.as_millis() as u64;
    let jitter_ms: u64 = rng().random_range(0..=max_jitter);
    settings.delay + Duration::from_millis(jitter_ms)
}

pub struct Scheduler<'a, F: Fetcher> {
    fetcher: &'a F,
    config: &'a ScraperConfig,
    store: &'a ArchiveStore,
    registry: Mutex<Registry>,
    progress: AtomicUsize,
}

impl<'a, F: Fetcher> Scheduler<'a, F> {
    pub fn new(
        fetcher: &'a F,
        config: &'a ScraperConfig,
        store: &'a ArchiveStore,
        registry: Registry,
    ) -> Self {
        Self {
            fetcher,
            config,
            store,
            registry: Mutex::new(registry),
            progress: AtomicUsize::new(0),
        }
    }

    /// Hand the registry back, including everything recorded during runs.
    pub fn into_registry(self) -> Registry {
        self.registry.into_inner()
    }

    /// The work a run would do: unseen candidates grouped by domain.
    /// Touches neither the network nor the filesystem.
    pub async fn plan(&self, candidates: Vec<UrlCandidate>) -> Vec<DomainGroup> {
        let fresh = self.registry.lock().await.filter_new(candidates);
        partition(fresh)
    }

    /// Fetch and archive every unseen candidate.
    ///
    /// Candidates already in the registry (or repeated in the batch) are
    /// dropped, the rest are grouped by domain, and up to
    /// `max_concurrent_domains` domains are worked at once. A failed URL
    /// never stops the rest of its domain.
    ///
    /// # Arguments
    ///
    /// * `candidates` - Extracted candidates in document order
    ///
    /// # Returns
    ///
    /// A [`RunReport`] with success and failure counts plus the failed URLs,
    /// which stay out of the registry so a later run retries them.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let scheduler = Scheduler::new(&fetcher, &config, &store, registry);
    /// let report = scheduler.run(candidates).await;
    /// println!("{} archived, {} failed", report.success_count, report.fail_count);
    /// ```
    #[instrument(level = "info", skip_all, fields(candidates = candidates.len()))]
    pub async fn run(&self, candidates: Vec<UrlCandidate>) -> RunReport {
        let t0 = Instant::now();
        let groups = self.plan(candidates).await;
        let total: usize = groups.iter().map(|g| g.candidates.len()).sum();
        if total == 0 {
            info!("No new URLs to archive");
            return RunReport::default();
        }

        let workers = self.config.max_concurrent_domains.max(1);
        info!(
            urls = total,
            domains = groups.len(),
            workers,
            "Starting archive run"
        );
        self.progress.store(0, Ordering::Relaxed);

        let reports: Vec<RunReport> = stream::iter(groups)
            .map(|group| self.process_domain(group, total))
            .buffer_unordered(workers)
            .collect()
            .await;

        let report = reports.into_iter().fold(RunReport::default(), |mut acc, r| {
            acc.merge(r);
            acc
        });
        info!(
            success = report.success_count,
            failed = report.fail_count,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Archive run complete"
        );
        report
    }

    #[instrument(level = "debug", skip_all, fields(domain = %group.domain, urls = group.candidates.len()))]
    async fn process_domain(&self, group: DomainGroup, total: usize) -> RunReport {
        let settings = self.config.site_settings(&group.domain);
        let mut report = RunReport::default();

        for (i, candidate) in group.candidates.iter().enumerate() {
            if i > 0 {
                let delay = politeness_delay(&settings);
                debug!(?delay, "Politeness delay");
                sleep(delay).await;
            }

            let n = self.progress.fetch_add(1, Ordering::Relaxed) + 1;
            let pct = n as f64 / total as f64 * 100.0;
            info!(
                "[{n}/{total}] ({pct:.1}%) {}: {}",
                group.domain, candidate.title
            );

            if self.archive_one(candidate, &settings).await {
                report.success_count += 1;
            } else {
                report.fail_count += 1;
                report.failed_urls.push(candidate.url.clone());
            }
        }

        report
    }

    /// Fetch, save and record one candidate. Returns whether it was archived.
    async fn archive_one(&self, candidate: &UrlCandidate, settings: &SiteSettings) -> bool {
        let page = match fetch_with_retries(self.fetcher, &candidate.url, settings).await {
            Ok(page) => page,
            Err(failure) => {
                warn!(url = %candidate.url, error = %failure, "Giving up on URL");
                return false;
            }
        };

        let saved = match self.store.save(candidate, &page.content).await {
            Ok(saved) => saved,
            Err(e) => {
                error!(url = %candidate.url, error = %e, "Failed to write archive");
                return false;
            }
        };
        info!(
            url = %candidate.url,
            dir = %saved.dir.display(),
            bytes = page.content.len(),
            strategy = %page.strategy,
            attempts = page.attempts,
            created = saved.created,
            "Archived"
        );

        // On persist failure the entry stays in memory and goes out with the
        // next successful write.
        let entry = RegistryEntry::from_metadata(&saved.metadata);
        if let Err(e) = self.registry.lock().await.record(entry).await {
            error!(url = %candidate.url, error = %e, "Failed to persist registry");
        }
        true
    }
}
