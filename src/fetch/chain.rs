//! Retry loop that escalates through fetch strategies with exponential backoff.
//!
//! The delay before retry `n` (0-based) is:
//! ```text
//! delay = backoff_base * 2^n + random_jitter(0..=backoff_jitter)
//! ```
//! A domain allowing `max_retries = r` makes at most `r + 1` attempts. A
//! [`FailureKind::Download`] failure ends the loop immediately.

use super::{DEFAULT_CHAIN, FailureKind, FetchFailure, FetchStrategy, Fetcher};
use crate::config::SiteSettings;
use crate::utils::truncate_for_log;
use rand::{Rng, rng};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// Content from the attempt that succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub content: String,
    pub strategy: FetchStrategy,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Strategy for attempt number `retry`.
///
/// A pinned site strategy always wins; otherwise the default chain is
/// indexed by `retry` and capped at its last entry.
pub fn strategy_for(retry: u32, settings: &SiteSettings) -> FetchStrategy {
    if let Some(pinned) = &settings.pinned {
        return FetchStrategy::SiteSpecific(pinned.clone());
    }
    let idx = (retry as usize).min(DEFAULT_CHAIN.len() - 1);
    DEFAULT_CHAIN[idx].clone()
}

/// Backoff before the attempt following failed attempt `retry`.
pub fn backoff_delay(retry: u32, settings: &SiteSettings) -> Duration {
    let delay = settings.backoff_base.saturating_mul(1 << retry.min(16));
    let max_jitter = settings.backoff_jitter.as_millis() as u64;
    let jitter_ms: u64 = rng().random_range(0..=max_jitter);
    delay + Duration::from_millis(jitter_ms)
}

/// Fetch `url`, escalating strategies until one yields usable content or the
/// domain's retry budget is spent.
#[instrument(level = "info", skip_all, fields(%url))]
pub async fn fetch_with_retries<F>(
    fetcher: &F,
    url: &str,
    settings: &SiteSettings,
) -> Result<FetchedPage, FetchFailure>
where
    F: Fetcher,
{
    let total_t0 = Instant::now();
    let mut retry = 0u32;

    loop {
        let strategy = strategy_for(retry, settings);
        let attempt_t0 = Instant::now();
        let result = fetcher
            .fetch(url, &strategy, settings.timeout)
            .await
            .and_then(|content| {
                if content.len() < settings.min_content_bytes {
                    Err(FetchFailure::new(
                        FailureKind::ContentTooShort,
                        format!(
                            "{} bytes, need {}",
                            content.len(),
                            settings.min_content_bytes
                        ),
                    ))
                } else {
                    Ok(content)
                }
            });

        let failure = match result {
            Ok(content) => {
                debug!(
                    %strategy,
                    attempts = retry + 1,
                    bytes = content.len(),
                    elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                    "Fetch succeeded"
                );
                return Ok(FetchedPage {
                    content,
                    strategy,
                    attempts: retry + 1,
                });
            }
            Err(failure) => failure,
        };

        if !failure.kind.is_retryable() {
            warn!(%strategy, kind = %failure.kind, "Target triggered a download; skipping");
            return Err(failure);
        }

        if retry >= settings.max_retries {
            warn!(
                %strategy,
                attempts = retry + 1,
                elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                error = %failure,
                "Fetch exhausted retries"
            );
            return Err(failure);
        }

        let delay = backoff_delay(retry, settings);
        warn!(
            %strategy,
            attempt = retry + 1,
            max = settings.max_retries,
            elapsed_ms_attempt = attempt_t0.elapsed().as_millis() as u64,
            ?delay,
            error = %truncate_for_log(&failure.to_string(), 80),
            "Fetch attempt failed; backing off"
        );
        sleep(delay).await;
        retry += 1;
    }
}
