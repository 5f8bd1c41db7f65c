//! Page fetching: strategies, failure taxonomy, and the fetcher seam.
//!
//! A fetch is a sequence of attempts, each using one [`FetchStrategy`]. The
//! [`chain`] module picks the strategy for each attempt and applies backoff;
//! implementations of [`Fetcher`] perform a single attempt and report every
//! problem as a [`FetchFailure`] value rather than an error escaping the call.
//!
//! | retry | strategy | behavior |
//! |-------|----------|----------|
//! | 0 | [`FetchStrategy::FastLoad`] | wait for the initial document parse |
//! | 1 | [`FetchStrategy::FullLoad`] | wait for network activity to settle |
//! | 2 | [`FetchStrategy::AltProtocol`] | isolated context, HTTP/2 disabled |
//! | 3+ | [`FetchStrategy::StaticFallback`] | plain HTTP GET, no rendering |
//!
//! Domains with a pinned [`FetchStrategy::SiteSpecific`] strategy skip the
//! table entirely.

pub mod browser;
pub mod chain;
pub mod http;

use crate::config::PinnedStrategy;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use browser::BrowserFetcher;
pub use chain::{fetch_with_retries, FetchedPage};
pub use http::HttpFetcher;

/// One fetch tactic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStrategy {
    FastLoad,
    FullLoad,
    AltProtocol,
    StaticFallback,
    SiteSpecific(PinnedStrategy),
}

/// The default escalation order, indexed by retry count.
pub const DEFAULT_CHAIN: [FetchStrategy; 4] = [
    FetchStrategy::FastLoad,
    FetchStrategy::FullLoad,
    FetchStrategy::AltProtocol,
    FetchStrategy::StaticFallback,
];

impl FetchStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FastLoad => "fast-load",
            Self::FullLoad => "full-load",
            Self::AltProtocol => "alt-protocol",
            Self::StaticFallback => "static-fallback",
            Self::SiteSpecific(_) => "site-specific",
        }
    }
}

impl fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a single attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The attempt exceeded its timeout.
    Timeout,
    /// Connection, DNS, TLS, or read failure.
    Transport,
    /// The server answered, but not with a usable page (e.g. HTTP 4xx/5xx).
    Protocol,
    /// The page was shorter than the domain's minimum; likely an interstitial.
    ContentTooShort,
    /// The page rendered but is a login wall or similar.
    Rejected,
    /// The browser could not be launched or driven.
    Browser,
    /// The target started a file download; there is no page to archive.
    Download,
}

impl FailureKind {
    /// Only download triggers are terminal; everything else escalates.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Download)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::ContentTooShort => "content-too-short",
            Self::Rejected => "rejected",
            Self::Browser => "browser",
            Self::Download => "download",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl FetchFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Performs one attempt against one URL.
///
/// Implementations must release any page or browsing context they open on
/// every path, and must map every fault to a [`FetchFailure`].
pub trait Fetcher {
    async fn fetch(
        &self,
        url: &str,
        strategy: &FetchStrategy,
        timeout: Duration,
    ) -> Result<String, FetchFailure>;
}

/// Routes static fetches to HTTP and every rendering strategy to the browser.
#[derive(Debug)]
pub struct PageFetcher {
    http: HttpFetcher,
    browser: BrowserFetcher,
}

impl PageFetcher {
    pub fn new(http: HttpFetcher, browser: BrowserFetcher) -> Self {
        Self { http, browser }
    }

    /// Close any browsers launched during the run.
    pub async fn shutdown(self) {
        self.browser.shutdown().await;
    }
}

impl Fetcher for PageFetcher {
    async fn fetch(
        &self,
        url: &str,
        strategy: &FetchStrategy,
        timeout: Duration,
    ) -> Result<String, FetchFailure> {
        match strategy {
            FetchStrategy::StaticFallback => self.http.fetch(url, strategy, timeout).await,
            _ => self.browser.fetch(url, strategy, timeout).await,
        }
    }
}
