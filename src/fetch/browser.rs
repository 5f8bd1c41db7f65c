//! Headless Chromium fetcher for the rendering strategies.
//!
//! Two browsers are launched lazily on first use: the primary one serves
//! fast-load, full-load, and site-specific attempts; a second one with HTTP/2
//! disabled serves alt-protocol attempts, each inside a fresh isolated browser
//! context. Every attempt opens its own page and closes it (and disposes its
//! context) before returning, whether it succeeded, failed, or timed out.

use super::{FailureKind, FetchFailure, FetchStrategy, Fetcher};
use crate::config::{Capture, PinnedStrategy};
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use futures::StreamExt;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, instrument, trace, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Resource count must hold steady this long to count as network-idle.
const NETWORK_IDLE_WINDOW: Duration = Duration::from_millis(500);

struct LaunchedBrowser {
    browser: Browser,
    handler: JoinHandle<()>,
    profile_dir: PathBuf,
}

impl LaunchedBrowser {
    async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!(error = %e, "Failed to close browser");
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
        remove_profile_dir(&self.profile_dir).await;
    }
}

/// Per-process Chromium profile directory for one browser.
fn profile_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("article_archiver_{}_{label}", std::process::id()))
}

/// Delete a profile directory left by a closed browser. Missing is fine.
async fn remove_profile_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "Removed browser profile"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove browser profile"),
    }
}

pub struct BrowserFetcher {
    user_agent: String,
    settle: Duration,
    primary: OnceCell<LaunchedBrowser>,
    legacy: OnceCell<LaunchedBrowser>,
}

impl fmt::Debug for BrowserFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserFetcher")
            .field("user_agent", &self.user_agent)
            .field("settle", &self.settle)
            .field("primary_launched", &self.primary.initialized())
            .field("legacy_launched", &self.legacy.initialized())
            .finish()
    }
}

impl BrowserFetcher {
    /// Create a fetcher; no browser is started until the first attempt.
    ///
    /// `settle` is the extra wait after navigation for late scripts.
    pub fn new(user_agent: &str, settle: Duration) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            settle,
            primary: OnceCell::new(),
            legacy: OnceCell::new(),
        }
    }

    async fn primary(&self) -> Result<&LaunchedBrowser, FetchFailure> {
        self.primary
            .get_or_try_init(|| launch(&self.user_agent, false))
            .await
    }

    async fn legacy(&self) -> Result<&LaunchedBrowser, FetchFailure> {
        self.legacy
            .get_or_try_init(|| launch(&self.user_agent, true))
            .await
    }

    /// Close whichever browsers were launched.
    pub async fn shutdown(self) {
        for launched in [self.primary.into_inner(), self.legacy.into_inner()]
            .into_iter()
            .flatten()
        {
            launched.close().await;
        }
        debug!("Browsers shut down");
    }

    async fn render(
        &self,
        page: &Page,
        url: &str,
        strategy: &FetchStrategy,
    ) -> Result<String, FetchFailure> {
        match strategy {
            FetchStrategy::FullLoad => {
                page.goto(url)
                    .await
                    .map_err(|e| classify_navigation_error(&e.to_string()))?;
                wait_for_network_idle(page).await;
                sleep(self.settle).await;
            }
            FetchStrategy::SiteSpecific(pinned) => {
                page.goto(url)
                    .await
                    .map_err(|e| classify_navigation_error(&e.to_string()))?;
                sleep(self.settle).await;
                return capture_selector(page, pinned).await;
            }
            FetchStrategy::FastLoad | FetchStrategy::AltProtocol | FetchStrategy::StaticFallback => {
                let nav = page
                    .execute(NavigateParams::new(url))
                    .await
                    .map_err(|e| classify_navigation_error(&e.to_string()))?;
                if let Some(error_text) = nav.result.error_text.as_deref() {
                    return Err(classify_navigate_error_text(error_text));
                }
                wait_for_dom_parsed(page, url).await;
                sleep(self.settle).await;
            }
        }

        page.content()
            .await
            .map_err(|e| FetchFailure::new(FailureKind::Browser, e.to_string()))
    }
}

impl Fetcher for BrowserFetcher {
    #[instrument(level = "debug", skip_all, fields(%url, %strategy))]
    async fn fetch(
        &self,
        url: &str,
        strategy: &FetchStrategy,
        timeout: Duration,
    ) -> Result<String, FetchFailure> {
        let isolated = matches!(strategy, FetchStrategy::AltProtocol);
        let launched = if isolated {
            self.legacy().await?
        } else {
            self.primary().await?
        };
        let browser = &launched.browser;

        let context = if isolated {
            Some(create_context(browser).await?)
        } else {
            None
        };

        let mut params = CreateTargetParams::new("about:blank");
        params.browser_context_id = context.clone();
        let page = match browser.new_page(params).await {
            Ok(page) => page,
            Err(e) => {
                dispose_context(browser, context).await;
                return Err(FetchFailure::new(FailureKind::Browser, e.to_string()));
            }
        };

        let result = match tokio::time::timeout(timeout, self.render(&page, url, strategy)).await {
            Ok(result) => result,
            Err(_) => Err(FetchFailure::new(
                FailureKind::Timeout,
                format!("{strategy} exceeded {}s", timeout.as_secs()),
            )),
        };

        if let Err(e) = page.close().await {
            debug!(error = %e, "Failed to close page");
        }
        dispose_context(browser, context).await;
        result
    }
}

#[instrument(level = "info", skip(user_agent))]
async fn launch(user_agent: &str, disable_http2: bool) -> Result<LaunchedBrowser, FetchFailure> {
    let label = if disable_http2 { "legacy" } else { "primary" };
    let user_data_dir = profile_dir(label);

    let mut builder = BrowserConfig::builder()
        .headless_mode(HeadlessMode::default())
        .request_timeout(Duration::from_secs(30))
        .window_size(1920, 1080)
        .user_data_dir(&user_data_dir)
        .arg(format!("--user-agent={user_agent}"))
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--disable-notifications")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--mute-audio");
    if disable_http2 {
        builder = builder
            .arg("--disable-http2")
            .arg("--ignore-certificate-errors");
    }
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        builder = builder.chrome_executable(path);
    }

    let config = builder
        .build()
        .map_err(|e| FetchFailure::new(FailureKind::Browser, e))?;
    let (browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| FetchFailure::new(FailureKind::Browser, e.to_string()))?;

    let handler = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                trace!(error = %e, "Browser handler event error");
            }
        }
    });

    info!(label, "Launched headless browser");
    Ok(LaunchedBrowser {
        browser,
        handler,
        profile_dir: user_data_dir,
    })
}

async fn create_context(browser: &Browser) -> Result<BrowserContextId, FetchFailure> {
    browser
        .execute(CreateBrowserContextParams::default())
        .await
        .map(|resp| resp.result.browser_context_id)
        .map_err(|e| FetchFailure::new(FailureKind::Browser, e.to_string()))
}

async fn dispose_context(browser: &Browser, context: Option<BrowserContextId>) {
    let Some(id) = context else {
        return;
    };
    if let Err(e) = browser.execute(DisposeBrowserContextParams::new(id)).await {
        debug!(error = %e, "Failed to dispose browser context");
    }
}

/// Poll until the new document has been parsed (`DOMContentLoaded`).
///
/// Bounded by the caller's timeout.
async fn wait_for_dom_parsed(page: &Page, url: &str) {
    const SCRIPT: &str = "(function() { return { readyState: document.readyState, href: location.href }; })()";
    loop {
        if let Ok(result) = page.evaluate(SCRIPT).await {
            if let Ok(value) = result.into_value::<serde_json::Value>() {
                let state = value.get("readyState").and_then(|v| v.as_str());
                let href = value.get("href").and_then(|v| v.as_str()).unwrap_or("");
                let navigated = href != "about:blank" || url == "about:blank";
                if navigated && matches!(state, Some("interactive") | Some("complete")) {
                    return;
                }
            }
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Poll until the document is complete and no new resources have started
/// loading for [`NETWORK_IDLE_WINDOW`].
///
/// Bounded by the caller's timeout.
async fn wait_for_network_idle(page: &Page) {
    const SCRIPT: &str = "(function() { return { readyState: document.readyState, resources: performance.getEntriesByType('resource').length }; })()";
    let mut last_count: Option<u64> = None;
    let mut quiet_for = Duration::ZERO;

    loop {
        if let Ok(result) = page.evaluate(SCRIPT).await {
            if let Ok(value) = result.into_value::<serde_json::Value>() {
                let complete = value.get("readyState").and_then(|v| v.as_str()) == Some("complete");
                let count = value.get("resources").and_then(|v| v.as_u64());
                if complete && count.is_some() && count == last_count {
                    quiet_for += POLL_INTERVAL;
                    if quiet_for >= NETWORK_IDLE_WINDOW {
                        return;
                    }
                } else {
                    quiet_for = Duration::ZERO;
                }
                last_count = count;
            }
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Wait for the pinned selector and capture its markup.
async fn capture_selector(page: &Page, pinned: &PinnedStrategy) -> Result<String, FetchFailure> {
    let element = loop {
        match page.find_element(pinned.selector.as_str()).await {
            Ok(element) => break element,
            Err(_) => sleep(SELECTOR_POLL_INTERVAL).await,
        }
    };

    if let Some(marker) = &pinned.reject_text {
        let text = element
            .inner_text()
            .await
            .map_err(|e| FetchFailure::new(FailureKind::Browser, e.to_string()))?
            .unwrap_or_default();
        if text.contains(marker.as_str()) {
            return Err(FetchFailure::new(
                FailureKind::Rejected,
                format!("page shows '{marker}'"),
            ));
        }
    }

    let html = match pinned.capture {
        Capture::Inner => element.inner_html().await,
        Capture::Outer => element.outer_html().await,
    }
    .map_err(|e| FetchFailure::new(FailureKind::Browser, e.to_string()))?;
    Ok(html.unwrap_or_default())
}

/// Map the `errorText` of a `Page.navigate` response to a failure kind.
///
/// Chromium answers a navigation that turned into a file download with
/// `net::ERR_ABORTED` here; anywhere else that code means a cancelled
/// navigation and is retried.
pub fn classify_navigate_error_text(error_text: &str) -> FetchFailure {
    if error_text.contains("net::ERR_ABORTED") {
        return FetchFailure::new(FailureKind::Download, error_text);
    }
    classify_navigation_error(error_text)
}

/// Map a navigation error message to a failure kind.
pub fn classify_navigation_error(message: &str) -> FetchFailure {
    let kind = if message.contains("Download is starting") {
        FailureKind::Download
    } else if message.contains("ERR_TIMED_OUT")
        || message.contains("Timeout")
        || message.contains("timed out")
    {
        FailureKind::Timeout
    } else if message.contains("ERR_HTTP2")
        || message.contains("ERR_SPDY")
        || message.contains("ERR_QUIC")
        || message.contains("ERR_SSL")
    {
        FailureKind::Protocol
    } else if message.contains("net::ERR_") {
        FailureKind::Transport
    } else {
        FailureKind::Browser
    };
    FetchFailure::new(kind, message)
}
