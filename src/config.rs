//! Scraper configuration loaded from YAML.
//!
//! Global defaults live under `rate_limit`; the `sites` table overrides them
//! per domain and may pin a domain to a site-specific fetch strategy.
//!
//! ```yaml
//! max_concurrent_domains: 5
//! rate_limit:
//!   delay_seconds: 3
//!   max_retries: 3
//!   timeout_seconds: 60
//!   min_content_bytes: 500
//! sites:
//!   inmediahk.net:
//!     timeout_seconds: 120
//!     pinned:
//!       selector: "article"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid config {path}: {reason}")]
    Invalid { path: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    /// Domains fetched concurrently; further domains wait for a free slot.
    pub max_concurrent_domains: usize,
    pub user_agent: String,
    pub rate_limit: RateLimit,
    /// Per-domain overrides keyed by host without the `www.` prefix.
    pub sites: BTreeMap<String, SiteOverride>,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        let mut sites = BTreeMap::new();
        sites.insert(
            "inmediahk.net".to_string(),
            SiteOverride {
                timeout_seconds: Some(120),
                pinned: Some(PinnedStrategy {
                    selector: "section > section article".to_string(),
                    capture: Capture::Inner,
                    reject_text: None,
                }),
                ..SiteOverride::default()
            },
        );
        Self {
            max_concurrent_domains: 5,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            rate_limit: RateLimit::default(),
            sites,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimit {
    /// Politeness delay between consecutive requests to one domain.
    pub delay_seconds: f64,
    /// Upper bound of the uniform jitter added to the politeness delay.
    pub delay_jitter_ms: u64,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    /// Content shorter than this is treated as an interstitial and retried.
    pub min_content_bytes: usize,
    pub backoff_base_ms: u64,
    pub backoff_jitter_ms: u64,
    /// Extra wait after navigation so late scripts can render.
    pub settle_ms: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            delay_seconds: 3.0,
            delay_jitter_ms: 1000,
            max_retries: 3,
            timeout_seconds: 60,
            min_content_bytes: 500,
            backoff_base_ms: 1000,
            backoff_jitter_ms: 250,
            settle_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteOverride {
    pub delay_seconds: Option<f64>,
    pub max_retries: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub min_content_bytes: Option<usize>,
    /// Replace the default strategy chain with a single dedicated strategy.
    pub pinned: Option<PinnedStrategy>,
}

/// A selector-driven capture for sites whose pages only render their
/// article body after heavy client-side work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedStrategy {
    /// CSS selector of the element holding the article.
    pub selector: String,
    #[serde(default)]
    pub capture: Capture,
    /// Text whose presence marks a login wall rather than an article.
    #[serde(default)]
    pub reject_text: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capture {
    #[default]
    Inner,
    Outer,
}

/// Effective settings for one domain after applying its override.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteSettings {
    pub delay: Duration,
    pub delay_jitter: Duration,
    pub max_retries: u32,
    pub timeout: Duration,
    pub min_content_bytes: usize,
    pub backoff_base: Duration,
    pub backoff_jitter: Duration,
    pub pinned: Option<PinnedStrategy>,
}

impl ScraperConfig {
    /// Load configuration from `path`, or the built-in defaults if it is absent.
    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config file; using defaults");
            return Ok(Self::default());
        }
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let config: ScraperConfig = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display.clone(),
            source,
        })?;
        config
            .validate()
            .map_err(|reason| ConfigError::Invalid { path: display, reason })?;
        info!(sites = config.sites.len(), "Loaded configuration");
        Ok(config)
    }

    /// Reject delays that cannot become a `Duration`.
    pub fn validate(&self) -> Result<(), String> {
        let delays = std::iter::once(("rate_limit", Some(self.rate_limit.delay_seconds))).chain(
            self.sites
                .iter()
                .map(|(domain, site)| (domain.as_str(), site.delay_seconds)),
        );
        for (scope, delay) in delays {
            if let Some(d) = delay.filter(|d| !d.is_finite() || *d < 0.0) {
                return Err(format!(
                    "{scope}: delay_seconds must be a finite, non-negative number (got {d})"
                ));
            }
        }
        Ok(())
    }

    /// Resolve the settings for `domain`, falling back to the global limits.
    pub fn site_settings(&self, domain: &str) -> SiteSettings {
        let defaults = &self.rate_limit;
        let site = self.sites.get(domain);

        SiteSettings {
            delay: Duration::try_from_secs_f64(
                site.and_then(|s| s.delay_seconds)
                    .unwrap_or(defaults.delay_seconds),
            )
            .unwrap_or(Duration::ZERO),
            delay_jitter: Duration::from_millis(defaults.delay_jitter_ms),
            max_retries: site
                .and_then(|s| s.max_retries)
                .unwrap_or(defaults.max_retries),
            timeout: Duration::from_secs(
                site.and_then(|s| s.timeout_seconds)
                    .unwrap_or(defaults.timeout_seconds),
            ),
            min_content_bytes: site
                .and_then(|s| s.min_content_bytes)
                .unwrap_or(defaults.min_content_bytes),
            backoff_base: Duration::from_millis(defaults.backoff_base_ms),
            backoff_jitter: Duration::from_millis(defaults.backoff_jitter_ms),
            pinned: site.and_then(|s| s.pinned.clone()),
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.rate_limit.settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_to_unknown_domain() {
        let config = ScraperConfig::default();
        let settings = config.site_settings("example.com");
        assert_eq!(settings.delay, Duration::from_secs(3));
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.timeout, Duration::from_secs(60));
        assert_eq!(settings.min_content_bytes, 500);
        assert!(settings.pinned.is_none());
    }

    #[test]
    fn test_site_override_wins() {
        let yaml = r#"
rate_limit:
  delay_seconds: 2
  max_retries: 4
sites:
  slow.example:
    delay_seconds: 10
    max_retries: 1
    min_content_bytes: 50
"#;
        let config: ScraperConfig = serde_yaml::from_str(yaml).unwrap();
        let slow = config.site_settings("slow.example");
        assert_eq!(slow.delay, Duration::from_secs(10));
        assert_eq!(slow.max_retries, 1);
        assert_eq!(slow.min_content_bytes, 50);
        assert_eq!(slow.timeout, Duration::from_secs(60));

        let other = config.site_settings("fast.example");
        assert_eq!(other.delay, Duration::from_secs(2));
        assert_eq!(other.max_retries, 4);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: ScraperConfig = serde_yaml::from_str("max_concurrent_domains: 2\n").unwrap();
        assert_eq!(config.max_concurrent_domains, 2);
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(config.rate_limit.backoff_base_ms, 1000);
    }

    #[test]
    fn test_pinned_strategy_parses() {
        let yaml = r#"
sites:
  hkej.com:
    pinned:
      selector: "div.article"
      capture: outer
      reject_text: "訂戶登入"
"#;
        let config: ScraperConfig = serde_yaml::from_str(yaml).unwrap();
        let pinned = config.site_settings("hkej.com").pinned.unwrap();
        assert_eq!(pinned.selector, "div.article");
        assert_eq!(pinned.capture, Capture::Outer);
        assert_eq!(pinned.reject_text.as_deref(), Some("訂戶登入"));
    }

    #[test]
    fn test_default_table_pins_inmedia() {
        let config = ScraperConfig::default();
        assert!(config.site_settings("inmediahk.net").pinned.is_some());
        assert_eq!(
            config.site_settings("inmediahk.net").timeout,
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = ScraperConfig::load(Path::new("/definitely/not/here.yml")).unwrap();
        assert_eq!(config.max_concurrent_domains, 5);
    }

    #[test]
    fn test_non_finite_delay_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.yml");
        std::fs::write(&path, "rate_limit:\n  delay_seconds: .inf\n").unwrap();
        let err = ScraperConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        std::fs::write(&path, "sites:\n  slow.example:\n    delay_seconds: -1\n").unwrap();
        let err = ScraperConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("slow.example"));
    }

    #[test]
    fn test_unrepresentable_delay_resolves_without_panic() {
        let mut config = ScraperConfig::default();
        config.rate_limit.delay_seconds = f64::INFINITY;
        assert_eq!(config.site_settings("example.com").delay, Duration::ZERO);
        config.rate_limit.delay_seconds = f64::NAN;
        assert_eq!(config.site_settings("example.com").delay, Duration::ZERO);
        config.rate_limit.delay_seconds = -2.0;
        assert_eq!(config.site_settings("example.com").delay, Duration::ZERO);
    }
}
