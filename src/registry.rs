//! Durable deduplication ledger mapping URL to its archive record.
//!
//! The registry file is rewritten in full after every successful archive so
//! that a crash loses at most the fetch that was in flight:
//!
//! ```json
//! {
//!   "scraped_urls": {
//!     "https://example.com/a": {
//!       "title": "…", "source": "bbc", "source_file": "content/news/BBC/README.md",
//!       "scraped_at": "2025-01-01T10:00:00.000000",
//!       "archive_path": "content/news/BBC/archive/a"
//!     }
//!   },
//!   "last_updated": "2025-01-01T10:00:00.000000"
//! }
//! ```
//!
//! A missing or malformed file loads as an empty registry.

use crate::models::{RegistryEntry, UrlCandidate};
use crate::utils::timestamp_now;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write registry {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    scraped_urls: BTreeMap<String, RegistryEntry>,
    #[serde(default)]
    last_updated: Option<String>,
}

#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    entries: BTreeMap<String, RegistryEntry>,
    last_updated: Option<String>,
}

impl Registry {
    /// An empty registry that will persist to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
            last_updated: None,
        }
    }

    /// Load the registry stored at `path`.
    ///
    /// Never fails: a missing file yields an empty registry, and an
    /// unreadable or malformed one is logged and treated as empty.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No registry file yet; starting empty");
                return Self::empty(path);
            }
            Err(e) => {
                warn!(error = %e, "Registry unreadable; starting empty");
                return Self::empty(path);
            }
        };

        match serde_json::from_str::<RegistryFile>(&raw) {
            Ok(file) => {
                let entries = file
                    .scraped_urls
                    .into_iter()
                    .map(|(url, mut entry)| {
                        entry.url = url.clone();
                        (url, entry)
                    })
                    .collect::<BTreeMap<_, _>>();
                info!(entries = entries.len(), "Loaded registry");
                Self {
                    path: path.to_path_buf(),
                    entries,
                    last_updated: file.last_updated,
                }
            }
            Err(e) => {
                warn!(error = %e, "Registry is corrupt; previous content presumed lost");
                Self::empty(path)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.contains_key(url)
    }

    pub fn get(&self, url: &str) -> Option<&RegistryEntry> {
        self.entries.get(url)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_updated(&self) -> Option<&str> {
        self.last_updated.as_deref()
    }

    /// Drop candidates already archived, and repeats of a URL within the
    /// batch, keeping extraction order.
    pub fn filter_new(&self, candidates: Vec<UrlCandidate>) -> Vec<UrlCandidate> {
        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .filter(|c| !self.contains(&c.url) && seen.insert(c.url.clone()))
            .collect()
    }

    /// Insert or replace the entry for its URL, then persist the whole
    /// registry. This is the only path that writes the registry file.
    ///
    /// # Arguments
    ///
    /// * `entry` - The archived URL's record; `entry.url` is the map key
    ///
    /// # Errors
    ///
    /// [`RegistryError`] if the registry cannot be encoded or written. The
    /// entry stays in memory either way and is written by the next
    /// successful call.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let saved = store.save(&candidate, &content).await?;
    /// registry.record(RegistryEntry::from_metadata(&saved.metadata)).await?;
    /// assert!(registry.contains(&candidate.url));
    /// ```
    #[instrument(level = "debug", skip_all, fields(url = %entry.url))]
    pub async fn record(&mut self, entry: RegistryEntry) -> Result<(), RegistryError> {
        self.entries.insert(entry.url.clone(), entry);
        self.persist().await
    }

    async fn persist(&mut self) -> Result<(), RegistryError> {
        self.last_updated = Some(timestamp_now());
        let file = RegistryFile {
            scraped_urls: self.entries.clone(),
            last_updated: self.last_updated.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let write_err = |source| RegistryError::Write {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        // Write beside the target and rename so readers never see a torn file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, format!("{json}\n")).await.map_err(write_err)?;
        fs::rename(&tmp, &self.path).await.map_err(write_err)?;
        debug!(entries = self.entries.len(), "Persisted registry");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(url: &str) -> RegistryEntry {
        RegistryEntry {
            url: url.to_string(),
            title: "Foo".to_string(),
            source: "bbc".to_string(),
            source_file: Some("content/news/BBC/README.md".to_string()),
            scraped_at: timestamp_now(),
            archive_path: Some("content/news/BBC/archive/foo".to_string()),
        }
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::load(tmp.path().join("scraped_urls.json")).await;
        assert!(registry.is_empty());
        assert!(registry.last_updated().is_none());
    }

    #[tokio::test]
    async fn test_load_corrupt_is_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("scraped_urls.json");
        std::fs::write(&path, "{ not json").unwrap();

        let registry = Registry::load(&path).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_record_persists_immediately() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("scraped_urls.json");
        let mut registry = Registry::load(&path).await;

        registry.record(entry("https://a.example/x")).await.unwrap();

        let reloaded = Registry::load(&path).await;
        assert!(reloaded.contains("https://a.example/x"));
        assert_eq!(reloaded.get("https://a.example/x").unwrap().url, "https://a.example/x");
        assert!(reloaded.last_updated().is_some());
        assert!(!tmp.path().join("scraped_urls.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_shape_matches_layout() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("scraped_urls.json");
        let mut registry = Registry::empty(&path);
        registry.record(entry("https://a.example/x")).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let row = &raw["scraped_urls"]["https://a.example/x"];
        assert_eq!(row["title"], "Foo");
        assert_eq!(row["archive_path"], "content/news/BBC/archive/foo");
        assert!(raw["last_updated"].is_string());
    }

    #[test]
    fn test_filter_new_drops_known_and_repeats() {
        let mut registry = Registry::empty("unused.json");
        registry
            .entries
            .insert("https://a.example/x".to_string(), entry("https://a.example/x"));

        let candidates = vec![
            UrlCandidate::new("https://a.example/x", "old", "BBC", "r.md"),
            UrlCandidate::new("https://a.example/y", "new", "BBC", "r.md"),
            UrlCandidate::new("https://a.example/y", "again", "BBC", "r.md"),
        ];
        let fresh = registry.filter_new(candidates);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].title, "new");
    }
}
