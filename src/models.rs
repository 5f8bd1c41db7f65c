//! Data models shared by the fetch, archive, registry, and annotation stages.
//!
//! - [`UrlCandidate`]: an article URL discovered in a source README, awaiting fetch
//! - [`RegistryEntry`]: the durable record written once a URL has been archived
//! - [`ArchiveMetadata`]: the `metadata.json` stored beside each archived page
//! - [`DomainGroup`]: the per-run, per-host work queue
//! - [`RunReport`] / [`AnnotateStats`]: aggregate outcomes reported to the user

use serde::{Deserialize, Serialize};

/// An article URL plus the provenance needed to archive it.
///
/// Candidates are rebuilt from the source documents on every run and are
/// never mutated once extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlCandidate {
    /// Absolute `http(s)` URL of the article.
    pub url: String,
    /// Link text from the source document; used to derive the archive slug.
    pub title: String,
    /// Source directory name as it appears on disk (e.g. `BBC`).
    pub source: String,
    /// Source document path relative to the project root, `/`-separated.
    pub source_file: String,
}

impl UrlCandidate {
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        source: impl Into<String>,
        source_file: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            source: source.into(),
            source_file: source_file.into(),
        }
    }
}

/// A successfully archived URL as recorded in the registry file.
///
/// The URL is the key of the `scraped_urls` map on disk, so it is not
/// serialized inside the entry itself. `source_file` and `archive_path` are
/// optional because registries written by older runs may lack them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    #[serde(skip)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    /// Lower-cased source name.
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default)]
    pub scraped_at: String,
    /// Archive directory relative to the project root, `/`-separated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<String>,
}

impl RegistryEntry {
    /// Build the registry row for a freshly archived candidate.
    pub fn from_metadata(metadata: &ArchiveMetadata) -> Self {
        Self {
            url: metadata.url.clone(),
            title: metadata.title.clone(),
            source: metadata.source.clone(),
            source_file: Some(metadata.source_file.clone()),
            scraped_at: metadata.scraped_at.clone(),
            archive_path: Some(metadata.archive_path.clone()),
        }
    }
}

/// Contents of `metadata.json` inside an archive directory.
///
/// `url` is the ground truth used to tell slug collisions apart from
/// re-saves of the same article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub url: String,
    pub title: String,
    pub source: String,
    pub source_file: String,
    pub scraped_at: String,
    pub archive_path: String,
}

/// Candidates that share a network host, in extraction order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainGroup {
    pub domain: String,
    pub candidates: Vec<UrlCandidate>,
}

/// Aggregate outcome of one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub success_count: usize,
    pub fail_count: usize,
    /// URLs that exhausted their retries; they stay out of the registry.
    pub failed_urls: Vec<String>,
}

impl RunReport {
    /// Fold another worker's outcome into this one.
    pub fn merge(&mut self, other: RunReport) {
        self.success_count += other.success_count;
        self.fail_count += other.fail_count;
        self.failed_urls.extend(other.failed_urls);
    }

    pub fn total(&self) -> usize {
        self.success_count + self.fail_count
    }
}

/// Outcome of an annotation pass over the source documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnotateStats {
    pub updated_files: usize,
    pub updated_links: usize,
    pub skipped: usize,
}
