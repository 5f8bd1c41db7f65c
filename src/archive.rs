//! Collision-safe archive of fetched pages.
//!
//! Each article is stored once under its source:
//!
//! ```text
//! content/news/<Source>/archive/
//! ├── foo/            # first article titled "Foo"
//! │   ├── index.html
//! │   └── metadata.json
//! └── foo-1/          # a different URL whose title also slugs to "foo"
//! ```
//!
//! The `url` in `metadata.json` decides whether an existing directory is the
//! same article (re-save, nothing written) or a slug collision (move on to the
//! next `-N` suffix). Directories are never overwritten.

use crate::models::{ArchiveMetadata, UrlCandidate};
use crate::utils::{relative_posix, timestamp_now};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, instrument, warn};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

pub const CONTENT_FILE: &str = "index.html";
pub const METADATA_FILE: &str = "metadata.json";
pub const ARCHIVE_DIR: &str = "archive";
const MAX_SLUG_CHARS: usize = 80;

static SEPARATOR_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-\s]+").unwrap());

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O failed at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to serialize metadata: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Convert a title to a filesystem-safe directory name.
///
/// Applies NFKD compatibility decomposition (full-width forms fold to ASCII,
/// accents split off and are dropped), lowercases, keeps letters and digits
/// from any script plus `_`, turns runs of whitespace and hyphens into one
/// `-`, and cuts long titles at the last hyphen within the first 80
/// characters. Empty results become `untitled`.
pub fn slugify(title: &str) -> String {
    let kept: String = title
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();
    let mut slug = SEPARATOR_RUNS
        .replace_all(&kept, "-")
        .trim_matches('-')
        .to_string();

    if slug.chars().count() > MAX_SLUG_CHARS {
        let cut: String = slug.chars().take(MAX_SLUG_CHARS).collect();
        slug = match cut.rsplit_once('-') {
            Some((head, _)) => head.to_string(),
            None => cut,
        };
    }

    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// Result of [`ArchiveStore::save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedArchive {
    pub dir: PathBuf,
    pub metadata: ArchiveMetadata,
    /// `false` when the URL was already archived and nothing was written.
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
    news_dir: PathBuf,
}

impl ArchiveStore {
    /// `root` is the project root that stored paths are relative to;
    /// `news_dir` holds one directory per source.
    pub fn new(root: impl Into<PathBuf>, news_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            news_dir: news_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn news_dir(&self) -> &Path {
        &self.news_dir
    }

    /// Directory of `source`, matched case-insensitively against what exists
    /// on disk; defaults to the lower-cased name.
    pub async fn source_dir(&self, source: &str) -> PathBuf {
        let lower = source.to_lowercase();
        let direct = self.news_dir.join(&lower);
        if fs::metadata(&direct).await.map(|m| m.is_dir()).unwrap_or(false) {
            return direct;
        }
        if let Ok(mut entries) = fs::read_dir(&self.news_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if is_dir && entry.file_name().to_string_lossy().to_lowercase() == lower {
                    return entry.path();
                }
            }
        }
        direct
    }

    /// Persist `content` for `candidate`, resolving slug collisions.
    ///
    /// The slug directory is claimed with an atomic `create_dir`. When it is
    /// taken, its `metadata.json` decides: same URL means an idempotent
    /// re-save, a different URL moves on to the next `-N` suffix.
    ///
    /// # Arguments
    ///
    /// * `candidate` - The article being archived; its title gives the slug
    /// * `content` - Page content written verbatim to `index.html`
    ///
    /// # Returns
    ///
    /// The archive directory and its metadata. `created` is `false` when the
    /// URL was already archived under the slug or one of its suffixes, in
    /// which case nothing is written.
    ///
    /// # Errors
    ///
    /// [`ArchiveError::Io`] if a directory or file cannot be created, and
    /// [`ArchiveError::Serialize`] if the metadata cannot be encoded.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let first = store.save(&foo_x, html).await?;   // archive/foo
    /// let second = store.save(&foo_y, html).await?;  // archive/foo-1
    /// let again = store.save(&foo_x, html).await?;   // archive/foo, created == false
    /// ```
    #[instrument(level = "debug", skip_all, fields(url = %candidate.url))]
    pub async fn save(
        &self,
        candidate: &UrlCandidate,
        content: &str,
    ) -> Result<SavedArchive, ArchiveError> {
        let archive_root = self.source_dir(&candidate.source).await.join(ARCHIVE_DIR);
        fs::create_dir_all(&archive_root)
            .await
            .map_err(io_err(&archive_root))?;

        let slug = slugify(&candidate.title);
        let mut suffix = 0usize;
        let dir = loop {
            let name = if suffix == 0 {
                slug.clone()
            } else {
                format!("{slug}-{suffix}")
            };
            let dir = archive_root.join(name);

            match fs::create_dir(&dir).await {
                Ok(()) => break dir,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if read_archive_url(&dir).await.as_deref() == Some(candidate.url.as_str()) {
                        warn!(dir = %dir.display(), "Archive already exists for this URL");
                        let metadata = match read_metadata(&dir).await {
                            Some(metadata) => metadata,
                            None => self.metadata_for(candidate, &dir),
                        };
                        return Ok(SavedArchive {
                            dir,
                            metadata,
                            created: false,
                        });
                    }
                    suffix += 1;
                }
                Err(e) => return Err(io_err(&dir)(e)),
            }
        };

        let content_path = dir.join(CONTENT_FILE);
        fs::write(&content_path, content)
            .await
            .map_err(io_err(&content_path))?;

        let metadata = self.metadata_for(candidate, &dir);
        let metadata_path = dir.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(&metadata)?;
        fs::write(&metadata_path, json)
            .await
            .map_err(io_err(&metadata_path))?;

        debug!(dir = %dir.display(), bytes = content.len(), "Archived page");
        Ok(SavedArchive {
            dir,
            metadata,
            created: true,
        })
    }

    fn metadata_for(&self, candidate: &UrlCandidate, dir: &Path) -> ArchiveMetadata {
        ArchiveMetadata {
            url: candidate.url.clone(),
            title: candidate.title.clone(),
            source: candidate.source.to_lowercase(),
            source_file: candidate.source_file.clone(),
            scraped_at: timestamp_now(),
            archive_path: relative_posix(dir, &self.root),
        }
    }
}

async fn read_metadata(dir: &Path) -> Option<ArchiveMetadata> {
    let raw = fs::read_to_string(dir.join(METADATA_FILE)).await.ok()?;
    serde_json::from_str(&raw).ok()
}

/// URL recorded in a directory's metadata, if readable.
///
/// Only the `url` field is required, so metadata from older runs still counts.
pub async fn read_archive_url(dir: &Path) -> Option<String> {
    let raw = fs::read_to_string(dir.join(METADATA_FILE)).await.ok()?;
    let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
    value
        .get("url")
        .and_then(|v| v.as_str())
        .filter(|u| !u.is_empty())
        .map(str::to_string)
}

/// Map every archived URL under `source_dir` to its archive directory.
///
/// Used as a fallback when a registry entry lacks a usable `archive_path`.
pub async fn index_source(source_dir: &Path) -> HashMap<String, PathBuf> {
    let mut index = HashMap::new();
    let archive_root = source_dir.join(ARCHIVE_DIR);
    let Ok(mut entries) = fs::read_dir(&archive_root).await else {
        return index;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let dir = entry.path();
        if let Some(url) = read_archive_url(&dir).await {
            index.insert(url, dir);
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> ArchiveStore {
        let root = tmp.path().to_path_buf();
        let news = root.join("content").join("news");
        std::fs::create_dir_all(news.join("BBC")).unwrap();
        ArchiveStore::new(root, news)
    }

    fn candidate(url: &str, title: &str) -> UrlCandidate {
        UrlCandidate::new(url, title, "BBC", "content/news/BBC/README.md")
    }

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Hello World"), "hello-world");
        assert_eq!(slugify("Test-Article!"), "test-article");
        assert_eq!(slugify("Multiple   Spaces -- here"), "multiple-spaces-here");
        assert_eq!(slugify("  -Edge- "), "edge");
    }

    #[test]
    fn test_slugify_keeps_cjk() {
        assert_eq!(slugify("宏福苑 大火：最新消息"), "宏福苑-大火最新消息");
    }

    #[test]
    fn test_slugify_folds_compatibility_forms() {
        assert_eq!(slugify("ＦＯＯ １２３"), "foo-123");
        assert_eq!(slugify("Café"), "cafe");
        assert_eq!(slugify("Ünïcödé Naïve"), "unicode-naive");
        assert_eq!(slugify("Breaking：ＨＫ"), "breakinghk");
    }

    #[test]
    fn test_slugify_empty_is_untitled() {
        assert_eq!(slugify("!!!"), "untitled");
        assert_eq!(slugify(""), "untitled");
    }

    #[test]
    fn test_slugify_truncates_at_hyphen() {
        let title = "word ".repeat(30);
        let slug = slugify(&title);
        assert!(slug.chars().count() <= MAX_SLUG_CHARS);
        assert!(!slug.ends_with('-'));
        assert!(slug.ends_with("word"));
    }

    #[tokio::test]
    async fn test_collision_gets_suffix() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let first = store
            .save(&candidate("https://a.example/x", "Foo"), "<html>x</html>")
            .await
            .unwrap();
        let second = store
            .save(&candidate("https://a.example/y", "Foo"), "<html>y</html>")
            .await
            .unwrap();

        assert!(first.created && second.created);
        assert!(first.dir.ends_with("archive/foo"));
        assert!(second.dir.ends_with("archive/foo-1"));
        assert_eq!(read_archive_url(&first.dir).await.unwrap(), "https://a.example/x");
        assert_eq!(read_archive_url(&second.dir).await.unwrap(), "https://a.example/y");
        assert_eq!(second.metadata.archive_path, "content/news/BBC/archive/foo-1");
    }

    #[tokio::test]
    async fn test_resave_same_url_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let c = candidate("https://a.example/x", "Foo");

        let first = store.save(&c, "<html>original</html>").await.unwrap();
        let again = store.save(&c, "<html>changed</html>").await.unwrap();

        assert!(!again.created);
        assert_eq!(again.dir, first.dir);
        let body = std::fs::read_to_string(first.dir.join(CONTENT_FILE)).unwrap();
        assert_eq!(body, "<html>original</html>");
    }

    #[tokio::test]
    async fn test_resave_finds_suffixed_match() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store
            .save(&candidate("https://a.example/x", "Foo"), "x")
            .await
            .unwrap();
        let y = candidate("https://a.example/y", "Foo");
        store.save(&y, "y").await.unwrap();

        let again = store.save(&y, "y2").await.unwrap();
        assert!(!again.created);
        assert!(again.dir.ends_with("archive/foo-1"));
    }

    #[tokio::test]
    async fn test_source_dir_is_case_insensitive() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let dir = store.source_dir("bbc").await;
        assert!(dir.ends_with("BBC"));
    }

    #[tokio::test]
    async fn test_index_source_maps_urls() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let saved = store
            .save(&candidate("https://a.example/x", "Foo"), "x")
            .await
            .unwrap();
        std::fs::create_dir_all(saved.dir.parent().unwrap().join("stray")).unwrap();

        let index = index_source(&store.source_dir("BBC").await).await;
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("https://a.example/x"), Some(&saved.dir));
    }
}
