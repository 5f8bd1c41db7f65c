//! Inject `Original` / `Archive` link buttons into source READMEs.
//!
//! For every registry entry, the list item linking to the entry's URL gets
//! two trailing buttons:
//!
//! ```text
//! - [Headline](https://example.com/a) [Original](https://example.com/a){.md-button .md-button--primary .archive-link} [Archive](archive/headline/){.md-button .archive-link}
//! ```
//!
//! The `.archive-link` class marks lines already annotated, so repeated
//! passes leave them alone. Lines carrying buttons from before the class
//! existed are normalized in place rather than getting a second pair.

use crate::archive::{ArchiveStore, index_source};
use crate::models::AnnotateStats;
use crate::registry::Registry;
use crate::sources::discover_sources;
use crate::utils::{resolve_stored_path, to_posix};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

pub const MARKER_TAG: &str = ".archive-link";
const PRIMARY_BUTTON: &str = "{.md-button .md-button--primary}";
const PLAIN_BUTTON: &str = "{.md-button}";

/// Archive directory as a link relative to the document, with a trailing `/`.
pub fn archive_link(source_file: &Path, archive_dir: &Path) -> String {
    let base = source_file.parent().unwrap_or_else(|| Path::new(""));
    let rel = pathdiff::diff_paths(archive_dir, base).unwrap_or_else(|| archive_dir.to_path_buf());
    format!("{}/", to_posix(&rel).trim_end_matches('/'))
}

/// Add (or normalize) the button pair on a single line without its newline.
pub fn add_markers_to_line(line: &str, url: &str, link: &str) -> String {
    if line.contains("Archive](") || line.contains("Original](") {
        if line.contains(MARKER_TAG) {
            return line.to_string();
        }
        return line
            .replace(
                PRIMARY_BUTTON,
                &format!("{{.md-button .md-button--primary {MARKER_TAG}}}"),
            )
            .replace(PLAIN_BUTTON, &format!("{{.md-button {MARKER_TAG}}}"));
    }

    format!(
        "{} [Original]({url}){{.md-button .md-button--primary {MARKER_TAG}}} [Archive]({link}){{.md-button {MARKER_TAG}}}",
        line.trim_end()
    )
}

/// Rewrite the list items linking to `url` in `text`.
///
/// Returns `None` when nothing changed.
pub fn annotate_text(text: &str, url: &str, link: &str) -> Option<String> {
    let pattern = format!(r"^\s*[-*]\s+\[[^\]]+\]\({}\)", regex::escape(url));
    let list_link = Regex::new(&pattern).ok()?;

    let mut changed = false;
    let mut out = String::with_capacity(text.len() + 256);
    for raw in text.split_inclusive('\n') {
        let body = raw.trim_end_matches(['\r', '\n']);
        let ending = &raw[body.len()..];
        if list_link.is_match(body) {
            let updated = add_markers_to_line(body, url, link);
            if updated != body {
                changed = true;
                out.push_str(&updated);
                out.push_str(ending);
                continue;
            }
        }
        out.push_str(raw);
    }

    changed.then_some(out)
}

/// Annotate one document for one URL. Returns whether the file changed.
pub async fn annotate_document(
    source_file: &Path,
    url: &str,
    archive_dir: &Path,
) -> std::io::Result<bool> {
    let text = fs::read_to_string(source_file).await?;
    let link = archive_link(source_file, archive_dir);
    match annotate_text(&text, url, &link) {
        Some(updated) => {
            fs::write(source_file, updated).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Per-source `url → archive dir` maps, each built on first use.
struct ArchiveLocator<'a> {
    store: &'a ArchiveStore,
    by_source: HashMap<String, HashMap<String, PathBuf>>,
}

impl<'a> ArchiveLocator<'a> {
    fn new(store: &'a ArchiveStore) -> Self {
        Self {
            store,
            by_source: HashMap::new(),
        }
    }

    async fn find(&mut self, source: &str, url: &str) -> Option<PathBuf> {
        if !self.by_source.contains_key(source) {
            let dir = self.store.source_dir(source).await;
            let index = index_source(&dir).await;
            debug!(source, archived = index.len(), "Indexed archive metadata");
            self.by_source.insert(source.to_string(), index);
        }
        self.by_source.get(source)?.get(url).cloned()
    }
}

/// Annotate the source documents for every registry entry, optionally
/// restricted to one source. Never aborts on a single bad entry.
#[instrument(level = "info", skip_all, fields(source = source_filter.unwrap_or("*")))]
pub async fn annotate(
    registry: &Registry,
    store: &ArchiveStore,
    source_filter: Option<&str>,
) -> AnnotateStats {
    let filter = source_filter.map(str::to_lowercase);
    let readmes: HashMap<String, PathBuf> = discover_sources(store.news_dir())
        .await
        .into_iter()
        .map(|(name, path)| (name.to_lowercase(), path))
        .collect();
    let mut locator = ArchiveLocator::new(store);
    let mut stats = AnnotateStats::default();
    let mut touched: HashSet<PathBuf> = HashSet::new();

    for entry in registry.entries() {
        let source = entry.source.to_lowercase();
        if filter.as_deref().is_some_and(|f| f != source) {
            continue;
        }

        let source_file = match &entry.source_file {
            Some(rel) => Some(resolve_stored_path(store.root(), rel)),
            None => readmes.get(&source).cloned(),
        };
        let Some(source_file) = source_file.filter(|p| p.is_file()) else {
            debug!(url = %entry.url, "Source document missing; skipping");
            stats.skipped += 1;
            continue;
        };

        let stored_dir = entry
            .archive_path
            .as_deref()
            .map(|rel| resolve_stored_path(store.root(), rel))
            .filter(|p| p.is_dir());
        let archive_dir = match stored_dir {
            Some(dir) => Some(dir),
            None => locator.find(&source, &entry.url).await,
        };
        let Some(archive_dir) = archive_dir else {
            debug!(url = %entry.url, "No archive directory found; skipping");
            stats.skipped += 1;
            continue;
        };

        match annotate_document(&source_file, &entry.url, &archive_dir).await {
            Ok(true) => {
                stats.updated_links += 1;
                touched.insert(source_file);
            }
            Ok(false) => stats.skipped += 1,
            Err(e) => {
                warn!(path = %source_file.display(), error = %e, "Failed to update markdown");
                stats.skipped += 1;
            }
        }
    }

    stats.updated_files = touched.len();
    info!(
        updated_files = stats.updated_files,
        updated_links = stats.updated_links,
        skipped = stats.skipped,
        "Markdown annotation complete"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RegistryEntry, UrlCandidate};
    use tempfile::TempDir;

    const URL: &str = "https://news.example/a?id=1";

    #[test]
    fn test_archive_link_is_relative() {
        let link = archive_link(
            Path::new("/p/content/news/BBC/README.md"),
            Path::new("/p/content/news/BBC/archive/foo"),
        );
        assert_eq!(link, "archive/foo/");
    }

    #[test]
    fn test_adds_buttons_once() {
        let text = format!("# BBC\n- [Headline]({URL})\n- [Other](https://news.example/b)\n");
        let first = annotate_text(&text, URL, "archive/headline/").unwrap();
        assert!(first.contains(&format!(
            "- [Headline]({URL}) [Original]({URL}){{.md-button .md-button--primary .archive-link}} [Archive](archive/headline/){{.md-button .archive-link}}\n"
        )));
        assert!(first.contains("- [Other](https://news.example/b)\n"));

        assert!(annotate_text(&first, URL, "archive/headline/").is_none());
    }

    #[test]
    fn test_normalizes_legacy_buttons() {
        let line = format!(
            "- [Headline]({URL}) [Original]({URL}){{.md-button .md-button--primary}} [Archive](archive/h/){{.md-button}}"
        );
        let updated = add_markers_to_line(&line, URL, "archive/h/");
        assert_eq!(updated.matches("[Original]").count(), 1);
        assert_eq!(updated.matches(MARKER_TAG).count(), 2);
        assert_eq!(add_markers_to_line(&updated, URL, "archive/h/"), updated);
    }

    #[test]
    fn test_preserves_crlf() {
        let text = format!("- [Headline]({URL})\r\nnext\r\n");
        let updated = annotate_text(&text, URL, "archive/h/").unwrap();
        assert!(updated.ends_with("{.md-button .archive-link}\r\nnext\r\n"));
    }

    #[test]
    fn test_ignores_non_list_mentions() {
        let text = format!("See [Headline]({URL}) inline.\n");
        assert!(annotate_text(&text, URL, "archive/h/").is_none());
    }

    async fn fixture(tmp: &TempDir) -> (ArchiveStore, Registry, PathBuf) {
        let root = tmp.path().to_path_buf();
        let news = root.join("content").join("news");
        std::fs::create_dir_all(news.join("BBC")).unwrap();
        let readme = news.join("BBC").join("README.md");
        std::fs::write(&readme, format!("# BBC\n- [Headline]({URL})\n")).unwrap();

        let store = ArchiveStore::new(&root, &news);
        let saved = store
            .save(
                &UrlCandidate::new(URL, "Headline", "BBC", "content/news/BBC/README.md"),
                "<html></html>",
            )
            .await
            .unwrap();
        let mut registry = Registry::empty(root.join("scraped_urls.json"));
        registry
            .record(RegistryEntry::from_metadata(&saved.metadata))
            .await
            .unwrap();
        (store, registry, readme)
    }

    #[tokio::test]
    async fn test_annotate_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let (store, registry, readme) = fixture(&tmp).await;

        let first = annotate(&registry, &store, None).await;
        assert_eq!(first.updated_links, 1);
        assert_eq!(first.updated_files, 1);
        let after_first = std::fs::read_to_string(&readme).unwrap();
        assert!(after_first.contains("[Archive](archive/headline/)"));

        let second = annotate(&registry, &store, None).await;
        assert_eq!(second.updated_links, 0);
        assert_eq!(std::fs::read_to_string(&readme).unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_annotate_falls_back_to_metadata_scan() {
        let tmp = TempDir::new().unwrap();
        let (store, _, readme) = fixture(&tmp).await;

        // A legacy row without paths still resolves through archive metadata.
        let legacy_path = tmp.path().join("legacy.json");
        std::fs::write(
            &legacy_path,
            format!(r#"{{"scraped_urls": {{"{URL}": {{"title": "Headline", "source": "bbc"}}}}}}"#),
        )
        .unwrap();
        let legacy = Registry::load(&legacy_path).await;

        let stats = annotate(&legacy, &store, Some("BBC")).await;
        assert_eq!(stats.updated_links, 1);
        assert!(std::fs::read_to_string(&readme).unwrap().contains("archive/headline/"));
    }

    #[tokio::test]
    async fn test_annotate_skips_missing_source_file() {
        let tmp = TempDir::new().unwrap();
        let (store, registry, readme) = fixture(&tmp).await;
        std::fs::remove_file(&readme).unwrap();

        let stats = annotate(&registry, &store, None).await;
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.updated_links, 0);
    }

    #[tokio::test]
    async fn test_annotate_skips_entry_without_archive_dir() {
        let tmp = TempDir::new().unwrap();
        let (store, registry, readme) = fixture(&tmp).await;
        std::fs::remove_dir_all(tmp.path().join("content/news/BBC/archive/headline")).unwrap();
        let before = std::fs::read_to_string(&readme).unwrap();

        let stats = annotate(&registry, &store, None).await;
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.updated_links, 0);
        assert_eq!(stats.updated_files, 0);
        assert_eq!(std::fs::read_to_string(&readme).unwrap(), before);
    }

    #[tokio::test]
    async fn test_annotate_respects_source_filter() {
        let tmp = TempDir::new().unwrap();
        let (store, registry, _) = fixture(&tmp).await;

        let stats = annotate(&registry, &store, Some("hk01")).await;
        assert_eq!(stats, AnnotateStats::default());
    }
}
