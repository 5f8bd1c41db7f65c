//! Source discovery and URL candidate extraction from source READMEs.
//!
//! Each directory under `content/news/` holding a `README*.md` is a source.
//! Links are pulled from three layouts found in those files:
//!
//! | layout | example |
//! |--------|---------|
//! | markdown link | `- [Headline](https://example.com/a)` |
//! | table row | `\| Headline \| https://example.com/a \|` |
//! | angle-bracket list item | `- Headline (<https://example.com/a>)` |

use crate::models::UrlCandidate;
use crate::utils::relative_posix;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, instrument};

static MARKDOWN_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\((https?://[^\)]+)\)").unwrap());
static TABLE_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\|\s*([^|]+?)\s*\|\s*<?(\s*https?://[^\s>|]+)\s*>?\s*\|").unwrap()
});
static ANGLE_LIST_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^-\s+(.+?)\s+\(<(https?://[^>]+)>\)").unwrap());

/// Link texts that are the annotator's own markers, not articles.
const MARKER_TITLES: [&str; 2] = ["original", "archive"];
/// Table header cells that are not article titles.
const HEADER_CELLS: [&str; 6] = ["標題", "title", "連結", "link", "---", "------"];

/// A `(title, url)` pair found in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedLink {
    pub title: String,
    pub url: String,
}

/// Pull article links from markdown text, in document order per layout.
pub fn extract_links(text: &str) -> Vec<ExtractedLink> {
    let mut links = Vec::new();

    for caps in MARKDOWN_LINK.captures_iter(text) {
        let title = caps[1].trim_matches('*').trim();
        let url = caps[2].trim();
        if MARKER_TITLES.contains(&title.to_lowercase().as_str()) || url.ends_with(".md") {
            continue;
        }
        links.push(ExtractedLink {
            title: title.to_string(),
            url: url.to_string(),
        });
    }

    for caps in TABLE_ROW.captures_iter(text) {
        let title = caps[1].trim();
        let url = caps[2].trim();
        if HEADER_CELLS.contains(&title.to_lowercase().as_str()) || url.is_empty() {
            continue;
        }
        links.push(ExtractedLink {
            title: title.to_string(),
            url: url.to_string(),
        });
    }

    for caps in ANGLE_LIST_ITEM.captures_iter(text) {
        let title = caps[1].trim();
        let url = caps[2].trim();
        if !title.is_empty() && !url.is_empty() {
            links.push(ExtractedLink {
                title: title.to_string(),
                url: url.to_string(),
            });
        }
    }

    links
}

fn is_readme(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.starts_with("readme.") && lower.ends_with("md")
}

/// Find every source directory under `news_dir` and its README.
#[instrument(level = "info", skip_all, fields(news_dir = %news_dir.display()))]
pub async fn discover_sources(news_dir: &Path) -> BTreeMap<String, PathBuf> {
    let mut sources = BTreeMap::new();
    let Ok(mut entries) = fs::read_dir(news_dir).await else {
        return sources;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let Ok(mut files) = fs::read_dir(entry.path()).await else {
            continue;
        };
        let mut readmes = Vec::new();
        while let Ok(Some(file)) = files.next_entry().await {
            if is_readme(&file.file_name().to_string_lossy()) {
                readmes.push(file.path());
            }
        }
        readmes.sort();
        if let Some(readme) = readmes.into_iter().next() {
            sources.insert(entry.file_name().to_string_lossy().into_owned(), readme);
        }
    }

    info!(count = sources.len(), "Discovered news sources");
    sources
}

/// Read one source README and turn its links into candidates.
pub async fn extract_candidates(
    readme: &Path,
    root: &Path,
    source: &str,
) -> Result<Vec<UrlCandidate>, Box<dyn Error>> {
    let text = fs::read_to_string(readme).await?;
    let source_file = relative_posix(readme, root);
    let candidates: Vec<UrlCandidate> = extract_links(&text)
        .into_iter()
        .map(|link| UrlCandidate::new(link.url, link.title, source, source_file.clone()))
        .collect();
    debug!(source, count = candidates.len(), "Extracted candidates");
    Ok(candidates)
}

/// Candidates from every source, optionally restricted to one source name
/// (compared case-insensitively).
pub async fn collect_candidates(
    sources: &BTreeMap<String, PathBuf>,
    root: &Path,
    source_filter: Option<&str>,
) -> Result<Vec<UrlCandidate>, Box<dyn Error>> {
    let filter = source_filter.map(str::to_lowercase);
    let mut all = Vec::new();
    for (name, readme) in sources {
        if filter.as_deref().is_some_and(|f| f != name.to_lowercase()) {
            continue;
        }
        all.extend(extract_candidates(readme, root, name).await?);
    }
    Ok(all)
}
