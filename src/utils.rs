//! Utility functions for timestamps, path normalization, and log formatting.
//!
//! - Timestamps in the ISO-8601 local form used by the registry and metadata files
//! - Conversion between on-disk paths and the `/`-separated relative paths stored in JSON
//! - String truncation for log fields
//! - File system validation for the archive root

use chrono::Local;
use std::error::Error;
use std::fs as stdfs;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{info, instrument};

/// Current local time as `YYYY-MM-DDTHH:MM:SS.ffffff`.
pub fn timestamp_now() -> String {
    Local::now()
        .naive_local()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// Render a path relative to `root` with `/` separators.
///
/// Falls back to the full path when `path` does not live under `root`.
pub fn relative_posix(path: &Path, root: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    to_posix(rel)
}

/// Join path components with `/` regardless of platform.
pub fn to_posix(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolve a relative path read from the registry against the project root.
///
/// Registries written on Windows may contain backslashes.
pub fn resolve_stored_path(root: &Path, stored: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in stored.split(['/', '\\']).filter(|p| !p.is_empty() && *p != ".") {
        path.push(part);
    }
    path
}

/// Truncate a string for logging purposes.
///
/// Long strings are cut to `max` characters with an ellipsis and a count of
/// the dropped characters appended. Cuts on character boundaries, so titles
/// in any script are safe.
pub fn truncate_for_log(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        None => s.to_string(),
        Some((byte_idx, _)) => {
            let dropped = s[byte_idx..].chars().count();
            format!("{}…(+{} chars)", &s[..byte_idx], dropped)
        }
    }
}

/// Ensure a directory exists and is writable.
///
/// Creates the directory if needed, then writes and removes a scratch file.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or is not writable.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_dir(path: &Path) -> Result<(), Box<dyn Error>> {
    if let Err(e) = fs::create_dir_all(path).await {
        return Err(Box::new(e));
    }
    let scratch_path = path.join("..__write_check__");
    match stdfs::File::create(&scratch_path) {
        Ok(_) => {
            let _ = stdfs::remove_file(&scratch_path);
            info!("Directory is writable");
            Ok(())
        }
        Err(e) => Err(Box::new(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_for_log_short_string() {
        assert_eq!(truncate_for_log("Hello, world!", 100), "Hello, world!");
    }

    #[test]
    fn test_truncate_for_log_long_string() {
        let s = "a".repeat(500);
        let result = truncate_for_log(&s, 100);
        assert!(result.starts_with(&"a".repeat(100)));
        assert!(result.contains("…(+400 chars)"));
    }

    #[test]
    fn test_truncate_for_log_multibyte() {
        let result = truncate_for_log("宏福苑大火現場直擊", 4);
        assert_eq!(result, "宏福苑大…(+5 chars)");
    }

    #[test]
    fn test_relative_posix() {
        let root = Path::new("/project");
        let path = Path::new("/project/content/news/BBC/archive/foo");
        assert_eq!(relative_posix(path, root), "content/news/BBC/archive/foo");
    }

    #[test]
    fn test_resolve_stored_path_handles_backslashes() {
        let root = Path::new("/project");
        let resolved = resolve_stored_path(root, "content\\news\\BBC\\archive\\foo");
        assert_eq!(resolved, Path::new("/project/content/news/BBC/archive/foo"));
    }

    #[test]
    fn test_timestamp_now_shape() {
        let ts = timestamp_now();
        assert_eq!(ts.len(), "2025-01-01T00:00:00.000000".len());
        assert_eq!(&ts[10..11], "T");
    }

    #[tokio::test]
    async fn test_ensure_writable_dir_creates_missing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("nested").join("archive");
        ensure_writable_dir(&dir).await.unwrap();
        assert!(dir.is_dir());
    }
}
