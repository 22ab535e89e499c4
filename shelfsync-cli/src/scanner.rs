//! Concrete [`FileScanner`] for the CLI shell: walks the configured
//! library root and emits candidate text files. The core treats this as
//! an external collaborator; exclusion patterns are opaque to the core,
//! so they live entirely here.

use std::path::Path;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use serde_json::json;
use shelfsync_core::error::{CoreError, Result};
use shelfsync_core::reconciler::FileScanner;
use shelfsync_model::{RelPath, ScannedFile};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Extensions considered eligible text documents. Kept intentionally small;
/// an operator curating a different corpus can fork this list.
const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "rst", "text", "adoc"];

const EXCLUDED_DIRS: &[&str] = &[".git", "node_modules", "target", ".shelfsync"];

/// Walks a directory tree on disk, normalizing paths relative to the
/// library root and extracting size/mtime metadata as the scanner
/// contract requires.
#[derive(Debug, Clone)]
pub struct WalkdirScanner;

impl WalkdirScanner {
    pub fn new() -> Self {
        Self
    }

    fn is_excluded(entry: &walkdir::DirEntry) -> bool {
        entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.') || EXCLUDED_DIRS.contains(&name))
            .unwrap_or(false)
    }

    fn is_eligible_file(entry: &walkdir::DirEntry) -> bool {
        if !entry.file_type().is_file() {
            return false;
        }
        entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| TEXT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }
}

impl Default for WalkdirScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileScanner for WalkdirScanner {
    async fn scan(&self, library_root: &Path) -> Result<Vec<ScannedFile>> {
        let root = library_root.to_path_buf();
        tokio::task::spawn_blocking(move || scan_blocking(&root))
            .await
            .map_err(|e| CoreError::Internal(format!("scanner task panicked: {e}")))?
    }

    async fn read_bytes(&self, library_root: &Path, file_path: &RelPath) -> Result<Vec<u8>> {
        let full = library_root.join(file_path.as_str());
        Ok(tokio::fs::read(&full).await?)
    }
}

fn scan_blocking(root: &Path) -> Result<Vec<ScannedFile>> {
    let mut out = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !WalkdirScanner::is_excluded(e));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !WalkdirScanner::is_eligible_file(&entry) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "skipping file with unreadable metadata");
                continue;
            }
        };
        let relative = match entry.path().strip_prefix(root) {
            Ok(p) => p,
            Err(_) => continue,
        };
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let rel_path = RelPath::from(relative.to_string_lossy().to_string());
        debug!(path = %rel_path, size = metadata.len(), "scanned");
        out.push(ScannedFile {
            file_path: rel_path,
            size: metadata.len(),
            mtime,
            path_derived_metadata: path_derived_metadata(relative),
        });
    }

    Ok(out)
}

/// Path-derived metadata is opaque to the core; this extracts only the
/// directory segments a caller might use for faceting later.
fn path_derived_metadata(relative: &Path) -> serde_json::Value {
    let segments: Vec<String> = relative
        .parent()
        .map(|p| p.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect())
        .unwrap_or_default();
    json!({ "directory_segments": segments })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scans_eligible_text_files_and_skips_others() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("image.png"), b"\x89PNG").unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git").join("ignored.txt"), b"nope").unwrap();

        let scanner = WalkdirScanner::new();
        let files = scanner.scan(dir.path()).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_path.as_str(), "a.txt");
    }
}
