//! On-disk cache of fetched items
//!
//! Every found item is written as `<folder>/<id>.json`. Ids the upstream
//! reported as absent get an empty marker at `<folder>/failed/<id>.failed`
//! so later runs can skip them.

use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Storage for fetched items and failure markers
pub trait ArtifactStore: Send + Sync {
    /// Whether a readable item for `id` is already stored
    fn is_cached(&self, id: &str) -> bool;

    /// Whether `id` carries a failure marker
    fn is_failed(&self, id: &str) -> bool;

    /// Reads a stored item; unreadable entries count as absent
    fn read(&self, id: &str) -> Option<Value>;

    /// Stores an item
    fn write(&self, id: &str, item: &Value) -> io::Result<()>;

    /// Records that `id` is absent upstream
    fn mark_failed(&self, id: &str) -> io::Result<()>;
}

/// Artifact store backed by a folder of JSON files
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    folder: PathBuf,
}

impl FileArtifactStore {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    fn item_path(&self, id: &str) -> PathBuf {
        self.folder.join(format!("{}.json", file_stem(id)))
    }

    fn failed_path(&self, id: &str) -> PathBuf {
        self.folder
            .join("failed")
            .join(format!("{}.failed", file_stem(id)))
    }
}

/// Screen names are matched case-insensitively upstream, so they share a file
fn file_stem(id: &str) -> String {
    id.trim()
        .trim_start_matches('@')
        .to_lowercase()
        .replace(['/', '\\'], "_")
}

impl ArtifactStore for FileArtifactStore {
    fn is_cached(&self, id: &str) -> bool {
        self.read(id).is_some()
    }

    fn is_failed(&self, id: &str) -> bool {
        self.failed_path(id).is_file()
    }

    fn read(&self, id: &str) -> Option<Value> {
        let path = self.item_path(id);
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Ignoring unreadable artifact {}: {}", path.display(), e);
                None
            }
        }
    }

    fn write(&self, id: &str, item: &Value) -> io::Result<()> {
        fs::create_dir_all(&self.folder)?;
        let json = serde_json::to_string_pretty(item)?;
        // Readers only ever see a complete file
        let path = self.item_path(id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;

        // A found item supersedes an older failure
        let failed = self.failed_path(id);
        if failed.is_file() {
            fs::remove_file(failed)?;
        }
        Ok(())
    }

    fn mark_failed(&self, id: &str) -> io::Result<()> {
        let path = self.failed_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, b"")
    }
}
