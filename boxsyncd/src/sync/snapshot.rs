use std::io::Write;
use std::path::PathBuf;

use rustix::fs::{FlockOperation, flock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::metadata::{Entry, MetadataStore};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct SnapshotDoc {
    cursor: Option<String>,
    entries: Vec<Entry>,
}

/// Durable form of the metadata store plus the delta cursor. The file is
/// rewritten whole under an exclusive advisory lock so a concurrent reader in
/// another process never observes a half-written document.
#[derive(Debug, Clone)]
pub struct Snapshot {
    path: PathBuf,
}

impl Snapshot {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Loads the persisted store. A missing file yields an empty store.
    /// Every loaded file entry has `uploaded` forced to `true`: edits that
    /// were pending when the process died are treated as remote authority
    /// again rather than silently re-pushed with stale content.
    pub fn load(&self) -> Result<(MetadataStore, Option<String>), SnapshotError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok((MetadataStore::new(), None));
            }
            Err(err) => return Err(err.into()),
        };
        let doc: SnapshotDoc = serde_json::from_slice(&raw)?;
        let mut store = MetadataStore::new();
        for mut entry in doc.entries {
            entry.uploaded = true;
            store.insert(entry);
        }
        Ok((store, doc.cursor))
    }

    pub fn save(
        &self,
        store: &MetadataStore,
        cursor: Option<&str>,
    ) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut entries: Vec<Entry> = store.entries().cloned().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let doc = SnapshotDoc {
            cursor: cursor.map(str::to_string),
            entries,
        };
        let payload = serde_json::to_vec_pretty(&doc)?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)?;
        flock(&file, FlockOperation::LockExclusive).map_err(std::io::Error::from)?;
        file.set_len(0)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        // Lock released when the handle closes.
        Ok(())
    }
}
