use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("unknown path: {0}")]
    UnknownPath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Folder => "folder",
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, EntryKind::Folder)
    }
}

/// One mirrored node. `uploaded == false` marks a pending local edit: the
/// cache copy is the authority and remote-driven removal must not touch it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub path: String,
    pub id: String,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Unix seconds.
    pub modified: i64,
    pub uploaded: bool,
}

const LOCAL_ID_PREFIX: &str = "local-";

impl Entry {
    /// Entry for a node created locally that the remote has never seen. The
    /// provisional id is replaced by the remote one on first upload.
    pub fn new_local(path: &str, kind: EntryKind, size: u64, modified: i64) -> Self {
        Self {
            path: path.to_string(),
            id: format!("{LOCAL_ID_PREFIX}{}", uuid::Uuid::new_v4()),
            name: super::paths::leaf_name(path),
            kind,
            size,
            modified,
            uploaded: false,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }
}

/// In-memory metadata mirror, dual-indexed by path and by stable id. Both
/// indexes are kept coherent by every mutator: one path per id, one id per
/// path, at any instant.
#[derive(Debug, Default, Clone)]
pub struct MetadataStore {
    path_to_id: HashMap<String, String>,
    by_id: HashMap<String, Entry>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.path_to_id.get(path).and_then(|id| self.by_id.get(id))
    }

    pub fn get_by_id(&self, id: &str) -> Option<&Entry> {
        self.by_id.get(id)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.path_to_id.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.path_to_id.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.by_id.values()
    }

    /// Inserts or replaces the entry at `entry.path`. A path that is already
    /// known keeps its existing id regardless of what the caller passed in.
    pub fn insert(&mut self, mut entry: Entry) {
        if let Some(existing) = self.path_to_id.get(&entry.path) {
            if *existing != entry.id {
                entry.id = existing.clone();
            }
        }
        self.path_to_id
            .insert(entry.path.clone(), entry.id.clone());
        self.by_id.insert(entry.id.clone(), entry);
    }

    /// Removes both index sides and returns the entry.
    pub fn remove(&mut self, path: &str) -> Option<Entry> {
        let id = self.path_to_id.remove(path)?;
        self.by_id.remove(&id)
    }

    /// Reassigns the id of a known path, typically swapping a provisional
    /// local id for the remote one after the first successful upload.
    pub fn update_id(&mut self, path: &str, new_id: &str) -> Result<(), MetadataError> {
        let old_id = self
            .path_to_id
            .get(path)
            .cloned()
            .ok_or_else(|| MetadataError::UnknownPath(path.to_string()))?;
        if old_id == new_id {
            return Ok(());
        }
        let mut entry = match self.by_id.remove(&old_id) {
            Some(entry) => entry,
            None => return Err(MetadataError::UnknownPath(path.to_string())),
        };
        entry.id = new_id.to_string();
        self.path_to_id.insert(path.to_string(), new_id.to_string());
        self.by_id.insert(new_id.to_string(), entry);
        Ok(())
    }

    /// Moves the entry with `id` to `new_path`, keeping its id. Remote-rename
    /// reconciliation; a no-op when the id is unknown. An entry already
    /// sitting at `new_path` under a different id is evicted, so neither
    /// index can end up pointing at an orphan.
    pub fn update_path(&mut self, id: &str, new_path: &str) {
        if !self.by_id.contains_key(id) {
            return;
        }
        if let Some(occupant) = self.path_to_id.get(new_path).cloned() {
            if occupant != id {
                self.by_id.remove(&occupant);
            }
        }
        let Some(entry) = self.by_id.get_mut(id) else {
            return;
        };
        let old_path = std::mem::replace(&mut entry.path, new_path.to_string());
        entry.name = super::paths::leaf_name(new_path);
        self.path_to_id.remove(&old_path);
        self.path_to_id.insert(new_path.to_string(), id.to_string());
    }

    /// Immediate children of the directory `dir`.
    pub fn children(&self, dir: &str) -> Vec<&Entry> {
        self.by_id
            .values()
            .filter(|entry| super::paths::parent_of(&entry.path) == dir && entry.path != dir)
            .collect()
    }

    /// Every entry strictly below the directory `prefix`.
    pub fn descendants(&self, prefix: &str) -> Vec<Entry> {
        self.by_id
            .values()
            .filter(|entry| super::paths::is_descendant_of(&entry.path, prefix))
            .cloned()
            .collect()
    }
}
