use std::sync::Arc;
use std::time::Duration;

use boxsync_core::{RemoteEntry, RemoteError};

use super::metadata::Entry;
use super::paths::cache_path_for;
use super::remote::entry_from_remote;
use super::{SyncContext, SyncState};

/// Pulls remote changes into the metadata mirror. First run does a full
/// recursive listing; afterwards the persisted cursor drives an incremental
/// change feed. Woken by the notification listener and by a periodic timer.
pub struct RefreshWorker {
    ctx: Arc<SyncContext>,
    poll_interval: Duration,
}

impl RefreshWorker {
    pub fn new(ctx: Arc<SyncContext>, poll_interval: Duration) -> Self {
        Self { ctx, poll_interval }
    }

    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.ctx.refresh.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            if self.ctx.stopping() {
                break;
            }
            if let Err(err) = self.run_once().await {
                // The cursor was not advanced; the next pass re-fetches the
                // same window and reapplying a delta is idempotent.
                eprintln!("[boxsyncd] refresh failed: {err}");
            }
        }
        eprintln!("[boxsyncd] refresh worker stopped");
    }

    pub async fn run_once(&self) -> Result<(), RemoteError> {
        let cursor = { self.ctx.state.lock().await.cursor.clone() };
        let mut page = match &cursor {
            None => {
                eprintln!("[boxsyncd] no cursor, listing the full tree");
                self.ctx.remote.list_folder("/", true).await?
            }
            Some(cursor) => self.ctx.remote.get_changes(cursor).await?,
        };
        loop {
            let applied = {
                let mut state = self.ctx.state.lock().await;
                let applied = self.apply_entries(&mut state, &page.entries);
                state.cursor = Some(page.cursor.clone());
                applied
            };
            if applied > 0 {
                eprintln!("[boxsyncd] reconciled {applied} change(s)");
            }
            if !page.has_more {
                break;
            }
            page = self.ctx.remote.get_changes(&page.cursor).await?;
        }
        self.ctx.schedule_snapshot();
        Ok(())
    }

    fn apply_entries(&self, state: &mut SyncState, entries: &[RemoteEntry]) -> usize {
        let mut applied = 0;
        for remote_entry in entries {
            match remote_entry {
                RemoteEntry::Deleted { path } => {
                    if self.apply_delete(state, path) {
                        applied += 1;
                    }
                }
                other => {
                    if let Some(incoming) = entry_from_remote(other, true) {
                        if self.apply_upsert(state, incoming) {
                            applied += 1;
                        }
                    }
                }
            }
        }
        applied
    }

    fn apply_upsert(&self, state: &mut SyncState, incoming: Entry) -> bool {
        if let Some(current) = state.metadata.get_by_id(&incoming.id).cloned() {
            if current.path != incoming.path {
                if state
                    .metadata
                    .get(&incoming.path)
                    .is_some_and(|dest| !dest.uploaded)
                {
                    // A pending local edit occupies the destination; leave
                    // both entries alone and let the upload worker settle it.
                    return false;
                }
                // Same id at a new path: a remote rename or move.
                state.metadata.update_path(&incoming.id, &incoming.path);
                self.relocate_cache(&current, &incoming);
            }
            let merged = Entry {
                uploaded: current.uploaded,
                ..incoming
            };
            state.metadata.insert(merged);
            return true;
        }

        if let Some(existing) = state.metadata.get(&incoming.path).cloned() {
            if !existing.uploaded {
                // A pending local edit at this path outranks remote metadata;
                // the upload worker settles the conflict.
                return false;
            }
            // Replaced remotely under a new id.
            state.metadata.remove(&incoming.path);
        }
        if incoming.kind.is_folder() {
            if let Ok(dir) = cache_path_for(&self.ctx.cache_root, &incoming.path) {
                let _ = std::fs::create_dir_all(dir);
            }
        }
        state.metadata.insert(incoming);
        true
    }

    /// Remote deletion. Never removes a node whose local edit has not been
    /// pushed yet; that cache copy is the only copy.
    fn apply_delete(&self, state: &mut SyncState, path: &str) -> bool {
        let Some(entry) = state.metadata.get(path).cloned() else {
            return false;
        };
        if !entry.kind.is_folder() {
            if !entry.uploaded {
                return false;
            }
            state.metadata.remove(path);
            self.remove_cache_file(path);
            return true;
        }

        let mut pending_descendant = false;
        for descendant in state.metadata.descendants(path) {
            if descendant.uploaded {
                state.metadata.remove(&descendant.path);
                if !descendant.kind.is_folder() {
                    self.remove_cache_file(&descendant.path);
                }
            } else {
                pending_descendant = true;
            }
        }
        if pending_descendant || !entry.uploaded {
            // The directory stays while anything under it is pending.
            return true;
        }
        state.metadata.remove(path);
        if let Ok(dir) = cache_path_for(&self.ctx.cache_root, path) {
            let _ = std::fs::remove_dir_all(dir);
        }
        true
    }

    fn relocate_cache(&self, old: &Entry, new: &Entry) {
        let (Ok(from), Ok(to)) = (
            cache_path_for(&self.ctx.cache_root, &old.path),
            cache_path_for(&self.ctx.cache_root, &new.path),
        ) else {
            return;
        };
        if new.kind.is_folder() {
            if from.exists() {
                let _ = std::fs::rename(&from, &to);
            } else {
                let _ = std::fs::create_dir_all(&to);
            }
            return;
        }
        if from.exists() {
            if let Some(parent) = to.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = std::fs::rename(&from, &to);
        }
    }

    fn remove_cache_file(&self, path: &str) {
        if let Ok(cache) = cache_path_for(&self.ctx.cache_root, path) {
            let _ = std::fs::remove_file(cache);
        }
    }
}
