use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use boxsync_core::RemoteError;
use thiserror::Error;
use time::OffsetDateTime;

use super::downlock::{DownloadLock, LockOutcome};
use super::{SyncContext, SyncState};
use super::metadata::{Entry, EntryKind, MetadataError};
use super::paths::{self, PathError, cache_path_for};
use super::remote::entry_from_remote;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no such entry: {0}")]
    NotFound(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("{0}")]
    Path(#[from] PathError),
    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Metadata(#[from] MetadataError),
}

#[derive(Debug, Clone, Copy)]
pub struct NodeAttr {
    pub kind: EntryKind,
    pub size: u64,
    /// Unix seconds.
    pub modified: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
}

/// The dispatcher: every filesystem-facing operation funnels through here.
/// An operation's local mutations (cache file, metadata, upload queue) land
/// inside one state-mutex critical section; remote calls run outside it
/// wherever the operation allows.
pub struct Model {
    ctx: Arc<SyncContext>,
}

impl Model {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn trigger_refresh(&self) {
        self.ctx.trigger_refresh();
    }

    pub fn cache_path(&self, path: &str) -> Result<PathBuf, ModelError> {
        Ok(cache_path_for(&self.ctx.cache_root, path)?)
    }

    pub async fn getattr(&self, path: &str) -> Result<NodeAttr, ModelError> {
        let path = paths::normalize(path);
        if path == "/" {
            return Ok(NodeAttr {
                kind: EntryKind::Folder,
                size: 0,
                modified: now_unix(),
            });
        }
        let cache = self.cache_path(&path)?;
        let entry = {
            let state = self.ctx.state.lock().await;
            state.metadata.get(&path).cloned()
        };
        let stat = std::fs::metadata(&cache).ok();

        match (entry, stat) {
            // Pending local edit: the cache copy is the authority.
            (Some(entry), Some(stat)) if !entry.uploaded => Ok(attr_from_stat(&stat)),
            (Some(entry), Some(stat)) => {
                let local = attr_from_stat(&stat);
                if local.modified > entry.modified {
                    Ok(local)
                } else {
                    Ok(attr_from_entry(&entry))
                }
            }
            (Some(entry), None) => Ok(attr_from_entry(&entry)),
            (None, Some(stat)) => Ok(attr_from_stat(&stat)),
            (None, None) => Err(ModelError::NotFound(path)),
        }
    }

    /// Children of `path`: the union of mirrored entries and whatever sits in
    /// the cache directory, deduplicated by name. The placeholder directory
    /// is created so a freshly mirrored folder is browsable before hydration.
    pub async fn readdir(&self, path: &str) -> Result<Vec<(String, EntryKind)>, ModelError> {
        let path = paths::normalize(path);
        let cache = self.cache_path(&path)?;
        std::fs::create_dir_all(&cache)?;

        let mut out: Vec<(String, EntryKind)> = Vec::new();
        {
            let state = self.ctx.state.lock().await;
            for child in state.metadata.children(&path) {
                out.push((child.name.clone(), child.kind));
            }
        }
        for dir_entry in std::fs::read_dir(&cache)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".partial") || name.ends_with(".lock") {
                continue;
            }
            if out.iter().any(|(existing, _)| *existing == name) {
                continue;
            }
            let kind = if dir_entry.file_type()?.is_dir() {
                EntryKind::Folder
            } else {
                EntryKind::File
            };
            out.push((name, kind));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Hydrates the cache copy on demand. The per-path advisory lock keeps
    /// hydration single-flight across tasks and processes; after acquiring
    /// it the need is re-checked, since the previous holder usually did the
    /// work already.
    pub async fn open(&self, path: &str) -> Result<(), ModelError> {
        let path = paths::normalize(path);
        let cache = self.cache_path(&path)?;
        let entry = {
            let state = self.ctx.state.lock().await;
            state.metadata.get(&path).cloned()
        };
        let Some(entry) = entry else {
            if cache.exists() {
                return Ok(());
            }
            return Err(ModelError::NotFound(path));
        };
        if entry.kind.is_folder() || !entry.uploaded {
            return Ok(());
        }
        if !needs_hydration(&cache, &entry) {
            return Ok(());
        }

        let (_guard, outcome) = DownloadLock::acquire(&cache).await?;
        if !needs_hydration(&cache, &entry) {
            if outcome == LockOutcome::Waited {
                eprintln!("[boxsyncd] {path} hydrated by a concurrent open");
            }
            return Ok(());
        }
        eprintln!("[boxsyncd] hydrating {path}");
        self.ctx.remote.download(&entry.path, &cache).await?;
        Ok(())
    }

    pub async fn read(&self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>, ModelError> {
        let path = paths::normalize(path);
        self.open(&path).await?;
        let cache = self.cache_path(&path)?;
        let mut file = std::fs::File::open(&cache)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size as usize];
        let mut read = 0;
        while read < buf.len() {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(buf)
    }

    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<u32, ModelError> {
        let path = paths::normalize(path);
        let cache = self.cache_path(&path)?;
        {
            let mut state = self.ctx.state.lock().await;
            if let Some(parent) = cache.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .open(&cache)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
            drop(file);
            self.mark_pending_locked(&mut state, &path, &cache)?;
        }
        self.ctx.schedule_snapshot();
        Ok(data.len() as u32)
    }

    pub async fn create(&self, path: &str) -> Result<(), ModelError> {
        let path = paths::normalize(path);
        let cache = self.cache_path(&path)?;
        {
            let mut state = self.ctx.state.lock().await;
            if let Some(parent) = cache.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::File::create(&cache)?;
            self.mark_pending_locked(&mut state, &path, &cache)?;
        }
        self.ctx.schedule_snapshot();
        Ok(())
    }

    pub async fn truncate(&self, path: &str, size: u64) -> Result<(), ModelError> {
        let path = paths::normalize(path);
        // Truncating a non-hydrated file must operate on real content.
        self.open(&path).await?;
        let cache = self.cache_path(&path)?;
        {
            let mut state = self.ctx.state.lock().await;
            let file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .open(&cache)?;
            file.set_len(size)?;
            drop(file);
            self.mark_pending_locked(&mut state, &path, &cache)?;
        }
        self.ctx.schedule_snapshot();
        Ok(())
    }

    /// Records the cache file as the new authority for `path` and queues the
    /// push to the remote store. The caller holds the state lock, so the
    /// cache write, the metadata flip and the enqueue land as one step.
    fn mark_pending_locked(
        &self,
        state: &mut SyncState,
        path: &str,
        cache: &Path,
    ) -> Result<(), ModelError> {
        let stat = std::fs::metadata(cache)?;
        let mut entry = state
            .metadata
            .get(path)
            .cloned()
            .unwrap_or_else(|| Entry::new_local(path, EntryKind::File, 0, 0));
        entry.size = stat.len();
        entry.modified = now_unix();
        entry.uploaded = false;
        state.metadata.insert(entry);
        self.ctx
            .queue
            .add_task(cache.to_path_buf(), path.to_string());
        Ok(())
    }

    /// Remote first; the mirror and cache change only after the remote store
    /// accepted the folder.
    pub async fn mkdir(&self, path: &str) -> Result<(), ModelError> {
        let path = paths::normalize(path);
        let created = self.ctx.remote.create_folder(&path).await?;
        let cache = self.cache_path(&path)?;
        {
            let mut state = self.ctx.state.lock().await;
            std::fs::create_dir_all(&cache)?;
            if let Some(entry) = entry_from_remote(&created, true) {
                state.metadata.insert(entry);
            }
        }
        self.ctx.schedule_snapshot();
        Ok(())
    }

    pub async fn rmdir(&self, path: &str) -> Result<(), ModelError> {
        let path = paths::normalize(path);
        let cache = self.cache_path(&path)?;
        let entry = {
            let state = self.ctx.state.lock().await;
            if !state.metadata.children(&path).is_empty() {
                return Err(ModelError::NotEmpty(path));
            }
            state.metadata.get(&path).cloned()
        };
        if cache.exists() && std::fs::read_dir(&cache)?.next().is_some() {
            return Err(ModelError::NotEmpty(path));
        }

        if let Some(entry) = &entry {
            if !entry.is_provisional() {
                if let Err(err) = self.ctx.remote.delete(&path).await {
                    if !err.is_not_found() {
                        return Err(err.into());
                    }
                }
            }
        } else if !cache.exists() {
            return Err(ModelError::NotFound(path));
        }

        {
            let mut state = self.ctx.state.lock().await;
            state.metadata.remove(&path);
            if cache.exists() {
                std::fs::remove_dir(&cache)?;
            }
        }
        self.ctx.schedule_snapshot();
        Ok(())
    }

    pub async fn unlink(&self, path: &str) -> Result<(), ModelError> {
        let path = paths::normalize(path);
        let cache = self.cache_path(&path)?;
        let entry = {
            let state = self.ctx.state.lock().await;
            state.metadata.get(&path).cloned()
        };
        match &entry {
            Some(entry) if !entry.is_provisional() => {
                // Tolerate the remote having dropped it first.
                if let Err(err) = self.ctx.remote.delete(&path).await {
                    if !err.is_not_found() {
                        return Err(err.into());
                    }
                }
            }
            Some(_) => {}
            None if !cache.exists() => return Err(ModelError::NotFound(path)),
            None => {}
        }

        {
            let mut state = self.ctx.state.lock().await;
            state.metadata.remove(&path);
            self.ctx.queue.drain_matching(|task| task.remote == path);
            if cache.exists() {
                std::fs::remove_file(&cache)?;
            }
        }
        self.ctx.schedule_snapshot();
        Ok(())
    }

    /// Rename, remote first. The local mutation cascades over every
    /// descendant key, retargets queued uploads, and moves the cache node,
    /// all without changing any entry's id.
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), ModelError> {
        let from = paths::normalize(from);
        let to = paths::normalize(to);
        let from_cache = self.cache_path(&from)?;
        let to_cache = self.cache_path(&to)?;

        let entry = {
            let state = self.ctx.state.lock().await;
            state.metadata.get(&from).cloned()
        };
        match &entry {
            Some(entry) if !entry.is_provisional() => {
                self.ctx.remote.move_entry(&from, &to).await?;
            }
            Some(_) => {}
            None if !from_cache.exists() => return Err(ModelError::NotFound(from)),
            None => {}
        }

        {
            let mut state = self.ctx.state.lock().await;
            let mut moves: Vec<(String, String)> = Vec::new();
            if let Some(entry) = state.metadata.get(&from) {
                moves.push((entry.id.clone(), to.clone()));
            }
            for descendant in state.metadata.descendants(&from) {
                let mapped = format!("{to}{}", &descendant.path[from.len()..]);
                moves.push((descendant.id, mapped));
            }
            for (id, mapped) in moves {
                state.metadata.update_path(&id, &mapped);
            }

            for (task, at) in self.ctx.queue.drain_matching(|task| {
                task.remote == from || paths::is_descendant_of(&task.remote, &from)
            }) {
                let mapped_remote = if task.remote == from {
                    to.clone()
                } else {
                    format!("{to}{}", &task.remote[from.len()..])
                };
                let mapped_local = self.cache_path(&mapped_remote)?;
                self.ctx.queue.schedule_at(
                    super::uploader::UploadTask {
                        local: mapped_local,
                        remote: mapped_remote,
                    },
                    at,
                );
            }

            if from_cache.exists() {
                if let Some(parent) = to_cache.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::rename(&from_cache, &to_cache)?;
            }
        }
        self.ctx.schedule_snapshot();
        Ok(())
    }

    pub async fn statfs(&self) -> Result<FsStats, ModelError> {
        let usage = self.ctx.remote.space_usage().await?;
        let files = {
            let state = self.ctx.state.lock().await;
            state.metadata.len() as u64
        };
        let free = usage.total.saturating_sub(usage.used);
        Ok(FsStats {
            bsize: 512,
            blocks: usage.total / 512,
            bfree: free / 512,
            bavail: free / 512,
            files,
        })
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn attr_from_entry(entry: &Entry) -> NodeAttr {
    NodeAttr {
        kind: entry.kind,
        size: entry.size,
        modified: entry.modified,
    }
}

fn attr_from_stat(stat: &std::fs::Metadata) -> NodeAttr {
    let modified = stat
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    NodeAttr {
        kind: if stat.is_dir() {
            EntryKind::Folder
        } else {
            EntryKind::File
        },
        size: stat.len(),
        modified,
    }
}

fn needs_hydration(cache: &PathBuf, entry: &Entry) -> bool {
    match std::fs::metadata(cache) {
        Err(_) => true,
        Ok(stat) => attr_from_stat(&stat).modified < entry.modified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testutil::{FakeRemote, fake_context, with_state};

    fn model_over(remote: Arc<FakeRemote>) -> (Model, tempfile::TempDir) {
        let (ctx, dir) = fake_context(remote);
        (Model::new(ctx), dir)
    }

    #[tokio::test]
    async fn root_getattr_is_always_a_directory() {
        let (model, _dir) = model_over(FakeRemote::new());
        let attr = model.getattr("/").await.unwrap();
        assert!(attr.kind.is_folder());
    }

    #[tokio::test]
    async fn create_is_visible_before_any_upload_runs() {
        let (model, _dir) = model_over(FakeRemote::new());
        model.create("/draft.txt").await.unwrap();

        let attr = model.getattr("/draft.txt").await.unwrap();
        assert!(!attr.kind.is_folder());
        assert_eq!(attr.size, 0);
        assert_eq!(model.context().queue.len(), 1);
        with_state(model.context(), |state| {
            let entry = state.metadata.get("/draft.txt").unwrap();
            assert!(!entry.uploaded);
            assert!(entry.is_provisional());
        })
        .await;
    }

    #[tokio::test]
    async fn write_then_read_round_trips_through_the_cache() {
        let (model, _dir) = model_over(FakeRemote::new());
        model.create("/notes.txt").await.unwrap();
        let written = model.write("/notes.txt", 0, b"hello world").await.unwrap();
        assert_eq!(written, 11);

        let data = model.read("/notes.txt", 6, 5).await.unwrap();
        assert_eq!(data, b"world");

        let attr = model.getattr("/notes.txt").await.unwrap();
        assert_eq!(attr.size, 11);
    }

    #[tokio::test]
    async fn truncate_marks_the_entry_pending() {
        let (model, _dir) = model_over(FakeRemote::new());
        model.create("/big.txt").await.unwrap();
        model.write("/big.txt", 0, b"0123456789").await.unwrap();
        model.truncate("/big.txt", 4).await.unwrap();

        let attr = model.getattr("/big.txt").await.unwrap();
        assert_eq!(attr.size, 4);
        with_state(model.context(), |state| {
            assert!(!state.metadata.get("/big.txt").unwrap().uploaded);
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_opens_download_exactly_once() {
        let remote = FakeRemote::with_download_delay(std::time::Duration::from_millis(100));
        remote.seed_file("/big.bin", "id:1", b"payload", 100);
        let (model, _dir) = model_over(Arc::clone(&remote));
        let model = Arc::new(model);

        with_state(model.context(), |state| {
            state.metadata.insert(Entry {
                path: "/big.bin".into(),
                id: "id:1".into(),
                name: "big.bin".into(),
                kind: EntryKind::File,
                size: 7,
                modified: 100,
                uploaded: true,
            });
        })
        .await;

        let a = {
            let model = Arc::clone(&model);
            tokio::spawn(async move { model.open("/big.bin").await })
        };
        let b = {
            let model = Arc::clone(&model);
            tokio::spawn(async move { model.open("/big.bin").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(remote.download_count("/big.bin"), 1);
        assert_eq!(model.read("/big.bin", 0, 16).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn open_never_overwrites_a_pending_edit() {
        let remote = FakeRemote::new();
        remote.seed_file("/doc.txt", "id:1", b"remote version", 9_999_999_999);
        let (model, _dir) = model_over(Arc::clone(&remote));

        model.create("/doc.txt").await.unwrap();
        model.write("/doc.txt", 0, b"local draft").await.unwrap();
        model.open("/doc.txt").await.unwrap();

        assert_eq!(remote.download_count("/doc.txt"), 0);
        assert_eq!(model.read("/doc.txt", 0, 64).await.unwrap(), b"local draft");
    }

    #[tokio::test]
    async fn open_unknown_path_is_not_found() {
        let (model, _dir) = model_over(FakeRemote::new());
        assert!(matches!(
            model.open("/nope").await,
            Err(ModelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn readdir_unions_mirror_and_cache() {
        let (model, _dir) = model_over(FakeRemote::new());
        with_state(model.context(), |state| {
            state.metadata.insert(Entry {
                path: "/remote-only.txt".into(),
                id: "id:1".into(),
                name: "remote-only.txt".into(),
                kind: EntryKind::File,
                size: 1,
                modified: 1,
                uploaded: true,
            });
        })
        .await;
        model.create("/local-only.txt").await.unwrap();
        // Transfer droppings stay invisible.
        std::fs::write(
            model.cache_path("/half.txt.partial").unwrap(),
            b"",
        )
        .unwrap();

        let listing = model.readdir("/").await.unwrap();
        let names: Vec<&str> = listing.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["local-only.txt", "remote-only.txt"]);
    }

    #[tokio::test]
    async fn mkdir_goes_remote_first() {
        let remote = FakeRemote::new();
        let (model, _dir) = model_over(Arc::clone(&remote));
        model.mkdir("/projects").await.unwrap();

        with_state(model.context(), |state| {
            let entry = state.metadata.get("/projects").unwrap();
            assert!(entry.kind.is_folder());
            assert!(entry.uploaded);
            assert!(!entry.is_provisional());
        })
        .await;
        assert!(model.cache_path("/projects").unwrap().is_dir());
    }

    #[tokio::test]
    async fn rmdir_rejects_a_directory_with_children() {
        let (model, _dir) = model_over(FakeRemote::new());
        model.mkdir("/projects").await.unwrap();
        model.create("/projects/a.txt").await.unwrap();

        assert!(matches!(
            model.rmdir("/projects").await,
            Err(ModelError::NotEmpty(_))
        ));

        model.unlink("/projects/a.txt").await.unwrap();
        model.rmdir("/projects").await.unwrap();
        with_state(model.context(), |state| {
            assert!(!state.metadata.contains("/projects"));
        })
        .await;
    }

    #[tokio::test]
    async fn unlink_drops_the_queued_upload() {
        let (model, _dir) = model_over(FakeRemote::new());
        model.create("/gone.txt").await.unwrap();
        assert_eq!(model.context().queue.len(), 1);

        model.unlink("/gone.txt").await.unwrap();

        assert!(model.context().queue.is_empty());
        assert!(!model.cache_path("/gone.txt").unwrap().exists());
        assert!(matches!(
            model.getattr("/gone.txt").await,
            Err(ModelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rename_cascades_and_preserves_ids() {
        let remote = FakeRemote::new();
        let (model, _dir) = model_over(Arc::clone(&remote));
        model.mkdir("/docs").await.unwrap();
        model.create("/docs/a.txt").await.unwrap();
        model.write("/docs/a.txt", 0, b"abc").await.unwrap();

        let (dir_id, file_id) = with_state(model.context(), |state| {
            (
                state.metadata.get("/docs").unwrap().id.clone(),
                state.metadata.get("/docs/a.txt").unwrap().id.clone(),
            )
        })
        .await;

        model.rename("/docs", "/archive").await.unwrap();

        with_state(model.context(), |state| {
            assert!(!state.metadata.contains("/docs"));
            assert_eq!(state.metadata.get("/archive").unwrap().id, dir_id);
            assert_eq!(state.metadata.get("/archive/a.txt").unwrap().id, file_id);
        })
        .await;
        assert_eq!(
            std::fs::read(model.cache_path("/archive/a.txt").unwrap()).unwrap(),
            b"abc"
        );
        // The pending upload followed the rename.
        let retargeted = model
            .context()
            .queue
            .drain_matching(|task| task.remote == "/archive/a.txt");
        assert_eq!(retargeted.len(), 1);
    }

    #[tokio::test]
    async fn open_rehydrates_a_stale_cache_copy() {
        let remote = FakeRemote::new();
        remote.seed_file("/doc.txt", "id:1", b"fresh revision", 0);
        let (model, _dir) = model_over(Arc::clone(&remote));
        let cache = model.cache_path("/doc.txt").unwrap();
        std::fs::write(&cache, b"stale").unwrap();

        with_state(model.context(), |state| {
            state.metadata.insert(Entry {
                path: "/doc.txt".into(),
                id: "id:1".into(),
                name: "doc.txt".into(),
                kind: EntryKind::File,
                size: 14,
                modified: now_unix() + 3600,
                uploaded: true,
            });
        })
        .await;

        model.open("/doc.txt").await.unwrap();

        assert_eq!(remote.download_count("/doc.txt"), 1);
        assert_eq!(std::fs::read(&cache).unwrap(), b"fresh revision");
    }

    #[tokio::test]
    async fn write_mutates_the_cache_only_inside_the_critical_section() {
        let (model, _dir) = model_over(FakeRemote::new());
        model.create("/a.txt").await.unwrap();
        let model = Arc::new(model);
        let cache = model.cache_path("/a.txt").unwrap();

        let guard = model.context().state.lock().await;
        let writer = {
            let model = Arc::clone(&model);
            tokio::spawn(async move { model.write("/a.txt", 0, b"xyz").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // The state lock is held, so the cache file has not moved yet.
        assert_eq!(std::fs::read(&cache).unwrap(), b"");
        drop(guard);

        writer.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&cache).unwrap(), b"xyz");
    }

    #[tokio::test]
    async fn rename_applies_local_changes_in_one_critical_section() {
        let remote = FakeRemote::new();
        let (model, _dir) = model_over(Arc::clone(&remote));
        model.mkdir("/docs").await.unwrap();
        model.create("/docs/a.txt").await.unwrap();
        let model = Arc::new(model);

        let guard = model.context().state.lock().await;
        let renamer = {
            let model = Arc::clone(&model);
            tokio::spawn(async move { model.rename("/docs", "/archive").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // Nothing local moves while another call holds the state lock.
        assert!(model.cache_path("/docs/a.txt").unwrap().exists());
        drop(guard);

        renamer.await.unwrap().unwrap();
        assert!(!model.cache_path("/docs/a.txt").unwrap().exists());
        assert!(model.cache_path("/archive/a.txt").unwrap().exists());
    }

    #[tokio::test]
    async fn statfs_reports_block_accounting() {
        let (model, _dir) = model_over(FakeRemote::new());
        let stats = model.statfs().await.unwrap();
        assert_eq!(stats.bsize, 512);
        assert_eq!(stats.blocks, 10 * 1024 * 1024 / 512);
        assert_eq!(stats.bfree, 9 * 1024 * 1024 / 512);
    }
}
