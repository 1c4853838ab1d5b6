pub mod backoff;
pub mod downlock;
pub mod metadata;
pub mod model;
pub mod paths;
pub mod refresher;
pub mod remote;
pub mod snapshot;
pub mod uploader;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify};

use metadata::MetadataStore;
use remote::RemoteStore;
use snapshot::{Snapshot, SnapshotError};
use uploader::UploadQueue;

/// Everything guarded by the single dispatcher mutex: the metadata mirror
/// and the delta cursor it was last reconciled against.
pub struct SyncState {
    pub metadata: MetadataStore,
    pub cursor: Option<String>,
}

/// Shared wiring between the dispatcher and the background workers.
pub struct SyncContext {
    pub remote: Arc<dyn RemoteStore>,
    pub state: Mutex<SyncState>,
    pub queue: UploadQueue,
    pub refresh: Notify,
    pub snapshot: Snapshot,
    pub cache_root: PathBuf,
    stop: AtomicBool,
    pub shutdown: Notify,
}

impl SyncContext {
    /// Loads the persisted snapshot and wires up the shared state. A missing
    /// snapshot starts empty; a corrupt one is an error for the caller.
    pub fn bootstrap(
        remote: Arc<dyn RemoteStore>,
        snapshot: Snapshot,
        cache_root: PathBuf,
    ) -> Result<Arc<Self>, SnapshotError> {
        let (metadata, cursor) = snapshot.load()?;
        Ok(Arc::new(Self {
            remote,
            state: Mutex::new(SyncState { metadata, cursor }),
            queue: UploadQueue::new(),
            refresh: Notify::new(),
            snapshot,
            cache_root,
            stop: AtomicBool::new(false),
            shutdown: Notify::new(),
        }))
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        self.refresh.notify_waiters();
    }

    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn trigger_refresh(&self) {
        self.refresh.notify_one();
    }

    /// Rewrites the snapshot in the background after a mutation; errors are
    /// logged, the in-memory state stays authoritative.
    pub fn schedule_snapshot(self: &Arc<Self>) {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = ctx.flush_snapshot().await {
                eprintln!("[boxsyncd] snapshot flush failed: {err}");
            }
        });
    }

    pub async fn flush_snapshot(&self) -> Result<(), SnapshotError> {
        let state = self.state.lock().await;
        self.snapshot.save(&state.metadata, state.cursor.as_deref())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use boxsync_core::{ListPage, RemoteEntry, RemoteError, SpaceUsage};
    use reqwest::StatusCode;
    use time::OffsetDateTime;
    use time::format_description::well_known::Rfc3339;

    use super::remote::RemoteStore;
    use super::snapshot::Snapshot;
    use super::{SyncContext, SyncState};

    fn rfc3339(unix: i64) -> String {
        OffsetDateTime::from_unix_timestamp(unix)
            .unwrap()
            .format(&Rfc3339)
            .unwrap()
    }

    #[derive(Clone)]
    struct FakeFile {
        id: String,
        data: Vec<u8>,
        modified: i64,
    }

    #[derive(Default)]
    struct FakeInner {
        files: HashMap<String, FakeFile>,
        folders: HashMap<String, String>,
        change_pages: Vec<ListPage>,
        uploads: Vec<String>,
        downloads: HashMap<String, u32>,
        failing_uploads: HashMap<String, u32>,
        next_id: u64,
        next_cursor: u64,
    }

    /// In-memory stand-in for the HTTP client, with call counters for the
    /// debounce and single-flight properties.
    #[derive(Default)]
    pub struct FakeRemote {
        inner: StdMutex<FakeInner>,
        /// Artificial latency per download, to widen race windows in
        /// concurrency tests.
        pub download_delay: Option<Duration>,
    }

    impl FakeRemote {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn with_download_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                download_delay: Some(delay),
                ..Self::default()
            })
        }

        pub fn seed_file(&self, path: &str, id: &str, data: &[u8], modified: i64) {
            let mut inner = self.inner.lock().unwrap();
            inner.files.insert(
                path.to_string(),
                FakeFile {
                    id: id.to_string(),
                    data: data.to_vec(),
                    modified,
                },
            );
        }

        pub fn push_change_page(&self, entries: Vec<RemoteEntry>, has_more: bool) {
            let mut inner = self.inner.lock().unwrap();
            inner.next_cursor += 1;
            let cursor = format!("cursor-{}", inner.next_cursor);
            inner.change_pages.push(ListPage {
                entries,
                cursor,
                has_more,
            });
        }

        /// Makes the next `count` uploads to `remote_path` fail with a 503.
        pub fn fail_uploads(&self, remote_path: &str, count: u32) {
            let mut inner = self.inner.lock().unwrap();
            inner.failing_uploads.insert(remote_path.to_string(), count);
        }

        pub fn upload_log(&self) -> Vec<String> {
            self.inner.lock().unwrap().uploads.clone()
        }

        pub fn download_count(&self, path: &str) -> u32 {
            self.inner
                .lock()
                .unwrap()
                .downloads
                .get(path)
                .copied()
                .unwrap_or(0)
        }

        pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
            self.inner
                .lock()
                .unwrap()
                .files
                .get(path)
                .map(|f| f.data.clone())
        }

        fn service_unavailable() -> RemoteError {
            RemoteError::Api {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: "unavailable".to_string(),
            }
        }

        fn not_found(path: &str) -> RemoteError {
            RemoteError::Api {
                status: StatusCode::NOT_FOUND,
                body: format!("no entry at {path}"),
            }
        }
    }

    #[async_trait]
    impl RemoteStore for FakeRemote {
        async fn list_folder(
            &self,
            _path: &str,
            _recursive: bool,
        ) -> Result<ListPage, RemoteError> {
            let mut inner = self.inner.lock().unwrap();
            let mut entries: Vec<RemoteEntry> = inner
                .folders
                .iter()
                .map(|(path, id)| RemoteEntry::Folder {
                    id: id.clone(),
                    path: path.clone(),
                    name: super::paths::leaf_name(path),
                })
                .collect();
            entries.extend(inner.files.iter().map(|(path, file)| RemoteEntry::File {
                id: file.id.clone(),
                path: path.clone(),
                name: super::paths::leaf_name(path),
                size: file.data.len() as u64,
                modified: rfc3339(file.modified),
            }));
            entries.sort_by(|a, b| a.path().cmp(b.path()));
            inner.next_cursor += 1;
            Ok(ListPage {
                entries,
                cursor: format!("cursor-{}", inner.next_cursor),
                has_more: false,
            })
        }

        async fn get_changes(&self, cursor: &str) -> Result<ListPage, RemoteError> {
            let mut inner = self.inner.lock().unwrap();
            if inner.change_pages.is_empty() {
                return Ok(ListPage {
                    entries: Vec::new(),
                    cursor: cursor.to_string(),
                    has_more: false,
                });
            }
            Ok(inner.change_pages.remove(0))
        }

        async fn get_metadata(&self, path: &str) -> Result<RemoteEntry, RemoteError> {
            let inner = self.inner.lock().unwrap();
            if let Some(file) = inner.files.get(path) {
                return Ok(RemoteEntry::File {
                    id: file.id.clone(),
                    path: path.to_string(),
                    name: super::paths::leaf_name(path),
                    size: file.data.len() as u64,
                    modified: rfc3339(file.modified),
                });
            }
            if let Some(id) = inner.folders.get(path) {
                return Ok(RemoteEntry::Folder {
                    id: id.clone(),
                    path: path.to_string(),
                    name: super::paths::leaf_name(path),
                });
            }
            Err(Self::not_found(path))
        }

        async fn download(&self, remote_path: &str, target: &Path) -> Result<(), RemoteError> {
            let data = {
                let mut inner = self.inner.lock().unwrap();
                *inner.downloads.entry(remote_path.to_string()).or_default() += 1;
                inner
                    .files
                    .get(remote_path)
                    .map(|f| f.data.clone())
                    .ok_or_else(|| Self::not_found(remote_path))?
            };
            if let Some(delay) = self.download_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(target, data).await?;
            Ok(())
        }

        async fn upload(
            &self,
            source: &Path,
            remote_path: &str,
            _overwrite: bool,
        ) -> Result<RemoteEntry, RemoteError> {
            let data = tokio::fs::read(source).await?;
            let mut inner = self.inner.lock().unwrap();
            if let Some(remaining) = inner.failing_uploads.get_mut(remote_path) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Self::service_unavailable());
                }
            }
            inner.uploads.push(remote_path.to_string());
            let id = match inner.files.get(remote_path) {
                Some(existing) => existing.id.clone(),
                None => {
                    inner.next_id += 1;
                    format!("id:{}", inner.next_id)
                }
            };
            let modified = OffsetDateTime::now_utc().unix_timestamp();
            let size = data.len() as u64;
            inner.files.insert(
                remote_path.to_string(),
                FakeFile {
                    id: id.clone(),
                    data,
                    modified,
                },
            );
            Ok(RemoteEntry::File {
                id,
                path: remote_path.to_string(),
                name: super::paths::leaf_name(remote_path),
                size,
                modified: rfc3339(modified),
            })
        }

        async fn create_folder(&self, path: &str) -> Result<RemoteEntry, RemoteError> {
            let mut inner = self.inner.lock().unwrap();
            inner.next_id += 1;
            let id = format!("id:{}", inner.next_id);
            inner.folders.insert(path.to_string(), id.clone());
            Ok(RemoteEntry::Folder {
                id,
                path: path.to_string(),
                name: super::paths::leaf_name(path),
            })
        }

        async fn delete(&self, path: &str) -> Result<(), RemoteError> {
            let mut inner = self.inner.lock().unwrap();
            if inner.files.remove(path).is_none() && inner.folders.remove(path).is_none() {
                return Err(Self::not_found(path));
            }
            Ok(())
        }

        async fn move_entry(&self, from: &str, to: &str) -> Result<RemoteEntry, RemoteError> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(file) = inner.files.remove(from) {
                let entry = RemoteEntry::File {
                    id: file.id.clone(),
                    path: to.to_string(),
                    name: super::paths::leaf_name(to),
                    size: file.data.len() as u64,
                    modified: rfc3339(file.modified),
                };
                inner.files.insert(to.to_string(), file);
                return Ok(entry);
            }
            if let Some(id) = inner.folders.remove(from) {
                inner.folders.insert(to.to_string(), id.clone());
                return Ok(RemoteEntry::Folder {
                    id,
                    path: to.to_string(),
                    name: super::paths::leaf_name(to),
                });
            }
            Err(Self::not_found(from))
        }

        async fn space_usage(&self) -> Result<SpaceUsage, RemoteError> {
            Ok(SpaceUsage {
                total: 10 * 1024 * 1024,
                used: 1024 * 1024,
            })
        }
    }

    /// Context over a fake remote and a temp cache root. The tempdir is
    /// returned so it outlives the test body.
    pub fn fake_context(remote: Arc<FakeRemote>) -> (Arc<SyncContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = Snapshot::new(dir.path().join("state.json"));
        let cache_root = dir.path().join("cache");
        std::fs::create_dir_all(&cache_root).unwrap();
        let ctx = SyncContext::bootstrap(remote, snapshot, cache_root).unwrap();
        (ctx, dir)
    }

    pub async fn with_state<R>(
        ctx: &Arc<SyncContext>,
        f: impl FnOnce(&mut SyncState) -> R,
    ) -> R {
        let mut state = ctx.state.lock().await;
        f(&mut state)
    }
}
