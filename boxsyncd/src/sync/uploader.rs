use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use boxsync_core::{RemoteEntry, RemoteError};

use super::SyncContext;
use super::backoff::RetryPolicy;
use super::remote::parse_modified;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadTask {
    pub local: PathBuf,
    pub remote: String,
}

/// Outstanding uploads, keyed by task and stamped with the last touch time.
/// Re-adding a task refreshes the stamp, which is what debounces a burst of
/// writes into one transfer. A stamp in the future encodes a retry delay.
#[derive(Debug, Default)]
pub struct UploadQueue {
    pending: StdMutex<HashMap<UploadTask, Instant>>,
    failed: StdMutex<Vec<UploadTask>>,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&self, local: PathBuf, remote: String) {
        let task = UploadTask { local, remote };
        self.pending
            .lock()
            .expect("upload queue poisoned")
            .insert(task, Instant::now());
    }

    pub fn schedule_at(&self, task: UploadTask, at: Instant) {
        self.pending
            .lock()
            .expect("upload queue poisoned")
            .insert(task, at);
    }

    pub fn contains_remote(&self, remote: &str) -> bool {
        self.pending
            .lock()
            .expect("upload queue poisoned")
            .keys()
            .any(|task| task.remote == remote)
    }

    /// Removes and returns every pending task matching `pred`, with its
    /// stamp. Used by rename and unlink to retarget or drop queued work.
    pub fn drain_matching(
        &self,
        pred: impl Fn(&UploadTask) -> bool,
    ) -> Vec<(UploadTask, Instant)> {
        let mut pending = self.pending.lock().expect("upload queue poisoned");
        let matching: Vec<UploadTask> = pending.keys().filter(|t| pred(t)).cloned().collect();
        matching
            .into_iter()
            .filter_map(|task| pending.remove(&task).map(|at| (task, at)))
            .collect()
    }

    /// Takes the tasks that are ready to go: quiescent for at least
    /// `quiet_for`, or everything not delayed into the future when `force`
    /// is set. Most recently touched first.
    pub fn take_ready(&self, quiet_for: Duration, force: bool) -> Vec<(UploadTask, Instant)> {
        let now = Instant::now();
        let mut pending = self.pending.lock().expect("upload queue poisoned");
        let ready_keys: Vec<UploadTask> = pending
            .iter()
            .filter(|(_, at)| {
                now.checked_duration_since(**at)
                    .is_some_and(|quiet| force || quiet >= quiet_for)
            })
            .map(|(task, _)| task.clone())
            .collect();
        let mut ready: Vec<(UploadTask, Instant)> = ready_keys
            .into_iter()
            .filter_map(|task| pending.remove(&task).map(|at| (task, at)))
            .collect();
        ready.sort_by(|a, b| b.1.cmp(&a.1));
        ready
    }

    pub fn record_failed(&self, task: UploadTask) {
        self.failed.lock().expect("upload queue poisoned").push(task);
    }

    pub fn failed_tasks(&self) -> Vec<UploadTask> {
        self.failed.lock().expect("upload queue poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("upload queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pushes debounced local edits to the remote store.
pub struct UploadWorker {
    ctx: Arc<SyncContext>,
    sync_interval: Duration,
    max_sync_interval: Duration,
    retry: RetryPolicy,
    attempts: HashMap<UploadTask, u32>,
    last_force: Instant,
}

impl UploadWorker {
    pub fn new(
        ctx: Arc<SyncContext>,
        sync_interval: Duration,
        max_sync_interval: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ctx,
            sync_interval,
            max_sync_interval,
            retry,
            attempts: HashMap::new(),
            last_force: Instant::now(),
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.sync_interval) => {}
                _ = self.ctx.shutdown.notified() => {}
            }
            if self.ctx.stopping() {
                break;
            }
            self.run_once().await;
        }
        eprintln!("[boxsyncd] upload worker stopped");
    }

    /// One tick: drain the ready batch, newest first, stopping at the first
    /// failure. Unprocessed tasks keep their original stamps so they come
    /// back on the next tick.
    pub async fn run_once(&mut self) {
        let force = self.last_force.elapsed() >= self.max_sync_interval;
        let batch = self.ctx.queue.take_ready(self.sync_interval, force);
        if force {
            self.last_force = Instant::now();
        }
        if batch.is_empty() {
            return;
        }
        eprintln!("[boxsyncd] uploading {} entr(ies)", batch.len());
        for (idx, (task, _)) in batch.iter().enumerate() {
            match self.upload_one(task).await {
                Ok(()) => {
                    self.attempts.remove(task);
                }
                Err(err) => {
                    eprintln!("[boxsyncd] upload of {} failed: {err}", task.remote);
                    self.handle_failure(task.clone(), &err);
                    for (rest, at) in &batch[idx + 1..] {
                        self.ctx.queue.schedule_at(rest.clone(), *at);
                    }
                    break;
                }
            }
        }
    }

    async fn upload_one(&self, task: &UploadTask) -> Result<(), RemoteError> {
        let uploaded = self
            .ctx
            .remote
            .upload(&task.local, &task.remote, true)
            .await?;
        self.mark_uploaded(task, &uploaded).await;
        self.ctx.schedule_snapshot();
        Ok(())
    }

    async fn mark_uploaded(&self, task: &UploadTask, uploaded: &RemoteEntry) {
        let mut state = self.ctx.state.lock().await;
        let Some(existing) = state.metadata.get(&task.remote) else {
            // Removed while the transfer was in flight.
            return;
        };
        let mut entry = existing.clone();
        if let RemoteEntry::File { size, modified, .. } = uploaded {
            entry.size = *size;
            entry.modified = parse_modified(modified);
        }
        // A write that landed mid-transfer re-queued the task; the cache copy
        // is still ahead of what we just pushed.
        entry.uploaded = !self.ctx.queue.contains_remote(&task.remote);
        state.metadata.insert(entry);
        if let Some(remote_id) = uploaded.id() {
            let _ = state.metadata.update_id(&task.remote, remote_id);
        }
    }

    fn handle_failure(&mut self, task: UploadTask, err: &RemoteError) {
        let attempt = self.attempts.entry(task.clone()).or_insert(0);
        *attempt += 1;
        let attempt = *attempt;
        if !err.is_retryable() || self.retry.exhausted(attempt) {
            eprintln!(
                "[boxsyncd] giving up on {} after {attempt} attempt(s)",
                task.remote
            );
            self.attempts.remove(&task);
            self.ctx.queue.record_failed(task);
            return;
        }
        let delay = self.retry.delay(attempt);
        self.ctx.queue.schedule_at(task, Instant::now() + delay);
    }
}
