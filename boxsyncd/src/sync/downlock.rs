use std::path::{Path, PathBuf};

use rustix::fs::{FlockOperation, flock};

/// How the lock was obtained. `Waited` means another holder ran in between,
/// so the caller should re-check whether the work is still needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Waited,
}

/// Exclusive advisory lock file guarding hydration of one cache path. The
/// lock lives in a `<name>.lock` sibling so it also serializes against other
/// processes sharing the cache. Released (and the lock file removed) on drop.
pub struct DownloadLock {
    _file: std::fs::File,
    lock_path: PathBuf,
}

impl DownloadLock {
    pub async fn acquire(target: &Path) -> std::io::Result<(Self, LockOutcome)> {
        let lock_path = lock_path_for(target);
        if let Some(parent) = lock_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut waited = false;
        loop {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&lock_path)?;
            let file = match flock(&file, FlockOperation::NonBlockingLockExclusive) {
                Ok(()) => file,
                Err(rustix::io::Errno::WOULDBLOCK) => {
                    // Contended: wait for the current holder off the async
                    // threads, then report that someone else ran first.
                    waited = true;
                    tokio::task::spawn_blocking(move || {
                        flock(&file, FlockOperation::LockExclusive)
                            .map_err(std::io::Error::from)?;
                        Ok::<std::fs::File, std::io::Error>(file)
                    })
                    .await
                    .map_err(std::io::Error::other)??
                }
                Err(err) => return Err(err.into()),
            };
            // The holder unlinks the file on release, so a lock won here may
            // be on an inode that is no longer at `lock_path`. Such a lock
            // serializes nothing; re-open and lock the current file instead.
            if file_matches_path(&file, &lock_path)? {
                let outcome = if waited {
                    LockOutcome::Waited
                } else {
                    LockOutcome::Acquired
                };
                return Ok((
                    Self {
                        _file: file,
                        lock_path,
                    },
                    outcome,
                ));
            }
        }
    }
}

fn file_matches_path(file: &std::fs::File, path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?.ino();
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.ino() == held),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

impl Drop for DownloadLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}
