use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use boxsync_core::RemoteClient;

use crate::notify_listener::NotifyListener;
use crate::sync::backoff::RetryPolicy;
use crate::sync::refresher::RefreshWorker;
use crate::sync::snapshot::Snapshot;
use crate::sync::uploader::UploadWorker;
use crate::sync::{SyncContext, remote::RemoteStore};

const APP_DIR_NAME: &str = "boxsync";
const DEFAULT_ACCOUNT_ID: &str = "me";
const DEFAULT_SYNC_SECS: u64 = 10;
const DEFAULT_MAX_SYNC_SECS: u64 = 120;
const DEFAULT_REFRESH_POLL_SECS: u64 = 60;
const DEFAULT_MAX_RETRY_ATTEMPTS: u64 = 8;
const DEFAULT_NOTIFY_RECONNECTS: u64 = 10;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub cache_root: PathBuf,
    pub state_file: PathBuf,
    pub api_base_url: Option<String>,
    pub token: String,
    pub account_id: String,
    pub sync_interval: Duration,
    pub max_sync_interval: Duration,
    pub refresh_poll_interval: Duration,
    pub notify_url: Option<String>,
    pub max_retry_attempts: u32,
    pub notify_max_reconnects: u32,
    pub enable_upload_worker: bool,
    pub enable_refresh_worker: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let cache_root = std::env::var("BOXSYNC_CACHE_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::cache_dir()
                    .unwrap_or_else(std::env::temp_dir)
                    .join(APP_DIR_NAME)
            });
        let state_file = std::env::var("BOXSYNC_STATE_FILE")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(std::env::temp_dir)
                    .join(APP_DIR_NAME)
                    .join("state.json")
            });
        let token = std::env::var("BOXSYNC_TOKEN")
            .context("BOXSYNC_TOKEN is required (set it in the environment or a .env file)")?;

        Ok(Self {
            cache_root,
            state_file,
            api_base_url: std::env::var("BOXSYNC_API_URL").ok(),
            token,
            account_id: std::env::var("BOXSYNC_ACCOUNT_ID")
                .unwrap_or_else(|_| DEFAULT_ACCOUNT_ID.to_string()),
            sync_interval: Duration::from_secs(read_u64_env(
                "BOXSYNC_SYNC_SECS",
                DEFAULT_SYNC_SECS,
            )),
            max_sync_interval: Duration::from_secs(read_u64_env(
                "BOXSYNC_MAX_SYNC_SECS",
                DEFAULT_MAX_SYNC_SECS,
            )),
            refresh_poll_interval: Duration::from_secs(read_u64_env(
                "BOXSYNC_REFRESH_POLL_SECS",
                DEFAULT_REFRESH_POLL_SECS,
            )),
            notify_url: std::env::var("BOXSYNC_NOTIFY_URL").ok(),
            max_retry_attempts: read_u64_env(
                "BOXSYNC_MAX_RETRY_ATTEMPTS",
                DEFAULT_MAX_RETRY_ATTEMPTS,
            ) as u32,
            notify_max_reconnects: read_u64_env(
                "BOXSYNC_NOTIFY_RECONNECTS",
                DEFAULT_NOTIFY_RECONNECTS,
            ) as u32,
            enable_upload_worker: read_bool_env("BOXSYNC_ENABLE_UPLOAD", true),
            enable_refresh_worker: read_bool_env("BOXSYNC_ENABLE_REFRESH", true),
        })
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    ctx: Arc<SyncContext>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.cache_root)
            .await
            .with_context(|| format!("failed to create cache root at {:?}", config.cache_root))?;
        if let Some(parent) = config.state_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create state directory at {parent:?}"))?;
        }

        let client = match &config.api_base_url {
            Some(base) => RemoteClient::with_base_url(base, config.token.clone())?,
            None => RemoteClient::new(config.token.clone())?,
        };
        let remote: Arc<dyn RemoteStore> = Arc::new(client);
        let snapshot = Snapshot::new(config.state_file.clone());
        let ctx = match SyncContext::bootstrap(
            Arc::clone(&remote),
            snapshot.clone(),
            config.cache_root.clone(),
        ) {
            Ok(ctx) => ctx,
            Err(err) => {
                eprintln!(
                    "[boxsyncd] state file is unreadable ({err}), starting with an empty mirror"
                );
                let _ = std::fs::remove_file(snapshot.path());
                SyncContext::bootstrap(remote, snapshot, config.cache_root.clone())
                    .context("failed to initialize sync state")?
            }
        };

        Ok(Self { config, ctx })
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub async fn run(self) -> anyhow::Result<()> {
        eprintln!(
            "[boxsyncd] started: cache_root={}, state_file={}, upload={}, refresh={}",
            self.config.cache_root.display(),
            self.config.state_file.display(),
            if self.config.enable_upload_worker {
                "enabled"
            } else {
                "disabled"
            },
            if self.config.enable_refresh_worker {
                "enabled"
            } else {
                "disabled"
            },
        );

        let handles = self.spawn_workers();

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        eprintln!("[boxsyncd] shutting down");
        self.ctx.request_stop();
        for handle in handles {
            let _ = handle.await;
        }
        self.ctx
            .flush_snapshot()
            .await
            .context("final state flush failed")?;
        Ok(())
    }

    /// Spawns the configured background workers on the current runtime and
    /// returns their handles. Shutdown is cooperative: `request_stop` on the
    /// context, then await the handles.
    pub fn spawn_workers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        if self.config.enable_upload_worker {
            let worker = UploadWorker::new(
                Arc::clone(&self.ctx),
                self.config.sync_interval,
                self.config.max_sync_interval,
                RetryPolicy::new(
                    Duration::from_millis(500),
                    Duration::from_secs(60),
                    self.config.max_retry_attempts,
                ),
            );
            handles.push(tokio::spawn(worker.run()));
        }
        if self.config.enable_refresh_worker {
            let worker = RefreshWorker::new(
                Arc::clone(&self.ctx),
                self.config.refresh_poll_interval,
            );
            // A first pass right away, so the mirror is browsable without
            // waiting for the poll timer.
            self.ctx.trigger_refresh();
            handles.push(tokio::spawn(worker.run()));
        }
        if let Some(notify_url) = &self.config.notify_url {
            let listener = NotifyListener::new(
                Arc::clone(&self.ctx),
                format!(
                    "{}/{}",
                    notify_url.trim_end_matches('/'),
                    self.config.account_id
                ),
                self.config.notify_max_reconnects,
            );
            handles.push(tokio::spawn(listener.run()));
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_u64_env_falls_back_on_garbage() {
        // Env vars are process-global; use names no other test touches.
        unsafe {
            std::env::set_var("BOXSYNC_TEST_U64", "not a number");
        }
        assert_eq!(read_u64_env("BOXSYNC_TEST_U64", 7), 7);
        unsafe {
            std::env::set_var("BOXSYNC_TEST_U64", "42");
        }
        assert_eq!(read_u64_env("BOXSYNC_TEST_U64", 7), 42);
        unsafe {
            std::env::remove_var("BOXSYNC_TEST_U64");
        }
        assert_eq!(read_u64_env("BOXSYNC_TEST_U64", 7), 7);
    }

    #[test]
    fn read_bool_env_accepts_common_spellings() {
        unsafe {
            std::env::set_var("BOXSYNC_TEST_BOOL", "yes");
        }
        assert!(read_bool_env("BOXSYNC_TEST_BOOL", false));
        unsafe {
            std::env::set_var("BOXSYNC_TEST_BOOL", "0");
        }
        assert!(!read_bool_env("BOXSYNC_TEST_BOOL", true));
        unsafe {
            std::env::remove_var("BOXSYNC_TEST_BOOL");
        }
        assert!(read_bool_env("BOXSYNC_TEST_BOOL", true));
    }
}
