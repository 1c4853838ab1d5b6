use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use crate::sync::SyncContext;
use crate::sync::backoff::RetryPolicy;

/// Long-polls the change-notification endpoint and pings the refresh worker
/// for every event line. The payload carries no semantics; it only says
/// "something changed, go ask". Lines starting with ':' are keepalive
/// comments. After too many consecutive connection failures the listener
/// gives up and the periodic refresh timer remains the fallback.
pub struct NotifyListener {
    ctx: Arc<SyncContext>,
    url: String,
    max_retries: u32,
    retry: RetryPolicy,
}

impl NotifyListener {
    pub fn new(ctx: Arc<SyncContext>, url: String, max_retries: u32) -> Self {
        Self {
            ctx,
            url,
            max_retries,
            retry: RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), max_retries),
        }
    }

    pub async fn run(self) {
        let client = reqwest::Client::new();
        let mut failures = 0u32;
        while !self.ctx.stopping() {
            let outcome = tokio::select! {
                outcome = self.listen_once(&client) => outcome,
                // A quiet long poll produces no chunks to observe the stop
                // flag on; shutdown has to interrupt it from the outside.
                _ = self.ctx.shutdown.notified() => break,
            };
            match outcome {
                Ok(()) => {
                    failures = 0;
                }
                Err(err) => {
                    failures += 1;
                    if failures > self.max_retries {
                        eprintln!(
                            "[boxsyncd] notification stream gave up after {failures} failures; periodic refresh stays active"
                        );
                        break;
                    }
                    let delay = self.retry.delay(failures);
                    eprintln!(
                        "[boxsyncd] notification stream error ({err}), reconnecting in {}ms",
                        delay.as_millis()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.ctx.shutdown.notified() => {}
                    }
                }
            }
        }
        eprintln!("[boxsyncd] notification listener stopped");
    }

    async fn listen_once(&self, client: &reqwest::Client) -> Result<(), reqwest::Error> {
        let response = client.get(&self.url).send().await?.error_for_status()?;
        let mut stream = response.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            if self.ctx.stopping() {
                return Ok(());
            }
            buf.extend_from_slice(&chunk?);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                eprintln!("[boxsyncd] change notification received");
                self.ctx.trigger_refresh();
            }
        }
        Ok(())
    }
}
