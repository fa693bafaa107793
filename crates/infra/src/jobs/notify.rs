//! Change notifications that wake idle dispatchers.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::types::BackoffPolicy;

/// Postgres channel the job table trigger notifies on.
pub const JOBS_CHANNEL: &str = "marketplace_jobs";

/// In-process wake-up signal.
///
/// A notification sent while nobody waits is kept, so the next wait returns
/// immediately and no change is lost between a claim pass and the next wait.
#[derive(Debug, Clone, Default)]
pub struct WakeSignal {
    inner: Arc<Notify>,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.inner.notify_one();
    }

    pub async fn notified(&self) {
        self.inner.notified().await;
    }
}

/// Forwards `LISTEN marketplace_jobs` notifications into a `WakeSignal`.
///
/// Connection failures are retried with backoff; the dispatcher keeps polling
/// in the meantime.
pub struct PgJobListener {
    pool: PgPool,
    channel: String,
    wake: WakeSignal,
    reconnect: BackoffPolicy,
}

impl PgJobListener {
    pub fn new(pool: PgPool, wake: WakeSignal) -> Self {
        Self {
            pool,
            channel: JOBS_CHANNEL.to_string(),
            wake,
            reconnect: BackoffPolicy::exponential(Duration::from_millis(500), Duration::from_secs(30)),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Run until `shutdown` flips to `true`.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.listen().await {
                Ok(mut listener) => {
                    failures = 0;
                    tracing::info!(channel = %self.channel, "listening for job notifications");
                    // Anything committed while disconnected went unnoticed.
                    self.wake.notify();

                    loop {
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    return;
                                }
                            }
                            received = listener.try_recv() => match received {
                                Ok(Some(_)) => self.wake.notify(),
                                Ok(None) => {
                                    tracing::warn!(channel = %self.channel, "notification connection lost, reconnecting");
                                    self.wake.notify();
                                }
                                Err(err) => {
                                    tracing::warn!(channel = %self.channel, error = %err, "notification listener failed");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(channel = %self.channel, error = %err, "failed to start notification listener");
                }
            }

            failures = failures.saturating_add(1);
            let delay = self.reconnect.delay_for_attempt(failures);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn listen(&self) -> Result<PgListener, sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        Ok(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notification_before_wait_is_not_lost() {
        let wake = WakeSignal::new();
        wake.clone().notify();

        tokio::time::timeout(Duration::from_millis(100), wake.notified())
            .await
            .expect("stored notification should complete the wait");
    }
}
