//! Exponential backoff and the task that replays persisted retries.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::WebhookDispatcher;
use crate::config::DispatcherConfig;

/// `delay(n) = min(2^n * base, cap)` for attempt `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(300_000),
        }
    }
}

impl Backoff {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            base: config.backoff_base,
            cap: config.backoff_cap,
        }
    }

    /// Delay before the attempt following failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Background task polling the store for due retry jobs.
pub struct RetryScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RetryScheduler {
    /// Spawn the polling loop on the current runtime.
    pub fn start(dispatcher: WebhookDispatcher) -> Self {
        let interval = dispatcher.config().retry_poll_interval;
        let (shutdown, mut stop) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            log::info!("webhook retry scheduler polling every {interval:?}");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match dispatcher.run_due_retries(chrono::Utc::now()).await {
                            Ok(0) => {}
                            Ok(n) => log::debug!("replayed {n} webhook retries"),
                            Err(e) => log::error!("webhook retry poll failed: {e}"),
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            log::info!("webhook retry scheduler stopped");
        });

        Self { shutdown, handle }
    }

    /// Stop polling and wait for the in-flight poll to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            log::warn!("retry scheduler task ended abnormally: {e}");
        }
    }
}
