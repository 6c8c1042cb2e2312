//! Save triggering and background flushing.
//!
//! Writes call [`SaveSignal::request`]; the scheduler waits for a quiet period,
//! then flushes once for the whole burst. A periodic tick flushes regardless.
//! Flushes run one at a time; a request that arrives mid-flush is picked up
//! by the next cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::FlushConfig;
use crate::storage::engine::Database;

#[derive(Default)]
pub struct SaveSignal {
    notify: Notify,
    pending: AtomicBool,
    reasons: Mutex<Vec<String>>,
}

impl SaveSignal {
    pub fn request(&self, reason: &str) {
        if let Ok(mut r) = self.reasons.lock() {
            if r.len() < 32 && !r.iter().any(|x| x == reason) {
                r.push(reason.to_string());
            }
        }
        self.pending.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Clear the pending flag and return the coalesced reasons, or None if a
    /// previous cycle already consumed them.
    fn take(&self) -> Option<Vec<String>> {
        if !self.pending.swap(false, Ordering::AcqRel) {
            return None;
        }
        let reasons = self
            .reasons
            .lock()
            .map(|mut r| std::mem::take(&mut *r))
            .unwrap_or_default();
        Some(reasons)
    }

    async fn notified(&self) {
        self.notify.notified().await
    }
}

pub struct FlushScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl FlushScheduler {
    /// Must be called from within a tokio runtime.
    pub fn spawn(db: Arc<Database>, config: &FlushConfig) -> Self {
        let interval = Duration::from_secs(config.interval_secs.max(1));
        let debounce = Duration::from_millis(config.debounce_ms);
        let (tx, mut rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = ticker.tick() => {
                        run_flush(&db, "interval").await;
                    }
                    _ = db.save_signal().notified() => {
                        tokio::time::sleep(debounce).await;
                        if let Some(reasons) = db.save_signal().take() {
                            let reason = if reasons.is_empty() { "write".to_string() } else { reasons.join(",") };
                            run_flush(&db, &reason).await;
                        }
                    }
                }
            }
            tracing::debug!("flush scheduler stopped");
        });

        Self { shutdown: tx, handle }
    }

    /// Stop the loop after any in-flight flush. The final flush is the caller's.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "flush scheduler task ended abnormally");
        }
    }
}

async fn run_flush(db: &Arc<Database>, reason: &str) {
    let db = Arc::clone(db);
    let reason = reason.to_string();
    let joined = tokio::task::spawn_blocking(move || {
        let result = db.flush();
        (reason, result)
    })
    .await;
    match joined {
        Ok((reason, Ok(outcome))) => {
            tracing::debug!(reason = %reason, bytes = outcome.bytes, ms = outcome.elapsed.as_millis() as u64, "flushed")
        }
        Ok((reason, Err(e))) => {
            tracing::warn!(reason = %reason, error = %e, "flush failed; in-memory state kept, will retry next cycle")
        }
        Err(e) => tracing::warn!(error = %e, "flush task panicked"),
    }
}
