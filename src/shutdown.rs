//! Cooperative shutdown
//!
//! A [`ShutdownSignal`] is shared by every long-running task. Crawl consumers
//! check it between pages and give their claimed entry back when it is set,
//! so an interrupted extraction resumes from the last persisted cursor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shutdown flag shared between the signal handler and the workers
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Requests shutdown; waiters are woken once
    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Waits until shutdown is requested. Returns immediately if it already was.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent request is not missed
        notified.as_mut().enable();
        if self.is_requested() {
            return;
        }
        notified.await;
    }

    /// Sleeps for `duration` unless shutdown is requested first
    ///
    /// Returns `true` when the sleep was cut short.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_requested(),
            _ = self.wait() => true,
        }
    }

    /// Spawns a task that requests shutdown on Ctrl+C
    pub fn install_ctrl_c(self: &Arc<Self>) {
        let signal = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, finishing current pages before exiting");
                signal.request();
            }
        });
    }
}
