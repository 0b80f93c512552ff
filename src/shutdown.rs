//! Cooperative shutdown signal
//!
//! A single [`ShutdownSignal`] is created by the orchestrator and cloned into
//! every worker. Workers observe it at suspension points: fetches, rate-limit
//! waits, breaker cooldowns, checkpoint saves, and queue operations.

use tokio::sync::watch;

/// Clonable cancellation token backed by a watch channel
///
/// `trigger()` is idempotent. `wait()` resolves once triggered, including
/// for clones created after the trigger.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Signal shutdown to every clone
    pub fn trigger(&self) {
        // send only fails if every receiver is gone, which means nobody is
        // left to observe the signal anyway
        let _ = self.tx.send(true);
    }

    /// Non-blocking check, for loop headers
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Suspend until shutdown is triggered
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // wait_for returns immediately if the value is already true
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
