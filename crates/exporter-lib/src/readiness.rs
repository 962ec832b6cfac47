//! One-shot readiness signals
//!
//! Components that populate shared state at startup mark a signal once their
//! initial listing completes; dependents wait on a set of signals with a bounded
//! timeout instead of blocking forever.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A latch that flips to ready exactly once
#[derive(Debug, Clone)]
pub struct ReadySignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadySignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark the signal ready; later calls are no-ops
    pub fn mark_ready(&self) {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal has been marked ready
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

/// Wait until every signal is ready, giving up after `timeout`.
///
/// Returns `true` when all signals fired in time.
pub async fn wait_all(signals: &[ReadySignal], timeout: Duration) -> bool {
    let all = futures::future::join_all(signals.iter().map(ReadySignal::wait));
    tokio::time::timeout(timeout, all).await.is_ok()
}
