//! Background finality watchers, one per pending transaction.

use tracing::{debug, error, warn};

use attest_core::TxHash;

use crate::error::EngineError;
use crate::reconciler::Reconciler;

impl Reconciler {
    /// Poll `hash` in the background until it is final or failed.
    ///
    /// At most one watcher runs per transaction; arming an already watched
    /// transaction does nothing.
    pub(crate) fn watch(&self, hash: TxHash) {
        if self.inner.watched.insert(hash.clone(), ()).is_some() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.run_watch(&hash).await;
            this.inner.watched.remove(&hash);
        });
    }

    /// Number of transactions with a live watcher.
    pub fn watched_count(&self) -> usize {
        self.inner.watched.len()
    }

    async fn run_watch(&self, hash: &TxHash) {
        let interval = self.inner.config.poll_interval();
        let mut failures: u32 = 0;
        debug!(tx_hash = %hash, "finality watcher started");

        loop {
            let delay = if failures == 0 {
                interval
            } else {
                self.inner.retry.delay_for_attempt(failures).max(interval)
            };
            tokio::time::sleep(delay).await;

            match self.poll_transaction(hash).await {
                Ok(outcome) if outcome.is_terminal() => {
                    debug!(tx_hash = %hash, %outcome, "finality watcher done");
                    break;
                }
                Ok(_) => failures = 0,
                Err(err @ (EngineError::IndexConflict { .. } | EngineError::Internal(_))) => {
                    error!(tx_hash = %hash, error = %err, "finality watcher stopped");
                    break;
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    warn!(tx_hash = %hash, failures, error = %err, "finality poll failed, backing off");
                }
            }
        }
    }
}
