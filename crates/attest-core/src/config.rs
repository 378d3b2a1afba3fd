use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CoreError;

/// Tuning for the reconciler, finality watcher and verification engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Confirmation depth at which a transaction is treated as final.
    ///
    /// Reorgs deeper than this are assumed not to happen; raise it on
    /// ledgers with weaker finality.
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u32,
    /// Interval between confirmation polls of a pending transaction.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on any single ledger call.
    #[serde(default = "default_ledger_timeout_ms")]
    pub ledger_timeout_ms: u64,
    /// Attempts made to submit a transaction while the ledger is unavailable.
    #[serde(default = "default_submit_max_attempts")]
    pub submit_max_attempts: u32,
    /// First retry delay after a transient ledger failure.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    /// Cap on the retry delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// A pending row older than this is verified against the ledger.
    #[serde(default = "default_pending_staleness_secs")]
    pub pending_staleness_secs: u64,
    /// When set, any cached row older than this is verified against the ledger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cache_age_secs: Option<u64>,
    /// Capacity of the verification → reconciler repair queue.
    #[serde(default = "default_repair_queue_capacity")]
    pub repair_queue_capacity: usize,
    /// Capacity of the outbound event channel.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_required_confirmations() -> u32 {
    6
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_ledger_timeout_ms() -> u64 {
    5_000
}
fn default_submit_max_attempts() -> u32 {
    5
}
fn default_backoff_initial_ms() -> u64 {
    200
}
fn default_backoff_max_ms() -> u64 {
    10_000
}
fn default_pending_staleness_secs() -> u64 {
    120
}
fn default_repair_queue_capacity() -> usize {
    1024
}
fn default_event_channel_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            required_confirmations: default_required_confirmations(),
            poll_interval_ms: default_poll_interval_ms(),
            ledger_timeout_ms: default_ledger_timeout_ms(),
            submit_max_attempts: default_submit_max_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            pending_staleness_secs: default_pending_staleness_secs(),
            max_cache_age_secs: None,
            repair_queue_capacity: default_repair_queue_capacity(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl EngineConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.required_confirmations == 0 {
            return Err(CoreError::InvalidConfig(
                "required_confirmations must be at least 1".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "poll_interval_ms must be positive".into(),
            ));
        }
        if self.submit_max_attempts == 0 {
            return Err(CoreError::InvalidConfig(
                "submit_max_attempts must be at least 1".into(),
            ));
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(CoreError::InvalidConfig(
                "backoff_initial_ms exceeds backoff_max_ms".into(),
            ));
        }
        if self.repair_queue_capacity == 0 || self.event_channel_capacity == 0 {
            return Err(CoreError::InvalidConfig(
                "channel capacities must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }

    pub fn pending_staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_staleness_secs as i64)
    }

    pub fn max_cache_age(&self) -> Option<chrono::Duration> {
        self.max_cache_age_secs
            .map(|secs| chrono::Duration::seconds(secs as i64))
    }
}
