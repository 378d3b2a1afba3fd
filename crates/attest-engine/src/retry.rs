//! Retry delays and bounded ledger calls.

use std::future::Future;
use std::time::Duration;

use attest_core::EngineConfig;
use attest_ledger::LedgerError;

/// Capped exponential backoff for transient ledger failures.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Backoff {
    /// Doubling backoff bounded by the engine configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            initial_delay_ms: config.backoff_initial_ms,
            max_delay_ms: config.backoff_max_ms,
            multiplier: 2.0,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = (self.initial_delay_ms as f64) * self.multiplier.powi(exponent);
        let delay = delay.min(self.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }
}

/// Bound a ledger call by `limit`; elapsing maps to `LedgerError::Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout(limit.as_millis() as u64)),
    }
}
