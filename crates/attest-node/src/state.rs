//! State shared with the HTTP handlers.

use std::sync::Arc;
use std::time::Instant;

use attest_engine::AttestEngine;

pub struct NodeState {
    pub engine: Arc<AttestEngine>,
    /// Identifier of the ledger backend the engine talks to.
    pub ledger_id: String,
    pub start_time: Instant,
}

impl NodeState {
    pub fn new(engine: Arc<AttestEngine>, ledger_id: impl Into<String>) -> Self {
        Self {
            engine,
            ledger_id: ledger_id.into(),
            start_time: Instant::now(),
        }
    }
}
