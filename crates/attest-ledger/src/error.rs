use attest_core::TxHash;

/// Ledger-boundary errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger call timed out after {0} ms")]
    Timeout(u64),

    #[error("transaction {hash} rejected: {reason}")]
    Rejected { hash: TxHash, reason: String },

    #[error("unknown transaction: {0}")]
    UnknownTransaction(TxHash),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("chain journal: {0}")]
    Journal(String),
}

impl LedgerError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}
