use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use attest_core::{CredentialId, TxHash, TxKind};

use crate::error::LedgerError;

/// Point-in-time on-chain view of one credential identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStatus {
    /// An issuance for the identifier is on-chain.
    pub exists: bool,
    /// A revocation for the identifier is on-chain.
    pub revoked: bool,
    /// Hash of the on-chain issuance, if any.
    #[serde(default)]
    pub issuance_tx: Option<TxHash>,
    /// Hash of the on-chain revocation, if any.
    #[serde(default)]
    pub revocation_tx: Option<TxHash>,
}

/// Ledger client interface.
///
/// The ledger is an opaque append-only log with finality after N
/// confirmations. Implementations bridge to a concrete chain.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a state-changing transaction; returns once the ledger has
    /// acknowledged it.
    async fn submit(&self, kind: TxKind, payload: &[u8]) -> Result<TxHash, LedgerError>;

    /// Current confirmation depth of a transaction.
    ///
    /// A transaction the ledger has rejected yields `LedgerError::Rejected`.
    async fn confirmations(&self, tx: &TxHash) -> Result<u32, LedgerError>;

    /// Direct on-chain query of an identifier's state.
    async fn status(&self, id: &CredentialId) -> Result<LedgerStatus, LedgerError>;

    /// Identifier of this ledger backend (e.g. "simulated").
    fn ledger_id(&self) -> &str;
}
