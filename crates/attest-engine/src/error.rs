use attest_core::{ConstraintState, CoreError, CredentialId};
use attest_ledger::LedgerError;
use attest_store::StoreError;

/// Engine errors. Callers branch on the variant, never on the message.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("credential already exists: {0}")]
    AlreadyExists(CredentialId),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("credential already revoked: {0}")]
    AlreadyRevoked(CredentialId),

    #[error("credential not yet active: {0}")]
    NotYetActive(CredentialId),

    #[error("invalid or unknown verification token")]
    InvalidToken,

    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("ledger rejected transaction for {id}: {reason}")]
    LedgerRejected { id: CredentialId, reason: String },

    #[error("write for {id} hit {state} unique index {index} (key {key})")]
    IndexConflict {
        id: CredentialId,
        index: String,
        state: ConstraintState,
        key: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("migration of field {field} blocked: {remaining} documents still use it alone")]
    MigrationBlocked { field: String, remaining: usize },

    #[error("migration error: {0}")]
    Migration(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyExists(_) => "already_exists",
            Self::NotFound(_) => "not_found",
            Self::AlreadyRevoked(_) => "already_revoked",
            Self::NotYetActive(_) => "not_yet_active",
            Self::InvalidToken => "invalid_token",
            Self::LedgerUnavailable(_) => "ledger_unavailable",
            Self::LedgerRejected { .. } => "ledger_rejected",
            Self::IndexConflict { .. } => "index_conflict",
            Self::InvalidInput(_) => "invalid_input",
            Self::MigrationBlocked { .. } => "migration_blocked",
            Self::Migration(_) => "migration",
            Self::Store(_) => "store",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the same call may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LedgerUnavailable(_))
    }

    /// Map a ledger error raised while acting on `id`.
    pub fn from_ledger(id: &CredentialId, err: LedgerError) -> Self {
        match err {
            LedgerError::Unavailable(reason) => Self::LedgerUnavailable(reason),
            LedgerError::Timeout(ms) => {
                Self::LedgerUnavailable(format!("ledger call timed out after {} ms", ms))
            }
            LedgerError::Rejected { reason, .. } => Self::LedgerRejected {
                id: id.clone(),
                reason,
            },
            LedgerError::UnknownTransaction(hash) => {
                Self::Internal(format!("ledger does not know transaction {}", hash))
            }
            LedgerError::InvalidPayload(reason) => Self::Internal(reason),
            LedgerError::Journal(reason) => Self::Internal(format!("chain journal: {}", reason)),
        }
    }
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidToken => Self::InvalidToken,
            CoreError::InvalidStateTransition { .. } | CoreError::Serialization(_) => {
                Self::Internal(err.to_string())
            }
            other => Self::InvalidInput(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("document codec: {}", err))
    }
}
