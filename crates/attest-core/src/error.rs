use crate::types::CredentialStatus;

/// Core data-model errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid status transition from {from} to {to}")]
    InvalidStateTransition {
        from: CredentialStatus,
        to: CredentialStatus,
    },

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("invalid credential id: {0}")]
    InvalidCredentialId(String),

    #[error("invalid verification token")]
    InvalidToken,

    #[error("invalid document hash: {0}")]
    InvalidDocumentHash(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
