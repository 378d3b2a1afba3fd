//! Attest Core: shared data model, errors, and configuration for the
//! Attest credential consistency engine.

pub mod config;
pub mod credential_state;
pub mod error;
pub mod schema;
pub mod types;

pub use config::EngineConfig;
pub use credential_state::{CredentialStateMachine, LifecycleEvent};
pub use error::CoreError;
pub use schema::{ConstraintPurpose, ConstraintState, IndexConstraint, SchemaLayout};
pub use types::{
    Credential, CredentialId, CredentialStatus, DocumentHash, LedgerPayload, LedgerTransaction,
    TxHash, TxKind, TxOutcome, VerificationToken,
};
