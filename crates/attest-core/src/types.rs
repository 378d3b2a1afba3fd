use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::credential_state::{CredentialStateMachine, LifecycleEvent};
use crate::error::CoreError;

/// Maximum length of an external credential identifier.
pub const MAX_ID_LEN: usize = 128;

/// Prefix carried by every verification token.
pub const TOKEN_PREFIX: &str = "vt_";

const TOKEN_BYTES: usize = 32;

/// Stable external identifier of a credential (e.g. a registration number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(String);

impl CredentialId {
    /// Create an identifier, trimming surrounding whitespace.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, CoreError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidCredentialId("identifier is empty".into()));
        }
        if trimmed.len() > MAX_ID_LEN {
            return Err(CoreError::InvalidCredentialId(format!(
                "identifier exceeds {} bytes",
                MAX_ID_LEN
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(CoreError::InvalidCredentialId(
                "identifier contains control characters".into(),
            ));
        }
        if trimmed.starts_with(TOKEN_PREFIX) {
            return Err(CoreError::InvalidCredentialId(format!(
                "identifier may not start with '{}'",
                TOKEN_PREFIX
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, non-guessable token embedded in a credential's QR artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerificationToken(String);

impl VerificationToken {
    /// Generate a fresh random token.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(format!("{}{}", TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(bytes)))
    }

    /// Parse a token presented by a verifier.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let body = raw
            .trim()
            .strip_prefix(TOKEN_PREFIX)
            .ok_or(CoreError::InvalidToken)?;
        let decoded = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| CoreError::InvalidToken)?;
        if decoded.len() != TOKEN_BYTES {
            return Err(CoreError::InvalidToken);
        }
        Ok(Self(raw.trim().to_string()))
    }

    /// Whether a string has the shape of a token (cheap prefix check).
    pub fn looks_like_token(raw: &str) -> bool {
        raw.trim().starts_with(TOKEN_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VerificationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed reference to the underlying document (BLAKE3, hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentHash(String);

impl DocumentHash {
    /// Hash raw document bytes.
    pub fn of(document: &[u8]) -> Self {
        Self(blake3::hash(document).to_hex().to_string())
    }

    /// Validate a caller-supplied hash (64 hex characters).
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let normalized = raw.trim().to_ascii_lowercase();
        let bytes = hex::decode(&normalized)
            .map_err(|e| CoreError::InvalidDocumentHash(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(CoreError::InvalidDocumentHash(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hash of a submitted ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl TxHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cached lifecycle status of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    /// Issuance submitted, not yet final.
    Pending,
    /// Issuance final, not revoked.
    Active,
    /// Revocation final. Terminal.
    Revoked,
    /// Issuance rejected on-chain. Terminal for that issuance.
    Failed,
}

impl CredentialStatus {
    /// Whether no further transition is possible from this status.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Revoked | Self::Failed)
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Revoked => write!(f, "revoked"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Kind of state change a ledger transaction carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Issue,
    Revoke,
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Issue => write!(f, "issue"),
            Self::Revoke => write!(f, "revoke"),
        }
    }
}

/// Outcome of a ledger transaction as last observed by polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxOutcome {
    Pending,
    Finalized,
    Failed,
}

impl TxOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TxOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Finalized => write!(f, "finalized"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Body of an issue or revoke transaction as submitted to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerPayload {
    pub credential_id: CredentialId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_hash: Option<DocumentHash>,
}

impl LedgerPayload {
    pub fn issue(credential_id: CredentialId, document_hash: DocumentHash) -> Self {
        Self {
            credential_id,
            document_hash: Some(document_hash),
        }
    }

    pub fn revoke(credential_id: CredentialId) -> Self {
        Self {
            credential_id,
            document_hash: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A submitted state change, retained for audit and crash recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub hash: TxHash,
    pub kind: TxKind,
    pub credential_id: CredentialId,
    /// Present on issue transactions so a lost cache row can be rebuilt.
    #[serde(default)]
    pub document_hash: Option<DocumentHash>,
    pub confirmations: u32,
    pub outcome: TxOutcome,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub settled_at: Option<DateTime<Utc>>,
}

impl LedgerTransaction {
    /// Record a freshly submitted transaction.
    pub fn submitted(hash: TxHash, kind: TxKind, payload: &LedgerPayload) -> Self {
        Self {
            hash,
            kind,
            credential_id: payload.credential_id.clone(),
            document_hash: payload.document_hash.clone(),
            confirmations: 0,
            outcome: TxOutcome::Pending,
            failure_reason: None,
            submitted_at: Utc::now(),
            settled_at: None,
        }
    }

    /// Record an observed confirmation depth. Depth never decreases.
    pub fn observe_confirmations(&mut self, confirmations: u32) {
        self.confirmations = self.confirmations.max(confirmations);
    }

    /// Mark finalized. Returns false if the outcome was already terminal.
    pub fn mark_finalized(&mut self, confirmations: u32) -> bool {
        if self.outcome.is_terminal() {
            return false;
        }
        self.observe_confirmations(confirmations);
        self.outcome = TxOutcome::Finalized;
        self.settled_at = Some(Utc::now());
        true
    }

    /// Mark failed. Returns false if the outcome was already terminal.
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> bool {
        if self.outcome.is_terminal() {
            return false;
        }
        self.outcome = TxOutcome::Failed;
        self.failure_reason = Some(reason.into());
        self.settled_at = Some(Utc::now());
        true
    }
}

/// One issued attestation as cached in the index store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub status: CredentialStatus,
    pub issuance_tx: Option<TxHash>,
    pub revocation_tx: Option<TxHash>,
    pub document_hash: DocumentHash,
    pub verification_token: VerificationToken,
    /// Incremented on every reconciled write.
    pub cache_version: u64,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Build a pending record for a just-submitted issuance.
    ///
    /// `previous_version` is the version of the row being replaced (0 for a
    /// fresh identifier) so versions stay monotonic across re-issuance.
    pub fn pending(
        id: CredentialId,
        document_hash: DocumentHash,
        verification_token: VerificationToken,
        issuance_tx: TxHash,
        previous_version: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: CredentialStatus::Pending,
            issuance_tx: Some(issuance_tx),
            revocation_tx: None,
            document_hash,
            verification_token,
            cache_version: previous_version + 1,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a lifecycle event, bumping the cache version.
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<CredentialStatus, CoreError> {
        let next = CredentialStateMachine::transition(self.status, &event)?;
        match event {
            LifecycleEvent::IssuanceFinalized => {}
            LifecycleEvent::IssuanceFailed { reason } => self.failure_reason = Some(reason),
            LifecycleEvent::RevocationFinalized { tx } => self.revocation_tx = Some(tx),
        }
        self.status = next;
        self.cache_version += 1;
        self.updated_at = Utc::now();
        Ok(next)
    }

    /// Check the status/transaction-reference invariants of a cached row.
    pub fn check_invariants(&self) -> Result<(), CoreError> {
        let ok = match self.status {
            CredentialStatus::Pending | CredentialStatus::Active | CredentialStatus::Failed => {
                self.issuance_tx.is_some() && self.revocation_tx.is_none()
            }
            CredentialStatus::Revoked => {
                self.issuance_tx.is_some() && self.revocation_tx.is_some()
            }
        };
        if ok {
            Ok(())
        } else {
            Err(CoreError::ValidationError(format!(
                "credential {} in status {} has inconsistent transaction references",
                self.id, self.status
            )))
        }
    }
}
