//! Verification engine: read-only validity verdicts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use attest_core::{
    Credential, CredentialId, CredentialStatus, EngineConfig, TxHash, VerificationToken,
};
use attest_ledger::{LedgerClient, LedgerError, LedgerStatus};
use attest_store::IndexStore;

use crate::codec;
use crate::error::EngineError;
use crate::retry::with_timeout;
use crate::schema::SchemaHandle;

/// How fresh the caller needs the answer to be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Cache first; the ledger only when the cache is missing or doubtful.
    #[default]
    Cached,
    /// Always consult the ledger.
    Strong,
}

impl FromStr for Consistency {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cached" | "cache" => Ok(Self::Cached),
            "strong" | "ledger" => Ok(Self::Strong),
            other => Err(EngineError::InvalidInput(format!(
                "unknown consistency level: {}",
                other
            ))),
        }
    }
}

/// Where a verdict's status came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Cache,
    Ledger,
}

impl fmt::Display for VerdictSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cache => write!(f, "cache"),
            Self::Ledger => write!(f, "ledger"),
        }
    }
}

/// Answer to "is this credential valid right now".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub credential_id: CredentialId,
    pub status: CredentialStatus,
    pub as_of: DateTime<Utc>,
    pub source: VerdictSource,
    /// Version of the cached row the verdict was read from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_version: Option<u64>,
    /// Issuance transaction to recheck while the credential is pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tx: Option<TxHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Verdict {
    fn from_cache(credential: &Credential) -> Self {
        Self {
            credential_id: credential.id.clone(),
            status: credential.status,
            as_of: credential.updated_at,
            source: VerdictSource::Cache,
            cache_version: Some(credential.cache_version),
            pending_tx: pending_tx(credential),
            failure_reason: credential.failure_reason.clone(),
        }
    }

    fn from_ledger(id: CredentialId, status: CredentialStatus, cached: Option<&Credential>) -> Self {
        // Pending and failed are not ledger states; carry the cached detail.
        let carried = cached.filter(|c| c.status == status);
        Self {
            credential_id: id,
            status,
            as_of: Utc::now(),
            source: VerdictSource::Ledger,
            cache_version: None,
            pending_tx: carried.and_then(pending_tx),
            failure_reason: carried.and_then(|c| c.failure_reason.clone()),
        }
    }
}

fn pending_tx(credential: &Credential) -> Option<TxHash> {
    match credential.status {
        CredentialStatus::Pending => credential.issuance_tx.clone(),
        _ => None,
    }
}

/// Ledger state of one identifier with finality applied.
struct OnChain {
    status: LedgerStatus,
    issuance_final: bool,
    revocation_final: bool,
}

/// What the caller presented: an identifier or a verification token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyTarget {
    Id(CredentialId),
    Token(VerificationToken),
}

impl VerifyTarget {
    /// Tokens are recognised by prefix; anything else is an identifier.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        if VerificationToken::looks_like_token(raw) {
            Ok(Self::Token(VerificationToken::parse(raw)?))
        } else {
            Ok(Self::Id(CredentialId::new(raw)?))
        }
    }
}

/// Produces verdicts. Reads the store and the ledger, writes neither; a
/// cache found wrong is queued for the reconciler to repair.
#[derive(Clone)]
pub struct Verifier {
    config: EngineConfig,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn IndexStore>,
    schema: SchemaHandle,
    repairs: mpsc::Sender<CredentialId>,
}

impl Verifier {
    pub fn new(
        config: EngineConfig,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn IndexStore>,
        schema: SchemaHandle,
        repairs: mpsc::Sender<CredentialId>,
    ) -> Self {
        Self {
            config,
            ledger,
            store,
            schema,
            repairs,
        }
    }

    /// Verify an identifier or a `vt_` token.
    pub async fn verify(&self, raw: &str, consistency: Consistency) -> Result<Verdict, EngineError> {
        match VerifyTarget::parse(raw)? {
            VerifyTarget::Id(id) => {
                let cached = self.cached(&id).await?;
                self.decide(id, cached, consistency).await
            }
            VerifyTarget::Token(token) => {
                let credential = self.resolve_token(&token).await?;
                self.decide(credential.id.clone(), Some(credential), consistency)
                    .await
            }
        }
    }

    /// The cached row only, no ledger access.
    pub async fn cached(&self, id: &CredentialId) -> Result<Option<Credential>, EngineError> {
        let layout = self.schema.layout().await;
        match self.store.get(id.as_str()).await? {
            Some(doc) => Ok(Some(codec::from_document(id.as_str(), doc, &layout)?)),
            None => Ok(None),
        }
    }

    async fn resolve_token(&self, token: &VerificationToken) -> Result<Credential, EngineError> {
        let layout = self.schema.layout().await;
        let found = self
            .store
            .find_by_field(&layout.token_field, &Value::String(token.as_str().to_string()))
            .await?;
        match found {
            Some((key, doc)) => codec::from_document(&key, doc, &layout),
            None => Err(EngineError::InvalidToken),
        }
    }

    async fn decide(
        &self,
        id: CredentialId,
        cached: Option<Credential>,
        consistency: Consistency,
    ) -> Result<Verdict, EngineError> {
        if !self.needs_ledger(cached.as_ref(), consistency) {
            if let Some(credential) = &cached {
                debug!(credential_id = %id, status = %credential.status, "verified from cache");
                return Ok(Verdict::from_cache(credential));
            }
        }

        let on_chain = match self.observe(&id).await {
            Ok(on_chain) => on_chain,
            Err(err) => {
                return match (&cached, consistency) {
                    (Some(credential), Consistency::Cached) => {
                        warn!(credential_id = %id, error = %err, "ledger unreachable, answering from cache");
                        Ok(Verdict::from_cache(credential))
                    }
                    _ => Err(EngineError::from_ledger(&id, err)),
                };
            }
        };

        let status = match self.ledger_status(&id, &on_chain, cached.as_ref()) {
            Some(status) => status,
            None => return Err(EngineError::NotFound(id.to_string())),
        };

        let disagrees = match &cached {
            Some(c) => c.status != status,
            None => on_chain.status.exists,
        };
        if disagrees {
            self.request_repair(&id);
        }
        debug!(credential_id = %id, %status, "verified from ledger");
        let mut verdict = Verdict::from_ledger(id, status, cached.as_ref());
        if status == CredentialStatus::Pending && on_chain.status.issuance_tx.is_some() {
            verdict.pending_tx = on_chain.status.issuance_tx;
        }
        Ok(verdict)
    }

    /// The ledger's view of `id`, with finality checked for each on-chain
    /// transaction.
    async fn observe(&self, id: &CredentialId) -> Result<OnChain, LedgerError> {
        let status = with_timeout(self.config.ledger_timeout(), self.ledger.status(id)).await?;
        let issuance_final = self.is_final(status.issuance_tx.as_ref()).await?;
        let revocation_final = issuance_final && self.is_final(status.revocation_tx.as_ref()).await?;
        Ok(OnChain {
            status,
            issuance_final,
            revocation_final,
        })
    }

    async fn is_final(&self, tx: Option<&TxHash>) -> Result<bool, LedgerError> {
        let Some(tx) = tx else {
            return Ok(false);
        };
        let required = self.config.required_confirmations;
        match with_timeout(self.config.ledger_timeout(), self.ledger.confirmations(tx)).await {
            Ok(depth) => Ok(depth >= required),
            Err(LedgerError::Rejected { .. } | LedgerError::UnknownTransaction(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn needs_ledger(&self, cached: Option<&Credential>, consistency: Consistency) -> bool {
        let Some(credential) = cached else {
            return true;
        };
        if consistency == Consistency::Strong {
            return true;
        }
        let age = Utc::now() - credential.updated_at;
        if credential.status == CredentialStatus::Pending && age > self.config.pending_staleness() {
            return true;
        }
        matches!(self.config.max_cache_age(), Some(limit) if age > limit)
    }

    /// Status the ledger implies, given what the cache holds.
    ///
    /// Only final transactions count: an issuance still short of the
    /// required depth reads as pending, and a revocation short of it leaves
    /// the credential active. `None` when neither side knows the credential.
    fn ledger_status(
        &self,
        id: &CredentialId,
        on_chain: &OnChain,
        cached: Option<&Credential>,
    ) -> Option<CredentialStatus> {
        if on_chain.revocation_final {
            return Some(CredentialStatus::Revoked);
        }
        if on_chain.issuance_final {
            return Some(CredentialStatus::Active);
        }
        if on_chain.status.exists {
            return Some(CredentialStatus::Pending);
        }
        match cached.map(|c| c.status) {
            // Not on-chain yet, or never made it; the cache is as good as it gets.
            Some(status @ (CredentialStatus::Pending | CredentialStatus::Failed)) => Some(status),
            Some(status) => {
                error!(credential_id = %id, cached = %status, "cached credential absent from ledger");
                None
            }
            None => None,
        }
    }

    fn request_repair(&self, id: &CredentialId) {
        match self.repairs.try_send(id.clone()) {
            Ok(()) => debug!(credential_id = %id, "cache repair queued"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(credential_id = %id, "repair queue full, dropping request")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(credential_id = %id, "repair queue closed")
            }
        }
    }
}
