//! Outbound event channel for the notification collaborator.
//!
//! Delivery is best-effort: events are broadcast to whoever is subscribed at
//! the time, slow subscribers may lag and miss events, and replays during
//! recovery can emit an event more than once. Consistency never depends on
//! delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

use attest_core::{CredentialId, TxHash};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Issued,
    Revoked,
    IssuanceFailed,
    RevocationFailed,
    /// A write hit a deprecated or removed unique index.
    IndexConflict,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Issued => write!(f, "issued"),
            Self::Revoked => write!(f, "revoked"),
            Self::IssuanceFailed => write!(f, "issuance_failed"),
            Self::RevocationFailed => write!(f, "revocation_failed"),
            Self::IndexConflict => write!(f, "index_conflict"),
        }
    }
}

/// One outbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub credential_id: CredentialId,
    #[serde(default)]
    pub tx_hash: Option<TxHash>,
    #[serde(default)]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(kind: EventKind, credential_id: CredentialId) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            credential_id,
            tx_hash: None,
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn with_tx(mut self, tx: TxHash) -> Self {
        self.tx_hash = Some(tx);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Broadcast sender shared by every publisher.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish without waiting; an event nobody listens to is dropped.
    pub fn publish(&self, event: EngineEvent) {
        let kind = event.kind;
        match self.tx.send(event) {
            Ok(receivers) => tracing::debug!(%kind, receivers, "event published"),
            Err(_) => tracing::trace!(%kind, "event dropped, no subscribers"),
        }
    }
}
