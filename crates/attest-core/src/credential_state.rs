use crate::error::CoreError;
use crate::types::{CredentialStatus, TxHash};

/// Ledger outcomes that move a cached credential between statuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The issuance transaction reached the confirmation threshold.
    IssuanceFinalized,
    /// The issuance transaction was rejected on-chain.
    IssuanceFailed { reason: String },
    /// The revocation transaction reached the confirmation threshold.
    RevocationFinalized { tx: TxHash },
}

impl LifecycleEvent {
    fn target(&self) -> CredentialStatus {
        match self {
            Self::IssuanceFinalized => CredentialStatus::Active,
            Self::IssuanceFailed { .. } => CredentialStatus::Failed,
            Self::RevocationFinalized { .. } => CredentialStatus::Revoked,
        }
    }
}

/// Enforces the finality-monotone credential lifecycle.
///
/// Valid transitions:
/// - Pending → Active (IssuanceFinalized)
/// - Pending → Failed (IssuanceFailed)
/// - Active → Revoked (RevocationFinalized)
///
/// Creating a pending row (fresh issuance, or re-issuance over a failed one)
/// is a row replacement, not a transition, and is handled by the reconciler.
pub struct CredentialStateMachine;

impl CredentialStateMachine {
    /// Attempt a transition. Returns the new status, or an error for any
    /// transition not listed above.
    pub fn transition(
        current: CredentialStatus,
        event: &LifecycleEvent,
    ) -> Result<CredentialStatus, CoreError> {
        let next = match (current, event) {
            (CredentialStatus::Pending, LifecycleEvent::IssuanceFinalized) => {
                CredentialStatus::Active
            }
            (CredentialStatus::Pending, LifecycleEvent::IssuanceFailed { .. }) => {
                CredentialStatus::Failed
            }
            (CredentialStatus::Active, LifecycleEvent::RevocationFinalized { .. }) => {
                CredentialStatus::Revoked
            }
            _ => {
                return Err(CoreError::InvalidStateTransition {
                    from: current,
                    to: event.target(),
                });
            }
        };

        tracing::debug!(from = %current, to = %next, event = ?event, "credential status transition");

        Ok(next)
    }

    /// Check if a transition is valid without performing it.
    pub fn can_transition(current: CredentialStatus, event: &LifecycleEvent) -> bool {
        Self::transition(current, event).is_ok()
    }
}
