//! Attest Engine: keeps the index store consistent with ledger truth.
//!
//! - [`Reconciler`]: the only writer of credential rows. Submits issue and
//!   revoke transactions, watches them to finality, replays unfinished work
//!   after a crash and repairs rows the verifier found stale.
//! - [`Verifier`]: read-only; answers "is this credential valid right now",
//!   cache first, ledger on doubt.
//! - [`MigrationGuard`]: owns the unique-constraint lifecycle so a renamed
//!   identifier field never leaves a ghost index behind.

pub mod codec;
pub mod engine;
pub mod error;
pub mod events;
pub mod locks;
pub mod migration;
pub mod reconciler;
pub mod retry;
pub mod schema;
pub mod verifier;
mod watcher;

pub use engine::AttestEngine;
pub use error::EngineError;
pub use events::{EngineEvent, EventBus, EventKind};
pub use locks::KeyedLocks;
pub use migration::{MigrationGuard, MigrationStatus};
pub use reconciler::{Reconciler, RecoveryReport};
pub use retry::Backoff;
pub use schema::SchemaHandle;
pub use verifier::{Consistency, Verdict, VerdictSource, Verifier, VerifyTarget};
