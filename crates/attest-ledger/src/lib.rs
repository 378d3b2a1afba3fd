//! Attest Ledger Layer
//!
//! Defines the boundary to the append-only ledger that holds the
//! authoritative issuance and revocation record, plus an in-process
//! simulated ledger used by the node and the test suites.

pub mod adapters;
pub mod error;
pub mod traits;

pub use adapters::simulated::{ChainJournal, ChainRecord, ChainState, SimulatedLedger};
pub use error::LedgerError;
pub use traits::{LedgerClient, LedgerStatus};
