//! Attest Index Store
//!
//! The durable, queryable cache of credential state. Documents are JSON
//! objects keyed by credential identifier; named unique indexes reject
//! conflicting writes. The store also keeps the ledger-transaction audit
//! log and the unique-constraint catalog.

pub mod backend;
pub mod document;
pub mod error;
pub mod memory;

pub use backend::IndexStore;
pub use document::{Document, IndexSpec, VERSION_FIELD};
pub use error::StoreError;
pub use memory::MemoryIndexStore;
