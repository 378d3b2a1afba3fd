use async_trait::async_trait;
use serde_json::Value;

use attest_core::{CredentialId, IndexConstraint, LedgerTransaction, TxHash};

use crate::document::{Document, IndexSpec};
use crate::error::StoreError;

/// Index store interface.
///
/// Implementations must make `upsert` atomic with respect to unique-index
/// checks: either the document and all its index entries are written, or
/// nothing is.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert or replace the document stored under `key`.
    async fn upsert(&self, key: &str, doc: Document) -> Result<(), StoreError>;

    /// Read a document by key.
    async fn get(&self, key: &str) -> Result<Option<Document>, StoreError>;

    /// First document whose `field` equals `value`.
    async fn find_by_field(
        &self,
        field: &str,
        value: &Value,
    ) -> Result<Option<(String, Document)>, StoreError>;

    /// Every stored document.
    async fn scan(&self) -> Result<Vec<(String, Document)>, StoreError>;

    /// Create a unique index over existing and future documents.
    ///
    /// Returns `Ok(false)` if an identical index already exists; fails with
    /// `DuplicateKey` if existing documents already violate it.
    async fn create_unique_index(&self, spec: IndexSpec) -> Result<bool, StoreError>;

    /// Drop a unique index. Returns `Ok(false)` if it did not exist.
    async fn drop_index(&self, name: &str) -> Result<bool, StoreError>;

    /// All physical unique indexes.
    async fn list_indexes(&self) -> Result<Vec<IndexSpec>, StoreError>;

    /// Insert or replace an audit-log transaction record.
    async fn put_transaction(&self, tx: &LedgerTransaction) -> Result<(), StoreError>;

    /// Read an audit-log transaction record.
    async fn get_transaction(&self, hash: &TxHash) -> Result<Option<LedgerTransaction>, StoreError>;

    /// Every audit-log transaction record, oldest first.
    async fn list_transactions(&self) -> Result<Vec<LedgerTransaction>, StoreError>;

    /// Audit-log records of one credential, oldest first.
    async fn transactions_for_credential(
        &self,
        id: &CredentialId,
    ) -> Result<Vec<LedgerTransaction>, StoreError>;

    /// Audit-log records whose outcome is still pending, oldest first.
    async fn list_pending_transactions(&self) -> Result<Vec<LedgerTransaction>, StoreError>;

    /// Insert or replace a constraint catalog entry.
    async fn put_constraint(&self, constraint: &IndexConstraint) -> Result<(), StoreError>;

    /// The full constraint catalog.
    async fn list_constraints(&self) -> Result<Vec<IndexConstraint>, StoreError>;
}
