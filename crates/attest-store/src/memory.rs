use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use attest_core::{CredentialId, IndexConstraint, LedgerTransaction, TxHash, TxOutcome};

use crate::backend::IndexStore;
use crate::document::{check_version, Document, IndexSpec};
use crate::error::StoreError;

/// A unique index: spec plus index key to owning document key.
#[derive(Debug, Clone)]
struct UniqueIndex {
    spec: IndexSpec,
    entries: HashMap<String, String>,
}

/// Documents and indexes, guarded together so upserts are atomic.
#[derive(Debug, Default)]
struct Collection {
    documents: BTreeMap<String, Document>,
    indexes: BTreeMap<String, UniqueIndex>,
}

/// In-memory index store.
///
/// Suitable for tests and for running a node without persistence.
pub struct MemoryIndexStore {
    collection: RwLock<Collection>,
    /// Audit log keyed by transaction hash.
    transactions: DashMap<TxHash, LedgerTransaction>,
    /// Audit-log hashes per credential.
    by_credential: DashMap<CredentialId, Vec<TxHash>>,
    /// Constraint catalog keyed by constraint name.
    constraints: DashMap<String, IndexConstraint>,
}

impl MemoryIndexStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            collection: RwLock::new(Collection::default()),
            transactions: DashMap::new(),
            by_credential: DashMap::new(),
            constraints: DashMap::new(),
        }
    }

    /// Number of stored documents.
    pub async fn document_count(&self) -> usize {
        self.collection.read().await.documents.len()
    }
}

impl Default for MemoryIndexStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn upsert(&self, key: &str, doc: Document) -> Result<(), StoreError> {
        let mut guard = self.collection.write().await;
        let collection = &mut *guard;

        check_version(key, collection.documents.get(key), &doc)?;

        for (name, index) in &collection.indexes {
            let index_key = index.spec.key_for(&doc);
            if let Some(owner) = index.entries.get(&index_key) {
                if owner != key {
                    return Err(StoreError::DuplicateKey {
                        index: name.clone(),
                        key: index_key,
                    });
                }
            }
        }

        if let Some(previous) = collection.documents.get(key) {
            for index in collection.indexes.values_mut() {
                let old_key = index.spec.key_for(previous);
                if index.entries.get(&old_key).map(String::as_str) == Some(key) {
                    index.entries.remove(&old_key);
                }
            }
        }
        for index in collection.indexes.values_mut() {
            index.entries.insert(index.spec.key_for(&doc), key.to_string());
        }
        collection.documents.insert(key.to_string(), doc);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.collection.read().await.documents.get(key).cloned())
    }

    async fn find_by_field(
        &self,
        field: &str,
        value: &Value,
    ) -> Result<Option<(String, Document)>, StoreError> {
        let collection = self.collection.read().await;

        let indexed = collection
            .indexes
            .values()
            .find(|i| i.spec.fields.len() == 1 && i.spec.fields[0] == field);
        if let Some(index) = indexed {
            let index_key = serde_json::to_string(&[value])?;
            return Ok(index.entries.get(&index_key).and_then(|owner| {
                collection
                    .documents
                    .get(owner)
                    .map(|d| (owner.clone(), d.clone()))
            }));
        }

        Ok(collection
            .documents
            .iter()
            .find(|(_, d)| d.get(field) == Some(value))
            .map(|(k, d)| (k.clone(), d.clone())))
    }

    async fn scan(&self) -> Result<Vec<(String, Document)>, StoreError> {
        let collection = self.collection.read().await;
        Ok(collection
            .documents
            .iter()
            .map(|(k, d)| (k.clone(), d.clone()))
            .collect())
    }

    async fn create_unique_index(&self, spec: IndexSpec) -> Result<bool, StoreError> {
        let mut collection = self.collection.write().await;

        if let Some(existing) = collection.indexes.get(&spec.name) {
            if existing.spec.fields == spec.fields {
                return Ok(false);
            }
            return Err(StoreError::IndexMismatch(spec.name));
        }

        let mut entries = HashMap::new();
        for (key, doc) in &collection.documents {
            let index_key = spec.key_for(doc);
            if entries.insert(index_key.clone(), key.clone()).is_some() {
                return Err(StoreError::DuplicateKey {
                    index: spec.name,
                    key: index_key,
                });
            }
        }

        tracing::info!(index = %spec.name, fields = ?spec.fields, "unique index created");
        collection
            .indexes
            .insert(spec.name.clone(), UniqueIndex { spec, entries });
        Ok(true)
    }

    async fn drop_index(&self, name: &str) -> Result<bool, StoreError> {
        let dropped = self.collection.write().await.indexes.remove(name).is_some();
        if dropped {
            tracing::info!(index = name, "unique index dropped");
        }
        Ok(dropped)
    }

    async fn list_indexes(&self) -> Result<Vec<IndexSpec>, StoreError> {
        let collection = self.collection.read().await;
        Ok(collection.indexes.values().map(|i| i.spec.clone()).collect())
    }

    async fn put_transaction(&self, tx: &LedgerTransaction) -> Result<(), StoreError> {
        self.transactions.insert(tx.hash.clone(), tx.clone());
        let mut hashes = self.by_credential.entry(tx.credential_id.clone()).or_default();
        if !hashes.contains(&tx.hash) {
            hashes.push(tx.hash.clone());
        }
        Ok(())
    }

    async fn get_transaction(
        &self,
        hash: &TxHash,
    ) -> Result<Option<LedgerTransaction>, StoreError> {
        Ok(self.transactions.get(hash).map(|t| t.value().clone()))
    }

    async fn list_transactions(&self) -> Result<Vec<LedgerTransaction>, StoreError> {
        let mut txs: Vec<LedgerTransaction> =
            self.transactions.iter().map(|t| t.value().clone()).collect();
        txs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(txs)
    }

    async fn transactions_for_credential(
        &self,
        id: &CredentialId,
    ) -> Result<Vec<LedgerTransaction>, StoreError> {
        let hashes = match self.by_credential.get(id) {
            Some(hashes) => hashes.value().clone(),
            None => return Ok(Vec::new()),
        };
        let mut txs: Vec<LedgerTransaction> = hashes
            .iter()
            .filter_map(|h| self.transactions.get(h).map(|t| t.value().clone()))
            .collect();
        txs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(txs)
    }

    async fn list_pending_transactions(&self) -> Result<Vec<LedgerTransaction>, StoreError> {
        let mut txs: Vec<LedgerTransaction> = self
            .transactions
            .iter()
            .filter(|t| t.outcome == TxOutcome::Pending)
            .map(|t| t.value().clone())
            .collect();
        txs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(txs)
    }

    async fn put_constraint(&self, constraint: &IndexConstraint) -> Result<(), StoreError> {
        self.constraints
            .insert(constraint.name.clone(), constraint.clone());
        Ok(())
    }

    async fn list_constraints(&self) -> Result<Vec<IndexConstraint>, StoreError> {
        let mut all: Vec<IndexConstraint> =
            self.constraints.iter().map(|c| c.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }
}
