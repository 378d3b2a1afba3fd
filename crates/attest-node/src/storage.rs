//! RocksDB storage backend for the Attest node.

use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use tokio::sync::Mutex;

use attest_core::{CredentialId, IndexConstraint, LedgerTransaction, TxHash, TxOutcome};
use attest_ledger::{ChainJournal, ChainRecord, ChainState, LedgerError};
use attest_store::document::check_version;
use attest_store::{Document, IndexSpec, IndexStore, StoreError};

/// Column family names for different data types.
const CF_DOCUMENTS: &str = "documents";
const CF_INDEX_SPECS: &str = "index_specs";
/// Keys are `index name \0 index key`, values the owning document key.
const CF_INDEX_ENTRIES: &str = "index_entries";
const CF_TRANSACTIONS: &str = "transactions";
/// Keys are `credential id \0 tx hash`, values empty.
const CF_TX_BY_CREDENTIAL: &str = "tx_by_credential";
/// Hashes of audit records still pending, values empty.
const CF_PENDING_TRANSACTIONS: &str = "pending_transactions";
const CF_CONSTRAINTS: &str = "constraints";
/// Simulated chain journal: records keyed by hash, plus the height.
const CF_CHAIN: &str = "chain";
const CF_CHAIN_META: &str = "chain_meta";

const CHAIN_HEIGHT_KEY: &[u8] = b"height";

const ENTRY_SEPARATOR: u8 = 0;

/// RocksDB-backed index store.
///
/// Every mutation of documents or indexes runs under one writer lock and
/// lands in a single `WriteBatch`, so a document and its index entries are
/// written together or not at all.
pub struct RocksIndexStore {
    db: DB,
    writer: Mutex<()>,
}

fn backend(err: rocksdb::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn journal(err: impl std::fmt::Display) -> LedgerError {
    LedgerError::Journal(err.to_string())
}

fn entry_key(index: &str, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(index.len() + key.len() + 1);
    out.extend_from_slice(index.as_bytes());
    out.push(ENTRY_SEPARATOR);
    out.extend_from_slice(key.as_bytes());
    out
}

impl RocksIndexStore {
    /// Open or create a RocksDB database at the given path with column families.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_DOCUMENTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_INDEX_SPECS, Options::default()),
            ColumnFamilyDescriptor::new(CF_INDEX_ENTRIES, Options::default()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Options::default()),
            ColumnFamilyDescriptor::new(CF_TX_BY_CREDENTIAL, Options::default()),
            ColumnFamilyDescriptor::new(CF_PENDING_TRANSACTIONS, Options::default()),
            ColumnFamilyDescriptor::new(CF_CONSTRAINTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_CHAIN, Options::default()),
            ColumnFamilyDescriptor::new(CF_CHAIN_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)?;
        tracing::info!(path = %path.display(), "rocksdb index store opened");

        Ok(Self {
            db,
            writer: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("column family '{}' not found", name)))
    }

    fn get_json<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key).map_err(backend)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn all_json<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<(String, T)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(backend)?;
            out.push((
                String::from_utf8_lossy(&key).into_owned(),
                serde_json::from_slice(&value)?,
            ));
        }
        Ok(out)
    }

    fn index_specs(&self) -> Result<Vec<IndexSpec>, StoreError> {
        Ok(self
            .all_json::<IndexSpec>(CF_INDEX_SPECS)?
            .into_iter()
            .map(|(_, spec)| spec)
            .collect())
    }

    fn index_owner(&self, index: &str, key: &str) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_INDEX_ENTRIES)?;
        Ok(self
            .db
            .get_cf(cf, entry_key(index, key))
            .map_err(backend)?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Every key in `cf_name` starting with `prefix`.
    fn prefixed_keys(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut keys = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = item.map_err(backend)?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    /// Audit records for the given hashes, oldest first. Hashes without a
    /// record are skipped.
    fn transactions_by_hash<I>(&self, hashes: I) -> Result<Vec<LedgerTransaction>, StoreError>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut txs = Vec::new();
        for hash in hashes {
            if let Some(tx) = self.get_json::<LedgerTransaction>(CF_TRANSACTIONS, &hash)? {
                txs.push(tx);
            }
        }
        txs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(txs)
    }
}

#[async_trait]
impl IndexStore for RocksIndexStore {
    async fn upsert(&self, key: &str, doc: Document) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;

        let previous: Option<Document> = self.get_json(CF_DOCUMENTS, key.as_bytes())?;
        check_version(key, previous.as_ref(), &doc)?;

        let specs = self.index_specs()?;
        for spec in &specs {
            let index_key = spec.key_for(&doc);
            if let Some(owner) = self.index_owner(&spec.name, &index_key)? {
                if owner != key {
                    return Err(StoreError::DuplicateKey {
                        index: spec.name.clone(),
                        key: index_key,
                    });
                }
            }
        }

        let entries = self.cf(CF_INDEX_ENTRIES)?;
        let mut batch = WriteBatch::default();
        if let Some(previous) = &previous {
            for spec in &specs {
                let old_key = spec.key_for(previous);
                if self.index_owner(&spec.name, &old_key)?.as_deref() == Some(key) {
                    batch.delete_cf(entries, entry_key(&spec.name, &old_key));
                }
            }
        }
        for spec in &specs {
            batch.put_cf(entries, entry_key(&spec.name, &spec.key_for(&doc)), key.as_bytes());
        }
        batch.put_cf(self.cf(CF_DOCUMENTS)?, key.as_bytes(), serde_json::to_vec(&doc)?);
        self.db.write(batch).map_err(backend)
    }

    async fn get(&self, key: &str) -> Result<Option<Document>, StoreError> {
        self.get_json(CF_DOCUMENTS, key.as_bytes())
    }

    async fn find_by_field(
        &self,
        field: &str,
        value: &Value,
    ) -> Result<Option<(String, Document)>, StoreError> {
        let indexed = self
            .index_specs()?
            .into_iter()
            .find(|s| s.fields.len() == 1 && s.fields[0] == field);
        if let Some(spec) = indexed {
            let index_key = serde_json::to_string(&[value])?;
            return match self.index_owner(&spec.name, &index_key)? {
                Some(owner) => Ok(self
                    .get_json::<Document>(CF_DOCUMENTS, owner.as_bytes())?
                    .map(|doc| (owner, doc))),
                None => Ok(None),
            };
        }

        Ok(self
            .all_json::<Document>(CF_DOCUMENTS)?
            .into_iter()
            .find(|(_, doc)| doc.get(field) == Some(value)))
    }

    async fn scan(&self) -> Result<Vec<(String, Document)>, StoreError> {
        self.all_json(CF_DOCUMENTS)
    }

    async fn create_unique_index(&self, spec: IndexSpec) -> Result<bool, StoreError> {
        let _writer = self.writer.lock().await;

        let existing: Option<IndexSpec> = self.get_json(CF_INDEX_SPECS, spec.name.as_bytes())?;
        if let Some(existing) = existing {
            if existing.fields == spec.fields {
                return Ok(false);
            }
            return Err(StoreError::IndexMismatch(spec.name));
        }

        let entries = self.cf(CF_INDEX_ENTRIES)?;
        let mut seen = std::collections::HashSet::new();
        let mut batch = WriteBatch::default();
        for (key, doc) in self.all_json::<Document>(CF_DOCUMENTS)? {
            let index_key = spec.key_for(&doc);
            if !seen.insert(index_key.clone()) {
                return Err(StoreError::DuplicateKey {
                    index: spec.name,
                    key: index_key,
                });
            }
            batch.put_cf(entries, entry_key(&spec.name, &index_key), key.as_bytes());
        }
        batch.put_cf(self.cf(CF_INDEX_SPECS)?, spec.name.as_bytes(), serde_json::to_vec(&spec)?);
        self.db.write(batch).map_err(backend)?;

        tracing::info!(index = %spec.name, fields = ?spec.fields, "unique index created");
        Ok(true)
    }

    async fn drop_index(&self, name: &str) -> Result<bool, StoreError> {
        let _writer = self.writer.lock().await;

        let existing: Option<IndexSpec> = self.get_json(CF_INDEX_SPECS, name.as_bytes())?;
        if existing.is_none() {
            return Ok(false);
        }

        let entries = self.cf(CF_INDEX_ENTRIES)?;
        let mut batch = WriteBatch::default();
        for key in self.prefixed_keys(CF_INDEX_ENTRIES, &entry_key(name, ""))? {
            batch.delete_cf(entries, key);
        }
        batch.delete_cf(self.cf(CF_INDEX_SPECS)?, name.as_bytes());
        self.db.write(batch).map_err(backend)?;

        tracing::info!(index = name, "unique index dropped");
        Ok(true)
    }

    async fn list_indexes(&self) -> Result<Vec<IndexSpec>, StoreError> {
        self.index_specs()
    }

    async fn put_transaction(&self, tx: &LedgerTransaction) -> Result<(), StoreError> {
        let hash = tx.hash.as_str().as_bytes();
        let pending = self.cf(CF_PENDING_TRANSACTIONS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_TRANSACTIONS)?, hash, serde_json::to_vec(tx)?);
        batch.put_cf(
            self.cf(CF_TX_BY_CREDENTIAL)?,
            entry_key(tx.credential_id.as_str(), tx.hash.as_str()),
            b"",
        );
        if tx.outcome == TxOutcome::Pending {
            batch.put_cf(pending, hash, b"");
        } else {
            batch.delete_cf(pending, hash);
        }
        self.db.write(batch).map_err(backend)
    }

    async fn get_transaction(&self, hash: &TxHash) -> Result<Option<LedgerTransaction>, StoreError> {
        self.get_json(CF_TRANSACTIONS, hash.as_str().as_bytes())
    }

    async fn list_transactions(&self) -> Result<Vec<LedgerTransaction>, StoreError> {
        let mut txs: Vec<LedgerTransaction> = self
            .all_json::<LedgerTransaction>(CF_TRANSACTIONS)?
            .into_iter()
            .map(|(_, tx)| tx)
            .collect();
        txs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(txs)
    }

    async fn transactions_for_credential(
        &self,
        id: &CredentialId,
    ) -> Result<Vec<LedgerTransaction>, StoreError> {
        let prefix = entry_key(id.as_str(), "");
        let hashes = self
            .prefixed_keys(CF_TX_BY_CREDENTIAL, &prefix)?
            .into_iter()
            .map(|key| key[prefix.len()..].to_vec());
        self.transactions_by_hash(hashes)
    }

    async fn list_pending_transactions(&self) -> Result<Vec<LedgerTransaction>, StoreError> {
        let hashes = self.prefixed_keys(CF_PENDING_TRANSACTIONS, &[])?;
        self.transactions_by_hash(hashes)
    }

    async fn put_constraint(&self, constraint: &IndexConstraint) -> Result<(), StoreError> {
        let cf = self.cf(CF_CONSTRAINTS)?;
        self.db
            .put_cf(cf, constraint.name.as_bytes(), serde_json::to_vec(constraint)?)
            .map_err(backend)
    }

    async fn list_constraints(&self) -> Result<Vec<IndexConstraint>, StoreError> {
        let mut all: Vec<IndexConstraint> = self
            .all_json::<IndexConstraint>(CF_CONSTRAINTS)?
            .into_iter()
            .map(|(_, c)| c)
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }
}

impl ChainJournal for RocksIndexStore {
    fn load(&self) -> Result<ChainState, LedgerError> {
        let meta = self.cf(CF_CHAIN_META).map_err(journal)?;
        let height = match self.db.get_cf(meta, CHAIN_HEIGHT_KEY).map_err(journal)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| journal("corrupt chain height"))?;
                u64::from_be_bytes(raw)
            }
            None => 0,
        };
        let records = self
            .all_json::<ChainRecord>(CF_CHAIN)
            .map_err(journal)?
            .into_iter()
            .map(|(_, record)| record)
            .collect();
        Ok(ChainState { height, records })
    }

    fn append(&self, records: &[ChainRecord], height: Option<u64>) -> Result<(), LedgerError> {
        let chain = self.cf(CF_CHAIN).map_err(journal)?;
        let mut batch = WriteBatch::default();
        for record in records {
            batch.put_cf(
                chain,
                record.hash.as_str().as_bytes(),
                serde_json::to_vec(record).map_err(journal)?,
            );
        }
        if let Some(height) = height {
            let meta = self.cf(CF_CHAIN_META).map_err(journal)?;
            batch.put_cf(meta, CHAIN_HEIGHT_KEY, height.to_be_bytes());
        }
        self.db.write(batch).map_err(journal)
    }
}
