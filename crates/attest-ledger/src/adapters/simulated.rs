use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use attest_core::{CredentialId, LedgerPayload, TxHash, TxKind};

use crate::error::LedgerError;
use crate::traits::{LedgerClient, LedgerStatus};

/// A transaction as the simulated chain sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub hash: TxHash,
    pub kind: TxKind,
    pub payload: LedgerPayload,
    /// Submission order, used to mine in arrival order.
    pub sequence: u64,
    /// Block height the transaction was included at.
    pub included_at: Option<u64>,
    /// Set when the chain rejected the transaction.
    pub rejection: Option<String>,
}

impl ChainRecord {
    fn is_settled_on_chain(&self) -> bool {
        self.included_at.is_some() && self.rejection.is_none()
    }
}

/// Persisted chain contents, as loaded back from a journal.
#[derive(Debug, Clone, Default)]
pub struct ChainState {
    pub height: u64,
    pub records: Vec<ChainRecord>,
}

/// Durable backing for a [`SimulatedLedger`].
///
/// Without a journal the simulated chain lives only in memory, which is
/// fine for tests but not for a node whose index store outlives the process.
pub trait ChainJournal: Send + Sync {
    /// Everything recorded so far.
    fn load(&self) -> Result<ChainState, LedgerError>;

    /// Persist changed records and, when given, the new chain height, in
    /// one atomic write.
    fn append(&self, records: &[ChainRecord], height: Option<u64>) -> Result<(), LedgerError>;
}

/// In-process append-only ledger.
///
/// Transactions enter a mempool on `submit` and are included, in submission
/// order, by the next mined block. Confirmation depth is
/// `height - included_at + 1`. Inclusion enforces the on-chain rules: an
/// identifier can be issued once and only an issued identifier can be
/// revoked; violating transactions are rejected. Outages, latency and
/// rejections can be injected for testing. With a [`ChainJournal`] attached
/// every change is written through, so the chain survives a restart.
pub struct SimulatedLedger {
    /// Transactions keyed by hash.
    transactions: DashMap<TxHash, ChainRecord>,
    /// Current block height.
    height: AtomicU64,
    /// Submission counter (also the hash nonce).
    submissions: AtomicU64,
    /// When false every call fails with `Unavailable`.
    available: AtomicBool,
    /// Artificial delay applied to every call.
    latency_ms: AtomicU64,
    journal: Option<Arc<dyn ChainJournal>>,
}

impl SimulatedLedger {
    /// Create an empty ledger at height 0.
    pub fn new() -> Self {
        Self {
            transactions: DashMap::new(),
            height: AtomicU64::new(0),
            submissions: AtomicU64::new(0),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            journal: None,
        }
    }

    /// Restore the chain recorded in `journal` and keep writing through to it.
    pub fn with_journal(journal: Arc<dyn ChainJournal>) -> Result<Self, LedgerError> {
        let state = journal.load()?;
        let next_sequence = state
            .records
            .iter()
            .map(|r| r.sequence + 1)
            .max()
            .unwrap_or(0);
        let transactions = DashMap::new();
        for record in state.records {
            transactions.insert(record.hash.clone(), record);
        }
        tracing::info!(
            height = state.height,
            transactions = transactions.len(),
            "simulated chain restored from journal"
        );
        Ok(Self {
            transactions,
            height: AtomicU64::new(state.height),
            submissions: AtomicU64::new(next_sequence),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            journal: Some(journal),
        })
    }

    /// Current block height.
    pub fn height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    /// Total number of transactions ever submitted.
    pub fn submission_count(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Number of submitted transactions of the given kind for an identifier.
    pub fn submissions_for(&self, id: &CredentialId, kind: TxKind) -> usize {
        self.transactions
            .iter()
            .filter(|t| t.kind == kind && &t.payload.credential_id == id)
            .count()
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        tracing::info!(available, "simulated ledger availability changed");
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Force a transaction to fail on-chain.
    pub fn fail_transaction(&self, hash: &TxHash, reason: impl Into<String>) -> bool {
        let record = match self.transactions.get_mut(hash) {
            Some(mut tx) => {
                tx.rejection = Some(reason.into());
                tx.clone()
            }
            None => return false,
        };
        self.journal(&[record], None);
        true
    }

    /// Mine `blocks` blocks. The first one includes every valid mempool
    /// transaction.
    pub fn mine_blocks(&self, blocks: u64) {
        for _ in 0..blocks {
            let height = self.height.fetch_add(1, Ordering::SeqCst) + 1;
            self.include_mempool(height);
        }
        tracing::debug!(height = self.height(), blocks, "simulated blocks mined");
    }

    /// Spawn a task mining one block every `interval`.
    pub fn spawn_block_producer(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.mine_blocks(1);
            }
        })
    }

    fn include_mempool(&self, height: u64) {
        let mut changed = Vec::new();
        let mut mempool: Vec<ChainRecord> = self
            .transactions
            .iter()
            .filter(|t| t.included_at.is_none() && t.rejection.is_none())
            .map(|t| t.value().clone())
            .collect();
        mempool.sort_by_key(|t| t.sequence);

        for tx in mempool {
            let verdict = self.validate_inclusion(&tx);
            if let Some(mut entry) = self.transactions.get_mut(&tx.hash) {
                match verdict {
                    Ok(()) => entry.included_at = Some(height),
                    Err(reason) => {
                        tracing::debug!(tx_hash = %tx.hash, %reason, "simulated ledger rejected transaction");
                        entry.rejection = Some(reason);
                    }
                }
                changed.push(entry.clone());
            }
        }
        self.journal(&changed, Some(height));
    }

    /// Write through to the journal. Mining has no caller to report to, so
    /// failures are logged.
    fn journal(&self, records: &[ChainRecord], height: Option<u64>) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.append(records, height) {
                tracing::error!(error = %err, "chain journal write failed");
            }
        }
    }

    fn validate_inclusion(&self, tx: &ChainRecord) -> Result<(), String> {
        let id = &tx.payload.credential_id;
        match tx.kind {
            TxKind::Issue => {
                if self.settled(id, TxKind::Issue).is_some() {
                    return Err(format!("credential {} already issued", id));
                }
            }
            TxKind::Revoke => {
                if self.settled(id, TxKind::Issue).is_none() {
                    return Err(format!("credential {} was never issued", id));
                }
                if self.settled(id, TxKind::Revoke).is_some() {
                    return Err(format!("credential {} already revoked", id));
                }
            }
        }
        Ok(())
    }

    /// The on-chain (included, not rejected) transaction of `kind` for `id`.
    fn settled(&self, id: &CredentialId, kind: TxKind) -> Option<TxHash> {
        self.transactions
            .iter()
            .filter(|t| t.kind == kind && &t.payload.credential_id == id && t.is_settled_on_chain())
            .min_by_key(|t| t.sequence)
            .map(|t| t.hash.clone())
    }

    async fn gate(&self) -> Result<(), LedgerError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("simulated outage".into()));
        }
        Ok(())
    }
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    async fn submit(&self, kind: TxKind, payload: &[u8]) -> Result<TxHash, LedgerError> {
        self.gate().await?;
        let decoded = LedgerPayload::from_bytes(payload)
            .map_err(|e| LedgerError::InvalidPayload(e.to_string()))?;
        if kind == TxKind::Issue && decoded.document_hash.is_none() {
            return Err(LedgerError::InvalidPayload(
                "issue payload carries no document hash".into(),
            ));
        }

        let sequence = self.submissions.fetch_add(1, Ordering::SeqCst);
        let mut hasher = blake3::Hasher::new();
        hasher.update(&sequence.to_be_bytes());
        hasher.update(kind.to_string().as_bytes());
        hasher.update(payload);
        let hash = TxHash::new(format!("0x{}", hasher.finalize().to_hex()));

        let record = ChainRecord {
            hash: hash.clone(),
            kind,
            payload: decoded,
            sequence,
            included_at: None,
            rejection: None,
        };
        // Journal before the mempool sees it, so a mined copy is never
        // overwritten by this one.
        if let Some(journal) = &self.journal {
            journal.append(std::slice::from_ref(&record), None)?;
        }
        self.transactions.insert(hash.clone(), record);
        tracing::info!(tx_hash = %hash, %kind, "simulated ledger accepted transaction");
        Ok(hash)
    }

    async fn confirmations(&self, tx: &TxHash) -> Result<u32, LedgerError> {
        self.gate().await?;
        let entry = self
            .transactions
            .get(tx)
            .ok_or_else(|| LedgerError::UnknownTransaction(tx.clone()))?;
        if let Some(reason) = &entry.rejection {
            return Err(LedgerError::Rejected {
                hash: tx.clone(),
                reason: reason.clone(),
            });
        }
        let depth = match entry.included_at {
            Some(at) => self.height().saturating_sub(at) + 1,
            None => 0,
        };
        Ok(u32::try_from(depth).unwrap_or(u32::MAX))
    }

    async fn status(&self, id: &CredentialId) -> Result<LedgerStatus, LedgerError> {
        self.gate().await?;
        let issuance_tx = self.settled(id, TxKind::Issue);
        let revocation_tx = self.settled(id, TxKind::Revoke);
        Ok(LedgerStatus {
            exists: issuance_tx.is_some(),
            revoked: revocation_tx.is_some(),
            issuance_tx,
            revocation_tx,
        })
    }

    fn ledger_id(&self) -> &str {
        "simulated"
    }
}
