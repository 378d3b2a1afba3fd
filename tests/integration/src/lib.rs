//! Shared harness for the end-to-end scenarios.
//!
//! Each harness wires an [`AttestEngine`] to an in-process ledger and an
//! in-memory index store. Blocks are mined explicitly with
//! [`Harness::mine`] so tests control exactly when finality is reached.

use std::future::Future;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use attest_core::{Credential, CredentialId, CredentialStatus, DocumentHash, EngineConfig};
use attest_engine::AttestEngine;
use attest_ledger::{ChainJournal, ChainRecord, ChainState, LedgerError, SimulatedLedger};
use attest_store::MemoryIndexStore;

pub const CONFIRMATIONS: u32 = 3;

static TRACING: Once = Once::new();

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Engine config tuned for tests: shallow finality and fast polling.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        required_confirmations: CONFIRMATIONS,
        poll_interval_ms: 10,
        backoff_initial_ms: 5,
        backoff_max_ms: 50,
        ..Default::default()
    }
}

pub struct Harness {
    pub engine: AttestEngine,
    pub ledger: Arc<SimulatedLedger>,
    pub store: Arc<MemoryIndexStore>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        init_tracing();
        let ledger = Arc::new(SimulatedLedger::new());
        let store = Arc::new(MemoryIndexStore::new());
        Self::reopen(config, ledger, store).await
    }

    /// Open a fresh engine over existing ledger and store, as after a restart.
    pub async fn reopen(
        config: EngineConfig,
        ledger: Arc<SimulatedLedger>,
        store: Arc<MemoryIndexStore>,
    ) -> Self {
        let engine = AttestEngine::open(config, ledger.clone(), store.clone())
            .await
            .expect("engine opens");
        Self {
            engine,
            ledger,
            store,
        }
    }

    /// Mine enough blocks for everything submitted so far to be final.
    pub fn finalize_all(&self) {
        self.ledger.mine_blocks(CONFIRMATIONS as u64);
    }

    pub fn mine(&self, blocks: u64) {
        self.ledger.mine_blocks(blocks);
    }

    pub async fn cached(&self, id: &CredentialId) -> Option<Credential> {
        self.engine.credential(id).await.expect("cache read")
    }

    /// Wait until the cached row for `id` reaches `status`.
    pub async fn wait_for_status(&self, id: &CredentialId, status: CredentialStatus) -> bool {
        wait_until(Duration::from_secs(5), || async move {
            matches!(self.cached(id).await, Some(c) if c.status == status)
        })
        .await
    }
}

/// Chain journal kept in memory, so a "restarted" ledger can be rebuilt
/// from what the previous one recorded.
#[derive(Default)]
pub struct MemoryJournal {
    state: Mutex<ChainState>,
}

impl ChainJournal for MemoryJournal {
    fn load(&self) -> Result<ChainState, LedgerError> {
        Ok(self.state.lock().expect("journal lock").clone())
    }

    fn append(&self, records: &[ChainRecord], height: Option<u64>) -> Result<(), LedgerError> {
        let mut state = self.state.lock().expect("journal lock");
        for record in records {
            state.records.retain(|r| r.hash != record.hash);
            state.records.push(record.clone());
        }
        if let Some(height) = height {
            state.height = height;
        }
        Ok(())
    }
}

pub fn id(raw: &str) -> CredentialId {
    CredentialId::new(raw).expect("valid id")
}

pub fn doc(content: &str) -> DocumentHash {
    DocumentHash::of(content.as_bytes())
}

/// Poll `check` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
