use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use attest_core::{Credential, CredentialId, DocumentHash, EngineConfig, LedgerTransaction};
use attest_ledger::LedgerClient;
use attest_store::IndexStore;

use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::locks::KeyedLocks;
use crate::migration::MigrationGuard;
use crate::reconciler::{Reconciler, RecoveryReport};
use crate::schema::SchemaHandle;
use crate::verifier::{Consistency, Verdict, Verifier};

/// The assembled engine: reconciler, verifier and migration guard sharing
/// one store, one ledger, one lock table and one schema view.
pub struct AttestEngine {
    config: EngineConfig,
    reconciler: Reconciler,
    verifier: Verifier,
    migrations: MigrationGuard,
    events: EventBus,
    repair_worker: JoinHandle<()>,
}

impl AttestEngine {
    /// Validate the configuration, load the constraint catalog and start the
    /// repair worker. Must be called inside a Tokio runtime.
    pub async fn open(
        config: EngineConfig,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn IndexStore>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let schema = SchemaHandle::new();
        let locks = Arc::new(KeyedLocks::new());
        let events = EventBus::new(config.event_channel_capacity);

        let migrations = MigrationGuard::new(store.clone(), schema.clone(), locks.clone());
        migrations.bootstrap().await?;

        let reconciler = Reconciler::new(
            config.clone(),
            ledger.clone(),
            store.clone(),
            schema.clone(),
            locks,
            events.clone(),
        );
        let (repair_tx, repair_rx) = mpsc::channel(config.repair_queue_capacity);
        let verifier = Verifier::new(config.clone(), ledger.clone(), store, schema, repair_tx);
        let repair_worker = reconciler.spawn_repair_worker(repair_rx);

        tracing::info!(
            ledger = ledger.ledger_id(),
            required_confirmations = config.required_confirmations,
            "engine opened"
        );
        Ok(Self {
            config,
            reconciler,
            verifier,
            migrations,
            events,
            repair_worker,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    pub fn migrations(&self) -> &MigrationGuard {
        &self.migrations
    }

    /// Subscribe to outbound events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn issue(
        &self,
        id: CredentialId,
        document_hash: DocumentHash,
    ) -> Result<Credential, EngineError> {
        self.reconciler.issue(id, document_hash).await
    }

    pub async fn revoke(&self, id: CredentialId) -> Result<LedgerTransaction, EngineError> {
        self.reconciler.revoke(id).await
    }

    pub async fn verify(&self, raw: &str, consistency: Consistency) -> Result<Verdict, EngineError> {
        self.verifier.verify(raw, consistency).await
    }

    /// Cached row, if any.
    pub async fn credential(&self, id: &CredentialId) -> Result<Option<Credential>, EngineError> {
        self.verifier.cached(id).await
    }

    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        self.reconciler.recover().await
    }

    /// Replay the full audit log into a store that lost its rows.
    pub async fn rebuild(&self) -> Result<RecoveryReport, EngineError> {
        self.reconciler.rebuild().await
    }
}

impl Drop for AttestEngine {
    fn drop(&mut self) {
        self.repair_worker.abort();
    }
}
