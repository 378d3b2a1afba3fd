//! Node lifecycle: store, ledger, engine and HTTP API wired together.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use attest_engine::{AttestEngine, EngineEvent, EventKind};
use attest_ledger::{LedgerClient, SimulatedLedger};
use attest_store::{IndexStore, MemoryIndexStore};

use crate::config::{AttestConfig, StorageBackend};
use crate::state::NodeState;
use crate::storage::RocksIndexStore;

pub struct AttestNode {
    config: AttestConfig,
    engine: Option<Arc<AttestEngine>>,
    event_rx: Option<broadcast::Receiver<EngineEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl AttestNode {
    pub fn new(config: AttestConfig) -> Result<Self> {
        config
            .engine
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid engine config: {}", e))?;
        Ok(Self {
            config,
            engine: None,
            event_rx: None,
            tasks: Vec::new(),
        })
    }

    /// Open the store, start the ledger, replay unfinished work and bind the API.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("starting Attest node");

        // A persistent cache needs a persistent chain under it, or recovery
        // would find every pending transaction unknown.
        let (store, ledger): (Arc<dyn IndexStore>, Arc<SimulatedLedger>) =
            match self.config.storage.backend {
                StorageBackend::Rocksdb => {
                    let store = Arc::new(RocksIndexStore::open(&self.config.storage.data_dir)?);
                    let ledger = SimulatedLedger::with_journal(store.clone())?;
                    (store as Arc<dyn IndexStore>, Arc::new(ledger))
                }
                StorageBackend::Memory => {
                    tracing::warn!("using in-memory index store and ledger; state is lost on exit");
                    (
                        Arc::new(MemoryIndexStore::new()) as Arc<dyn IndexStore>,
                        Arc::new(SimulatedLedger::new()),
                    )
                }
            };

        let block_interval = Duration::from_millis(self.config.ledger.block_interval_ms);
        self.tasks
            .push(ledger.clone().spawn_block_producer(block_interval));
        let ledger_id = ledger.ledger_id().to_string();

        let engine = Arc::new(AttestEngine::open(self.config.engine.clone(), ledger, store).await?);
        let event_rx = engine.subscribe();

        engine.recover().await?;

        let api_addr: SocketAddr = self.config.api_addr().parse()?;
        let state = Arc::new(NodeState::new(engine.clone(), ledger_id));
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = crate::api::start_api_server(api_addr, state).await {
                tracing::error!(error = %e, "HTTP API server error");
            }
        }));

        self.engine = Some(engine);
        self.event_rx = Some(event_rx);
        Ok(())
    }

    /// Log outbound engine events until the channel closes.
    pub async fn run(&mut self) -> Result<()> {
        let mut event_rx = self
            .event_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("node not started"))?;

        tracing::info!("entering main event loop");
        loop {
            match event_rx.recv().await {
                Ok(event) => Self::handle_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("engine event channel closed");
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_event(event: &EngineEvent) {
        match event.kind {
            EventKind::IndexConflict => tracing::error!(
                credential = %event.credential_id,
                detail = event.detail.as_deref().unwrap_or(""),
                "index conflict"
            ),
            EventKind::IssuanceFailed | EventKind::RevocationFailed => tracing::warn!(
                kind = %event.kind,
                credential = %event.credential_id,
                detail = event.detail.as_deref().unwrap_or(""),
                "ledger transaction failed"
            ),
            _ => tracing::info!(
                kind = %event.kind,
                credential = %event.credential_id,
                tx = event.tx_hash.as_ref().map(|h| h.as_str()).unwrap_or(""),
                "credential event"
            ),
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("shutting down Attest node");
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.event_rx = None;
        if let Some(engine) = self.engine.take() {
            drop(engine);
            tracing::info!("engine closed");
        }
        Ok(())
    }

    pub fn engine(&self) -> Option<&Arc<AttestEngine>> {
        self.engine.as_ref()
    }
}
