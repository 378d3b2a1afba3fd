//! Attestation reconciler: the single writer of credential rows.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use attest_core::{
    ConstraintPurpose, ConstraintState, Credential, CredentialId, CredentialStatus, DocumentHash,
    EngineConfig, LedgerPayload, LedgerTransaction, LifecycleEvent, TxHash, TxKind, TxOutcome,
    VerificationToken,
};
use attest_ledger::{LedgerClient, LedgerError};
use attest_store::{IndexStore, StoreError};

use crate::codec;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus, EventKind};
use crate::locks::KeyedLocks;
use crate::retry::{with_timeout, Backoff};
use crate::schema::SchemaHandle;

/// What a crash-recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Audit-log records examined.
    pub scanned: usize,
    /// Records whose cache effect was (re)applied.
    pub replayed: usize,
    /// Pending records that reached a terminal outcome during recovery.
    pub settled: usize,
    /// Pending records handed back to a finality watcher.
    pub rearmed: usize,
    /// Records that could not be processed.
    pub errors: usize,
}

/// Ledger observation applied to a pending transaction.
enum Observation {
    Finalized(u32),
    Failed(String),
}

pub(crate) struct Inner {
    pub(crate) config: EngineConfig,
    pub(crate) ledger: Arc<dyn LedgerClient>,
    pub(crate) store: Arc<dyn IndexStore>,
    pub(crate) schema: SchemaHandle,
    pub(crate) locks: Arc<KeyedLocks<CredentialId>>,
    pub(crate) events: EventBus,
    pub(crate) retry: Backoff,
    /// Transactions that currently have a finality watcher.
    pub(crate) watched: DashMap<TxHash, ()>,
}

/// Drives issuance and revocation through the ledger and keeps the cached
/// rows in step with ledger outcomes.
///
/// Every mutation of a credential row happens under that identifier's lock,
/// so no two writers for the same id ever reach the submission step
/// together. Outcome application is idempotent, which makes duplicate
/// polling and crash replays harmless.
#[derive(Clone)]
pub struct Reconciler {
    pub(crate) inner: Arc<Inner>,
}

impl Reconciler {
    pub fn new(
        config: EngineConfig,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn IndexStore>,
        schema: SchemaHandle,
        locks: Arc<KeyedLocks<CredentialId>>,
        events: EventBus,
    ) -> Self {
        let retry = Backoff::from_config(&config);
        Self {
            inner: Arc::new(Inner {
                config,
                ledger,
                store,
                schema,
                locks,
                events,
                retry,
                watched: DashMap::new(),
            }),
        }
    }

    /// Submit an issuance and return the pending row without waiting for
    /// finality.
    ///
    /// Runs on its own task: once the ledger has the transaction, a caller
    /// dropping this future does not stop the row from being written.
    pub async fn issue(
        &self,
        id: CredentialId,
        document_hash: DocumentHash,
    ) -> Result<Credential, EngineError> {
        let this = self.clone();
        tokio::spawn(async move { this.issue_locked(id, document_hash).await })
            .await
            .map_err(|e| EngineError::Internal(format!("issue task aborted: {}", e)))?
    }

    async fn issue_locked(
        &self,
        id: CredentialId,
        document_hash: DocumentHash,
    ) -> Result<Credential, EngineError> {
        let _guard = self.inner.locks.lock(&id).await;

        let existing = self.credential(&id).await?;
        if let Some(existing) = &existing {
            match existing.status {
                CredentialStatus::Pending if existing.document_hash == document_hash => {
                    debug!(credential_id = %id, "issuance already in flight, returning pending row");
                    if let Some(hash) = existing.issuance_tx.clone() {
                        self.watch(hash);
                    }
                    return Ok(existing.clone());
                }
                CredentialStatus::Pending | CredentialStatus::Active | CredentialStatus::Revoked => {
                    return Err(EngineError::AlreadyExists(id));
                }
                CredentialStatus::Failed => {
                    info!(credential_id = %id, "re-issuing after failed issuance");
                }
            }
        }

        // An earlier call may have reached the ledger without leaving a row.
        let failed_tx = existing.as_ref().and_then(|c| c.issuance_tx.clone());
        if let Some(tx) = self.live_issuance(&id, failed_tx.as_ref()).await? {
            return self.resume_issuance(tx, existing, document_hash).await;
        }

        let (token, previous_version) = match existing {
            Some(failed) => (failed.verification_token, failed.cache_version),
            None => (VerificationToken::generate(), 0),
        };

        let payload = LedgerPayload::issue(id.clone(), document_hash.clone());
        let hash = self.submit(&id, TxKind::Issue, &payload).await?;
        let tx = LedgerTransaction::submitted(hash.clone(), TxKind::Issue, &payload);
        if let Err(err) = self.inner.store.put_transaction(&tx).await {
            error!(credential_id = %id, tx_hash = %hash, error = %err, "submitted issuance missing from audit log");
            return Err(err.into());
        }

        // From here the transaction is recorded; if the row write fails the
        // watcher rebuilds the row from the audit log.
        self.watch(hash.clone());
        let credential = Credential::pending(id, document_hash, token, hash.clone(), previous_version);
        self.write(&credential).await?;
        info!(credential_id = %credential.id, tx_hash = %hash, "issuance submitted");
        Ok(credential)
    }

    /// Latest issuance for `id` in the audit log that has not failed,
    /// ignoring `skip`.
    async fn live_issuance(
        &self,
        id: &CredentialId,
        skip: Option<&TxHash>,
    ) -> Result<Option<LedgerTransaction>, EngineError> {
        Ok(self
            .transactions_for(id)
            .await?
            .into_iter()
            .rev()
            .find(|t| t.kind == TxKind::Issue && t.outcome != TxOutcome::Failed && Some(&t.hash) != skip))
    }

    /// Put back the row of an issuance the ledger already holds instead of
    /// submitting another one. Caller holds the identifier lock.
    async fn resume_issuance(
        &self,
        tx: LedgerTransaction,
        existing: Option<Credential>,
        document_hash: DocumentHash,
    ) -> Result<Credential, EngineError> {
        let id = tx.credential_id.clone();
        let row = match self.issuance_row(&tx, existing) {
            Some(row) => row,
            None => Credential::pending(
                id.clone(),
                document_hash.clone(),
                VerificationToken::generate(),
                tx.hash.clone(),
                0,
            ),
        };
        self.write(&row).await?;
        info!(credential_id = %id, tx_hash = %tx.hash, outcome = %tx.outcome, "resumed recorded issuance");

        if tx.outcome == TxOutcome::Finalized {
            self.reflect(&tx, false).await?;
            return Err(EngineError::AlreadyExists(id));
        }
        self.watch(tx.hash.clone());
        if row.document_hash != document_hash {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(row)
    }

    /// Submit a revocation of an active credential.
    ///
    /// Returns the pending transaction; the row turns `revoked` only once
    /// the transaction is final.
    pub async fn revoke(&self, id: CredentialId) -> Result<LedgerTransaction, EngineError> {
        let this = self.clone();
        tokio::spawn(async move { this.revoke_locked(id).await })
            .await
            .map_err(|e| EngineError::Internal(format!("revoke task aborted: {}", e)))?
    }

    async fn revoke_locked(&self, id: CredentialId) -> Result<LedgerTransaction, EngineError> {
        let _guard = self.inner.locks.lock(&id).await;

        let credential = self
            .credential(&id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        match credential.status {
            CredentialStatus::Active => {}
            CredentialStatus::Revoked => return Err(EngineError::AlreadyRevoked(id)),
            CredentialStatus::Pending => return Err(EngineError::NotYetActive(id)),
            CredentialStatus::Failed => return Err(EngineError::NotFound(id.to_string())),
        }

        let previous = self
            .transactions_for(&id)
            .await?
            .into_iter()
            .rev()
            .find(|t| t.kind == TxKind::Revoke && t.outcome != TxOutcome::Failed);
        if let Some(tx) = previous {
            if tx.outcome == TxOutcome::Pending {
                debug!(credential_id = %id, tx_hash = %tx.hash, "revocation already in flight");
                self.watch(tx.hash.clone());
                return Ok(tx);
            }
            // Final on the ledger but not yet on the row.
            self.reflect(&tx, false).await?;
            return Err(EngineError::AlreadyRevoked(id));
        }

        let payload = LedgerPayload::revoke(id.clone());
        let hash = self.submit(&id, TxKind::Revoke, &payload).await?;
        let tx = LedgerTransaction::submitted(hash.clone(), TxKind::Revoke, &payload);
        if let Err(err) = self.inner.store.put_transaction(&tx).await {
            // Repair adopts it from the ledger once it is on-chain.
            error!(credential_id = %id, tx_hash = %hash, error = %err, "submitted revocation missing from audit log");
            return Err(err.into());
        }
        info!(credential_id = %id, tx_hash = %hash, "revocation submitted");

        self.watch(hash);
        Ok(tx)
    }

    /// The cached row for `id`, decoded under the current layout.
    pub async fn credential(&self, id: &CredentialId) -> Result<Option<Credential>, EngineError> {
        let layout = self.inner.schema.layout().await;
        match self.inner.store.get(id.as_str()).await? {
            Some(doc) => Ok(Some(codec::from_document(id.as_str(), doc, &layout)?)),
            None => Ok(None),
        }
    }

    /// Audit-log records for `id`, oldest first.
    pub async fn transactions_for(
        &self,
        id: &CredentialId,
    ) -> Result<Vec<LedgerTransaction>, EngineError> {
        Ok(self.inner.store.transactions_for_credential(id).await?)
    }

    /// Poll one transaction's confirmation depth and apply its outcome if
    /// it has become terminal.
    pub async fn poll_transaction(&self, hash: &TxHash) -> Result<TxOutcome, EngineError> {
        let tx = self.audit_record(hash).await?;
        if tx.outcome.is_terminal() {
            return self.replay(hash).await;
        }

        let required = self.inner.config.required_confirmations;
        let observed = with_timeout(
            self.inner.config.ledger_timeout(),
            self.inner.ledger.confirmations(hash),
        )
        .await;

        match observed {
            Ok(depth) if depth >= required => self.settle(hash, Observation::Finalized(depth)).await,
            Ok(depth) => {
                self.record_depth(&tx.credential_id, hash, depth).await?;
                debug!(tx_hash = %hash, depth, required, "awaiting finality");
                Ok(TxOutcome::Pending)
            }
            Err(LedgerError::Rejected { reason, .. }) => {
                self.settle(hash, Observation::Failed(reason)).await
            }
            Err(LedgerError::UnknownTransaction(_)) => {
                self.settle(hash, Observation::Failed("transaction unknown to ledger".into()))
                    .await
            }
            Err(err) => Err(EngineError::from_ledger(&tx.credential_id, err)),
        }
    }

    /// Pick up unfinished work after a restart.
    ///
    /// Only records still pending are visited: a record turns terminal only
    /// after its effect reached the cache. Each is replayed, polled once
    /// and, if still pending or the ledger is unreachable, handed to a
    /// watcher.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let pending = self.inner.store.list_pending_transactions().await?;
        let report = self.replay_all(pending).await;
        info!(
            scanned = report.scanned,
            settled = report.settled,
            rearmed = report.rearmed,
            errors = report.errors,
            "recovery complete"
        );
        Ok(report)
    }

    /// Rebuild the cache from the whole audit log, for a store whose
    /// credential rows were lost. Terminal records have their effect
    /// re-applied (a no-op when already reflected); pending ones are treated
    /// as in [`recover`](Self::recover).
    pub async fn rebuild(&self) -> Result<RecoveryReport, EngineError> {
        let transactions = self.inner.store.list_transactions().await?;
        let report = self.replay_all(transactions).await;
        info!(
            scanned = report.scanned,
            replayed = report.replayed,
            settled = report.settled,
            rearmed = report.rearmed,
            errors = report.errors,
            "cache rebuild complete"
        );
        Ok(report)
    }

    async fn replay_all(&self, transactions: Vec<LedgerTransaction>) -> RecoveryReport {
        let mut report = RecoveryReport {
            scanned: transactions.len(),
            ..Default::default()
        };

        for tx in transactions {
            if let Err(err) = self.replay(&tx.hash).await {
                error!(tx_hash = %tx.hash, credential_id = %tx.credential_id, error = %err, "replay failed");
                report.errors += 1;
                continue;
            }
            if tx.outcome.is_terminal() {
                report.replayed += 1;
                continue;
            }

            match self.poll_transaction(&tx.hash).await {
                Ok(outcome) if outcome.is_terminal() => report.settled += 1,
                Ok(_) => {
                    self.watch(tx.hash.clone());
                    report.rearmed += 1;
                }
                Err(err) if err.is_transient() => {
                    warn!(tx_hash = %tx.hash, error = %err, "ledger unreachable during recovery, watching");
                    self.watch(tx.hash.clone());
                    report.rearmed += 1;
                }
                Err(err) => {
                    error!(tx_hash = %tx.hash, error = %err, "recovery poll failed");
                    report.errors += 1;
                }
            }
        }
        report
    }

    /// Bring the row for `id` in line with the ledger.
    ///
    /// Transactions the ledger knows about but the audit log does not (for
    /// example a revocation made directly on-chain) are adopted, then every
    /// pending transaction for `id` is polled.
    pub async fn repair(&self, id: &CredentialId) -> Result<(), EngineError> {
        let status = with_timeout(self.inner.config.ledger_timeout(), self.inner.ledger.status(id))
            .await
            .map_err(|e| EngineError::from_ledger(id, e))?;

        {
            let _guard = self.inner.locks.lock(id).await;
            let known: HashSet<TxHash> = self
                .transactions_for(id)
                .await?
                .into_iter()
                .map(|t| t.hash)
                .collect();

            let adoptable = [
                (TxKind::Issue, status.issuance_tx),
                (TxKind::Revoke, status.revocation_tx),
            ];
            for (kind, hash) in adoptable {
                let Some(hash) = hash.filter(|h| !known.contains(h)) else {
                    continue;
                };
                let payload = LedgerPayload {
                    credential_id: id.clone(),
                    document_hash: None,
                };
                let tx = LedgerTransaction::submitted(hash.clone(), kind, &payload);
                self.inner.store.put_transaction(&tx).await?;
                info!(credential_id = %id, tx_hash = %hash, %kind, "adopted out-of-band transaction");
            }
        }

        for tx in self.transactions_for(id).await? {
            if tx.outcome.is_terminal() {
                continue;
            }
            match self.poll_transaction(&tx.hash).await? {
                TxOutcome::Pending => self.watch(tx.hash.clone()),
                outcome => debug!(tx_hash = %tx.hash, %outcome, "repair settled transaction"),
            }
        }
        Ok(())
    }

    /// Consume repair requests from the verifier until the channel closes.
    pub fn spawn_repair_worker(&self, mut requests: mpsc::Receiver<CredentialId>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(id) = requests.recv().await {
                match this.repair(&id).await {
                    Ok(()) => debug!(credential_id = %id, "cache repair done"),
                    Err(err) => warn!(credential_id = %id, error = %err, "cache repair failed"),
                }
                this.inner.locks.prune();
            }
            debug!("repair queue closed");
        })
    }

    async fn submit(
        &self,
        id: &CredentialId,
        kind: TxKind,
        payload: &LedgerPayload,
    ) -> Result<TxHash, EngineError> {
        let bytes = payload.to_bytes()?;
        let max_attempts = self.inner.config.submit_max_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = with_timeout(
                self.inner.config.ledger_timeout(),
                self.inner.ledger.submit(kind, &bytes),
            )
            .await;
            match result {
                Ok(hash) => return Ok(hash),
                // A timed-out submission may have landed; retrying could double-submit.
                Err(LedgerError::Unavailable(reason)) if attempt < max_attempts => {
                    let delay = self.inner.retry.delay_for_attempt(attempt);
                    warn!(
                        credential_id = %id,
                        %kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "ledger unavailable, retrying submission"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if let LedgerError::Rejected { reason, .. } = &err {
                        error!(credential_id = %id, %kind, %reason, "submission rejected");
                    }
                    return Err(EngineError::from_ledger(id, err));
                }
            }
        }
    }

    async fn audit_record(&self, hash: &TxHash) -> Result<LedgerTransaction, EngineError> {
        self.inner
            .store
            .get_transaction(hash)
            .await?
            .ok_or_else(|| EngineError::Internal(format!("transaction {} not in audit log", hash)))
    }

    async fn record_depth(
        &self,
        id: &CredentialId,
        hash: &TxHash,
        depth: u32,
    ) -> Result<(), EngineError> {
        let _guard = self.inner.locks.lock(id).await;
        let mut tx = self.audit_record(hash).await?;
        if tx.outcome.is_terminal() || depth <= tx.confirmations {
            return Ok(());
        }
        tx.observe_confirmations(depth);
        self.inner.store.put_transaction(&tx).await?;
        Ok(())
    }

    async fn settle(&self, hash: &TxHash, observation: Observation) -> Result<TxOutcome, EngineError> {
        let id = self.audit_record(hash).await?.credential_id;
        let _guard = self.inner.locks.lock(&id).await;

        let mut tx = self.audit_record(hash).await?;
        let changed = match observation {
            Observation::Finalized(depth) => tx.mark_finalized(depth),
            Observation::Failed(reason) => tx.mark_failed(reason),
        };
        // The row first: a terminal record always has its effect cached.
        self.reflect(&tx, changed).await?;
        if changed {
            self.inner.store.put_transaction(&tx).await?;
            match tx.outcome {
                TxOutcome::Failed => error!(
                    credential_id = %id,
                    tx_hash = %hash,
                    kind = %tx.kind,
                    reason = tx.failure_reason.as_deref().unwrap_or_default(),
                    "transaction failed on-chain"
                ),
                _ => info!(credential_id = %id, tx_hash = %hash, kind = %tx.kind, depth = tx.confirmations, "transaction final"),
            }
        }
        Ok(tx.outcome)
    }

    async fn replay(&self, hash: &TxHash) -> Result<TxOutcome, EngineError> {
        let id = self.audit_record(hash).await?.credential_id;
        let _guard = self.inner.locks.lock(&id).await;
        let tx = self.audit_record(hash).await?;
        self.reflect(&tx, false).await?;
        Ok(tx.outcome)
    }

    /// Make the row reflect one transaction's recorded outcome.
    ///
    /// Caller holds the identifier lock. `newly_settled` is true only for
    /// the call that moved the transaction to its terminal outcome.
    async fn reflect(&self, tx: &LedgerTransaction, newly_settled: bool) -> Result<(), EngineError> {
        let id = &tx.credential_id;
        let current = self.credential(id).await?;

        match (tx.kind, tx.outcome) {
            (TxKind::Issue, TxOutcome::Pending) => {
                let missing = match &current {
                    None => true,
                    Some(c) => {
                        c.status == CredentialStatus::Failed && c.issuance_tx.as_ref() != Some(&tx.hash)
                    }
                };
                if missing {
                    if let Some(rebuilt) = self.issuance_row(tx, current) {
                        self.write(&rebuilt).await?;
                        info!(credential_id = %id, tx_hash = %tx.hash, "rebuilt pending row from audit log");
                    }
                }
            }
            (TxKind::Issue, outcome) => {
                let Some(mut credential) = self.issuance_row(tx, current) else {
                    return Ok(());
                };
                if credential.status != CredentialStatus::Pending {
                    return Ok(());
                }
                let (event, kind) = if outcome == TxOutcome::Finalized {
                    (LifecycleEvent::IssuanceFinalized, EventKind::Issued)
                } else {
                    let reason = tx
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "rejected by ledger".to_string());
                    (LifecycleEvent::IssuanceFailed { reason }, EventKind::IssuanceFailed)
                };
                credential.apply(event)?;
                self.write(&credential).await?;
                info!(credential_id = %id, status = %credential.status, version = credential.cache_version, "issuance reflected");

                let mut published = EngineEvent::new(kind, id.clone()).with_tx(tx.hash.clone());
                if let Some(reason) = &credential.failure_reason {
                    published = published.with_detail(reason.clone());
                }
                self.inner.events.publish(published);
            }
            (TxKind::Revoke, TxOutcome::Finalized) => match current {
                Some(mut credential) if credential.status == CredentialStatus::Active => {
                    credential.apply(LifecycleEvent::RevocationFinalized {
                        tx: tx.hash.clone(),
                    })?;
                    self.write(&credential).await?;
                    info!(credential_id = %id, version = credential.cache_version, "revocation reflected");
                    self.inner
                        .events
                        .publish(EngineEvent::new(EventKind::Revoked, id.clone()).with_tx(tx.hash.clone()));
                }
                Some(credential) if credential.status == CredentialStatus::Revoked => {}
                Some(credential) => warn!(
                    credential_id = %id,
                    tx_hash = %tx.hash,
                    status = %credential.status,
                    "finalized revocation does not apply to row"
                ),
                None => warn!(credential_id = %id, tx_hash = %tx.hash, "finalized revocation for unknown row"),
            },
            (TxKind::Revoke, TxOutcome::Failed) => {
                if newly_settled {
                    let reason = tx.failure_reason.clone().unwrap_or_default();
                    self.inner.events.publish(
                        EngineEvent::new(EventKind::RevocationFailed, id.clone())
                            .with_tx(tx.hash.clone())
                            .with_detail(reason),
                    );
                }
            }
            (TxKind::Revoke, TxOutcome::Pending) => {}
        }
        Ok(())
    }

    /// The row an issuance outcome applies to, rebuilding it from the audit
    /// record if the cache lost it. A failed row gives way to any issuance
    /// that has not failed. `None` when the row has moved on to a different
    /// issuance.
    fn issuance_row(&self, tx: &LedgerTransaction, current: Option<Credential>) -> Option<Credential> {
        match current {
            Some(credential) if credential.issuance_tx.as_ref() == Some(&tx.hash) => Some(credential),
            Some(credential)
                if credential.status == CredentialStatus::Failed && tx.outcome != TxOutcome::Failed =>
            {
                let document_hash = tx
                    .document_hash
                    .clone()
                    .unwrap_or_else(|| credential.document_hash.clone());
                Some(Credential::pending(
                    credential.id,
                    document_hash,
                    credential.verification_token,
                    tx.hash.clone(),
                    credential.cache_version,
                ))
            }
            Some(credential) => {
                debug!(
                    credential_id = %tx.credential_id,
                    tx_hash = %tx.hash,
                    current_tx = ?credential.issuance_tx,
                    "superseded issuance outcome ignored"
                );
                None
            }
            None => self.rebuild_pending(tx),
        }
    }

    fn rebuild_pending(&self, tx: &LedgerTransaction) -> Option<Credential> {
        match &tx.document_hash {
            Some(document_hash) => Some(Credential::pending(
                tx.credential_id.clone(),
                document_hash.clone(),
                VerificationToken::generate(),
                tx.hash.clone(),
                0,
            )),
            None => {
                warn!(credential_id = %tx.credential_id, tx_hash = %tx.hash, "cannot rebuild row without document hash");
                None
            }
        }
    }

    /// Encode under the current layout and upsert.
    async fn write(&self, credential: &Credential) -> Result<(), EngineError> {
        credential
            .check_invariants()
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        let layout = self.inner.schema.layout().await;
        let doc = codec::to_document(credential, &layout)?;

        match self.inner.store.upsert(credential.id.as_str(), doc).await {
            Ok(()) => {
                debug!(credential_id = %credential.id, status = %credential.status, version = credential.cache_version, "row written");
                Ok(())
            }
            Err(StoreError::DuplicateKey { index, key }) => {
                Err(self.classify_conflict(&credential.id, index, key).await)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn classify_conflict(&self, id: &CredentialId, index: String, key: String) -> EngineError {
        let constraint = self.inner.schema.constraint(&index).await;
        match constraint {
            Some(c) if c.state == ConstraintState::Active && c.purpose == ConstraintPurpose::Identifier => {
                EngineError::AlreadyExists(id.clone())
            }
            Some(c) if c.state == ConstraintState::Active => {
                error!(credential_id = %id, %index, "verification token collision");
                EngineError::Internal(format!("verification token collision on {}", index))
            }
            other => {
                let state = other.map(|c| c.state).unwrap_or(ConstraintState::Removed);
                error!(
                    credential_id = %id,
                    %index,
                    %state,
                    %key,
                    "write rejected by a unique index that should not be enforcing"
                );
                self.inner.events.publish(
                    EngineEvent::new(EventKind::IndexConflict, id.clone())
                        .with_detail(format!("{} ({})", index, state)),
                );
                EngineError::IndexConflict {
                    id: id.clone(),
                    index,
                    state,
                    key,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attest_ledger::SimulatedLedger;
    use attest_store::{IndexSpec, MemoryIndexStore};

    struct Harness {
        ledger: Arc<SimulatedLedger>,
        store: Arc<MemoryIndexStore>,
        reconciler: Reconciler,
        events: EventBus,
    }

    fn harness() -> Harness {
        let config = EngineConfig {
            required_confirmations: 3,
            // Tests drive polling by hand.
            poll_interval_ms: 60_000,
            submit_max_attempts: 3,
            backoff_initial_ms: 1,
            backoff_max_ms: 5,
            ..Default::default()
        };
        let ledger = Arc::new(SimulatedLedger::new());
        let store = Arc::new(MemoryIndexStore::new());
        let events = EventBus::new(32);
        let reconciler = Reconciler::new(
            config,
            ledger.clone(),
            store.clone(),
            SchemaHandle::new(),
            Arc::new(KeyedLocks::new()),
            events.clone(),
        );
        Harness {
            ledger,
            store,
            reconciler,
            events,
        }
    }

    fn id(raw: &str) -> CredentialId {
        CredentialId::new(raw).unwrap()
    }

    fn hash() -> DocumentHash {
        DocumentHash::of(b"transcript")
    }

    async fn finalize(h: &Harness, tx: &TxHash) -> TxOutcome {
        h.ledger.mine_blocks(3);
        h.reconciler.poll_transaction(tx).await.unwrap()
    }

    #[tokio::test]
    async fn test_issue_returns_pending() {
        let h = harness();
        let c = h.reconciler.issue(id("STU-001"), hash()).await.unwrap();
        assert_eq!(c.status, CredentialStatus::Pending);
        assert_eq!(c.cache_version, 1);
        assert!(c.issuance_tx.is_some());

        let stored = h.reconciler.credential(&id("STU-001")).await.unwrap().unwrap();
        assert_eq!(stored, c);
        assert_eq!(h.ledger.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_issue_is_idempotent_while_pending() {
        let h = harness();
        let first = h.reconciler.issue(id("STU-001"), hash()).await.unwrap();
        let second = h.reconciler.issue(id("STU-001"), hash()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.ledger.submission_count(), 1);

        let other = h
            .reconciler
            .issue(id("STU-001"), DocumentHash::of(b"other"))
            .await;
        assert!(matches!(other, Err(EngineError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_finality_activates() {
        let h = harness();
        let mut rx = h.events.subscribe();
        let c = h.reconciler.issue(id("STU-001"), hash()).await.unwrap();
        let tx = c.issuance_tx.unwrap();

        h.ledger.mine_blocks(1);
        assert_eq!(h.reconciler.poll_transaction(&tx).await.unwrap(), TxOutcome::Pending);
        assert_eq!(h.store.get_transaction(&tx).await.unwrap().unwrap().confirmations, 1);

        assert_eq!(finalize(&h, &tx).await, TxOutcome::Finalized);
        let stored = h.reconciler.credential(&id("STU-001")).await.unwrap().unwrap();
        assert_eq!(stored.status, CredentialStatus::Active);
        assert_eq!(stored.cache_version, 2);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Issued);
        assert_eq!(event.tx_hash, Some(tx.clone()));

        // Duplicate polling is a no-op.
        assert_eq!(h.reconciler.poll_transaction(&tx).await.unwrap(), TxOutcome::Finalized);
        let again = h.reconciler.credential(&id("STU-001")).await.unwrap().unwrap();
        assert_eq!(again.cache_version, 2);
    }

    #[tokio::test]
    async fn test_issue_over_active_or_revoked_fails() {
        let h = harness();
        let c = h.reconciler.issue(id("STU-001"), hash()).await.unwrap();
        finalize(&h, c.issuance_tx.as_ref().unwrap()).await;
        assert!(matches!(
            h.reconciler.issue(id("STU-001"), hash()).await,
            Err(EngineError::AlreadyExists(_))
        ));

        let revoke = h.reconciler.revoke(id("STU-001")).await.unwrap();
        finalize(&h, &revoke.hash).await;
        assert!(matches!(
            h.reconciler.issue(id("STU-001"), hash()).await,
            Err(EngineError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_issuance_marks_failed_and_allows_reissue() {
        let h = harness();
        let mut rx = h.events.subscribe();
        let c = h.reconciler.issue(id("STU-003"), hash()).await.unwrap();
        let tx = c.issuance_tx.clone().unwrap();
        h.ledger.fail_transaction(&tx, "out of gas");

        assert_eq!(h.reconciler.poll_transaction(&tx).await.unwrap(), TxOutcome::Failed);
        let failed = h.reconciler.credential(&id("STU-003")).await.unwrap().unwrap();
        assert_eq!(failed.status, CredentialStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("out of gas"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::IssuanceFailed);
        assert_eq!(event.detail.as_deref(), Some("out of gas"));

        let reissued = h.reconciler.issue(id("STU-003"), hash()).await.unwrap();
        assert_eq!(reissued.status, CredentialStatus::Pending);
        assert!(reissued.cache_version > failed.cache_version);
        assert_eq!(reissued.verification_token, failed.verification_token);
        assert_ne!(reissued.issuance_tx, failed.issuance_tx);

        // The old failure replayed later must not touch the new issuance.
        h.reconciler.poll_transaction(&tx).await.unwrap();
        let current = h.reconciler.credential(&id("STU-003")).await.unwrap().unwrap();
        assert_eq!(current, reissued);
    }

    #[tokio::test]
    async fn test_revoke_rules() {
        let h = harness();
        assert!(matches!(
            h.reconciler.revoke(id("NOPE")).await,
            Err(EngineError::NotFound(_))
        ));

        let c = h.reconciler.issue(id("STU-001"), hash()).await.unwrap();
        assert!(matches!(
            h.reconciler.revoke(id("STU-001")).await,
            Err(EngineError::NotYetActive(_))
        ));

        finalize(&h, c.issuance_tx.as_ref().unwrap()).await;
        let first = h.reconciler.revoke(id("STU-001")).await.unwrap();
        let second = h.reconciler.revoke(id("STU-001")).await.unwrap();
        assert_eq!(first.hash, second.hash);
        assert_eq!(h.ledger.submissions_for(&id("STU-001"), TxKind::Revoke), 1);

        // Still active until the revocation is final.
        let row = h.reconciler.credential(&id("STU-001")).await.unwrap().unwrap();
        assert_eq!(row.status, CredentialStatus::Active);

        finalize(&h, &first.hash).await;
        let row = h.reconciler.credential(&id("STU-001")).await.unwrap().unwrap();
        assert_eq!(row.status, CredentialStatus::Revoked);
        assert_eq!(row.revocation_tx, Some(first.hash));
        assert!(matches!(
            h.reconciler.revoke(id("STU-001")).await,
            Err(EngineError::AlreadyRevoked(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_revocation_keeps_active() {
        let h = harness();
        let mut rx = h.events.subscribe();
        let c = h.reconciler.issue(id("STU-001"), hash()).await.unwrap();
        finalize(&h, c.issuance_tx.as_ref().unwrap()).await;
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Issued);

        let revoke = h.reconciler.revoke(id("STU-001")).await.unwrap();
        h.ledger.fail_transaction(&revoke.hash, "reverted");
        assert_eq!(
            h.reconciler.poll_transaction(&revoke.hash).await.unwrap(),
            TxOutcome::Failed
        );
        let row = h.reconciler.credential(&id("STU-001")).await.unwrap().unwrap();
        assert_eq!(row.status, CredentialStatus::Active);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::RevocationFailed);

        // A fresh revocation may be submitted.
        let retry = h.reconciler.revoke(id("STU-001")).await.unwrap();
        assert_ne!(retry.hash, revoke.hash);
    }

    #[tokio::test]
    async fn test_submit_retries_through_short_outage() {
        let h = harness();
        h.ledger.set_available(false);
        let ledger = h.ledger.clone();
        let restore = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(3)).await;
            ledger.set_available(true);
        });
        let result = h.reconciler.issue(id("STU-001"), hash()).await;
        restore.await.unwrap();
        // Either the retry window covered the outage or it did not; no row without a submission.
        match result {
            Ok(c) => assert_eq!(c.status, CredentialStatus::Pending),
            Err(err) => {
                assert!(err.is_transient());
                assert!(h.reconciler.credential(&id("STU-001")).await.unwrap().is_none());
            }
        }
    }

    #[tokio::test]
    async fn test_unavailable_ledger_surfaces_transient_error() {
        let h = harness();
        h.ledger.set_available(false);
        let err = h.reconciler.issue(id("STU-001"), hash()).await.unwrap_err();
        assert!(matches!(err, EngineError::LedgerUnavailable(_)));
        assert!(h.reconciler.credential(&id("STU-001")).await.unwrap().is_none());
        assert!(h.store.list_transactions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_visits_only_pending_records() {
        let h = harness();
        let pending = h.reconciler.issue(id("A"), hash()).await.unwrap();
        let done = h.reconciler.issue(id("B"), hash()).await.unwrap();
        h.ledger.mine_blocks(3);
        finalize(&h, done.issuance_tx.as_ref().unwrap()).await;
        h.ledger.set_available(false);

        let report = h.reconciler.recover().await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.rearmed, 1);
        assert_eq!(
            h.store.list_pending_transactions().await.unwrap()[0].hash,
            pending.issuance_tx.unwrap()
        );
    }

    #[tokio::test]
    async fn test_rebuild_restores_lost_rows() {
        let h = harness();
        let pending = h.reconciler.issue(id("A"), hash()).await.unwrap();
        let finalized = h.reconciler.issue(id("B"), hash()).await.unwrap();
        h.ledger.mine_blocks(3);
        h.reconciler
            .poll_transaction(finalized.issuance_tx.as_ref().unwrap())
            .await
            .unwrap();

        // Simulate a crash that lost the cache but kept the audit log.
        let store = Arc::new(MemoryIndexStore::new());
        for tx in h.store.list_transactions().await.unwrap() {
            store.put_transaction(&tx).await.unwrap();
        }
        let recovered = Reconciler::new(
            EngineConfig {
                required_confirmations: 3,
                poll_interval_ms: 60_000,
                ..Default::default()
            },
            h.ledger.clone(),
            store.clone(),
            SchemaHandle::new(),
            Arc::new(KeyedLocks::new()),
            EventBus::new(8),
        );

        let report = recovered.rebuild().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.replayed, 1);
        assert_eq!(report.settled, 1);
        assert_eq!(report.errors, 0);

        // Both issuances are final on the ledger by now.
        let a = recovered.credential(&id("A")).await.unwrap().unwrap();
        let b = recovered.credential(&id("B")).await.unwrap().unwrap();
        assert_eq!(a.status, CredentialStatus::Active);
        assert_eq!(a.issuance_tx, pending.issuance_tx);
        assert_eq!(b.status, CredentialStatus::Active);
    }

    #[tokio::test]
    async fn test_recover_rearms_while_ledger_down() {
        let h = harness();
        let c = h.reconciler.issue(id("A"), hash()).await.unwrap();
        h.ledger.set_available(false);

        let report = h.reconciler.recover().await.unwrap();
        assert_eq!(report.rearmed, 1);
        let row = h.reconciler.credential(&id("A")).await.unwrap().unwrap();
        assert_eq!(row, c);
    }

    #[tokio::test]
    async fn test_repair_adopts_out_of_band_revocation() {
        let h = harness();
        let c = h.reconciler.issue(id("STU-001"), hash()).await.unwrap();
        finalize(&h, c.issuance_tx.as_ref().unwrap()).await;

        let payload = LedgerPayload::revoke(id("STU-001")).to_bytes().unwrap();
        h.ledger.submit(TxKind::Revoke, &payload).await.unwrap();
        h.ledger.mine_blocks(3);

        h.reconciler.repair(&id("STU-001")).await.unwrap();
        let row = h.reconciler.credential(&id("STU-001")).await.unwrap().unwrap();
        assert_eq!(row.status, CredentialStatus::Revoked);
        assert_eq!(h.reconciler.transactions_for(&id("STU-001")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ghost_index_conflict_is_escalated() {
        let h = harness();
        let mut rx = h.events.subscribe();
        // An index the catalog does not know about, on a field nothing writes.
        h.store
            .create_unique_index(IndexSpec::new("uniq_legacy", vec!["legacy".into()]))
            .await
            .unwrap();

        h.reconciler.issue(id("A"), hash()).await.unwrap();
        let err = h.reconciler.issue(id("B"), hash()).await.unwrap_err();
        match err {
            EngineError::IndexConflict { index, key, .. } => {
                assert_eq!(index, "uniq_legacy");
                assert_eq!(key, "[null]");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::IndexConflict);
    }

    #[tokio::test]
    async fn test_row_write_failure_after_submit_is_resumed() {
        let h = harness();
        h.store
            .create_unique_index(IndexSpec::new("uniq_legacy", vec!["legacy".into()]))
            .await
            .unwrap();
        h.reconciler.issue(id("A"), hash()).await.unwrap();

        // The ledger takes the issuance, the cache refuses the row.
        let err = h.reconciler.issue(id("B"), hash()).await.unwrap_err();
        assert!(matches!(err, EngineError::IndexConflict { .. }));
        assert!(h.reconciler.credential(&id("B")).await.unwrap().is_none());
        let recorded = h.reconciler.transactions_for(&id("B")).await.unwrap();
        assert_eq!(recorded.len(), 1);

        h.store.drop_index("uniq_legacy").await.unwrap();
        let resumed = h.reconciler.issue(id("B"), hash()).await.unwrap();
        assert_eq!(resumed.status, CredentialStatus::Pending);
        assert_eq!(resumed.issuance_tx.as_ref(), Some(&recorded[0].hash));
        assert_eq!(h.ledger.submissions_for(&id("B"), TxKind::Issue), 1);

        assert_eq!(finalize(&h, &recorded[0].hash).await, TxOutcome::Finalized);
        let row = h.reconciler.credential(&id("B")).await.unwrap().unwrap();
        assert_eq!(row.status, CredentialStatus::Active);
        assert_eq!(row.verification_token, resumed.verification_token);
    }

    #[tokio::test]
    async fn test_failed_row_yields_to_final_issuance_on_repair() {
        let h = harness();
        let c = h.reconciler.issue(id("STU-005"), hash()).await.unwrap();
        let rejected = c.issuance_tx.clone().unwrap();
        h.ledger.fail_transaction(&rejected, "out of gas");
        h.reconciler.poll_transaction(&rejected).await.unwrap();

        // Issued again straight on the ledger.
        let payload = LedgerPayload::issue(id("STU-005"), hash()).to_bytes().unwrap();
        let on_chain = h.ledger.submit(TxKind::Issue, &payload).await.unwrap();
        h.ledger.mine_blocks(3);

        h.reconciler.repair(&id("STU-005")).await.unwrap();
        let row = h.reconciler.credential(&id("STU-005")).await.unwrap().unwrap();
        assert_eq!(row.status, CredentialStatus::Active);
        assert_eq!(row.issuance_tx, Some(on_chain));
        assert_eq!(row.verification_token, c.verification_token);
        assert_eq!(row.failure_reason, None);
    }

    #[tokio::test]
    async fn test_concurrent_issue_submits_once() {
        let h = harness();
        let a = h.reconciler.clone();
        let b = h.reconciler.clone();
        let (first, second) = tokio::join!(
            a.issue(id("STU-002"), hash()),
            b.issue(id("STU-002"), hash())
        );
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(h.ledger.submissions_for(&id("STU-002"), TxKind::Issue), 1);
        assert_eq!(h.store.document_count().await, 1);
    }
}
