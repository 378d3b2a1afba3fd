//! Integration test: restart with work in flight.

use std::sync::Arc;

use attest_core::CredentialStatus;
use attest_engine::Consistency;
use attest_integration_tests::{doc, id, test_config, Harness, MemoryJournal};
use attest_ledger::SimulatedLedger;
use attest_store::{IndexStore, MemoryIndexStore};

#[tokio::test]
async fn test_restart_rearms_pending_issuance() {
    // The first process never polls again, as if it died after submitting.
    let mut idle = test_config();
    idle.poll_interval_ms = 60_000;
    let before = Harness::with_config(idle).await;
    let student = id("STU-020");
    before
        .engine
        .issue(student.clone(), doc("transcript"))
        .await
        .unwrap();

    let after = Harness::reopen(test_config(), before.ledger.clone(), before.store.clone()).await;
    let report = after.engine.recover().await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.rearmed, 1);
    assert_eq!(report.errors, 0);

    after.finalize_all();
    assert!(after.wait_for_status(&student, CredentialStatus::Active).await);
}

#[tokio::test]
async fn test_restart_settles_transactions_finalized_while_down() {
    let mut idle = test_config();
    idle.poll_interval_ms = 60_000;
    let before = Harness::with_config(idle).await;
    let student = id("STU-021");
    before
        .engine
        .issue(student.clone(), doc("transcript"))
        .await
        .unwrap();
    before.finalize_all();

    let after = Harness::reopen(test_config(), before.ledger.clone(), before.store.clone()).await;
    let report = after.engine.recover().await.unwrap();
    assert_eq!(report.settled, 1);
    assert_eq!(
        after.cached(&student).await.unwrap().status,
        CredentialStatus::Active
    );

    // Replaying again changes nothing.
    let version = after.cached(&student).await.unwrap().cache_version;
    let report = after.engine.recover().await.unwrap();
    assert_eq!(report.settled, 0);
    assert_eq!(after.cached(&student).await.unwrap().cache_version, version);
}

#[tokio::test]
async fn test_lost_cache_is_rebuilt_from_audit_log() {
    let h = Harness::new().await;
    let active = id("STU-022");
    let revoked = id("STU-023");
    for student in [&active, &revoked] {
        h.engine
            .issue(student.clone(), doc(student.as_str()))
            .await
            .unwrap();
    }
    h.finalize_all();
    assert!(h.wait_for_status(&revoked, CredentialStatus::Active).await);
    assert!(h.wait_for_status(&active, CredentialStatus::Active).await);
    h.engine.revoke(revoked.clone()).await.unwrap();
    h.finalize_all();
    assert!(h.wait_for_status(&revoked, CredentialStatus::Revoked).await);

    // Only the audit log survives.
    let store = Arc::new(MemoryIndexStore::new());
    for tx in h.store.list_transactions().await.unwrap() {
        store.put_transaction(&tx).await.unwrap();
    }
    let rebuilt = Harness::reopen(test_config(), h.ledger.clone(), store).await;
    let report = rebuilt.engine.rebuild().await.unwrap();
    assert_eq!(report.scanned, 3);
    assert_eq!(report.errors, 0);

    let verdict = rebuilt
        .engine
        .verify(active.as_str(), Consistency::Cached)
        .await
        .unwrap();
    assert_eq!(verdict.status, CredentialStatus::Active);
    let row = rebuilt.cached(&revoked).await.unwrap();
    assert_eq!(row.status, CredentialStatus::Revoked);
    assert!(row.revocation_tx.is_some());
}

#[tokio::test]
async fn test_restart_over_journaled_chain_keeps_credentials() {
    let journal = Arc::new(MemoryJournal::default());
    let mut idle = test_config();
    idle.poll_interval_ms = 60_000;

    let ledger = Arc::new(SimulatedLedger::with_journal(journal.clone()).unwrap());
    let before = Harness::reopen(test_config(), ledger, Arc::new(MemoryIndexStore::new())).await;
    let settled = id("STU-024");
    before
        .engine
        .issue(settled.clone(), doc("transcript"))
        .await
        .unwrap();
    before.finalize_all();
    assert!(before.wait_for_status(&settled, CredentialStatus::Active).await);

    let in_flight = id("STU-025");
    let idle_engine = Harness::reopen(idle, before.ledger.clone(), before.store.clone()).await;
    idle_engine
        .engine
        .issue(in_flight.clone(), doc("transcript"))
        .await
        .unwrap();
    before.mine(1);

    // New process: the chain comes back from the journal, the cache from the store.
    let ledger = Arc::new(SimulatedLedger::with_journal(journal).unwrap());
    assert_eq!(ledger.height(), before.ledger.height());
    let after = Harness::reopen(test_config(), ledger, before.store.clone()).await;
    let report = after.engine.recover().await.unwrap();
    assert_eq!(report.errors, 0);
    assert_eq!(report.rearmed, 1);

    let strong = after
        .engine
        .verify(settled.as_str(), Consistency::Strong)
        .await
        .unwrap();
    assert_eq!(strong.status, CredentialStatus::Active);
    assert_eq!(
        after.cached(&in_flight).await.unwrap().status,
        CredentialStatus::Pending
    );

    after.finalize_all();
    assert!(after.wait_for_status(&in_flight, CredentialStatus::Active).await);
}
