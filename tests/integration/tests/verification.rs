//! Integration test: the ledger overrides a stale cache and the cache heals.

use attest_core::{CredentialStatus, LedgerPayload, TxKind, VerificationToken};
use attest_engine::{Consistency, EngineError, VerdictSource};
use attest_integration_tests::{doc, id, test_config, Harness, CONFIRMATIONS};
use attest_ledger::LedgerClient;

#[tokio::test]
async fn test_ledger_wins_and_cache_is_repaired() {
    let h = Harness::new().await;
    let student = id("STU-010");

    h.engine
        .issue(student.clone(), doc("transcript"))
        .await
        .unwrap();
    h.finalize_all();
    assert!(h.wait_for_status(&student, CredentialStatus::Active).await);

    // Revoked on-chain by another writer; the cache never saw it.
    let payload = LedgerPayload::revoke(student.clone()).to_bytes().unwrap();
    let out_of_band = h.ledger.submit(TxKind::Revoke, &payload).await.unwrap();
    h.finalize_all();

    let cached = h.engine.verify("STU-010", Consistency::Cached).await.unwrap();
    assert_eq!(cached.status, CredentialStatus::Active);
    assert_eq!(cached.source, VerdictSource::Cache);

    let strong = h.engine.verify("STU-010", Consistency::Strong).await.unwrap();
    assert_eq!(strong.status, CredentialStatus::Revoked);
    assert_eq!(strong.source, VerdictSource::Ledger);

    // The disagreement queued a repair that adopts the foreign revocation.
    assert!(h.wait_for_status(&student, CredentialStatus::Revoked).await);
    let row = h.cached(&student).await.unwrap();
    assert_eq!(row.revocation_tx, Some(out_of_band));

    let cached = h.engine.verify("STU-010", Consistency::Cached).await.unwrap();
    assert_eq!(cached.status, CredentialStatus::Revoked);
    assert_eq!(cached.source, VerdictSource::Cache);
}

#[tokio::test]
async fn test_stale_pending_row_is_checked_against_ledger() {
    let mut config = test_config();
    config.pending_staleness_secs = 0;
    // Keep the watcher out of the way so only the verifier can notice finality.
    config.poll_interval_ms = 60_000;
    let h = Harness::with_config(config).await;
    let student = id("STU-011");

    h.engine
        .issue(student.clone(), doc("transcript"))
        .await
        .unwrap();
    h.finalize_all();

    let verdict = h.engine.verify("STU-011", Consistency::Cached).await.unwrap();
    assert_eq!(verdict.status, CredentialStatus::Active);
    assert_eq!(verdict.source, VerdictSource::Ledger);
}

#[tokio::test]
async fn test_unknown_target() {
    let h = Harness::new().await;
    let err = h
        .engine
        .verify("NOBODY", Consistency::Strong)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let token = VerificationToken::generate();
    let err = h
        .engine
        .verify(token.as_str(), Consistency::Cached)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidToken));

    let err = h
        .engine
        .verify("vt_not-a-token", Consistency::Cached)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidToken));
}

#[tokio::test]
async fn test_outage_serves_cache_but_not_strong_reads() {
    let h = Harness::new().await;
    let student = id("STU-012");
    h.engine
        .issue(student.clone(), doc("transcript"))
        .await
        .unwrap();
    h.finalize_all();
    assert!(h.wait_for_status(&student, CredentialStatus::Active).await);

    h.ledger.set_available(false);
    let cached = h.engine.verify("STU-012", Consistency::Cached).await.unwrap();
    assert_eq!(cached.status, CredentialStatus::Active);

    let err = h
        .engine
        .verify("STU-012", Consistency::Strong)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LedgerUnavailable(_)));
}

#[tokio::test]
async fn test_strong_reads_wait_for_finality_depth() {
    let mut config = test_config();
    config.poll_interval_ms = 60_000;
    let h = Harness::with_config(config).await;
    let student = id("STU-013");

    let credential = h
        .engine
        .issue(student.clone(), doc("transcript"))
        .await
        .unwrap();

    // Included but short of the required depth at every step.
    for _ in 1..CONFIRMATIONS {
        h.mine(1);
        let strong = h.engine.verify("STU-013", Consistency::Strong).await.unwrap();
        assert_eq!(strong.status, CredentialStatus::Pending);
        assert_eq!(strong.source, VerdictSource::Ledger);
        assert_eq!(strong.pending_tx, credential.issuance_tx);
    }

    h.mine(1);
    let strong = h.engine.verify("STU-013", Consistency::Strong).await.unwrap();
    assert_eq!(strong.status, CredentialStatus::Active);
    // The disagreement with the pending row queued a repair.
    assert!(h.wait_for_status(&student, CredentialStatus::Active).await);

    h.engine.revoke(student.clone()).await.unwrap();
    for _ in 1..CONFIRMATIONS {
        h.mine(1);
        let strong = h.engine.verify("STU-013", Consistency::Strong).await.unwrap();
        assert_eq!(strong.status, CredentialStatus::Active);
        let cached = h.engine.verify("STU-013", Consistency::Cached).await.unwrap();
        assert_eq!(cached.status, CredentialStatus::Active);
    }

    h.mine(1);
    let strong = h.engine.verify("STU-013", Consistency::Strong).await.unwrap();
    assert_eq!(strong.status, CredentialStatus::Revoked);
    assert!(h.wait_for_status(&student, CredentialStatus::Revoked).await);
}

#[tokio::test]
async fn test_stale_pending_row_short_of_depth_stays_pending() {
    let mut config = test_config();
    config.pending_staleness_secs = 0;
    config.poll_interval_ms = 60_000;
    let h = Harness::with_config(config).await;
    let student = id("STU-014");

    h.engine
        .issue(student.clone(), doc("transcript"))
        .await
        .unwrap();
    h.mine(1);
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let verdict = h.engine.verify("STU-014", Consistency::Cached).await.unwrap();
    assert_eq!(verdict.source, VerdictSource::Ledger);
    assert_eq!(verdict.status, CredentialStatus::Pending);
    assert_eq!(
        h.cached(&student).await.unwrap().status,
        CredentialStatus::Pending
    );
}
