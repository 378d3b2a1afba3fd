//! Integration test: issuance and revocation through to ledger finality.

use attest_core::{CredentialStatus, EngineConfig, TxKind};
use attest_engine::{Consistency, EngineError, EventKind, VerdictSource};
use attest_integration_tests::{doc, id, Harness};
use attest_store::{IndexSpec, IndexStore};

#[tokio::test]
async fn test_issue_is_pending_until_final_then_active_from_cache() {
    let h = Harness::new().await;
    let student = id("STU-001");

    let credential = h
        .engine
        .issue(student.clone(), doc("transcript"))
        .await
        .unwrap();
    assert_eq!(credential.status, CredentialStatus::Pending);
    assert!(credential.issuance_tx.is_some());

    // One block is not enough.
    h.mine(1);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let verdict = h.engine.verify("STU-001", Consistency::Cached).await.unwrap();
    assert_eq!(verdict.status, CredentialStatus::Pending);
    assert_eq!(verdict.pending_tx, credential.issuance_tx);

    h.finalize_all();
    assert!(h.wait_for_status(&student, CredentialStatus::Active).await);

    let verdict = h.engine.verify("STU-001", Consistency::Cached).await.unwrap();
    assert_eq!(verdict.status, CredentialStatus::Active);
    assert_eq!(verdict.source, VerdictSource::Cache);

    // The token resolves to the same credential.
    let by_token = h
        .engine
        .verify(credential.verification_token.as_str(), Consistency::Cached)
        .await
        .unwrap();
    assert_eq!(by_token.credential_id, student);
    assert_eq!(by_token.status, CredentialStatus::Active);
}

#[tokio::test]
async fn test_revoke_before_finality_then_after() {
    let h = Harness::new().await;
    let student = id("STU-001");
    let mut events = h.engine.subscribe();

    h.engine
        .issue(student.clone(), doc("transcript"))
        .await
        .unwrap();
    let err = h.engine.revoke(student.clone()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotYetActive(_)));

    h.finalize_all();
    assert!(h.wait_for_status(&student, CredentialStatus::Active).await);

    let tx = h.engine.revoke(student.clone()).await.unwrap();
    assert_eq!(tx.kind, TxKind::Revoke);
    // Still active until the revocation is final.
    assert_eq!(
        h.cached(&student).await.unwrap().status,
        CredentialStatus::Active
    );

    h.finalize_all();
    assert!(h.wait_for_status(&student, CredentialStatus::Revoked).await);

    let err = h.engine.revoke(student.clone()).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyRevoked(_)));

    assert_eq!(events.recv().await.unwrap().kind, EventKind::Issued);
    assert_eq!(events.recv().await.unwrap().kind, EventKind::Revoked);
}

#[tokio::test]
async fn test_concurrent_issue_of_same_id_submits_once() {
    let h = Harness::new().await;
    let student = id("STU-002");

    let (first, second) = tokio::join!(
        h.engine.issue(student.clone(), doc("diploma")),
        h.engine.issue(student.clone(), doc("diploma"))
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first.issuance_tx, second.issuance_tx);
    assert_eq!(first.verification_token, second.verification_token);
    assert_eq!(h.ledger.submissions_for(&student, TxKind::Issue), 1);
    assert_eq!(h.store.document_count().await, 1);

    // A different document under the same identifier is refused.
    let err = h
        .engine
        .issue(student.clone(), doc("forged"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_rejected_issuance_fails_and_can_be_reissued() {
    let h = Harness::new().await;
    let student = id("STU-003");
    let mut events = h.engine.subscribe();

    let credential = h
        .engine
        .issue(student.clone(), doc("transcript"))
        .await
        .unwrap();
    let tx = credential.issuance_tx.clone().unwrap();
    assert!(h.ledger.fail_transaction(&tx, "out of gas"));
    h.mine(1);
    assert!(h.wait_for_status(&student, CredentialStatus::Failed).await);

    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, EventKind::IssuanceFailed);
    assert_eq!(event.tx_hash, Some(tx.clone()));

    let verdict = h.engine.verify("STU-003", Consistency::Cached).await.unwrap();
    assert_eq!(verdict.status, CredentialStatus::Failed);
    assert!(verdict.failure_reason.is_some());

    let err = h.engine.revoke(student.clone()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let again = h
        .engine
        .issue(student.clone(), doc("transcript"))
        .await
        .unwrap();
    assert_eq!(again.status, CredentialStatus::Pending);
    assert_ne!(again.issuance_tx, Some(tx));
    assert_eq!(again.verification_token, credential.verification_token);
    assert!(again.cache_version > credential.cache_version);

    h.finalize_all();
    assert!(h.wait_for_status(&student, CredentialStatus::Active).await);
}

#[tokio::test]
async fn test_ledger_outage_during_watch_recovers() {
    let h = Harness::new().await;
    let student = id("STU-004");

    h.engine
        .issue(student.clone(), doc("transcript"))
        .await
        .unwrap();
    h.ledger.set_available(false);
    h.finalize_all();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(
        h.cached(&student).await.unwrap().status,
        CredentialStatus::Pending
    );

    h.ledger.set_available(true);
    assert!(h.wait_for_status(&student, CredentialStatus::Active).await);
}

#[tokio::test]
async fn test_many_concurrent_issuers_share_one_submission() {
    let h = Harness::new().await;
    let student = id("STU-005");

    let attempts = (0..16).map(|_| h.engine.issue(student.clone(), doc("diploma")));
    let results = futures::future::join_all(attempts).await;

    let first = results[0].as_ref().unwrap().clone();
    for result in &results {
        assert_eq!(result.as_ref().unwrap(), &first);
    }
    assert_eq!(h.ledger.submissions_for(&student, TxKind::Issue), 1);
    assert_eq!(h.store.document_count().await, 1);
}

#[tokio::test]
async fn test_default_depth_of_six_confirmations() {
    let config = EngineConfig {
        poll_interval_ms: 10,
        ..Default::default()
    };
    assert_eq!(config.required_confirmations, 6);
    let h = Harness::with_config(config).await;
    let student = id("STU-001");

    h.engine
        .issue(student.clone(), doc("transcript"))
        .await
        .unwrap();
    h.mine(5);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let verdict = h.engine.verify("STU-001", Consistency::Strong).await.unwrap();
    assert_eq!(verdict.status, CredentialStatus::Pending);
    assert_eq!(
        h.cached(&student).await.unwrap().status,
        CredentialStatus::Pending
    );

    h.mine(1);
    assert!(h.wait_for_status(&student, CredentialStatus::Active).await);
    let verdict = h.engine.verify("STU-001", Consistency::Cached).await.unwrap();
    assert_eq!(verdict.status, CredentialStatus::Active);
    assert_eq!(verdict.source, VerdictSource::Cache);
}

#[tokio::test]
async fn test_cache_write_failure_after_submission_is_not_resubmitted() {
    let h = Harness::new().await;
    let student = id("STU-006");

    // An unmanaged index makes the row write fail after the ledger accepted it.
    h.store
        .create_unique_index(IndexSpec::new("uniq_stray", vec!["stray".into()]))
        .await
        .unwrap();
    h.engine.issue(id("STU-007"), doc("other")).await.unwrap();
    let err = h
        .engine
        .issue(student.clone(), doc("transcript"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::IndexConflict { .. }));
    assert_eq!(h.ledger.submissions_for(&student, TxKind::Issue), 1);
    assert!(h.cached(&student).await.is_none());

    h.store.drop_index("uniq_stray").await.unwrap();
    let resumed = h
        .engine
        .issue(student.clone(), doc("transcript"))
        .await
        .unwrap();
    assert_eq!(resumed.status, CredentialStatus::Pending);
    assert_eq!(h.ledger.submissions_for(&student, TxKind::Issue), 1);

    h.finalize_all();
    assert!(h.wait_for_status(&student, CredentialStatus::Active).await);
    let strong = h.engine.verify("STU-006", Consistency::Strong).await.unwrap();
    assert_eq!(strong.status, CredentialStatus::Active);
    assert_eq!(h.cached(&student).await.unwrap().issuance_tx, resumed.issuance_tx);
}
