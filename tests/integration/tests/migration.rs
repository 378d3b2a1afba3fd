//! Integration test: renaming the identifier field without leaving a ghost index.

use attest_core::{ConstraintState, CredentialStatus};
use attest_engine::{Consistency, EngineError, EventKind};
use attest_integration_tests::{doc, id, Harness};
use attest_store::{IndexSpec, IndexStore};

#[tokio::test]
async fn test_rename_then_issue_after_removal() {
    let h = Harness::new().await;
    for raw in ["STU-030", "STU-031"] {
        h.engine.issue(id(raw), doc(raw)).await.unwrap();
    }
    h.finalize_all();
    assert!(h.wait_for_status(&id("STU-031"), CredentialStatus::Active).await);

    let guard = h.engine.migrations();
    guard
        .begin_rename("registration_number", "student_id")
        .await
        .unwrap();

    // Dual-write window: new issuances land under both fields.
    h.engine.issue(id("STU-032"), doc("STU-032")).await.unwrap();
    let row = h.store.get("STU-032").await.unwrap().unwrap();
    assert_eq!(row["student_id"], "STU-032");
    assert_eq!(row["registration_number"], "STU-032");

    let deprecated = guard.deprecate("registration_number").await.unwrap();
    assert_eq!(deprecated.state, ConstraintState::Deprecated);
    let removed = guard.finalize("registration_number").await.unwrap();
    assert_eq!(removed.state, ConstraintState::Removed);

    let status = guard.status().await.unwrap();
    assert!(status.ghost_indexes.is_empty());
    assert_eq!(status.layout.id_fields, vec!["student_id"]);

    // New-shape rows omit the old field; two of them must not collide.
    for raw in ["STU-033", "STU-034"] {
        h.engine.issue(id(raw), doc(raw)).await.unwrap();
    }
    let row = h.store.get("STU-034").await.unwrap().unwrap();
    assert!(row.get("registration_number").is_none());

    h.finalize_all();
    assert!(h.wait_for_status(&id("STU-034"), CredentialStatus::Active).await);
    // Rows written before the rename still verify.
    let verdict = h.engine.verify("STU-030", Consistency::Cached).await.unwrap();
    assert_eq!(verdict.status, CredentialStatus::Active);
}

#[tokio::test]
async fn test_finalize_requires_deprecation() {
    let h = Harness::new().await;
    let guard = h.engine.migrations();
    guard
        .begin_rename("registration_number", "student_id")
        .await
        .unwrap();
    let err = guard.finalize("registration_number").await.unwrap_err();
    assert!(matches!(err, EngineError::Migration(_)));
}

#[tokio::test]
async fn test_ghost_index_surfaces_as_conflict() {
    let h = Harness::new().await;
    let mut events = h.engine.subscribe();

    // Left behind by an earlier, unmanaged schema change.
    h.store
        .create_unique_index(IndexSpec::new("uniq_old_number", vec!["old_number".into()]))
        .await
        .unwrap();
    let status = h.engine.migrations().status().await.unwrap();
    assert_eq!(status.ghost_indexes, vec!["uniq_old_number".to_string()]);

    h.engine.issue(id("STU-040"), doc("a")).await.unwrap();
    let err = h.engine.issue(id("STU-041"), doc("b")).await.unwrap_err();
    assert!(matches!(err, EngineError::IndexConflict { .. }));
    assert_eq!(events.recv().await.unwrap().kind, EventKind::IndexConflict);
}
