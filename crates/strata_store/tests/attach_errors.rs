//! Startup-time refusals: schema mismatch, double activation, joining a
//! non-empty table.

mod common;

use common::{insert_part, TestTable};
use strata_coord::Coordinator;
use strata_store::TableError;

#[tokio::test]
async fn mismatched_schema_is_refused_before_startup() {
    let table = TestTable::new("schema-mismatch");
    let (_s1, r1) = table.open("r1", false).await.unwrap();

    let mut renamed = common::sample_metadata();
    renamed.columns[1].name = "uid".to_string();
    let err = table
        .open_with_metadata("r2", false, renamed)
        .await
        .unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<TableError>(),
            Some(TableError::SchemaMismatch(_))
        ),
        "unexpected error: {err:#}"
    );

    // The healthy replica is unaffected.
    insert_part(&r1, &table.data_dir("r1"), 20240101, &["a"])
        .await
        .unwrap();
    r1.shutdown().await;
}

#[tokio::test]
async fn double_activation_is_refused() {
    let table = TestTable::new("double-activation");
    let (_s1, r1) = table.open("r1", false).await.unwrap();

    // A second process claims the same replica name while the first holds
    // the activation node. Attach mode, because the replica subtree exists.
    let err = table.open("r1", true).await.unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<TableError>(),
            Some(TableError::ReplicaAlreadyActive(_))
        ),
        "unexpected error: {err:#}"
    );

    // The original process is unharmed and still serves writes.
    insert_part(&r1, &table.data_dir("r1"), 20240101, &["a"])
        .await
        .unwrap();
    r1.shutdown().await;

    // With the first process gone, the same attach succeeds.
    let (_s2, revived) = table.open("r1", true).await.unwrap();
    revived.shutdown().await;
}

#[tokio::test]
async fn new_replica_is_refused_on_a_non_empty_table() {
    let table = TestTable::new("non-empty-join");
    let (_s1, r1) = table.open("r1", false).await.unwrap();
    insert_part(&r1, &table.data_dir("r1"), 20240101, &["a"])
        .await
        .unwrap();

    let err = table.open("r3", false).await.unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<TableError>(),
            Some(TableError::AddingReplicaToNonEmptyTable)
        ),
        "unexpected error: {err:#}"
    );
    r1.shutdown().await;
}

#[tokio::test]
async fn dropping_the_last_replica_removes_the_table() {
    let table = TestTable::new("drop-table");
    let (s1, r1) = table.open("r1", false).await.unwrap();
    let (_s2, r2) = table.open("r2", false).await.unwrap();

    r2.drop_replica().await.unwrap();
    assert!(s1.exists(&table.path).await.unwrap());
    assert!(!s1
        .exists(&format!("{}/replicas/r2", table.path))
        .await
        .unwrap());

    r1.drop_replica().await.unwrap();
    let probe = table.coord.session();
    assert!(!probe.exists(&table.path).await.unwrap());
}
