//! Restart behavior: pointers never outrun the durable queue, replay is
//! idempotent, and a re-attached replica catches up.

mod common;

use common::{insert_part, registered_parts, wait_for_parts, TestTable};
use strata_coord::Coordinator;

#[tokio::test]
async fn reattached_replica_catches_up() {
    let table = TestTable::new("queue-recovery");
    let (_s1, r1) = table.open_without_merges("r1", false).await.unwrap();
    let (s2, r2) = table.open_without_merges("r2", false).await.unwrap();

    let first = insert_part(&r1, &table.data_dir("r1"), 20240101, &["a"])
        .await
        .unwrap();
    wait_for_parts(&s2, r2.replica_path(), &[&first]).await;

    // r2 goes down; r1 keeps writing.
    r2.shutdown().await;
    drop(r2);
    let second = insert_part(&r1, &table.data_dir("r1"), 20240102, &["b"])
        .await
        .unwrap();

    // Back up: the missed entry is replayed, the already-executed one
    // short-circuits.
    let (s2, r2) = table.open_without_merges("r2", true).await.unwrap();
    wait_for_parts(&s2, r2.replica_path(), &[&first, &second]).await;
    common::wait_until_async("r2 drains its queue", || {
        let r2 = r2.clone();
        async move { r2.status().await.queue_size == 0 }
    })
    .await;

    // Pointer atomicity: once the queue is drained, r2's pointer into r1's
    // log sits exactly past the last consumed entry.
    let log_nodes = s2
        .get_children(&format!("{}/replicas/r1/log", table.path))
        .await
        .unwrap();
    let last_index: u64 = log_nodes
        .last()
        .and_then(|name| name.strip_prefix("log-"))
        .unwrap()
        .parse()
        .unwrap();
    let (pointer_raw, _) = s2
        .get(&format!("{}/log_pointers/r1", r2.replica_path()))
        .await
        .unwrap();
    let pointer: u64 = std::str::from_utf8(&pointer_raw)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(pointer, last_index + 1);

    let mut final_parts = registered_parts(&s2, r2.replica_path()).await;
    final_parts.sort();
    common::assert_disjoint(&final_parts);

    r1.shutdown().await;
    r2.shutdown().await;
}

#[tokio::test]
async fn status_snapshot_reflects_the_replica() {
    let table = TestTable::new("status-snapshot");
    let (_s1, r1) = table.open("r1", false).await.unwrap();
    common::wait_until("r1 takes leadership", || r1.is_leader()).await;

    let part = insert_part(&r1, &table.data_dir("r1"), 20240101, &["a"])
        .await
        .unwrap();
    common::wait_until_async("the insert settles", || {
        let r1 = r1.clone();
        async move { r1.status().await.queue_size == 0 }
    })
    .await;

    let status = r1.status().await;
    assert_eq!(status.replica_name, "r1");
    assert!(status.is_leader);
    assert_eq!(status.parts, vec![part]);

    let json = r1.status_json().await.unwrap();
    assert!(json.contains("\"replica_name\":\"r1\""));

    r1.shutdown().await;
}
