//! Merges may only cross abandoned or unused block numbers.

mod common;

use std::time::Duration;

use common::{insert_part, registered_parts, wait_for_single_covering_part, TestTable};
use strata_coord::Coordinator;
use strata_store::{block_path, PartInfo};

#[tokio::test]
async fn held_gap_blocks_veto_the_merge_until_abandoned() {
    let table = TestTable::new("merge-legality");
    let (s1, r1) = table.open("r1", false).await.unwrap();
    common::wait_until("r1 takes leadership", || r1.is_leader()).await;

    // Parts on blocks 0 and 2; block 1 is reserved by a writer that has not
    // decided yet.
    let first = insert_part(&r1, &table.data_dir("r1"), 20240101, &["a"])
        .await
        .unwrap();
    let held = r1.allocate_block_number().await.unwrap();
    let held_number = held.number();
    let second = insert_part(&r1, &table.data_dir("r1"), 20240101, &["b"])
        .await
        .unwrap();

    // Give the selector plenty of passes: it must refuse to merge across
    // the held number.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let mut parts = registered_parts(&s1, r1.replica_path()).await;
    parts.sort();
    assert_eq!(parts, vec![first.clone(), second.clone()]);

    // The writer gives up; the gap becomes crossable and the merge happens.
    held.abandon().await.unwrap();
    let left = PartInfo::parse(&first).unwrap().left;
    let right = PartInfo::parse(&second).unwrap().right;
    wait_for_single_covering_part(&s1, r1.replica_path(), left, right).await;

    // The selector garbage-collects the abandoned number it merged across.
    common::wait_until_async("the abandoned block node is collected", || {
        let s1 = s1.clone();
        let path = block_path(&table.path, held_number);
        async move { !s1.exists(&path).await.unwrap_or(true) }
    })
    .await;

    r1.shutdown().await;
}
