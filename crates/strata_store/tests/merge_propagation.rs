//! Merges selected by the leader propagate as merged parts.
//!
//! A replica that missed the inserts must end up downloading the merged
//! part, not the inputs: by the time it replays the log, the inputs are no
//! longer registered anywhere, so the downloads fail over to the merge
//! entry, which fetches the covering part and short-circuits the rest.

mod common;

use common::{insert_part, wait_for_single_covering_part, TestTable};
use strata_store::PartInfo;

#[tokio::test]
async fn late_replica_fetches_the_merged_part() {
    let table = TestTable::new("merge-propagation");
    let (s1, r1) = table.open("r1", false).await.unwrap();
    let (_s2, r2) = table.open("r2", false).await.unwrap();

    // r2 goes away before any data exists.
    r2.shutdown().await;
    drop(r2);

    common::wait_until("r1 takes leadership", || r1.is_leader()).await;

    let first = insert_part(&r1, &table.data_dir("r1"), 20240101, &["a"])
        .await
        .unwrap();
    insert_part(&r1, &table.data_dir("r1"), 20240101, &["b"])
        .await
        .unwrap();
    let third = insert_part(&r1, &table.data_dir("r1"), 20240101, &["c"])
        .await
        .unwrap();

    let left = PartInfo::parse(&first).unwrap().left;
    let right = PartInfo::parse(&third).unwrap().right;

    // The selector merges everything into one covering part on r1.
    let merged = wait_for_single_covering_part(&s1, r1.replica_path(), left, right).await;

    // r2 comes back and replays the backlog: three dead downloads falling
    // over to one fetch of the merged part.
    let (s2, r2) = table.open("r2", true).await.unwrap();
    let also_merged = wait_for_single_covering_part(&s2, r2.replica_path(), left, right).await;
    assert_eq!(merged, also_merged);

    common::wait_until_async("r2 drains its queue", || {
        let r2 = r2.clone();
        async move { r2.status().await.queue_size == 0 }
    })
    .await;
    assert_eq!(r2.local_part_names(), vec![merged.clone()]);

    // The merged payload is the concatenation of the inputs.
    let merged_file = table.data_dir("r2").join(&merged).join("data.tsv");
    assert_eq!(std::fs::read_to_string(merged_file).unwrap(), "a\nb\nc\n");

    r1.shutdown().await;
    r2.shutdown().await;
}
