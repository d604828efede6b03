//! Shared helpers for integration tests.
//!
//! Each test builds one in-process coordinator and a handful of replicas on
//! tempdir data directories, with sleeps shrunk far below the production
//! defaults so convergence happens in milliseconds.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use strata_coord::{Coordinator, CoordSession, MemoryCoordinator};
use strata_store::{
    catalog, Column, ConcatMerger, LocalExchange, PartInfo, ReplicatedTable, TableMetadata,
    TableOptions, TableSettings,
};

/// Upper bound for every wait loop.
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(20);
const POLL_SLEEP: Duration = Duration::from_millis(25);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn test_settings() -> TableSettings {
    TableSettings {
        replication_threads: 2,
        merging_threads: 2,
        queue_update_sleep: Duration::from_millis(50),
        queue_no_work_sleep: Duration::from_millis(50),
        queue_error_sleep: Duration::from_millis(50),
        queue_after_work_sleep: Duration::ZERO,
        merge_selecting_sleep: Duration::from_millis(50),
        old_parts_lifetime: Duration::ZERO,
    }
}

pub fn sample_metadata() -> TableMetadata {
    TableMetadata {
        date_column: "event_date".to_string(),
        sampling_expression: String::new(),
        index_granularity: 8192,
        mode: 0,
        sign_column: String::new(),
        primary_key: "(event_date, user_id)".to_string(),
        columns: vec![
            Column::new("event_date", "Date"),
            Column::new("user_id", "UInt64"),
            Column::new("value", "String"),
        ],
    }
}

/// One table shared by several test replicas.
pub struct TestTable {
    pub coord: Arc<MemoryCoordinator>,
    pub path: String,
    root: tempfile::TempDir,
}

impl TestTable {
    pub fn new(name: &str) -> TestTable {
        init_tracing();
        TestTable {
            coord: MemoryCoordinator::new(),
            path: format!("/tables/{name}"),
            root: tempfile::tempdir().expect("create test root"),
        }
    }

    pub fn data_dir(&self, replica: &str) -> PathBuf {
        self.root.path().join(replica)
    }

    /// Open a replica with its own coordinator session.
    pub async fn open(
        &self,
        replica: &str,
        attach: bool,
    ) -> anyhow::Result<(Arc<CoordSession>, Arc<ReplicatedTable>)> {
        self.open_with_metadata(replica, attach, sample_metadata())
            .await
    }

    pub async fn open_with_metadata(
        &self,
        replica: &str,
        attach: bool,
        metadata: TableMetadata,
    ) -> anyhow::Result<(Arc<CoordSession>, Arc<ReplicatedTable>)> {
        self.open_custom(replica, attach, metadata, test_settings())
            .await
    }

    /// Open a replica whose merge selector never proposes anything, for
    /// tests that assert on the raw inserted parts.
    pub async fn open_without_merges(
        &self,
        replica: &str,
        attach: bool,
    ) -> anyhow::Result<(Arc<CoordSession>, Arc<ReplicatedTable>)> {
        let settings = TableSettings {
            merging_threads: 0,
            ..test_settings()
        };
        self.open_custom(replica, attach, sample_metadata(), settings)
            .await
    }

    pub async fn open_custom(
        &self,
        replica: &str,
        attach: bool,
        metadata: TableMetadata,
        settings: TableSettings,
    ) -> anyhow::Result<(Arc<CoordSession>, Arc<ReplicatedTable>)> {
        let session = self.coord.session();
        let table = ReplicatedTable::open(
            session.clone(),
            Arc::new(LocalExchange),
            Arc::new(ConcatMerger),
            metadata,
            TableOptions {
                table_path: self.path.clone(),
                replica_name: replica.to_string(),
                host: "localhost".to_string(),
                port: 9009,
                data_dir: self.data_dir(replica),
                attach,
            },
            settings,
        )
        .await?;
        Ok((session, table))
    }
}

/// Simulate the write path: reserve a block number, materialize a part
/// directory and commit it. Returns the new part name.
pub async fn insert_part(
    table: &ReplicatedTable,
    data_dir: &std::path::Path,
    date: u32,
    rows: &[&str],
) -> anyhow::Result<String> {
    let lock = table.allocate_block_number().await?;
    let number = lock.number();
    let name = format!("{date}_{date}_{number}_{number}_0");

    let temp = data_dir.join(format!("insert_tmp_{name}"));
    std::fs::create_dir_all(&temp)?;
    let payload: String = rows.iter().map(|row| format!("{row}\n")).collect();
    std::fs::write(temp.join("data.tsv"), payload)?;
    catalog::write_part_sidecars(&temp, rows.len() as u64)?;

    table.commit_part(lock, &temp, &name).await?;
    Ok(name)
}

/// Part names registered for a replica in the coordinator.
pub async fn registered_parts(session: &Arc<CoordSession>, replica_path: &str) -> Vec<String> {
    session
        .get_children(&format!("{replica_path}/parts"))
        .await
        .unwrap_or_default()
}

/// Wait until a replica's registered part set equals `expected` (sorted).
pub async fn wait_for_parts(session: &Arc<CoordSession>, replica_path: &str, expected: &[&str]) {
    let deadline = tokio::time::Instant::now() + CONVERGE_TIMEOUT;
    loop {
        let mut parts = registered_parts(session, replica_path).await;
        parts.sort();
        let as_str: Vec<&str> = parts.iter().map(String::as_str).collect();
        if as_str == expected {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("replica {replica_path} did not converge: have {parts:?}, want {expected:?}");
        }
        tokio::time::sleep(POLL_SLEEP).await;
    }
}

/// Wait until a replica registers exactly one part covering `[left, right]`
/// and return its name. Tolerates intermediate merge steps.
pub async fn wait_for_single_covering_part(
    session: &Arc<CoordSession>,
    replica_path: &str,
    left: u64,
    right: u64,
) -> String {
    let deadline = tokio::time::Instant::now() + CONVERGE_TIMEOUT;
    loop {
        let parts = registered_parts(session, replica_path).await;
        if parts.len() == 1 {
            if let Ok(part) = PartInfo::parse(&parts[0]) {
                if part.left == left && part.right == right {
                    return parts[0].clone();
                }
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "replica {replica_path} never settled on one part covering \
                 [{left}, {right}]: have {parts:?}"
            );
        }
        tokio::time::sleep(POLL_SLEEP).await;
    }
}

pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + CONVERGE_TIMEOUT;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(POLL_SLEEP).await;
    }
}

pub async fn wait_until_async<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + CONVERGE_TIMEOUT;
    while !check().await {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(POLL_SLEEP).await;
    }
}

/// Assert the pairwise disjointness of a replica's registered intervals.
pub fn assert_disjoint(parts: &[String]) {
    let parsed: Vec<PartInfo> = parts
        .iter()
        .map(|name| PartInfo::parse(name).expect("registered part name parses"))
        .collect();
    for (index, left) in parsed.iter().enumerate() {
        for right in &parsed[index + 1..] {
            assert!(
                left.disjoint(right),
                "parts {} and {} overlap",
                left.name,
                right.name
            );
        }
    }
}
