//! Replicated table core.
//!
//! One `ReplicatedTable` is one replica of one table. It owns:
//! - the lifecycle (create/attach, part reconciliation, activation, drop),
//! - the queue updater task pulling peer logs into the local queue,
//! - the worker pool executing queue entries (download or merge),
//! - the merge selector, running only while this replica holds leadership.
//!
//! Writers stay outside: they allocate a block number, materialize a part
//! directory and hand it to [`ReplicatedTable::commit_part`], which
//! registers it and appends the replication log entry in one atomic batch.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::task::JoinHandle;

use strata_coord::{
    create_ancestors, Coordinator, CoordErrorKind, CreateMode, EphemeralNode, LeaderElection, Op,
};

use crate::block_lock::{block_path, BlockLock, BlockState};
use crate::catalog::{read_checksums, verify_checksums, PartCatalog};
use crate::error::TableError;
use crate::exchange::{endpoint_name, register_endpoint, unregister_endpoint, PartExchange};
use crate::log_entry::{LogAction, LogEntry};
use crate::merger::{approx_bytes, select_parts_to_merge, PartMerger, BIG_MERGE_APPROX_BYTES};
use crate::metadata::TableMetadata;
use crate::part::PartInfo;
use crate::queue::{ActiveEntry, ReplicationQueue};
use crate::settings::TableSettings;

/// Identity and placement of one replica.
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Coordinator path of the table root.
    pub table_path: String,
    pub replica_name: String,
    /// Advertised inter-server address of this replica.
    pub host: String,
    pub port: u16,
    /// Local directory holding the part directories.
    pub data_dir: PathBuf,
    /// Attach an existing replica instead of creating a new one.
    pub attach: bool,
}

/// Observability snapshot of one replica.
#[derive(Debug, Clone, Serialize)]
pub struct TableStatus {
    pub replica_name: String,
    pub is_leader: bool,
    pub queue_size: usize,
    pub merges_queued: usize,
    pub parts: Vec<String>,
    pub currently_merging: Vec<String>,
}

pub(crate) struct TableCore {
    coord: Arc<dyn Coordinator>,
    exchange: Arc<dyn PartExchange>,
    merger: Arc<dyn PartMerger>,
    metadata: TableMetadata,
    settings: TableSettings,
    table_path: String,
    replica_path: String,
    replica_name: String,
    catalog: Arc<PartCatalog>,
    queue: ReplicationQueue,
    /// Shared by fetch and merge installs; schema changes take it
    /// exclusively.
    structure_lock: tokio::sync::RwLock<()>,
    shutdown: AtomicBool,
    is_leader: Arc<AtomicBool>,
    merge_selector: Mutex<Option<JoinHandle<()>>>,
}

pub struct ReplicatedTable {
    core: Arc<TableCore>,
    election: Arc<LeaderElection>,
    endpoint: String,
    is_active: Mutex<Option<EphemeralNode>>,
    updater: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ReplicatedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedTable")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl ReplicatedTable {
    /// Create or attach one replica and start its replication tasks. Every
    /// fatal condition (schema mismatch, part reconciliation failure, double
    /// activation) surfaces here, before any task is spawned.
    pub async fn open(
        coord: Arc<dyn Coordinator>,
        exchange: Arc<dyn PartExchange>,
        merger: Arc<dyn PartMerger>,
        metadata: TableMetadata,
        options: TableOptions,
        settings: TableSettings,
    ) -> anyhow::Result<Arc<ReplicatedTable>> {
        let table_path = options.table_path.trim_end_matches('/').to_string();
        let replica_path = format!("{table_path}/replicas/{}", options.replica_name);
        let catalog = Arc::new(PartCatalog::load(&options.data_dir)?);

        if options.attach {
            check_table_metadata(coord.as_ref(), &table_path, &metadata).await?;
            check_parts(coord.as_ref(), &replica_path, &catalog).await?;
        } else {
            if !coord.exists(&table_path).await? {
                create_table(coord.as_ref(), &table_path, &metadata).await?;
            }
            if !is_table_empty(coord.as_ref(), &table_path).await? {
                return Err(TableError::AddingReplicaToNonEmptyTable.into());
            }
            check_table_metadata(coord.as_ref(), &table_path, &metadata).await?;
            create_replica(coord.as_ref(), &replica_path).await?;
        }

        let is_leader = Arc::new(AtomicBool::new(false));
        let core = Arc::new(TableCore {
            queue: ReplicationQueue::new(&table_path, &replica_path),
            coord: Arc::clone(&coord),
            exchange,
            merger,
            metadata,
            settings,
            table_path: table_path.clone(),
            replica_path: replica_path.clone(),
            replica_name: options.replica_name.clone(),
            catalog: Arc::clone(&catalog),
            structure_lock: tokio::sync::RwLock::new(()),
            shutdown: AtomicBool::new(false),
            is_leader: Arc::clone(&is_leader),
            merge_selector: Mutex::new(None),
        });

        let restored = core.queue.load(coord.as_ref()).await?;
        if restored > 0 {
            tracing::debug!(restored, replica = %replica_path, "restored queue entries");
        }

        let is_active = activate_replica(Arc::clone(&coord), &replica_path, &options).await?;

        let endpoint = endpoint_name(&replica_path);
        register_endpoint(endpoint.clone(), &catalog);

        let election_core = Arc::downgrade(&core);
        let election = LeaderElection::start(
            Arc::clone(&coord),
            &format!("{table_path}/leader_election"),
            &options.replica_name,
            is_leader,
            Box::new(move || {
                let Some(core) = election_core.upgrade() else {
                    return;
                };
                let selector = tokio::spawn(merge_selecting_loop(Arc::clone(&core)));
                *core.merge_selector.lock().unwrap() = Some(selector);
            }),
        )
        .await?;

        let updater = tokio::spawn(queue_updating_loop(Arc::clone(&core)));
        let workers = (0..core.settings.replication_threads)
            .map(|_| tokio::spawn(queue_worker_loop(Arc::clone(&core))))
            .collect();

        tracing::info!(replica = %replica_path, "replica active");
        Ok(Arc::new(ReplicatedTable {
            core,
            election,
            endpoint,
            is_active: Mutex::new(Some(is_active)),
            updater: Mutex::new(Some(updater)),
            workers: Mutex::new(workers),
        }))
    }

    pub fn replica_name(&self) -> &str {
        &self.core.replica_name
    }

    pub fn replica_path(&self) -> &str {
        &self.core.replica_path
    }

    pub fn table_path(&self) -> &str {
        &self.core.table_path
    }

    pub fn is_leader(&self) -> bool {
        self.core.is_leader.load(Ordering::Acquire)
    }

    /// Names of the active local parts, ordered by interval.
    pub fn local_part_names(&self) -> Vec<String> {
        self.core
            .catalog
            .parts()
            .iter()
            .map(|part| part.name.clone())
            .collect()
    }

    /// Reserve the next block number for a new insert.
    pub async fn allocate_block_number(&self) -> anyhow::Result<BlockLock> {
        Ok(BlockLock::acquire(Arc::clone(&self.core.coord), &self.core.table_path).await?)
    }

    /// Commit a freshly written part: install the materialized `temp_dir`
    /// into the catalog, then atomically commit the block number, register
    /// the part plus checksums and append a `get` entry to our own log for
    /// peers to replay.
    pub async fn commit_part(
        &self,
        lock: BlockLock,
        temp_dir: &Path,
        part_name: &str,
    ) -> anyhow::Result<()> {
        let core = &self.core;
        let _structure = core.structure_lock.read().await;

        let part = PartInfo::parse(part_name)?;
        let superseded = core.catalog.rename_temp_part_and_replace(temp_dir, part)?;
        let checksums = read_checksums(&core.catalog.part_dir(part_name))?;
        let entry = LogEntry::get_part(&core.replica_name, part_name);

        let mut ops = lock.commit_ops();
        ops.push(Op::create(
            format!("{}/parts/{part_name}", core.replica_path),
            Vec::new(),
            CreateMode::Persistent,
        ));
        ops.push(Op::create(
            format!("{}/parts/{part_name}/checksums", core.replica_path),
            checksums,
            CreateMode::Persistent,
        ));
        for old in &superseded {
            ops.push(Op::remove(format!(
                "{}/parts/{}/checksums",
                core.replica_path, old.name
            )));
            ops.push(Op::remove(format!("{}/parts/{}", core.replica_path, old.name)));
        }
        ops.push(Op::create(
            format!("{}/log/log-", core.replica_path),
            entry.format(),
            CreateMode::PersistentSequential,
        ));
        core.coord.multi(ops).await?;
        lock.committed();

        tracing::debug!(part = %part_name, replica = %core.replica_name, "committed part");
        Ok(())
    }

    pub async fn status(&self) -> TableStatus {
        let mut currently_merging: Vec<String> =
            self.core.queue.merging_snapshot().into_iter().collect();
        currently_merging.sort();
        TableStatus {
            replica_name: self.core.replica_name.clone(),
            is_leader: self.is_leader(),
            queue_size: self.core.queue.len().await,
            merges_queued: self.core.queue.merges_queued().await,
            parts: self.local_part_names(),
            currently_merging,
        }
    }

    pub async fn status_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(&self.status().await)?)
    }

    /// Stop every task and release the activation node. Idempotent. Each
    /// loop observes the flag within one sleep cycle.
    pub async fn shutdown(&self) {
        if self.core.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(replica = %self.core.replica_name, "waiting for replication tasks to finish");

        self.election.shutdown().await;
        let selector = self.core.merge_selector.lock().unwrap().take();
        if let Some(task) = selector {
            let _ = task.await;
        }
        let updater = self.updater.lock().unwrap().take();
        if let Some(task) = updater {
            let _ = task.await;
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        for task in workers {
            let _ = task.await;
        }

        let is_active = self.is_active.lock().unwrap().take();
        if let Some(node) = is_active {
            node.release().await;
        }
        unregister_endpoint(&self.endpoint);
        tracing::debug!(replica = %self.core.replica_name, "replication tasks finished");
    }

    /// Remove this replica from the table; the last replica to leave takes
    /// the table root with it.
    pub async fn drop_replica(&self) -> anyhow::Result<()> {
        self.shutdown().await;
        tracing::info!(replica = %self.core.replica_path, "dropping replica");
        self.core
            .coord
            .remove_recursive(&self.core.replica_path)
            .await?;
        let replicas = self
            .core
            .coord
            .get_children(&format!("{}/replicas", self.core.table_path))
            .await?;
        if replicas.is_empty() {
            tracing::info!(table = %self.core.table_path, "no replicas left, dropping table");
            self.core
                .coord
                .remove_recursive(&self.core.table_path)
                .await?;
        }
        Ok(())
    }
}

impl Drop for ReplicatedTable {
    fn drop(&mut self) {
        if self.core.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!(replica = %self.core.replica_name, "table dropped without shutdown");
        unregister_endpoint(&self.endpoint);
        let election = Arc::clone(&self.election);
        let is_active = self.is_active.lock().unwrap().take();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                election.shutdown().await;
                if let Some(node) = is_active {
                    node.release().await;
                }
            });
        }
    }
}

// --- lifecycle -------------------------------------------------------------

async fn create_table(
    coord: &dyn Coordinator,
    table_path: &str,
    metadata: &TableMetadata,
) -> anyhow::Result<()> {
    tracing::info!(table = %table_path, "creating table skeleton");
    create_ancestors(coord, table_path).await?;
    coord.create(table_path, b"", CreateMode::Persistent).await?;
    coord
        .create(
            &format!("{table_path}/metadata"),
            metadata.format().as_bytes(),
            CreateMode::Persistent,
        )
        .await?;
    for child in ["replicas", "blocks", "block_numbers", "leader_election", "temp"] {
        coord
            .create(&format!("{table_path}/{child}"), b"", CreateMode::Persistent)
            .await?;
    }
    Ok(())
}

async fn create_replica(coord: &dyn Coordinator, replica_path: &str) -> anyhow::Result<()> {
    tracing::info!(replica = %replica_path, "creating replica subtree");
    coord.create(replica_path, b"", CreateMode::Persistent).await?;
    for child in ["host", "log", "log_pointers", "queue", "parts"] {
        coord
            .create(&format!("{replica_path}/{child}"), b"", CreateMode::Persistent)
            .await?;
    }
    Ok(())
}

async fn is_table_empty(coord: &dyn Coordinator, table_path: &str) -> anyhow::Result<bool> {
    let replicas_path = format!("{table_path}/replicas");
    for replica in coord.get_children(&replicas_path).await? {
        let parts = coord
            .get_children(&format!("{replicas_path}/{replica}/parts"))
            .await?;
        if !parts.is_empty() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Compare the local schema against the registered metadata node.
async fn check_table_metadata(
    coord: &dyn Coordinator,
    table_path: &str,
    local: &TableMetadata,
) -> anyhow::Result<()> {
    let (raw, _) = coord
        .get(&format!("{table_path}/metadata"))
        .await
        .context("reading registered table metadata")?;
    let text = String::from_utf8(raw).context("registered metadata is not utf-8")?;
    let registered = TableMetadata::parse(&text).context("parsing registered metadata")?;
    local.check_matches(&registered)?;
    Ok(())
}

/// Reconcile local parts against this replica's registrations on attach.
/// Parts we should have but do not are fatal; a single unexpected local part
/// is quarantined, more than one is fatal.
async fn check_parts(
    coord: &dyn Coordinator,
    replica_path: &str,
    catalog: &PartCatalog,
) -> anyhow::Result<()> {
    let registered: HashSet<String> = coord
        .get_children(&format!("{replica_path}/parts"))
        .await?
        .into_iter()
        .collect();
    let local = catalog.parts();
    let local_names: HashSet<&str> = local.iter().map(|part| part.name.as_str()).collect();

    let mut missing: Vec<&String> = registered
        .iter()
        .filter(|name| !local_names.contains(name.as_str()))
        .collect();
    missing.sort();
    if !missing.is_empty() {
        return Err(TableError::NotFoundExpectedDataPart {
            count: missing.len(),
            example: missing[0].clone(),
        }
        .into());
    }

    let unexpected: Vec<Arc<PartInfo>> = local
        .iter()
        .filter(|part| !registered.contains(&part.name))
        .cloned()
        .collect();
    if unexpected.len() > 1 {
        return Err(TableError::TooManyUnexpectedDataParts {
            count: unexpected.len(),
            example: unexpected[0].name.clone(),
        }
        .into());
    }
    for part in unexpected {
        tracing::error!(part = %part.name, "unexpected local part, renaming to ignored_{}", part.name);
        catalog.rename_and_detach(&part, "ignored_")?;
    }
    Ok(())
}

/// Announce the replica as active and refresh its address in one atomic
/// batch. `NodeExists` means another process of the same replica holds the
/// activation node.
async fn activate_replica(
    coord: Arc<dyn Coordinator>,
    replica_path: &str,
    options: &TableOptions,
) -> anyhow::Result<EphemeralNode> {
    let host_data = format!("host: {}\nport: {}\n", options.host, options.port);
    let is_active_path = format!("{replica_path}/is_active");
    let ops = vec![
        Op::create(is_active_path.clone(), Vec::new(), CreateMode::Ephemeral),
        Op::set(format!("{replica_path}/host"), host_data),
    ];
    match coord.multi(ops).await {
        Ok(_) => {}
        Err(err) if err.kind() == CoordErrorKind::NodeExists => {
            return Err(TableError::ReplicaAlreadyActive(replica_path.to_string()).into());
        }
        Err(err) => return Err(err.into()),
    }
    Ok(EphemeralNode::existing(coord, is_active_path))
}

// --- queue execution -------------------------------------------------------

async fn queue_updating_loop(core: Arc<TableCore>) {
    while !core.shutdown.load(Ordering::Acquire) {
        match core.queue.pull_logs_to_queue(core.coord.as_ref()).await {
            Ok(_) => tokio::time::sleep(core.settings.queue_update_sleep).await,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "queue update pass failed");
                tokio::time::sleep(core.settings.queue_error_sleep).await;
            }
        }
    }
}

async fn queue_worker_loop(core: Arc<TableCore>) {
    while !core.shutdown.load(Ordering::Acquire) {
        let Some(active) = core.queue.pick_entry().await else {
            tokio::time::sleep(core.settings.queue_no_work_sleep).await;
            continue;
        };

        let result = execute_entry(&core, &active.entry).await;

        if core.shutdown.load(Ordering::Acquire) {
            // The durable queue node is untouched either way; a completed
            // action short-circuits on replay after restart.
            break;
        }

        match result {
            Ok(()) => {
                ack_entry(&core, &active).await;
                drop(active);
                if !core.settings.queue_after_work_sleep.is_zero() {
                    tokio::time::sleep(core.settings.queue_after_work_sleep).await;
                }
            }
            Err(err) => {
                // Nobody having the part yet is routine; everything else is
                // noteworthy. The entry goes back to the tail in both cases.
                if let Some(TableError::NoReplicaHasPart(part)) =
                    err.downcast_ref::<TableError>()
                {
                    tracing::info!(part = %part, "no active replica has the part yet, re-queuing");
                } else {
                    tracing::error!(
                        part = %active.entry.new_part_name(),
                        error = %format!("{err:#}"),
                        "queue entry failed, re-queuing"
                    );
                }
                core.queue.requeue(active).await;
                tokio::time::sleep(core.settings.queue_error_sleep).await;
            }
        }
    }
}

/// Remove the durable queue node after successful execution. A missing node
/// is fine; any other failure is logged and ignored.
async fn ack_entry(core: &TableCore, active: &ActiveEntry) {
    let path = format!("{}/queue/{}", core.replica_path, active.queue_node);
    if let Err(err) = core.coord.try_remove(&path).await {
        tracing::error!(path = %path, error = %err, "could not remove queue node, ignoring");
    }
}

async fn execute_entry(core: &TableCore, entry: &LogEntry) -> anyhow::Result<()> {
    let new_part = entry.new_part_name();
    let own_get = matches!(entry.action, LogAction::GetPart { .. })
        && entry.source_replica == core.replica_name;

    // Covered locally and registered: nothing to do. The registration check
    // matters because in rare cases a local part can exist without one.
    if let Some(containing) = core.catalog.containing_part(new_part) {
        if core
            .coord
            .exists(&format!("{}/parts/{}", core.replica_path, containing.name))
            .await?
        {
            if !own_get {
                tracing::debug!(part = %new_part, "skipping action, part already present");
            }
            return Ok(());
        }
    }

    if own_get {
        tracing::error!(part = %new_part, "part from our own log is missing locally; this is a bug");
    }

    let mut fetch_needed = matches!(entry.action, LogAction::GetPart { .. });

    if let LogAction::MergeParts { parts, into } = &entry.action {
        let mut inputs = Vec::with_capacity(parts.len());
        let mut have_all = true;
        for name in parts {
            match core.catalog.containing_part(name) {
                None => {
                    have_all = false;
                    break;
                }
                Some(part) if part.name != *name => {
                    tracing::error!(
                        part = %name,
                        covered_by = %part.name,
                        merge = %into,
                        "log and parts set look inconsistent: merge input already covered"
                    );
                    have_all = false;
                    break;
                }
                Some(part) => inputs.push(part),
            }
        }
        if have_all {
            return merge_parts_locally(core, &inputs, into).await;
        }
        tracing::debug!(merge = %into, "missing merge inputs, fetching the merged part instead");
        fetch_needed = true;
    }

    if fetch_needed {
        let downloaded: anyhow::Result<()> = async {
            let replica = find_active_replica_having_part(core, new_part).await?;
            fetch_part(core, new_part, &replica).await
        }
        .await;
        if let Err(err) = downloaded {
            // Prefer downloading the already-merged result over each input.
            if core.queue.reorder_inputs_after_merge(new_part).await {
                tracing::debug!(part = %new_part, "moved merge input downloads after their merge");
            }
            return Err(err);
        }
    }
    Ok(())
}

async fn merge_parts_locally(
    core: &TableCore,
    inputs: &[Arc<PartInfo>],
    new_name: &str,
) -> anyhow::Result<()> {
    let _structure = core.structure_lock.read().await;
    tracing::debug!(new_part = %new_name, inputs = inputs.len(), "merging parts");

    let part_dirs: Vec<PathBuf> = inputs
        .iter()
        .map(|part| core.catalog.part_dir(&part.name))
        .collect();
    let dest = core
        .catalog
        .data_dir()
        .join(format!("tmp_merge_{new_name}"));
    core.merger.merge(inputs, &part_dirs, new_name, &dest).await?;

    let part = PartInfo::parse(new_name)?;
    core.catalog.rename_temp_part_and_replace(&dest, part)?;
    let checksums = read_checksums(&core.catalog.part_dir(new_name))?;

    let mut ops = vec![
        Op::create(
            format!("{}/parts/{new_name}", core.replica_path),
            Vec::new(),
            CreateMode::Persistent,
        ),
        Op::create(
            format!("{}/parts/{new_name}/checksums", core.replica_path),
            checksums,
            CreateMode::Persistent,
        ),
    ];
    for input in inputs {
        ops.push(Op::remove(format!(
            "{}/parts/{}/checksums",
            core.replica_path, input.name
        )));
        ops.push(Op::remove(format!(
            "{}/parts/{}",
            core.replica_path, input.name
        )));
    }
    core.coord.multi(ops).await?;

    core.catalog.clear_old_parts(core.settings.old_parts_lifetime);
    tracing::info!(new_part = %new_name, replica = %core.replica_name, "merged parts");
    Ok(())
}

/// Pick uniformly among the active replicas that register the part.
async fn find_active_replica_having_part(
    core: &TableCore,
    part_name: &str,
) -> anyhow::Result<String> {
    let replicas_path = format!("{}/replicas", core.table_path);
    let mut replicas = core.coord.get_children(&replicas_path).await?;
    replicas.shuffle(&mut rand::thread_rng());
    for replica in replicas {
        let has_part = core
            .coord
            .exists(&format!("{replicas_path}/{replica}/parts/{part_name}"))
            .await?;
        let active = core
            .coord
            .exists(&format!("{replicas_path}/{replica}/is_active"))
            .await?;
        if has_part && active {
            return Ok(replica);
        }
    }
    Err(TableError::NoReplicaHasPart(part_name.to_string()).into())
}

async fn fetch_part(core: &TableCore, part_name: &str, replica: &str) -> anyhow::Result<()> {
    tracing::debug!(part = %part_name, from = %replica, "fetching part");
    let _structure = core.structure_lock.read().await;

    let peer_path = format!("{}/replicas/{replica}", core.table_path);
    let (raw, _) = core.coord.get(&format!("{peer_path}/host")).await?;
    let (host, port) = parse_host_data(std::str::from_utf8(&raw)?)?;

    let dest = core
        .catalog
        .data_dir()
        .join(format!("tmp_fetch_{part_name}"));
    let downloaded = core
        .exchange
        .fetch_part(&endpoint_name(&peer_path), &host, port, part_name, &dest)
        .await
        .and_then(|()| verify_checksums(&dest));
    if let Err(err) = downloaded {
        let _ = std::fs::remove_dir_all(&dest);
        return Err(err);
    }

    let part = PartInfo::parse(part_name)?;
    let superseded = core.catalog.rename_temp_part_and_replace(&dest, part)?;
    let checksums = read_checksums(&core.catalog.part_dir(part_name))?;

    let mut ops = vec![
        Op::create(
            format!("{}/parts/{part_name}", core.replica_path),
            Vec::new(),
            CreateMode::Persistent,
        ),
        Op::create(
            format!("{}/parts/{part_name}/checksums", core.replica_path),
            checksums,
            CreateMode::Persistent,
        ),
    ];
    for old in &superseded {
        tracing::debug!(part = %old.name, by = %part_name, "part rendered obsolete by the fetch");
        ops.push(Op::remove(format!(
            "{}/parts/{}/checksums",
            core.replica_path, old.name
        )));
        ops.push(Op::remove(format!(
            "{}/parts/{}",
            core.replica_path, old.name
        )));
    }
    core.coord.multi(ops).await?;

    tracing::debug!(part = %part_name, from = %replica, "fetched part");
    Ok(())
}

fn parse_host_data(text: &str) -> anyhow::Result<(String, u16)> {
    let mut lines = text.lines();
    let host = lines
        .next()
        .and_then(|line| line.strip_prefix("host: "))
        .context("host node lacks a host line")?;
    let port = lines
        .next()
        .and_then(|line| line.strip_prefix("port: "))
        .context("host node lacks a port line")?;
    Ok((host.to_string(), port.trim().parse()?))
}

// --- merge selection -------------------------------------------------------

async fn merge_selecting_loop(core: Arc<TableCore>) {
    tracing::info!(replica = %core.replica_name, "merge selector started");
    // Refresh the queue first so currently_merging is complete.
    if let Err(err) = core.queue.pull_logs_to_queue(core.coord.as_ref()).await {
        tracing::warn!(error = %format!("{err:#}"), "initial queue pull failed");
    }

    while !core.shutdown.load(Ordering::Acquire) && core.is_leader.load(Ordering::Acquire) {
        let selected = match select_and_publish_merge(&core).await {
            Ok(selected) => selected,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "merge selection pass failed");
                false
            }
        };
        if core.shutdown.load(Ordering::Acquire) {
            break;
        }
        if !selected {
            tokio::time::sleep(core.settings.merge_selecting_sleep).await;
        }
    }
    tracing::info!(replica = %core.replica_name, "merge selector stopped");
}

async fn select_and_publish_merge(core: &Arc<TableCore>) -> anyhow::Result<bool> {
    if core.queue.merges_queued().await >= core.settings.merging_threads {
        return Ok(false);
    }

    // While a big merge is in flight, keep proposing only small ones.
    let mut has_big_merge = false;
    for name in core.queue.merging_snapshot() {
        let Some(part) = core.catalog.containing_part(&name) else {
            continue;
        };
        if part.name != name {
            tracing::info!(part = %name, covered_by = %part.name, "currently merging set has an obsolete part");
            continue;
        }
        if approx_bytes(&part, core.metadata.index_granularity) > BIG_MERGE_APPROX_BYTES {
            has_big_merge = true;
            break;
        }
    }

    let parts = core.catalog.parts();
    let can_merge = {
        let core = Arc::clone(core);
        move |left: Arc<PartInfo>, right: Arc<PartInfo>| {
            let core = Arc::clone(&core);
            async move { can_merge_parts(&core, &left, &right).await }
        }
    };

    tracing::trace!(only_small = has_big_merge, "selecting parts to merge");
    let granularity = core.metadata.index_granularity;
    let mut selection =
        select_parts_to_merge(&parts, false, has_big_merge, granularity, &can_merge).await;
    if selection.is_none() {
        selection =
            select_parts_to_merge(&parts, true, has_big_merge, granularity, &can_merge).await;
    }
    let Some(selection) = selection else {
        return Ok(false);
    };

    let entry = LogEntry::merge_parts(
        &core.replica_name,
        selection
            .parts
            .iter()
            .map(|part| part.name.clone())
            .collect(),
        &selection.result_name,
    );
    core.coord
        .create(
            &format!("{}/log/log-", core.replica_path),
            entry.format().as_bytes(),
            CreateMode::PersistentSequential,
        )
        .await?;
    tracing::info!(
        new_part = %selection.result_name,
        inputs = selection.parts.len(),
        "selected parts to merge"
    );

    // Pull synchronously so the chosen inputs are tagged as currently
    // merging before the next selection round.
    core.queue.pull_logs_to_queue(core.coord.as_ref()).await?;

    // The gaps between the chosen parts held only abandoned numbers; their
    // nodes are garbage now. Concurrent deletion is fine.
    for window in selection.parts.windows(2) {
        for number in (window[0].right + 1)..window[1].left {
            let path = block_path(&core.table_path, number);
            match BlockLock::check(core.coord.as_ref(), &path).await {
                Ok(BlockState::Abandoned) => {
                    let _ = core.coord.try_remove(&path).await;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(path = %path, error = %err, "block number GC check failed");
                }
            }
        }
    }
    Ok(true)
}

/// Merge legality: endpoints must not be merging already, and every block
/// number in the gap must be abandoned or never used.
async fn can_merge_parts(core: &TableCore, left: &PartInfo, right: &PartInfo) -> bool {
    let merging = core.queue.merging_snapshot();
    if merging.contains(&left.name) || merging.contains(&right.name) {
        return false;
    }
    for number in (left.right + 1)..right.left {
        let path = block_path(&core.table_path, number);
        match BlockLock::check(core.coord.as_ref(), &path).await {
            Ok(BlockState::Abandoned | BlockState::Missing) => {}
            Ok(state) => {
                tracing::debug!(
                    left = %left.name,
                    right = %right.name,
                    block = %path,
                    state = ?state,
                    "cannot merge across a live block number"
                );
                return false;
            }
            Err(err) => {
                tracing::warn!(block = %path, error = %err, "block number check failed");
                return false;
            }
        }
    }
    true
}
