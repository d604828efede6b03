//! Replication queue.
//!
//! Every replica projects the union of all peers' logs into its own durable
//! queue and an in-memory mirror of it. The queue node in the coordinator
//! exists exactly as long as the action has not completed; the in-memory
//! side adds two bookkeeping sets:
//!
//! - `currently_merging`: inputs of every queued merge. Tagged when the
//!   entry is enqueued, untagged when it permanently leaves the queue.
//! - `future_parts`: parts some worker is producing right now. Tagged while
//!   a worker holds the entry, untagged on every exit path.
//!
//! Both are maintained through owned tags whose destruction untags, so no
//! failure path can leak a name.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use strata_coord::{Coordinator, CreateMode, Op};

use crate::log_entry::{LogAction, LogEntry};

type NameSet = Arc<Mutex<HashSet<String>>>;

/// Holds merge input names inside `currently_merging` for the lifetime of a
/// queued merge entry.
pub(crate) struct MergingTag {
    names: Vec<String>,
    set: NameSet,
}

impl MergingTag {
    fn tag(set: &NameSet, names: Vec<String>) -> Arc<MergingTag> {
        set.lock().unwrap().extend(names.iter().cloned());
        Arc::new(MergingTag {
            names,
            set: Arc::clone(set),
        })
    }
}

impl Drop for MergingTag {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap();
        for name in &self.names {
            set.remove(name);
        }
    }
}

/// Holds one produced-part name inside `future_parts` while a worker owns
/// the entry.
pub(crate) struct FutureTag {
    name: String,
    set: NameSet,
}

impl FutureTag {
    fn tag(set: &NameSet, name: String) -> FutureTag {
        set.lock().unwrap().insert(name.clone());
        FutureTag {
            name,
            set: Arc::clone(set),
        }
    }
}

impl Drop for FutureTag {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.name);
    }
}

struct QueueEntry {
    entry: LogEntry,
    /// Name of the durable queue node backing this entry.
    queue_node: String,
    merging_tag: Option<Arc<MergingTag>>,
}

/// A queue entry checked out by a worker. Dropping it releases every tag;
/// hand it back through [`ReplicationQueue::requeue`] on failure.
pub struct ActiveEntry {
    pub entry: LogEntry,
    pub queue_node: String,
    merging_tag: Option<Arc<MergingTag>>,
    future_tag: FutureTag,
}

pub struct ReplicationQueue {
    table_path: String,
    replica_path: String,
    entries: tokio::sync::Mutex<VecDeque<QueueEntry>>,
    future_parts: NameSet,
    currently_merging: NameSet,
}

/// Read position into one peer's log, ordered by the coordinator-assigned
/// creation id with a deterministic tie-break.
struct LogCursor {
    timestamp: i64,
    replica: String,
    index: u64,
    raw: Vec<u8>,
}

impl LogCursor {
    async fn read(
        coord: &dyn Coordinator,
        table_path: &str,
        replica: &str,
        index: u64,
    ) -> anyhow::Result<Option<LogCursor>> {
        let path = format!("{table_path}/replicas/{replica}/log/log-{index:010}");
        Ok(coord.try_get(&path).await?.map(|(raw, stat)| LogCursor {
            timestamp: stat.czxid,
            replica: replica.to_string(),
            index,
            raw,
        }))
    }

    fn key(&self) -> (i64, &str, u64) {
        (self.timestamp, &self.replica, self.index)
    }
}

impl PartialEq for LogCursor {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for LogCursor {}

impl PartialOrd for LogCursor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogCursor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

fn should_execute(entry: &LogEntry, future_parts: &HashSet<String>) -> bool {
    if let LogAction::MergeParts { parts, into } = &entry.action {
        // Wait for in-flight producers of the inputs. Missing inputs are not
        // a reason to wait: execution falls back to fetching the merged part.
        for name in parts {
            if future_parts.contains(name) {
                tracing::trace!(merge = %into, input = %name, "not merging yet, input is being produced");
                return false;
            }
        }
    }
    true
}

impl ReplicationQueue {
    pub fn new(table_path: impl Into<String>, replica_path: impl Into<String>) -> Self {
        Self {
            table_path: table_path.into(),
            replica_path: replica_path.into(),
            entries: tokio::sync::Mutex::new(VecDeque::new()),
            future_parts: Arc::new(Mutex::new(HashSet::new())),
            currently_merging: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn push(
        currently_merging: &NameSet,
        entries: &mut VecDeque<QueueEntry>,
        entry: LogEntry,
        queue_node: String,
    ) {
        let merging_tag = match &entry.action {
            LogAction::MergeParts { parts, .. } => {
                Some(MergingTag::tag(currently_merging, parts.clone()))
            }
            LogAction::GetPart { .. } => None,
        };
        entries.push_back(QueueEntry {
            entry,
            queue_node,
            merging_tag,
        });
    }

    /// Startup: restore the in-memory queue from the durable queue nodes.
    pub async fn load(&self, coord: &dyn Coordinator) -> anyhow::Result<usize> {
        let mut entries = self.entries.lock().await;
        let queue_path = format!("{}/queue", self.replica_path);
        let children = coord.get_children(&queue_path).await?;
        for child in children {
            let (raw, _) = coord.get(&format!("{queue_path}/{child}")).await?;
            let text = String::from_utf8(raw).context("queue entry is not utf-8")?;
            let entry = LogEntry::parse(&text)
                .with_context(|| format!("parsing queue entry {child}"))?;
            Self::push(&self.currently_merging, &mut entries, entry, child);
        }
        Ok(entries.len())
    }

    /// One updater pass: merge every peer's unread log suffix into the queue
    /// in coordinator-timestamp order. Each consumed entry is committed with
    /// one atomic multi-op creating the queue node and advancing the peer's
    /// log pointer, so a crash can never lose or duplicate an entry.
    ///
    /// Serialized on the queue lock; the merge selector also calls this
    /// between selections.
    pub async fn pull_logs_to_queue(&self, coord: &dyn Coordinator) -> anyhow::Result<usize> {
        let mut entries = self.entries.lock().await;

        let replicas_path = format!("{}/replicas", self.table_path);
        let replicas = coord.get_children(&replicas_path).await?;

        let mut heap: BinaryHeap<Reverse<LogCursor>> = BinaryHeap::new();
        for replica in &replicas {
            let pointer_path = format!("{}/log_pointers/{replica}", self.replica_path);
            let index = match coord.try_get(&pointer_path).await? {
                Some((raw, _)) => String::from_utf8(raw)
                    .context("log pointer is not utf-8")?
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("bad log pointer for {replica}"))?,
                None => {
                    // No pointer for this peer yet: start at its oldest
                    // retained entry.
                    let log_entries = coord
                        .get_children(&format!("{replicas_path}/{replica}/log"))
                        .await?;
                    let index = match log_entries.first() {
                        Some(name) => name
                            .strip_prefix("log-")
                            .with_context(|| format!("bad log node name {name}"))?
                            .parse::<u64>()?,
                        None => 0,
                    };
                    coord
                        .create(
                            &pointer_path,
                            index.to_string().as_bytes(),
                            CreateMode::Persistent,
                        )
                        .await?;
                    index
                }
            };
            if let Some(cursor) = LogCursor::read(coord, &self.table_path, replica, index).await? {
                heap.push(Reverse(cursor));
            }
        }

        let mut count = 0usize;
        while let Some(Reverse(cursor)) = heap.pop() {
            let text = String::from_utf8(cursor.raw.clone()).context("log entry is not utf-8")?;
            let entry = LogEntry::parse(&text).with_context(|| {
                format!("parsing log entry {} of {}", cursor.index, cursor.replica)
            })?;

            let results = coord
                .multi(vec![
                    Op::create(
                        format!("{}/queue/queue-", self.replica_path),
                        cursor.raw.clone(),
                        CreateMode::PersistentSequential,
                    ),
                    Op::set(
                        format!("{}/log_pointers/{}", self.replica_path, cursor.replica),
                        (cursor.index + 1).to_string(),
                    ),
                ])
                .await?;
            let queue_node = results[0]
                .created_path()
                .rsplit('/')
                .next()
                .expect("created path has a final component")
                .to_string();

            Self::push(&self.currently_merging, &mut entries, entry, queue_node);
            count += 1;

            if let Some(next) =
                LogCursor::read(coord, &self.table_path, &cursor.replica, cursor.index + 1).await?
            {
                heap.push(Reverse(next));
            }
        }

        if count > 0 {
            tracing::debug!(count, replica = %self.replica_path, "pulled entries into queue");
        }
        Ok(count)
    }

    /// Check out the first eligible entry, tagging its produced part.
    pub async fn pick_entry(&self) -> Option<ActiveEntry> {
        let mut entries = self.entries.lock().await;
        let position = {
            let future = self.future_parts.lock().unwrap();
            entries
                .iter()
                .position(|queued| should_execute(&queued.entry, &future))
        }?;
        let picked = entries.remove(position).expect("position is in bounds");
        let future_tag = FutureTag::tag(
            &self.future_parts,
            picked.entry.new_part_name().to_string(),
        );
        Some(ActiveEntry {
            entry: picked.entry,
            queue_node: picked.queue_node,
            merging_tag: picked.merging_tag,
            future_tag,
        })
    }

    /// Return a failed entry to the queue tail. The produced-part tag is
    /// released; merge inputs stay tagged because the entry is still queued.
    pub async fn requeue(&self, active: ActiveEntry) {
        let ActiveEntry {
            entry,
            queue_node,
            merging_tag,
            future_tag,
        } = active;
        drop(future_tag);
        let mut entries = self.entries.lock().await;
        entries.push_back(QueueEntry {
            entry,
            queue_node,
            merging_tag,
        });
    }

    /// Fetch-failure re-ordering. After failing to download `failed_part`,
    /// find the first queued merge consuming it and move every earlier entry
    /// producing one of that merge's inputs to just after the merge entry:
    /// downloading the already-merged result once beats downloading each
    /// input. Returns whether anything moved.
    pub async fn reorder_inputs_after_merge(&self, failed_part: &str) -> bool {
        let mut entries = self.entries.lock().await;

        let found = entries.iter().enumerate().find_map(|(position, queued)| {
            match &queued.entry.action {
                LogAction::MergeParts { parts, .. }
                    if parts.iter().any(|part| part == failed_part) =>
                {
                    Some((position, parts.iter().cloned().collect::<HashSet<String>>()))
                }
                _ => None,
            }
        });
        let Some((mut merge_position, inputs)) = found else {
            return false;
        };

        let mut moved = Vec::new();
        let mut index = 0;
        while index < merge_position {
            if inputs.contains(entries[index].entry.new_part_name()) {
                moved.push(entries.remove(index).expect("index is in bounds"));
                merge_position -= 1;
            } else {
                index += 1;
            }
        }

        let moved_count = moved.len();
        for (offset, queued) in moved.into_iter().enumerate() {
            entries.insert(merge_position + 1 + offset, queued);
        }
        moved_count > 0
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn merges_queued(&self) -> usize {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|queued| matches!(queued.entry.action, LogAction::MergeParts { .. }))
            .count()
    }

    /// Produced-part names of the queued entries, in order.
    pub async fn queued_part_names(&self) -> Vec<String> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|queued| queued.entry.new_part_name().to_string())
            .collect()
    }

    pub fn merging_snapshot(&self) -> HashSet<String> {
        self.currently_merging.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(part: &str) -> LogEntry {
        LogEntry::get_part("r1", part)
    }

    async fn push_all(queue: &ReplicationQueue, entries: Vec<LogEntry>) {
        let mut guard = queue.entries.lock().await;
        for (index, entry) in entries.into_iter().enumerate() {
            ReplicationQueue::push(
                &queue.currently_merging,
                &mut guard,
                entry,
                format!("queue-{index:010}"),
            );
        }
    }

    #[tokio::test]
    async fn merge_waits_for_in_flight_inputs() {
        let queue = ReplicationQueue::new("/t", "/t/replicas/r1");
        push_all(
            &queue,
            vec![
                get("20240101_20240101_1_1_0"),
                LogEntry::merge_parts(
                    "r1",
                    vec![
                        "20240101_20240101_1_1_0".to_string(),
                        "20240101_20240101_2_2_0".to_string(),
                    ],
                    "20240101_20240101_1_2_1",
                ),
            ],
        )
        .await;

        // The worker holding GET 1_1_0 blocks the merge, so a second worker
        // finds nothing eligible.
        let first = queue.pick_entry().await.unwrap();
        assert_eq!(first.entry.new_part_name(), "20240101_20240101_1_1_0");
        assert!(queue.pick_entry().await.is_none());

        // Completing the producer unblocks the merge.
        drop(first);
        let second = queue.pick_entry().await.unwrap();
        assert_eq!(second.entry.new_part_name(), "20240101_20240101_1_2_1");
    }

    #[tokio::test]
    async fn merging_tags_follow_the_entry_lifetime() {
        let queue = ReplicationQueue::new("/t", "/t/replicas/r1");
        push_all(
            &queue,
            vec![LogEntry::merge_parts(
                "r1",
                vec!["20240101_20240101_1_1_0".to_string()],
                "20240101_20240101_1_1_1",
            )],
        )
        .await;
        assert!(queue
            .merging_snapshot()
            .contains("20240101_20240101_1_1_0"));

        let active = queue.pick_entry().await.unwrap();
        // Checked out but still alive: inputs stay tagged.
        assert!(queue
            .merging_snapshot()
            .contains("20240101_20240101_1_1_0"));

        queue.requeue(active).await;
        assert!(queue
            .merging_snapshot()
            .contains("20240101_20240101_1_1_0"));

        let active = queue.pick_entry().await.unwrap();
        drop(active);
        assert!(queue.merging_snapshot().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_moves_merge_inputs_after_the_merge() {
        let queue = ReplicationQueue::new("/t", "/t/replicas/r2");
        push_all(
            &queue,
            vec![
                get("20240101_20240101_1_1_0"),
                get("20240101_20240101_2_2_0"),
                get("20240101_20240101_3_3_0"),
                LogEntry::merge_parts(
                    "r1",
                    vec![
                        "20240101_20240101_1_1_0".to_string(),
                        "20240101_20240101_2_2_0".to_string(),
                        "20240101_20240101_3_3_0".to_string(),
                    ],
                    "20240101_20240101_1_3_1",
                ),
            ],
        )
        .await;

        // A worker takes the first download and it fails.
        let failed = queue.pick_entry().await.unwrap();
        assert_eq!(failed.entry.new_part_name(), "20240101_20240101_1_1_0");
        assert!(queue
            .reorder_inputs_after_merge("20240101_20240101_1_1_0")
            .await);
        queue.requeue(failed).await;

        assert_eq!(
            queue.queued_part_names().await,
            vec![
                "20240101_20240101_1_3_1",
                "20240101_20240101_2_2_0",
                "20240101_20240101_3_3_0",
                "20240101_20240101_1_1_0",
            ]
        );
    }

    #[tokio::test]
    async fn reorder_without_a_consuming_merge_is_a_no_op() {
        let queue = ReplicationQueue::new("/t", "/t/replicas/r1");
        push_all(
            &queue,
            vec![get("20240101_20240101_1_1_0"), get("20240101_20240101_2_2_0")],
        )
        .await;
        assert!(!queue
            .reorder_inputs_after_merge("20240101_20240101_1_1_0")
            .await);
        assert_eq!(
            queue.queued_part_names().await,
            vec!["20240101_20240101_1_1_0", "20240101_20240101_2_2_0"]
        );
    }
}
