//! Runtime tuning for the replication engine.

use std::time::Duration;

/// Tuning knobs for one replicated table. `Default` carries the production
/// values; tests shrink the sleeps to keep wall-clock time down.
#[derive(Debug, Clone)]
pub struct TableSettings {
    /// Number of queue worker tasks executing fetches and merges.
    pub replication_threads: usize,
    /// Soft cap on simultaneously queued merges; the selector stops
    /// proposing new ones above it.
    pub merging_threads: usize,
    /// Pause between queue-updater passes.
    pub queue_update_sleep: Duration,
    /// Worker pause when no queue entry is eligible.
    pub queue_no_work_sleep: Duration,
    /// Pause after a failed pass or a failed queue entry.
    pub queue_error_sleep: Duration,
    /// Pause after successfully executing a queue entry.
    pub queue_after_work_sleep: Duration,
    /// Pause between merge-selector passes that produced nothing.
    pub merge_selecting_sleep: Duration,
    /// Grace period before physically deleting superseded parts.
    pub old_parts_lifetime: Duration,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            replication_threads: 12,
            merging_threads: 6,
            queue_update_sleep: Duration::from_secs(5),
            queue_no_work_sleep: Duration::from_secs(5),
            queue_error_sleep: Duration::from_secs(1),
            queue_after_work_sleep: Duration::ZERO,
            merge_selecting_sleep: Duration::from_secs(5),
            old_parts_lifetime: Duration::from_secs(480),
        }
    }
}
