//! Abandonable block-number lock.
//!
//! A writer reserves the next block number before materializing a part, then
//! either commits (the part now exists under that number) or abandons. The
//! merge selector later classifies every number in a gap between two parts:
//! only `Abandoned` and `Missing` numbers may be merged across, and only
//! `Abandoned` nodes are garbage-collected after a merge.
//!
//! On-node protocol for `…/block_numbers/block-<n>`:
//! - empty data + ephemeral `holder` child: held by a live writer;
//! - empty data, no holder: the writer died, abandoned;
//! - `committed` / `abandoned` marker: resolved explicitly.

use std::sync::Arc;

use strata_coord::{Coordinator, CoordError, CoordErrorKind, CreateMode, Op};

const COMMITTED_MARKER: &[u8] = b"committed";
const ABANDONED_MARKER: &[u8] = b"abandoned";

/// Classification of a block-number path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Held,
    Committed,
    Abandoned,
    Missing,
}

/// Coordinator path of a block-number node. The number is zero-padded to 10
/// digits only here, matching the sequential-create naming.
pub fn block_path(table_path: &str, number: u64) -> String {
    format!("{table_path}/block_numbers/block-{number:010}")
}

/// A reserved block number, pending commit or abandon.
pub struct BlockLock {
    coord: Arc<dyn Coordinator>,
    block_path: String,
    holder_path: String,
    number: u64,
    resolved: bool,
}

impl BlockLock {
    /// Reserve the next block number for the table.
    pub async fn acquire(
        coord: Arc<dyn Coordinator>,
        table_path: &str,
    ) -> Result<BlockLock, CoordError> {
        let block_path = coord
            .create(
                &format!("{table_path}/block_numbers/block-"),
                b"",
                CreateMode::PersistentSequential,
            )
            .await?;
        let number: u64 = block_path
            .rsplit('-')
            .next()
            .and_then(|suffix| suffix.parse().ok())
            .ok_or_else(|| CoordError::new(CoordErrorKind::BadArguments, block_path.clone()))?;
        let holder_path = format!("{block_path}/holder");
        coord
            .create(&holder_path, b"", CreateMode::Ephemeral)
            .await?;
        Ok(BlockLock {
            coord,
            block_path,
            holder_path,
            number,
            resolved: false,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn path(&self) -> &str {
        &self.block_path
    }

    /// Operations committing this block, for inclusion in the caller's
    /// atomic multi-op alongside part registration. Call [`committed`] once
    /// that multi succeeded.
    ///
    /// [`committed`]: BlockLock::committed
    pub fn commit_ops(&self) -> Vec<Op> {
        vec![
            Op::set(self.block_path.clone(), COMMITTED_MARKER.to_vec()),
            Op::remove(self.holder_path.clone()),
        ]
    }

    /// Mark the lock resolved after the commit multi-op succeeded.
    pub fn committed(mut self) {
        self.resolved = true;
    }

    /// Give the number up: merges may cross it from now on.
    pub async fn abandon(mut self) -> Result<(), CoordError> {
        self.resolved = true;
        self.coord
            .multi(vec![
                Op::set(self.block_path.clone(), ABANDONED_MARKER.to_vec()),
                Op::remove(self.holder_path.clone()),
            ])
            .await?;
        Ok(())
    }

    /// Classify a block-number path.
    pub async fn check(coord: &dyn Coordinator, path: &str) -> Result<BlockState, CoordError> {
        let Some((data, _)) = coord.try_get(path).await? else {
            return Ok(BlockState::Missing);
        };
        if data == COMMITTED_MARKER {
            return Ok(BlockState::Committed);
        }
        if data == ABANDONED_MARKER {
            return Ok(BlockState::Abandoned);
        }
        if coord.exists(&format!("{path}/holder")).await? {
            Ok(BlockState::Held)
        } else {
            Ok(BlockState::Abandoned)
        }
    }
}

impl Drop for BlockLock {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        // Best-effort abandon; if the task never runs, the ephemeral holder
        // disappearing with the session yields the same classification.
        let coord = Arc::clone(&self.coord);
        let block_path = self.block_path.clone();
        let holder_path = self.holder_path.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = coord
                    .multi(vec![
                        Op::set(block_path, ABANDONED_MARKER.to_vec()),
                        Op::remove(holder_path),
                    ])
                    .await;
            });
        }
    }
}
