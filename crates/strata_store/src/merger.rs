//! Merge selection and the merger adapter.
//!
//! Selection lives in the replication core: the leader picks a contiguous
//! run of parts, subject to an async legality predicate that consults the
//! coordinator. The actual column-wise merge is an external collaborator
//! behind [`PartMerger`]; [`ConcatMerger`] is the in-process reference
//! implementation that concatenates payload files name-by-name.

use std::fs;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;

use crate::catalog::{read_rows, write_part_sidecars, CHECKSUMS_FILE, ROWS_FILE};
use crate::part::PartInfo;

/// Upper bound on inputs per merge.
pub const MAX_PARTS_TO_MERGE: usize = 10;
/// Approximate uncompressed size (`rows * index_granularity`) above which a
/// merge counts as big. One big merge at a time; selection falls back to
/// small runs while one is in flight.
pub const BIG_MERGE_APPROX_BYTES: u64 = 25 * 1024 * 1024;

/// A chosen run of parts plus the name of the part it produces.
#[derive(Debug, Clone)]
pub struct MergeSelection {
    pub parts: Vec<Arc<PartInfo>>,
    pub result_name: String,
}

/// Approximate uncompressed byte size of a part.
pub fn approx_bytes(part: &PartInfo, index_granularity: u64) -> u64 {
    part.rows.saturating_mul(index_granularity)
}

/// Name of the part produced by merging `run`.
pub fn merged_name(run: &[Arc<PartInfo>]) -> String {
    let min_date = run.iter().map(|p| p.min_date).min().unwrap_or(0);
    let max_date = run.iter().map(|p| p.max_date).max().unwrap_or(0);
    let level = run.iter().map(|p| p.level).max().unwrap_or(0) + 1;
    let left = run.first().map(|p| p.left).unwrap_or(0);
    let right = run.last().map(|p| p.right).unwrap_or(0);
    PartInfo::format_name(min_date, max_date, left, right, level)
}

/// Pick a run of at least two interval-adjacent parts to merge.
///
/// `parts` must be the catalog snapshot, ordered by interval. `can_merge` is
/// evaluated once per adjacent pair and gates whether the run may span that
/// boundary. The plain pass only returns runs whose combined approximate
/// size stays under [`BIG_MERGE_APPROX_BYTES`]; the aggressive pass lifts
/// that bound unless `only_small` keeps it (while a big merge is already in
/// flight). Longest viable run wins, earliest on ties.
pub async fn select_parts_to_merge<F, Fut>(
    parts: &[Arc<PartInfo>],
    aggressive: bool,
    only_small: bool,
    index_granularity: u64,
    can_merge: &F,
) -> Option<MergeSelection>
where
    F: Fn(Arc<PartInfo>, Arc<PartInfo>) -> Fut,
    Fut: Future<Output = bool>,
{
    if parts.len() < 2 {
        return None;
    }

    let mut joinable = vec![false; parts.len()];
    for index in 1..parts.len() {
        joinable[index] = can_merge(
            Arc::clone(&parts[index - 1]),
            Arc::clone(&parts[index]),
        )
        .await;
    }

    let bound_size = !aggressive || only_small;
    let mut best: Option<(usize, usize)> = None;
    for start in 0..parts.len() - 1 {
        let mut total = approx_bytes(&parts[start], index_granularity);
        let mut end = start;
        while end + 1 < parts.len()
            && joinable[end + 1]
            && end + 1 - start < MAX_PARTS_TO_MERGE
        {
            let next = approx_bytes(&parts[end + 1], index_granularity);
            if bound_size && total + next > BIG_MERGE_APPROX_BYTES {
                break;
            }
            total += next;
            end += 1;
        }
        let len = end - start + 1;
        if len >= 2 && best.map_or(true, |(s, e)| len > e - s + 1) {
            best = Some((start, end));
        }
    }

    let (start, end) = best?;
    let run: Vec<Arc<PartInfo>> = parts[start..=end].iter().cloned().collect();
    let result_name = merged_name(&run);
    Some(MergeSelection {
        parts: run,
        result_name,
    })
}

/// Facade over the columnar merger: materialize the merge of `parts` into a
/// temporary directory and report the row count of the result.
#[async_trait]
pub trait PartMerger: Send + Sync {
    async fn merge(
        &self,
        parts: &[Arc<PartInfo>],
        part_dirs: &[PathBuf],
        new_name: &str,
        dest: &Path,
    ) -> anyhow::Result<u64>;
}

/// Reference merger: concatenates every payload file of the inputs in part
/// order, file name by file name, and writes the sidecars. Inputs must carry
/// the same payload file set.
pub struct ConcatMerger;

#[async_trait]
impl PartMerger for ConcatMerger {
    async fn merge(
        &self,
        parts: &[Arc<PartInfo>],
        part_dirs: &[PathBuf],
        new_name: &str,
        dest: &Path,
    ) -> anyhow::Result<u64> {
        if parts.is_empty() || parts.len() != part_dirs.len() {
            bail!("merge of {new_name} got an inconsistent input list");
        }

        let mut payload_names: Vec<String> = Vec::new();
        for dir_entry in fs::read_dir(&part_dirs[0])? {
            let name = dir_entry?.file_name().to_string_lossy().into_owned();
            if name != ROWS_FILE && name != CHECKSUMS_FILE {
                payload_names.push(name);
            }
        }
        payload_names.sort();

        fs::create_dir_all(dest)?;
        for file_name in &payload_names {
            let mut out = fs::File::create(dest.join(file_name))?;
            for dir in part_dirs {
                let source = dir.join(file_name);
                let bytes = fs::read(&source).with_context(|| {
                    format!("merge input file {} is missing", source.display())
                })?;
                out.write_all(&bytes)?;
            }
        }

        let mut rows = 0u64;
        for dir in part_dirs {
            rows += read_rows(dir)?;
        }
        write_part_sidecars(dest, rows)?;
        Ok(rows)
    }
}
