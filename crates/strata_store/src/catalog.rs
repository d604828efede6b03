//! Local data part catalog.
//!
//! The catalog indexes the immutable part directories living under one
//! replica's table data directory. Parts are opaque to the replication core
//! except for two small sidecar files: `rows.txt` (ASCII row count) and
//! `checksums.txt` (one `name\tsize\tcrc32` line per payload file). The
//! columnar layer owns everything else in a part directory.
//!
//! Active part intervals are pairwise disjoint. A newly installed part
//! supersedes every active part its interval contains; superseded parts are
//! kept on disk for a grace period so concurrent readers can drain.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};

use crate::part::PartInfo;

pub const ROWS_FILE: &str = "rows.txt";
pub const CHECKSUMS_FILE: &str = "checksums.txt";

struct Superseded {
    part: Arc<PartInfo>,
    since: Instant,
}

#[derive(Default)]
struct CatalogInner {
    /// Active parts keyed by left block number.
    active: BTreeMap<u64, Arc<PartInfo>>,
    superseded: Vec<Superseded>,
}

pub struct PartCatalog {
    data_dir: PathBuf,
    inner: Mutex<CatalogInner>,
}

impl PartCatalog {
    /// Open the catalog over `data_dir`, creating the directory if needed
    /// and indexing every part directory found in it. Directory names that
    /// do not parse as part names (`tmp_*`, `ignored_*`, stray files) are
    /// skipped. A part found covered by another loaded part is treated as
    /// superseded, which happens after a crash between a merge install and
    /// the old-parts sweep.
    pub fn load(data_dir: impl Into<PathBuf>) -> anyhow::Result<PartCatalog> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;

        let mut loaded: Vec<Arc<PartInfo>> = Vec::new();
        for dir_entry in fs::read_dir(&data_dir)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_dir() {
                continue;
            }
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            let Ok(mut part) = PartInfo::parse(&name) else {
                continue;
            };
            part.rows = read_rows(&dir_entry.path())
                .with_context(|| format!("reading row count of part {name}"))?;
            loaded.push(Arc::new(part));
        }

        // Wider intervals win; anything they contain was already merged.
        loaded.sort_by_key(|part| (part.left, std::cmp::Reverse(part.right)));
        let mut inner = CatalogInner::default();
        for part in loaded {
            let covered = inner
                .active
                .values()
                .any(|existing| existing.contains(&part));
            if covered {
                tracing::debug!(part = %part.name, "loaded part is covered by another, keeping as superseded");
                inner.superseded.push(Superseded {
                    part,
                    since: Instant::now(),
                });
            } else {
                inner.active.insert(part.left, part);
            }
        }

        Ok(PartCatalog {
            data_dir,
            inner: Mutex::new(inner),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn part_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Snapshot of active parts ordered by interval.
    pub fn parts(&self) -> Vec<Arc<PartInfo>> {
        self.inner.lock().unwrap().active.values().cloned().collect()
    }

    /// The unique active part whose interval covers the named one, if any.
    pub fn containing_part(&self, name: &str) -> Option<Arc<PartInfo>> {
        let wanted = PartInfo::parse(name).ok()?;
        let inner = self.inner.lock().unwrap();
        let (_, candidate) = inner.active.range(..=wanted.left).next_back()?;
        candidate.contains(&wanted).then(|| Arc::clone(candidate))
    }

    /// Atomically install a part materialized in `temp_dir`: rename it into
    /// place and retire every active part its interval contains. Returns the
    /// retired parts. Refuses partial interval overlap, which would break
    /// the disjointness invariant.
    pub fn rename_temp_part_and_replace(
        &self,
        temp_dir: &Path,
        part: PartInfo,
    ) -> anyhow::Result<Vec<Arc<PartInfo>>> {
        let mut part = part;
        part.rows = read_rows(temp_dir)
            .with_context(|| format!("reading row count of incoming part {}", part.name))?;

        let mut inner = self.inner.lock().unwrap();

        let mut contained = Vec::new();
        for existing in inner.active.values() {
            if part.contains(existing) && existing.name != part.name {
                contained.push(Arc::clone(existing));
            } else if !part.disjoint(existing) && !existing.contains(&part) {
                bail!(
                    "part {} partially overlaps active part {}",
                    part.name,
                    existing.name
                );
            }
        }

        let target = self.part_dir(&part.name);
        fs::rename(temp_dir, &target).with_context(|| {
            format!(
                "installing part {} from {}",
                part.name,
                temp_dir.display()
            )
        })?;

        let now = Instant::now();
        for old in &contained {
            inner.active.remove(&old.left);
            inner.superseded.push(Superseded {
                part: Arc::clone(old),
                since: now,
            });
        }
        inner.active.insert(part.left, Arc::new(part));
        Ok(contained)
    }

    /// Remove a part from the active set and move its directory aside under
    /// the given prefix (for example `ignored_`).
    pub fn rename_and_detach(&self, part: &PartInfo, prefix: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.active.remove(&part.left);
        let from = self.part_dir(&part.name);
        let to = self.data_dir.join(format!("{prefix}{}", part.name));
        fs::rename(&from, &to)
            .with_context(|| format!("detaching part {} to {}", part.name, to.display()))?;
        Ok(())
    }

    /// Physically delete superseded parts older than `lifetime`. Returns how
    /// many were removed.
    pub fn clear_old_parts(&self, lifetime: Duration) -> usize {
        let expired: Vec<Arc<PartInfo>> = {
            let mut inner = self.inner.lock().unwrap();
            let now = Instant::now();
            let (expired, kept): (Vec<_>, Vec<_>) = inner
                .superseded
                .drain(..)
                .partition(|old| now.duration_since(old.since) >= lifetime);
            inner.superseded = kept;
            expired.into_iter().map(|old| old.part).collect()
        };

        let mut removed = 0;
        for part in expired {
            let dir = self.part_dir(&part.name);
            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    tracing::debug!(part = %part.name, "removed old part");
                    removed += 1;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(part = %part.name, error = %err, "failed to remove old part");
                }
            }
        }
        removed
    }
}

/// Read the sidecar row count of a part directory.
pub fn read_rows(part_dir: &Path) -> anyhow::Result<u64> {
    let text = fs::read_to_string(part_dir.join(ROWS_FILE))?;
    Ok(text.trim().parse()?)
}

/// Read the checksum blob of a part directory.
pub fn read_checksums(part_dir: &Path) -> anyhow::Result<String> {
    Ok(fs::read_to_string(part_dir.join(CHECKSUMS_FILE))?)
}

/// Compute the checksum blob over the payload files of a part directory:
/// one `name\tsize\tcrc32` line per file, sorted by name. The sidecar files
/// themselves are excluded.
pub fn compute_checksums(part_dir: &Path) -> anyhow::Result<String> {
    let mut entries: Vec<(String, u64, u32)> = Vec::new();
    for dir_entry in fs::read_dir(part_dir)? {
        let dir_entry = dir_entry?;
        let name = dir_entry.file_name().to_string_lossy().into_owned();
        if name == ROWS_FILE || name == CHECKSUMS_FILE {
            continue;
        }
        if !dir_entry.file_type()?.is_file() {
            bail!("unexpected non-file {name} in part directory");
        }
        let mut file = fs::File::open(dir_entry.path())?;
        let mut hasher = crc32fast::Hasher::new();
        let mut size = 0u64;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        entries.push((name, size, hasher.finalize()));
    }
    entries.sort();
    let mut out = String::new();
    for (name, size, crc) in entries {
        out.push_str(&format!("{name}\t{size}\t{crc:08x}\n"));
    }
    Ok(out)
}

/// Write the sidecar files of a freshly materialized part directory.
pub fn write_part_sidecars(part_dir: &Path, rows: u64) -> anyhow::Result<()> {
    fs::write(part_dir.join(ROWS_FILE), format!("{rows}\n"))?;
    let checksums = compute_checksums(part_dir)?;
    fs::write(part_dir.join(CHECKSUMS_FILE), checksums)?;
    Ok(())
}

/// Verify that the payload of a part directory matches its checksum blob.
pub fn verify_checksums(part_dir: &Path) -> anyhow::Result<()> {
    let recorded = read_checksums(part_dir)?;
    let actual = compute_checksums(part_dir)?;
    if recorded != actual {
        bail!(
            "checksum mismatch in {}: recorded {recorded:?}, actual {actual:?}",
            part_dir.display()
        );
    }
    Ok(())
}
