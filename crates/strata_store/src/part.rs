//! Data part naming and interval algebra.
//!
//! A part name is `<min_date>_<max_date>_<left>_<right>_<level>`: the date
//! range covered by the rows, the inclusive block-number interval, and the
//! merge depth. Block numbers are plain decimal here; the 10-digit zero
//! padding exists only inside coordinator paths.

use anyhow::{bail, Context};

/// Descriptor of one immutable data part.
///
/// `rows` is not part of the name; it is filled in by the catalog from the
/// part directory and stays zero on freshly parsed names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    pub name: String,
    /// First covered date, `YYYYMMDD`.
    pub min_date: u32,
    /// Last covered date, `YYYYMMDD`.
    pub max_date: u32,
    /// Inclusive lower block number.
    pub left: u64,
    /// Inclusive upper block number.
    pub right: u64,
    /// Merge depth; merging parts of depth `L` yields depth `L + 1`.
    pub level: u32,
    pub rows: u64,
}

impl PartInfo {
    pub fn parse(name: &str) -> anyhow::Result<PartInfo> {
        let fields: Vec<&str> = name.split('_').collect();
        if fields.len() != 5 {
            bail!("bad part name {name:?}: expected 5 fields");
        }
        let min_date: u32 = fields[0]
            .parse()
            .with_context(|| format!("bad min date in part name {name:?}"))?;
        let max_date: u32 = fields[1]
            .parse()
            .with_context(|| format!("bad max date in part name {name:?}"))?;
        let left: u64 = fields[2]
            .parse()
            .with_context(|| format!("bad left block in part name {name:?}"))?;
        let right: u64 = fields[3]
            .parse()
            .with_context(|| format!("bad right block in part name {name:?}"))?;
        let level: u32 = fields[4]
            .parse()
            .with_context(|| format!("bad level in part name {name:?}"))?;
        if min_date > max_date {
            bail!("bad part name {name:?}: date range is inverted");
        }
        if left > right {
            bail!("bad part name {name:?}: block interval is inverted");
        }
        Ok(PartInfo {
            name: name.to_string(),
            min_date,
            max_date,
            left,
            right,
            level,
            rows: 0,
        })
    }

    pub fn format_name(min_date: u32, max_date: u32, left: u64, right: u64, level: u32) -> String {
        format!("{min_date}_{max_date}_{left}_{right}_{level}")
    }

    /// True when this part's interval covers `other`'s entirely. A part
    /// covers itself.
    pub fn contains(&self, other: &PartInfo) -> bool {
        self.left <= other.left && other.right <= self.right
    }

    pub fn contains_block(&self, number: u64) -> bool {
        self.left <= number && number <= self.right
    }

    pub fn disjoint(&self, other: &PartInfo) -> bool {
        self.right < other.left || other.right < self.left
    }
}
