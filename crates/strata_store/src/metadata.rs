//! Table metadata text format.
//!
//! The metadata node under the table root is the schema fingerprint every
//! replica checks itself against on attach. Comparison is byte-exact on the
//! formatted text; the mismatch error names the first differing item so an
//! operator can see what diverged.

use anyhow::{bail, Context};

use crate::error::TableError;

/// One column of the table schema. The type name is treated as opaque text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_name: String,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Schema fingerprint of a replicated table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    pub date_column: String,
    /// Formatted sampling expression, empty when the table has none.
    pub sampling_expression: String,
    pub index_granularity: u64,
    /// Integer code of the merge mode (plain, collapsing, summing, ...).
    pub mode: i32,
    /// Sign column for collapsing mode, empty otherwise.
    pub sign_column: String,
    /// Formatted primary key expression.
    pub primary_key: String,
    pub columns: Vec<Column>,
}

impl TableMetadata {
    pub fn format(&self) -> String {
        let mut out = String::new();
        out.push_str("metadata format version: 1\n");
        out.push_str(&format!("date column: {}\n", self.date_column));
        out.push_str(&format!(
            "sampling expression: {}\n",
            self.sampling_expression
        ));
        out.push_str(&format!("index granularity: {}\n", self.index_granularity));
        out.push_str(&format!("mode: {}\n", self.mode));
        out.push_str(&format!("sign column: {}\n", self.sign_column));
        out.push_str(&format!("primary key: {}\n", self.primary_key));
        out.push_str("columns:\n");
        for column in &self.columns {
            out.push_str(&back_quote(&column.name));
            out.push(' ');
            out.push_str(&column.type_name);
            out.push('\n');
        }
        out
    }

    pub fn parse(text: &str) -> anyhow::Result<TableMetadata> {
        let mut lines = text.lines();
        let mut expect_field = |field: &str| -> anyhow::Result<String> {
            let line = lines
                .next()
                .with_context(|| format!("metadata truncated before {field:?}"))?;
            line.strip_prefix(field)
                .map(str::to_string)
                .with_context(|| format!("metadata line {line:?} does not start with {field:?}"))
        };

        let version = expect_field("metadata format version: ")?;
        if version != "1" {
            bail!("unsupported metadata format version {version:?}");
        }
        let date_column = expect_field("date column: ")?;
        let sampling_expression = expect_field("sampling expression: ")?;
        let index_granularity = expect_field("index granularity: ")?
            .parse()
            .context("bad index granularity")?;
        let mode = expect_field("mode: ")?.parse().context("bad mode code")?;
        let sign_column = expect_field("sign column: ")?;
        let primary_key = expect_field("primary key: ")?;
        let columns_header = expect_field("columns:")?;
        if !columns_header.is_empty() {
            bail!("unexpected trailing text on columns header");
        }

        let mut columns = Vec::new();
        for line in lines {
            columns.push(parse_column_line(line)?);
        }

        Ok(TableMetadata {
            date_column,
            sampling_expression,
            index_granularity,
            mode,
            sign_column,
            primary_key,
            columns,
        })
    }

    /// Byte-exact comparison against the metadata registered in the
    /// coordinator, reporting the first difference.
    pub fn check_matches(&self, registered: &TableMetadata) -> Result<(), TableError> {
        let mismatch = |what: &str, ours: &str, theirs: &str| {
            Err(TableError::SchemaMismatch(format!(
                "{what} differs: local {ours:?}, registered {theirs:?}"
            )))
        };

        if self.date_column != registered.date_column {
            return mismatch("date column", &self.date_column, &registered.date_column);
        }
        if self.sampling_expression != registered.sampling_expression {
            return mismatch(
                "sampling expression",
                &self.sampling_expression,
                &registered.sampling_expression,
            );
        }
        if self.index_granularity != registered.index_granularity {
            return mismatch(
                "index granularity",
                &self.index_granularity.to_string(),
                &registered.index_granularity.to_string(),
            );
        }
        if self.mode != registered.mode {
            return mismatch("mode", &self.mode.to_string(), &registered.mode.to_string());
        }
        if self.sign_column != registered.sign_column {
            return mismatch("sign column", &self.sign_column, &registered.sign_column);
        }
        if self.primary_key != registered.primary_key {
            return mismatch("primary key", &self.primary_key, &registered.primary_key);
        }
        for (index, (ours, theirs)) in self.columns.iter().zip(&registered.columns).enumerate() {
            if ours.name != theirs.name {
                return Err(TableError::SchemaMismatch(format!(
                    "unexpected column name at position {index}: expected {:?}, registered {:?}",
                    ours.name, theirs.name
                )));
            }
            if ours.type_name != theirs.type_name {
                return Err(TableError::SchemaMismatch(format!(
                    "column {:?} type differs: local {:?}, registered {:?}",
                    ours.name, ours.type_name, theirs.type_name
                )));
            }
        }
        if self.columns.len() != registered.columns.len() {
            return Err(TableError::SchemaMismatch(format!(
                "column count differs: local {}, registered {}",
                self.columns.len(),
                registered.columns.len()
            )));
        }
        Ok(())
    }
}

/// Quote a column name in backticks with backslash escaping.
fn back_quote(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('`');
    for ch in name.chars() {
        if ch == '`' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('`');
    out
}

fn parse_column_line(line: &str) -> anyhow::Result<Column> {
    let mut chars = line.chars();
    if chars.next() != Some('`') {
        bail!("column line {line:?} does not start with a backtick");
    }
    let mut name = String::new();
    let mut closed = false;
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                let escaped = chars
                    .next()
                    .with_context(|| format!("dangling escape in column line {line:?}"))?;
                name.push(escaped);
            }
            '`' => {
                closed = true;
                break;
            }
            other => name.push(other),
        }
    }
    if !closed {
        bail!("unterminated column name in line {line:?}");
    }
    let rest: String = chars.collect();
    let type_name = rest
        .strip_prefix(' ')
        .with_context(|| format!("column line {line:?} lacks a type"))?;
    if type_name.is_empty() {
        bail!("column line {line:?} has an empty type");
    }
    Ok(Column::new(name, type_name))
}
