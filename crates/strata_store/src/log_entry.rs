//! Replication log entry wire format.
//!
//! Entries are appended to a replica's own log and replayed by every replica
//! through its queue. The format is line-oriented text with a trailing blank
//! line terminating the record:
//!
//! ```text
//! format version: 1
//! source replica: r1
//! merge
//! 20240101_20240101_1_1_0
//! 20240101_20240101_2_2_0
//! into
//! 20240101_20240101_1_2_1
//!
//! ```

use anyhow::{bail, Context};

/// What a log entry asks a replica to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogAction {
    /// Obtain the named part, normally by downloading it from a peer.
    GetPart { part: String },
    /// Merge the named local parts into `into`; replicas lacking the inputs
    /// download the merged part instead.
    MergeParts { parts: Vec<String>, into: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub source_replica: String,
    pub action: LogAction,
}

impl LogEntry {
    pub fn get_part(source_replica: impl Into<String>, part: impl Into<String>) -> Self {
        Self {
            source_replica: source_replica.into(),
            action: LogAction::GetPart { part: part.into() },
        }
    }

    pub fn merge_parts(
        source_replica: impl Into<String>,
        parts: Vec<String>,
        into: impl Into<String>,
    ) -> Self {
        Self {
            source_replica: source_replica.into(),
            action: LogAction::MergeParts {
                parts,
                into: into.into(),
            },
        }
    }

    /// Name of the part this entry produces.
    pub fn new_part_name(&self) -> &str {
        match &self.action {
            LogAction::GetPart { part } => part,
            LogAction::MergeParts { into, .. } => into,
        }
    }

    pub fn format(&self) -> String {
        let mut out = String::new();
        out.push_str("format version: 1\n");
        out.push_str("source replica: ");
        out.push_str(&self.source_replica);
        out.push('\n');
        match &self.action {
            LogAction::GetPart { part } => {
                out.push_str("get\n");
                out.push_str(part);
            }
            LogAction::MergeParts { parts, into } => {
                out.push_str("merge\n");
                for part in parts {
                    out.push_str(part);
                    out.push('\n');
                }
                out.push_str("into\n");
                out.push_str(into);
            }
        }
        out.push('\n');
        out.push('\n');
        out
    }

    pub fn parse(text: &str) -> anyhow::Result<LogEntry> {
        let mut lines = text.lines();
        let mut next = |what: &str| {
            lines
                .next()
                .with_context(|| format!("log entry truncated before {what}"))
        };

        let version = next("version")?;
        if version != "format version: 1" {
            bail!("unsupported log entry version line {version:?}");
        }
        let source_replica = next("source replica")?
            .strip_prefix("source replica: ")
            .context("log entry missing source replica line")?
            .to_string();

        let action = match next("action")? {
            "get" => LogAction::GetPart {
                part: next("part name")?.to_string(),
            },
            "merge" => {
                let mut parts = Vec::new();
                let into = loop {
                    let line = next("merge part list")?;
                    if line == "into" {
                        break next("merge result name")?.to_string();
                    }
                    parts.push(line.to_string());
                };
                if parts.is_empty() {
                    bail!("merge log entry lists no input parts");
                }
                LogAction::MergeParts { parts, into }
            }
            other => bail!("unknown log entry action {other:?}"),
        };

        if !text.ends_with("\n\n") {
            bail!("log entry record is not terminated by a blank line");
        }

        Ok(LogEntry {
            source_replica,
            action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_entry_roundtrip() {
        let entry = LogEntry::get_part("r1", "20240101_20240101_1_1_0");
        let text = entry.format();
        assert_eq!(
            text,
            "format version: 1\nsource replica: r1\nget\n20240101_20240101_1_1_0\n\n"
        );
        assert_eq!(LogEntry::parse(&text).unwrap(), entry);
    }

    #[test]
    fn merge_entry_roundtrip() {
        let entry = LogEntry::merge_parts(
            "replica-2",
            vec![
                "20240101_20240101_1_1_0".to_string(),
                "20240101_20240101_2_2_0".to_string(),
                "20240101_20240101_3_3_0".to_string(),
            ],
            "20240101_20240101_1_3_1",
        );
        let parsed = LogEntry::parse(&entry.format()).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(parsed.new_part_name(), "20240101_20240101_1_3_1");
    }

    #[test]
    fn parse_rejects_malformed_records() {
        assert!(LogEntry::parse("").is_err());
        assert!(LogEntry::parse("format version: 2\nsource replica: r1\nget\np\n\n").is_err());
        assert!(LogEntry::parse("format version: 1\nsource replica: r1\nsplit\np\n\n").is_err());
        // Merge without inputs.
        assert!(LogEntry::parse("format version: 1\nsource replica: r1\nmerge\ninto\np\n\n").is_err());
        // Truncated merge list.
        assert!(LogEntry::parse("format version: 1\nsource replica: r1\nmerge\np1\n").is_err());
    }
}
