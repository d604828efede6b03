//! Error codes surfaced by the replication core.
//!
//! Loops inside the engine catch, log and retry; these typed codes exist for
//! the conditions callers genuinely branch on. They travel inside `anyhow`
//! chains and are recovered with `downcast_ref` where the distinction
//! matters (the worker demotes `NoReplicaHasPart` to an INFO-level event).

#[derive(Debug, Clone, thiserror::Error)]
pub enum TableError {
    #[error("cannot add a replica to a non-empty table")]
    AddingReplicaToNonEmptyTable,

    #[error(
        "replica {0} appears to be already active; if you are sure it is not, \
         retry in a minute or remove its is_active node manually"
    )]
    ReplicaAlreadyActive(String),

    #[error("{count} expected data parts are missing locally (including {example})")]
    NotFoundExpectedDataPart { count: usize, example: String },

    #[error("{count} unexpected local data parts (including {example})")]
    TooManyUnexpectedDataParts { count: usize, example: String },

    #[error("no active replica has part {0}")]
    NoReplicaHasPart(String),

    #[error("table structure differs from the registered metadata: {0}")]
    SchemaMismatch(String),
}
