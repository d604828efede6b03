//! Typed facade over the coordination service.
//!
//! The coordination service is a hierarchical key/value store with ephemeral
//! and sequential nodes, atomic multi-operations and one-shot change watches.
//! Everything in strata_store consumes it through the `Coordinator` trait so
//! that backends can be swapped without touching the replication core.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

/// Node creation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Persistent node whose final path gets a 10-digit monotonic suffix
    /// assigned by the service.
    PersistentSequential,
    /// Removed automatically when the owning session ends.
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Node metadata returned alongside reads.
///
/// `czxid` is the creation transaction id: a globally monotonic value
/// assigned by the service, comparable across nodes. The replication queue
/// relies on it for cross-replica log ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub czxid: i64,
    pub version: i64,
}

/// Error codes surfaced by the facade.
///
/// Callers distinguish outcomes by code: `NodeExists` doubles as a predicate
/// during replica activation, `NoNode` during queue acknowledgement, and
/// `ConnectionLoss` marks transient failures worth retrying on the next pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordErrorKind {
    NoNode,
    NodeExists,
    BadVersion,
    NotEmpty,
    NoChildrenForEphemerals,
    BadArguments,
    SessionExpired,
    ConnectionLoss,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("coordination error {kind:?} for {path}")]
pub struct CoordError {
    pub kind: CoordErrorKind,
    pub path: String,
}

impl CoordError {
    pub fn new(kind: CoordErrorKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    pub fn kind(&self) -> CoordErrorKind {
        self.kind
    }

    /// True for failures that a periodic loop should simply retry.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, CoordErrorKind::ConnectionLoss)
    }
}

/// One operation inside an atomic `multi`.
#[derive(Debug, Clone)]
pub enum Op {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    Set {
        path: String,
        data: Vec<u8>,
    },
    Remove {
        path: String,
    },
}

impl Op {
    pub fn create(path: impl Into<String>, data: impl Into<Vec<u8>>, mode: CreateMode) -> Self {
        Op::Create {
            path: path.into(),
            data: data.into(),
            mode,
        }
    }

    pub fn set(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Op::Set {
            path: path.into(),
            data: data.into(),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Op::Remove { path: path.into() }
    }
}

/// Per-operation result of a successful `multi`.
#[derive(Debug, Clone)]
pub enum OpResult {
    /// Carries the final path, which differs from the requested one for
    /// sequential creates.
    Created { path: String },
    Set,
    Removed,
}

impl OpResult {
    /// Final path of a `Created` result; panics on other variants, which is
    /// a programming error at the call site.
    pub fn created_path(&self) -> &str {
        match self {
            OpResult::Created { path } => path,
            other => panic!("expected Created result, got {other:?}"),
        }
    }
}

/// Event delivered by a one-shot watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Created,
    Deleted,
    DataChanged,
}

/// One-shot watch on a single path. Armed at registration, fires on the next
/// event touching that exact path.
pub struct Watch {
    rx: oneshot::Receiver<WatchEvent>,
}

impl Watch {
    pub fn new(rx: oneshot::Receiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the event. Returns `None` when the backend went away before
    /// anything happened, which callers treat as a cue to re-check state.
    pub async fn wait(self) -> Option<WatchEvent> {
        self.rx.await.ok()
    }
}

/// Client interface to the coordination service.
///
/// Implementations are session-scoped: ephemeral nodes created through a
/// handle belong to that handle's session and disappear with it.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Create a node. Returns the final path (relevant for sequential modes).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode)
        -> Result<String, CoordError>;

    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat), CoordError>;

    async fn set(&self, path: &str, data: &[u8]) -> Result<Stat, CoordError>;

    async fn exists(&self, path: &str) -> Result<bool, CoordError>;

    /// Direct child names (not full paths), sorted.
    async fn get_children(&self, path: &str) -> Result<Vec<String>, CoordError>;

    async fn remove(&self, path: &str) -> Result<(), CoordError>;

    async fn remove_recursive(&self, path: &str) -> Result<(), CoordError>;

    /// Apply all operations atomically; the first failing operation aborts
    /// the whole batch with no partial effects.
    async fn multi(&self, ops: Vec<Op>) -> Result<Vec<OpResult>, CoordError>;

    /// Register a one-shot watch on `path`. The node does not have to exist.
    async fn watch(&self, path: &str) -> Result<Watch, CoordError>;

    /// Non-throwing read: `Ok(None)` when the node is absent.
    async fn try_get(&self, path: &str) -> Result<Option<(Vec<u8>, Stat)>, CoordError> {
        match self.get(path).await {
            Ok(found) => Ok(Some(found)),
            Err(err) if err.kind() == CoordErrorKind::NoNode => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Non-throwing remove: `Ok(false)` when the node was already gone.
    async fn try_remove(&self, path: &str) -> Result<bool, CoordError> {
        match self.remove(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == CoordErrorKind::NoNode => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Create every missing ancestor of `path` as an empty persistent node.
/// Tolerates concurrent creation.
pub async fn create_ancestors(
    coord: &dyn Coordinator,
    path: &str,
) -> Result<(), CoordError> {
    let mut prefix = String::new();
    let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        prefix.push('/');
        prefix.push_str(component);
        match coord.create(&prefix, b"", CreateMode::Persistent).await {
            Ok(_) => {}
            Err(err) if err.kind() == CoordErrorKind::NodeExists => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Owned handle to an ephemeral node.
///
/// Release is explicit on the shutdown path; dropping the holder without
/// releasing removes the node best-effort from a spawned task.
pub struct EphemeralNode {
    coord: Arc<dyn Coordinator>,
    path: String,
    released: bool,
}

impl EphemeralNode {
    /// Wrap an ephemeral node that was already created (for example inside a
    /// multi-op).
    pub fn existing(coord: Arc<dyn Coordinator>, path: impl Into<String>) -> Self {
        Self {
            coord,
            path: path.into(),
            released: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Err(err) = self.coord.try_remove(&self.path).await {
            tracing::warn!(path = %self.path, error = %err, "failed to release ephemeral node");
        }
    }
}

impl Drop for EphemeralNode {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let coord = Arc::clone(&self.coord);
        let path = self.path.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = coord.try_remove(&path).await;
            });
        }
    }
}
