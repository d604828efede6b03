//! In-process coordination service.
//!
//! `MemoryCoordinator` implements the same node semantics the facade expects
//! from a real deployment: a hierarchical namespace, session-owned ephemeral
//! nodes, 10-digit sequential suffixes with a per-parent counter, a globally
//! monotonic creation transaction id, atomic multi-operations and one-shot
//! watches. It backs the integration tests and embedded single-process
//! setups; a networked backend would implement `Coordinator` the same way.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::client::{
    Coordinator, CoordError, CoordErrorKind, CreateMode, Op, OpResult, Stat, Watch, WatchEvent,
};

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    czxid: i64,
    version: i64,
    /// Owning session id for ephemeral nodes.
    ephemeral_owner: Option<u64>,
    /// Next sequence number handed to sequential children of this node.
    seq_counter: u64,
}

#[derive(Default)]
struct Shared {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
    expired_sessions: HashSet<u64>,
    next_zxid: i64,
    next_session: u64,
}

/// Shared in-process coordination service. Hand out per-client handles with
/// [`MemoryCoordinator::session`].
pub struct MemoryCoordinator {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Mutex::new(Shared {
                next_zxid: 1,
                ..Shared::default()
            })),
        })
    }

    /// Open a new session. Ephemeral nodes created through the returned
    /// handle live exactly as long as the session.
    pub fn session(&self) -> Arc<CoordSession> {
        let id = {
            let mut shared = self.shared.lock().unwrap();
            shared.next_session += 1;
            shared.next_session
        };
        Arc::new(CoordSession {
            shared: Arc::clone(&self.shared),
            id,
        })
    }
}

/// One client session of the in-process coordinator. Dropping the last
/// handle ends the session, like a client process exiting.
pub struct CoordSession {
    shared: Arc<Mutex<Shared>>,
    id: u64,
}

impl std::fmt::Debug for CoordSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordSession").field("id", &self.id).finish()
    }
}

impl CoordSession {
    /// Terminate the session: every ephemeral node it owns disappears and
    /// further operations fail with `SessionExpired`. Used by failover tests
    /// to simulate a replica process dying.
    pub fn expire(&self) {
        let mut fired = Vec::new();
        {
            let mut shared = self.shared.lock().unwrap();
            if !shared.expired_sessions.insert(self.id) {
                return;
            }
            let owned: Vec<String> = shared
                .nodes
                .iter()
                .filter(|(_, node)| node.ephemeral_owner == Some(self.id))
                .map(|(path, _)| path.clone())
                .collect();
            for path in owned {
                shared.nodes.remove(&path);
                fired.extend(take_watches(&mut shared, &path, WatchEvent::Deleted));
            }
        }
        deliver(fired);
    }

    pub fn is_expired(&self) -> bool {
        self.shared.lock().unwrap().expired_sessions.contains(&self.id)
    }

    fn check_alive(&self, path: &str) -> Result<(), CoordError> {
        if self.is_expired() {
            Err(CoordError::new(CoordErrorKind::SessionExpired, path))
        } else {
            Ok(())
        }
    }
}

impl Drop for CoordSession {
    fn drop(&mut self) {
        self.expire();
    }
}

fn validate_path(path: &str) -> Result<(), CoordError> {
    let bad = || CoordError::new(CoordErrorKind::BadArguments, path);
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
        return Err(bad());
    }
    if path[1..].split('/').any(|component| component.is_empty()) {
        return Err(bad());
    }
    Ok(())
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

fn has_children(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
    let prefix = child_prefix(path);
    nodes
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .next()
        .is_some()
}

fn direct_children(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
    let prefix = child_prefix(path);
    nodes
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter_map(|(key, _)| {
            let rest = &key[prefix.len()..];
            (!rest.contains('/')).then(|| rest.to_string())
        })
        .collect()
}

fn take_watches(
    shared: &mut Shared,
    path: &str,
    event: WatchEvent,
) -> Vec<(oneshot::Sender<WatchEvent>, WatchEvent)> {
    shared
        .watches
        .remove(path)
        .unwrap_or_default()
        .into_iter()
        .map(|tx| (tx, event))
        .collect()
}

fn deliver(fired: Vec<(oneshot::Sender<WatchEvent>, WatchEvent)>) {
    for (tx, event) in fired {
        let _ = tx.send(event);
    }
}

/// Apply one operation to a working copy of the tree. Events are collected
/// and only delivered once the whole batch committed.
fn apply_op(
    nodes: &mut BTreeMap<String, Node>,
    next_zxid: &mut i64,
    session: u64,
    op: &Op,
    events: &mut Vec<(String, WatchEvent)>,
) -> Result<OpResult, CoordError> {
    match op {
        Op::Create { path, data, mode } => {
            validate_path(path)?;
            let parent = parent_of(path);
            if parent != "/" {
                let parent_node = nodes
                    .get_mut(parent)
                    .ok_or_else(|| CoordError::new(CoordErrorKind::NoNode, parent))?;
                if parent_node.ephemeral_owner.is_some() {
                    return Err(CoordError::new(
                        CoordErrorKind::NoChildrenForEphemerals,
                        parent,
                    ));
                }
            }
            let final_path = if mode.is_sequential() {
                let counter = if parent == "/" {
                    // Sequential nodes directly under the root are not used
                    // by the store; keep a per-root counter anyway.
                    *next_zxid as u64
                } else {
                    let parent_node = nodes.get_mut(parent).unwrap();
                    let counter = parent_node.seq_counter;
                    parent_node.seq_counter += 1;
                    counter
                };
                format!("{path}{counter:010}")
            } else {
                path.clone()
            };
            if nodes.contains_key(&final_path) {
                return Err(CoordError::new(CoordErrorKind::NodeExists, final_path));
            }
            let czxid = *next_zxid;
            *next_zxid += 1;
            nodes.insert(
                final_path.clone(),
                Node {
                    data: data.clone(),
                    czxid,
                    version: 0,
                    ephemeral_owner: mode.is_ephemeral().then_some(session),
                    seq_counter: 0,
                },
            );
            events.push((final_path.clone(), WatchEvent::Created));
            Ok(OpResult::Created { path: final_path })
        }
        Op::Set { path, data } => {
            let node = nodes
                .get_mut(path)
                .ok_or_else(|| CoordError::new(CoordErrorKind::NoNode, path.clone()))?;
            node.data = data.clone();
            node.version += 1;
            events.push((path.clone(), WatchEvent::DataChanged));
            Ok(OpResult::Set)
        }
        Op::Remove { path } => {
            if !nodes.contains_key(path) {
                return Err(CoordError::new(CoordErrorKind::NoNode, path.clone()));
            }
            if has_children(nodes, path) {
                return Err(CoordError::new(CoordErrorKind::NotEmpty, path.clone()));
            }
            nodes.remove(path);
            events.push((path.clone(), WatchEvent::Deleted));
            Ok(OpResult::Removed)
        }
    }
}

#[async_trait]
impl Coordinator for CoordSession {
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordError> {
        self.check_alive(path)?;
        let results = self
            .multi(vec![Op::create(path, data.to_vec(), mode)])
            .await?;
        Ok(results[0].created_path().to_string())
    }

    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat), CoordError> {
        self.check_alive(path)?;
        let shared = self.shared.lock().unwrap();
        let node = shared
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::new(CoordErrorKind::NoNode, path))?;
        Ok((
            node.data.clone(),
            Stat {
                czxid: node.czxid,
                version: node.version,
            },
        ))
    }

    async fn set(&self, path: &str, data: &[u8]) -> Result<Stat, CoordError> {
        self.check_alive(path)?;
        self.multi(vec![Op::set(path, data.to_vec())]).await?;
        let (_, stat) = self.get(path).await?;
        Ok(stat)
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordError> {
        self.check_alive(path)?;
        Ok(self.shared.lock().unwrap().nodes.contains_key(path))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, CoordError> {
        self.check_alive(path)?;
        let shared = self.shared.lock().unwrap();
        if path != "/" && !shared.nodes.contains_key(path) {
            return Err(CoordError::new(CoordErrorKind::NoNode, path));
        }
        Ok(direct_children(&shared.nodes, path))
    }

    async fn remove(&self, path: &str) -> Result<(), CoordError> {
        self.check_alive(path)?;
        self.multi(vec![Op::remove(path)]).await?;
        Ok(())
    }

    async fn remove_recursive(&self, path: &str) -> Result<(), CoordError> {
        self.check_alive(path)?;
        let fired = {
            let mut shared = self.shared.lock().unwrap();
            let prefix = child_prefix(path);
            let mut doomed: Vec<String> = shared
                .nodes
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(key, _)| key.clone())
                .collect();
            if shared.nodes.contains_key(path) {
                doomed.push(path.to_string());
            }
            let mut fired = Vec::new();
            for path in doomed {
                shared.nodes.remove(&path);
                fired.extend(take_watches(&mut shared, &path, WatchEvent::Deleted));
            }
            fired
        };
        deliver(fired);
        Ok(())
    }

    async fn multi(&self, ops: Vec<Op>) -> Result<Vec<OpResult>, CoordError> {
        self.check_alive("/")?;
        let fired;
        let results;
        {
            let mut shared = self.shared.lock().unwrap();
            // Work on a copy so a mid-batch failure leaves no partial state.
            let mut nodes = shared.nodes.clone();
            let mut next_zxid = shared.next_zxid;
            let mut events = Vec::new();
            let mut out = Vec::with_capacity(ops.len());
            for op in &ops {
                out.push(apply_op(
                    &mut nodes,
                    &mut next_zxid,
                    self.id,
                    op,
                    &mut events,
                )?);
            }
            shared.nodes = nodes;
            shared.next_zxid = next_zxid;
            results = out;
            fired = events
                .into_iter()
                .flat_map(|(path, event)| take_watches(&mut shared, &path, event))
                .collect::<Vec<_>>();
        }
        deliver(fired);
        Ok(results)
    }

    async fn watch(&self, path: &str) -> Result<Watch, CoordError> {
        self.check_alive(path)?;
        let (tx, rx) = oneshot::channel();
        self.shared
            .lock()
            .unwrap()
            .watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(Watch::new(rx))
    }
}
