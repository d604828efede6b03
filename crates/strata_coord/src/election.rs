//! Leader election over ephemeral-sequential nodes.
//!
//! Each participant creates one ephemeral-sequential child under the
//! election path; the smallest suffix is the leader. Non-leaders watch their
//! predecessor only, so a leader change wakes exactly one participant.
//! Leadership is exposed as an observable flag: consumers poll
//! [`LeaderElection::is_leader`] between work passes and stop when it clears.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::client::{Coordinator, CoordError, CoordErrorKind, CreateMode};

const ELECTION_RETRY_SLEEP: Duration = Duration::from_secs(1);

type LeaderCallback = Box<dyn Fn() + Send + Sync>;

struct ElectionInner {
    coord: Arc<dyn Coordinator>,
    path: String,
    node_path: String,
    node_name: String,
    is_leader: Arc<AtomicBool>,
    shutdown: AtomicBool,
    notify: Notify,
}

pub struct LeaderElection {
    inner: Arc<ElectionInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElection {
    /// Join the election at `path`, carrying `identifier` in the node data
    /// for observability. `on_leader` is invoked once per acquisition, from
    /// the election task. `is_leader` is the caller-shared leadership flag:
    /// it is raised before the callback runs and cleared on leadership loss
    /// or shutdown, so consumers started by the callback can poll it.
    pub async fn start(
        coord: Arc<dyn Coordinator>,
        path: &str,
        identifier: &str,
        is_leader: Arc<AtomicBool>,
        on_leader: LeaderCallback,
    ) -> Result<Arc<Self>, CoordError> {
        let node_path = coord
            .create(
                &format!("{path}/leader_election-"),
                identifier.as_bytes(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        let node_name = node_path
            .rsplit('/')
            .next()
            .expect("created path has a final component")
            .to_string();

        is_leader.store(false, Ordering::Release);
        let inner = Arc::new(ElectionInner {
            coord,
            path: path.to_string(),
            node_path,
            node_name,
            is_leader,
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        });

        let task = tokio::spawn(run(Arc::clone(&inner), on_leader));
        Ok(Arc::new(Self {
            inner,
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader.load(Ordering::Acquire)
    }

    /// Leave the election: removes the ephemeral node and clears the flag.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.is_leader.store(false, Ordering::Release);
        if let Err(err) = self.inner.coord.try_remove(&self.inner.node_path).await {
            tracing::warn!(path = %self.inner.node_path, error = %err, "failed to remove election node");
        }
    }
}

async fn run(inner: Arc<ElectionInner>, on_leader: LeaderCallback) {
    let mut announced = false;
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        let children = match inner.coord.get_children(&inner.path).await {
            Ok(mut children) => {
                children.sort();
                children
            }
            Err(err) if err.kind() == CoordErrorKind::SessionExpired => {
                inner.is_leader.store(false, Ordering::Release);
                break;
            }
            Err(err) => {
                tracing::warn!(path = %inner.path, error = %err, "election listing failed");
                tokio::time::sleep(ELECTION_RETRY_SLEEP).await;
                continue;
            }
        };

        // Fixed-width sequence suffixes make lexicographic order the
        // acquisition order.
        let Some(position) = children.iter().position(|name| *name == inner.node_name) else {
            // Our node is gone, so the session is too.
            inner.is_leader.store(false, Ordering::Release);
            break;
        };

        let watched = if position == 0 {
            if !announced {
                announced = true;
                inner.is_leader.store(true, Ordering::Release);
                tracing::info!(path = %inner.path, "became leader");
                on_leader();
            }
            inner.node_path.clone()
        } else {
            format!("{}/{}", inner.path, children[position - 1])
        };

        let watch = match inner.coord.watch(&watched).await {
            Ok(watch) => watch,
            Err(_) => continue,
        };
        match inner.coord.exists(&watched).await {
            Ok(true) => {}
            // Already gone between listing and watch registration: re-list.
            Ok(false) => continue,
            Err(_) => continue,
        }

        tokio::select! {
            _ = watch.wait() => {}
            _ = inner.notify.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordinator;

    async fn wait_until(what: impl Fn() -> bool) {
        for _ in 0..200 {
            if what() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn first_participant_leads_and_failover_promotes_next() {
        let coord = MemoryCoordinator::new();
        let bootstrap = coord.session();
        bootstrap
            .create("/table", b"", CreateMode::Persistent)
            .await
            .unwrap();
        bootstrap
            .create("/table/leader_election", b"", CreateMode::Persistent)
            .await
            .unwrap();

        let session_a = coord.session();
        let session_b = coord.session();

        let fired_a = Arc::new(AtomicBool::new(false));
        let fired_a2 = Arc::clone(&fired_a);
        let election_a = LeaderElection::start(
            session_a.clone(),
            "/table/leader_election",
            "r1",
            Arc::new(AtomicBool::new(false)),
            Box::new(move || fired_a2.store(true, Ordering::Release)),
        )
        .await
        .unwrap();

        let fired_b = Arc::new(AtomicBool::new(false));
        let fired_b2 = Arc::clone(&fired_b);
        let election_b = LeaderElection::start(
            session_b.clone(),
            "/table/leader_election",
            "r2",
            Arc::new(AtomicBool::new(false)),
            Box::new(move || fired_b2.store(true, Ordering::Release)),
        )
        .await
        .unwrap();

        let fired = Arc::clone(&fired_a);
        wait_until(move || fired.load(Ordering::Acquire)).await;
        assert!(election_a.is_leader());
        assert!(!election_b.is_leader());

        // Simulate the leader process dying.
        session_a.expire();

        let fired = Arc::clone(&fired_b);
        wait_until(move || fired.load(Ordering::Acquire)).await;
        assert!(election_b.is_leader());

        election_b.shutdown().await;
        assert!(!election_b.is_leader());
    }
}
