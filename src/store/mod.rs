//! Graph store seam and the connection manager that owns it.
//!
//! A [`GraphStore`] applies one [`MutationSet`] atomically. The
//! [`StoreConnectionManager`] wraps it with a bounded session pool, retries
//! transient failures with backoff and publishes its connectivity through a
//! [`ConnectionState`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{watch, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};

use crate::{
    connection::{ConnState, ConnectionState},
    error::SyncError,
    mutation::{MutationSet, NodeKind},
    paths::PATH_SEPARATOR,
    retry::RetryPolicy,
};

pub mod memory;
#[cfg(feature = "service")]
pub mod sqlite;

pub use memory::MemoryGraphStore;
#[cfg(feature = "service")]
pub use sqlite::SqliteGraphStore;

/// A node of the mirrored namespace, keyed by its full path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceNode {
    pub path: String,
    pub name: String,
    pub kind: NodeKind,
    pub node_type: String,
    pub depth: usize,
    pub created_at: i64,
    pub updated_at: i64,
    pub value: Option<Value>,
    pub value_timestamp: Option<i64>,
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HierarchyEdge {
    pub parent: String,
    pub child: String,
}

/// What applying one mutation set changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub nodes_created: usize,
    pub edges_created: usize,
    pub leaf_written: bool,
    /// The leaf upsert lost to a newer stored value.
    pub stale: bool,
}

#[async_trait]
pub trait GraphStore: Send + Sync + 'static {
    /// Verify that the store is reachable and the credentials are accepted.
    async fn connect(&self) -> Result<(), SyncError>;

    /// Apply every mutation of the set or none of them.
    async fn apply(&self, set: &MutationSet) -> Result<ApplyReport, SyncError>;

    async fn node(&self, path: &str) -> Result<Option<NamespaceNode>, SyncError>;

    async fn parent_of(&self, path: &str) -> Result<Option<String>, SyncError>;

    /// `(nodes, edges)`
    async fn counts(&self) -> Result<(usize, usize), SyncError>;

    /// Every way the stored hierarchy deviates from a forest of namespace trees.
    async fn tree_violations(&self) -> Result<Vec<String>, SyncError>;

    async fn close(&self);
}

/// Check the stored hierarchy: depth-1 nodes have no parent, every deeper
/// node has exactly one parent and that parent is its path prefix.
pub fn tree_violations<'a, N, E>(nodes: N, edges: E) -> Vec<String>
where
    N: IntoIterator<Item = (&'a str, usize)>,
    E: IntoIterator<Item = &'a HierarchyEdge>,
{
    let depths: BTreeMap<&str, usize> = nodes.into_iter().collect();
    let mut parents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut violations = Vec::new();

    for edge in edges {
        if !depths.contains_key(edge.parent.as_str()) {
            violations.push(format!("edge {} -> {}: parent missing", edge.parent, edge.child));
        }
        if !depths.contains_key(edge.child.as_str()) {
            violations.push(format!("edge {} -> {}: child missing", edge.parent, edge.child));
        }
        parents
            .entry(edge.child.as_str())
            .or_default()
            .insert(edge.parent.as_str());
    }

    for (path, depth) in depths.iter() {
        let found = parents.get(path);
        match (*depth, found) {
            (1, None) => {}
            (1, Some(p)) => violations.push(format!("root {path} has parents {p:?}")),
            (_, None) => violations.push(format!("{path} has no parent")),
            (_, Some(p)) if p.len() > 1 => {
                violations.push(format!("{path} has {} parents {p:?}", p.len()))
            }
            (_, Some(p)) => {
                let expected = path.rsplit_once(PATH_SEPARATOR).map(|(prefix, _)| prefix);
                if p.first().copied() != expected {
                    violations.push(format!("{path} is attached to {p:?}"));
                }
            }
        }
    }
    violations
}

/// Held for the duration of one transactional unit of work.
#[derive(Debug)]
pub struct Session {
    _permit: OwnedSemaphorePermit,
}

/// Bounds the number of concurrent store sessions.
#[derive(Debug, Clone)]
pub struct SessionPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl SessionPool {
    pub fn new(size: usize) -> SessionPool {
        let size = size.max(1);
        SessionPool {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub async fn acquire(&self, timeout: Duration) -> Result<Session, SyncError> {
        match tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(Session { _permit: permit }),
            Ok(Err(_closed)) => Err(SyncError::Cancelled),
            Err(_elapsed) => Err(SyncError::PoolExhausted(format!(
                "no store session free within {timeout:?} ({} in use)",
                self.in_use()
            ))),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn in_use(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    /// Wait for outstanding sessions to be released, then refuse new ones.
    /// Returns false if sessions were still held when `timeout` elapsed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let all = self.permits.acquire_many(self.size as u32);
        let drained = matches!(tokio::time::timeout(timeout, all).await, Ok(Ok(_)));
        self.permits.close();
        drained
    }
}

pub struct StoreConnectionManager {
    store: Arc<dyn GraphStore>,
    sessions: SessionPool,
    policy: RetryPolicy,
    acquire_timeout: Duration,
    state: ConnectionState,
}

impl StoreConnectionManager {
    pub fn new(
        store: Arc<dyn GraphStore>,
        policy: RetryPolicy,
        pool_size: usize,
        acquire_timeout: Duration,
    ) -> StoreConnectionManager {
        StoreConnectionManager {
            store,
            sessions: SessionPool::new(pool_size),
            policy,
            acquire_timeout,
            state: ConnectionState::new("StoreConnectionManager"),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn sessions(&self) -> &SessionPool {
        &self.sessions
    }

    /// Connect with retry. Authentication failures are returned immediately.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.state.set(ConnState::Connecting);
        let mut backoff = self.policy.backoff();
        loop {
            match self.store.connect().await {
                Ok(()) => {
                    self.state.set(ConnState::Connected);
                    tracing::info!("[StoreConnectionManager] connected");
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    self.state.set(ConnState::Disconnected);
                    tracing::error!("[StoreConnectionManager] cannot connect: {e}");
                    return Err(e);
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        self.state.set(ConnState::Reconnecting);
                        tracing::warn!(
                            "[StoreConnectionManager] connect attempt {} failed: {e}. Retrying in {delay:?}",
                            backoff.attempts()
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        self.state.set(ConnState::Disconnected);
                        tracing::error!(
                            "[StoreConnectionManager] giving up after {} connect attempts: {e}",
                            backoff.attempts()
                        );
                        return Err(SyncError::ConnectionLost {
                            attempts: backoff.attempts(),
                            last_error: e.to_string(),
                        });
                    }
                },
            }
        }
    }

    /// Apply `set` as one transaction, retrying transient failures with
    /// backoff. Returns `ConnectionLost` once the retry budget is spent.
    pub async fn execute_transactional(&self, set: &MutationSet) -> Result<ApplyReport, SyncError> {
        let mut backoff = self.policy.backoff();
        loop {
            let attempt = async {
                let _session = self.sessions.acquire(self.acquire_timeout).await?;
                self.store.apply(set).await
            }
            .await;

            let err = match attempt {
                Ok(report) => {
                    if !self.state.is_connected() {
                        tracing::info!("[StoreConnectionManager] store reachable again");
                    }
                    self.state.set(ConnState::Connected);
                    return Ok(report);
                }
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            match backoff.next_delay() {
                Some(delay) => {
                    if !matches!(err, SyncError::PoolExhausted(_)) {
                        self.state.set(ConnState::Reconnecting);
                    }
                    tracing::warn!(
                        "[StoreConnectionManager] '{}' attempt {} failed: {err}. Retrying in {delay:?}",
                        set.path,
                        backoff.attempts()
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    self.state.set(ConnState::Disconnected);
                    tracing::error!(
                        "[StoreConnectionManager] '{}' failed after {} attempts: {err}",
                        set.path,
                        backoff.attempts()
                    );
                    return Err(SyncError::ConnectionLost {
                        attempts: backoff.attempts(),
                        last_error: err.to_string(),
                    });
                }
            }
        }
    }

    /// One connectivity check. Updates the state either way.
    pub async fn probe(&self) -> Result<(), SyncError> {
        match self.store.connect().await {
            Ok(()) => {
                if !self.state.is_connected() {
                    tracing::info!("[StoreConnectionManager] reconnected");
                }
                self.state.set(ConnState::Connected);
                Ok(())
            }
            Err(e) => {
                let next = match self.state.get() {
                    ConnState::Connected => ConnState::Reconnecting,
                    other => other,
                };
                self.state.set(next);
                tracing::debug!("[StoreConnectionManager] probe failed: {e}");
                Err(e)
            }
        }
    }

    /// Probe the store every `interval` while it is not connected, until
    /// `shutdown` flips to true.
    pub fn spawn_liveness_probe(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        let current = manager.state.get();
                        if matches!(current, ConnState::Disconnected | ConnState::Reconnecting) {
                            let _ = manager.probe().await;
                        }
                    }
                }
            }
            tracing::debug!("[StoreConnectionManager] liveness probe stopped");
        })
    }

    /// Wait for in-flight sessions, then close the store.
    pub async fn stop(&self, timeout: Duration) {
        self.state.set(ConnState::Disconnecting);
        if !self.sessions.drain(timeout).await {
            tracing::warn!(
                "[StoreConnectionManager] {} sessions still active after {timeout:?}",
                self.sessions.in_use()
            );
        }
        self.store.close().await;
        self.state.set(ConnState::Disconnected);
        tracing::info!("[StoreConnectionManager] stopped");
    }
}
