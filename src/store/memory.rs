use async_trait::async_trait;
use parking_lot::Mutex;
use petgraph::{graph::NodeIndex, visit::EdgeRef, Direction, Graph};
use serde_json::Map;
use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicBool, Ordering},
};

use super::{ApplyReport, GraphStore, HierarchyEdge, NamespaceNode};
use crate::{
    error::SyncError,
    mutation::{GraphMutation, MutationSet, NodeKind},
};

#[derive(Debug, Default)]
struct NamespaceGraph {
    graph: Graph<NamespaceNode, ()>,
    index: HashMap<String, NodeIndex>,
}

impl NamespaceGraph {
    fn parent_of(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .next()
            .map(|edge| edge.source())
    }

    /// Reject the set up front so that applying it cannot fail halfway.
    fn validate(&self, set: &MutationSet) -> Result<(), SyncError> {
        let mut pending: HashSet<&str> = HashSet::new();
        let mut pending_edges: HashMap<&str, &str> = HashMap::new();
        for mutation in set.iter() {
            match mutation {
                GraphMutation::UpsertNode { path, .. } | GraphMutation::UpsertLeaf { path, .. } => {
                    pending.insert(path.as_str());
                }
                GraphMutation::UpsertEdge { parent, child } => {
                    for end in [parent, child] {
                        if !pending.contains(end.as_str()) && !self.index.contains_key(end) {
                            return Err(SyncError::Store(format!(
                                "edge {parent} -> {child} references unknown node {end}"
                            )));
                        }
                    }
                    let existing = self
                        .index
                        .get(child)
                        .and_then(|idx| self.parent_of(*idx))
                        .map(|idx| self.graph[idx].path.as_str())
                        .or_else(|| pending_edges.get(child.as_str()).copied());
                    if let Some(existing) = existing {
                        if existing != parent.as_str() {
                            return Err(SyncError::Store(format!(
                                "{child} already has parent {existing}, refusing {parent}"
                            )));
                        }
                    }
                    pending_edges.insert(child.as_str(), parent.as_str());
                }
            }
        }
        Ok(())
    }

    fn upsert(&mut self, mutation: &GraphMutation, report: &mut ApplyReport) {
        match mutation {
            GraphMutation::UpsertNode {
                path,
                name,
                node_type,
                depth,
                at,
            } => {
                if self.index.contains_key(path) {
                    return;
                }
                let idx = self.graph.add_node(NamespaceNode {
                    path: path.clone(),
                    name: name.clone(),
                    kind: NodeKind::Structural,
                    node_type: node_type.clone(),
                    depth: *depth,
                    created_at: *at,
                    updated_at: *at,
                    value: None,
                    value_timestamp: None,
                    attributes: Map::new(),
                });
                self.index.insert(path.clone(), idx);
                report.nodes_created += 1;
            }
            GraphMutation::UpsertEdge { parent, child } => {
                let (Some(&parent_idx), Some(&child_idx)) =
                    (self.index.get(parent), self.index.get(child))
                else {
                    return;
                };
                if self.parent_of(child_idx).is_none() {
                    self.graph.add_edge(parent_idx, child_idx, ());
                    report.edges_created += 1;
                }
            }
            GraphMutation::UpsertLeaf {
                path,
                name,
                node_type,
                depth,
                value,
                value_timestamp,
                attributes,
                at,
            } => match self.index.get(path) {
                Some(&idx) => {
                    let node = &mut self.graph[idx];
                    let newer = node
                        .value_timestamp
                        .map(|stored| stored <= *value_timestamp)
                        .unwrap_or(true);
                    if !newer {
                        report.stale = true;
                        return;
                    }
                    node.kind = NodeKind::Leaf;
                    node.value = Some(value.clone());
                    node.value_timestamp = Some(*value_timestamp);
                    node.attributes = attributes.clone();
                    node.updated_at = *at;
                    report.leaf_written = true;
                }
                None => {
                    let idx = self.graph.add_node(NamespaceNode {
                        path: path.clone(),
                        name: name.clone(),
                        kind: NodeKind::Leaf,
                        node_type: node_type.clone(),
                        depth: *depth,
                        created_at: *at,
                        updated_at: *at,
                        value: Some(value.clone()),
                        value_timestamp: Some(*value_timestamp),
                        attributes: attributes.clone(),
                    });
                    self.index.insert(path.clone(), idx);
                    report.nodes_created += 1;
                    report.leaf_written = true;
                }
            },
        }
    }

    fn edges(&self) -> Vec<HierarchyEdge> {
        self.graph
            .edge_references()
            .map(|edge| HierarchyEdge {
                parent: self.graph[edge.source()].path.clone(),
                child: self.graph[edge.target()].path.clone(),
            })
            .collect()
    }
}

/// In-process graph store. Each mutation set is validated in full before any
/// of it is applied, so a rejected set leaves no trace.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    inner: Mutex<NamespaceGraph>,
    closed: AtomicBool,
}

impl MemoryGraphStore {
    pub fn new() -> MemoryGraphStore {
        MemoryGraphStore::default()
    }

    /// Every stored path, sorted.
    pub fn paths(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut paths = inner.index.keys().cloned().collect::<Vec<_>>();
        paths.sort();
        paths
    }

    pub fn edges(&self) -> Vec<HierarchyEdge> {
        let mut edges = self.inner.lock().edges();
        edges.sort();
        edges
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn connect(&self) -> Result<(), SyncError> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    #[tracing::instrument(skip(self, set), fields(path = %set.path))]
    async fn apply(&self, set: &MutationSet) -> Result<ApplyReport, SyncError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::TransientStore("store is closed".to_string()));
        }
        let mut inner = self.inner.lock();
        inner.validate(set)?;
        let mut report = ApplyReport::default();
        for mutation in set.iter() {
            tracing::debug!("{mutation}");
            inner.upsert(mutation, &mut report);
        }
        Ok(report)
    }

    async fn node(&self, path: &str) -> Result<Option<NamespaceNode>, SyncError> {
        let inner = self.inner.lock();
        Ok(inner.index.get(path).map(|idx| inner.graph[*idx].clone()))
    }

    async fn parent_of(&self, path: &str) -> Result<Option<String>, SyncError> {
        let inner = self.inner.lock();
        Ok(inner
            .index
            .get(path)
            .and_then(|idx| inner.parent_of(*idx))
            .map(|idx| inner.graph[idx].path.clone()))
    }

    async fn counts(&self) -> Result<(usize, usize), SyncError> {
        let inner = self.inner.lock();
        Ok((inner.graph.node_count(), inner.graph.edge_count()))
    }

    async fn tree_violations(&self) -> Result<Vec<String>, SyncError> {
        let inner = self.inner.lock();
        let edges = inner.edges();
        let nodes = inner
            .graph
            .node_weights()
            .map(|node| (node.path.as_str(), node.depth));
        Ok(super::tree_violations(nodes, edges.iter()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mutation::MutationBuilder, paths::NamespacePath, payload::Payload};
    use serde_json::json;
    use std::str::FromStr;

    fn leaf_set(path: &str, value: serde_json::Value, ts: i64) -> MutationSet {
        let payload = Payload {
            value,
            timestamp: ts,
            attributes: Map::new(),
        };
        MutationBuilder::default().build(&NamespacePath::from_str(path).unwrap(), Some(&payload), ts)
    }

    #[tokio::test]
    async fn test_rejected_set_leaves_no_trace() {
        let store = MemoryGraphStore::new();
        let set = MutationSet {
            path: "a/b".to_string(),
            mutations: vec![
                GraphMutation::UpsertNode {
                    path: "a/b".to_string(),
                    name: "b".to_string(),
                    node_type: "FACILITY".to_string(),
                    depth: 2,
                    at: 0,
                },
                GraphMutation::UpsertEdge {
                    parent: "a".to_string(),
                    child: "a/b".to_string(),
                },
            ],
        };
        assert!(matches!(store.apply(&set).await, Err(SyncError::Store(_))));
        assert_eq!(store.counts().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_leaf_upgrade_and_structural_never_downgrades() {
        let store = MemoryGraphStore::new();
        store.apply(&leaf_set("a/b", json!(1), 10)).await.unwrap();
        let structural =
            MutationBuilder::default().build(&NamespacePath::from_str("a/b").unwrap(), None, 20);
        let report = store.apply(&structural).await.unwrap();
        assert_eq!(report, ApplyReport::default());

        let node = store.node("a/b").await.unwrap().unwrap();
        assert_eq!(node.kind, NodeKind::Leaf);
        assert_eq!(node.value, Some(json!(1)));
        assert_eq!(store.parent_of("a/b").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.parent_of("a").await.unwrap(), None);
        assert!(store.tree_violations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_store_is_transient() {
        let store = MemoryGraphStore::new();
        store.close().await;
        let err = store.apply(&leaf_set("a", json!(1), 1)).await.unwrap_err();
        assert!(err.is_transient());
        store.connect().await.unwrap();
        assert!(store.apply(&leaf_set("a", json!(1), 1)).await.is_ok());
    }
}
