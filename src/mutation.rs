use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use crate::{error::SyncError, paths::NamespacePath, payload::Payload};

/// ISA-95 style labels for the first namespace levels.
pub const DEFAULT_NODE_TYPES: [&str; 5] = ["ENTERPRISE", "FACILITY", "AREA", "LINE", "DEVICE"];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Exists only as an ancestor position in the hierarchy.
    #[default]
    Structural,
    /// Has received at least one value-bearing message.
    Leaf,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Structural => "structural",
            NodeKind::Leaf => "leaf",
        }
    }
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "structural" => Ok(NodeKind::Structural),
            "leaf" => Ok(NodeKind::Leaf),
            other => Err(SyncError::Serialization(format!(
                "unknown node kind '{other}'"
            ))),
        }
    }
}

/// A single idempotent write against the graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GraphMutation {
    /// Create a structural node unless a node with this path already exists.
    /// Never changes an existing node.
    UpsertNode {
        path: String,
        name: String,
        node_type: String,
        depth: usize,
        /// Message arrival time, epoch ms
        at: i64,
    },
    /// Create the parent -> child hierarchy edge unless it already exists.
    UpsertEdge { parent: String, child: String },
    /// Create or update the node as a leaf holding `value`. Skipped when the
    /// stored value carries a newer `value_timestamp` (last-write-wins).
    UpsertLeaf {
        path: String,
        name: String,
        node_type: String,
        depth: usize,
        value: Value,
        value_timestamp: i64,
        attributes: Map<String, Value>,
        at: i64,
    },
}

impl GraphMutation {
    /// The node path this mutation writes. For edges, the child.
    pub fn path(&self) -> &str {
        match self {
            GraphMutation::UpsertNode { path, .. } => path,
            GraphMutation::UpsertEdge { child, .. } => child,
            GraphMutation::UpsertLeaf { path, .. } => path,
        }
    }
}

impl Display for GraphMutation {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            GraphMutation::UpsertNode { path, .. } => write!(f, "UpsertNode({path})"),
            GraphMutation::UpsertEdge { parent, child } => {
                write!(f, "UpsertEdge({parent} -> {child})")
            }
            GraphMutation::UpsertLeaf {
                path,
                value_timestamp,
                ..
            } => write!(f, "UpsertLeaf({path}@{value_timestamp})"),
        }
    }
}

/// The ordered mutations derived from one message. Nodes always precede the
/// edges that reference them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationSet {
    pub path: String,
    pub mutations: Vec<GraphMutation>,
}

impl MutationSet {
    pub fn iter(&self) -> impl Iterator<Item = &GraphMutation> {
        self.mutations.iter()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn leaf(&self) -> Option<&GraphMutation> {
        self.mutations
            .iter()
            .find(|m| matches!(m, GraphMutation::UpsertLeaf { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationBuilder {
    node_types: Vec<String>,
}

impl Default for MutationBuilder {
    fn default() -> Self {
        MutationBuilder::new(DEFAULT_NODE_TYPES.iter().map(|t| t.to_string()).collect())
    }
}

impl MutationBuilder {
    pub fn new(node_types: Vec<String>) -> MutationBuilder {
        if node_types.is_empty() {
            return MutationBuilder::default();
        }
        MutationBuilder { node_types }
    }

    /// Label for the node at zero-based `level`. Levels past the configured
    /// labels reuse the last one with a depth suffix: `DEVICE_depth_2`.
    pub fn node_type(&self, level: usize) -> String {
        match self.node_types.get(level) {
            Some(node_type) => node_type.clone(),
            None => {
                let last = &self.node_types[self.node_types.len() - 1];
                format!("{last}_depth_{}", level + 1 - self.node_types.len())
            }
        }
    }

    /// Build the mutation set for one message.
    ///
    /// Every ancestor prefix gets a structural node upsert followed by the edge
    /// from its parent. The path itself becomes a leaf upsert when a payload is
    /// present and a structural upsert otherwise. Pure: nothing is executed.
    pub fn build(&self, path: &NamespacePath, payload: Option<&Payload>, at: i64) -> MutationSet {
        let mut mutations = Vec::with_capacity(path.depth() * 2);
        for level in 0..path.depth() {
            let depth = level + 1;
            let node_path = path.prefix(depth);
            let name = path.segments()[level].clone();
            let node_type = self.node_type(level);
            let is_target = depth == path.depth();

            match payload {
                Some(payload) if is_target => mutations.push(GraphMutation::UpsertLeaf {
                    path: node_path.clone(),
                    name,
                    node_type,
                    depth,
                    value: payload.value.clone(),
                    value_timestamp: payload.timestamp,
                    attributes: payload.attributes.clone(),
                    at,
                }),
                _ => mutations.push(GraphMutation::UpsertNode {
                    path: node_path.clone(),
                    name,
                    node_type,
                    depth,
                    at,
                }),
            }

            if level > 0 {
                mutations.push(GraphMutation::UpsertEdge {
                    parent: path.prefix(level),
                    child: node_path,
                });
            }
        }
        MutationSet {
            path: path.to_string(),
            mutations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_type_per_depth() {
        let builder = MutationBuilder::default();
        let expected = [
            (0, "ENTERPRISE"),
            (1, "FACILITY"),
            (2, "AREA"),
            (3, "LINE"),
            (4, "DEVICE"),
            (5, "DEVICE_depth_1"),
            (6, "DEVICE_depth_2"),
            (9, "DEVICE_depth_5"),
        ];
        for (level, node_type) in expected {
            assert_eq!(builder.node_type(level), node_type);
        }
    }

    #[test]
    fn test_build_leaf_set() {
        let builder = MutationBuilder::default();
        let path = NamespacePath::from_str("site1/line1/tempSensor").unwrap();
        let payload = Payload {
            value: json!(72.5),
            timestamp: 100,
            attributes: Map::new(),
        };
        let set = builder.build(&path, Some(&payload), 1_000);

        let rendered = set.iter().map(|m| m.to_string()).collect::<Vec<_>>();
        assert_eq!(
            rendered,
            vec![
                "UpsertNode(site1)",
                "UpsertNode(site1/line1)",
                "UpsertEdge(site1 -> site1/line1)",
                "UpsertLeaf(site1/line1/tempSensor@100)",
                "UpsertEdge(site1/line1 -> site1/line1/tempSensor)",
            ]
        );
        assert_eq!(set.leaf().map(|m| m.path()), Some("site1/line1/tempSensor"));
    }

    #[test]
    fn test_build_structural_set() {
        let builder = MutationBuilder::default();
        let path = NamespacePath::from_str("site1/line1").unwrap();
        let set = builder.build(&path, None, 1_000);
        assert_eq!(set.len(), 3);
        assert!(set.leaf().is_none());
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = MutationBuilder::new(vec!["SITE".to_string()]);
        let path = NamespacePath::from_str("a/b/c").unwrap();
        assert_eq!(builder.build(&path, None, 5), builder.build(&path, None, 5));
        match &builder.build(&path, None, 5).mutations[3] {
            GraphMutation::UpsertNode { node_type, .. } => assert_eq!(node_type, "SITE_depth_2"),
            other => panic!("unexpected mutation {other}"),
        }
    }
}
