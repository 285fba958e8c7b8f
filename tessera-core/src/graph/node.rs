//! Graph Nodes
//!
//! This module defines the node types that live in the computation dependency
//! graph. One node exists per declared computation.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a computation in the dependency graph.
///
/// Ids are handed out by the graph in registration order, so the same schema
/// always yields the same ids. Bound state is keyed by them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a computation node writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A dictionary slot.
    Dictionary,
    /// A property on every record of an entity or relation.
    Property,
    /// The existence of entity records.
    Entity,
    /// The existence of relation rows.
    Relation,
}

/// A node in the dependency graph.
#[derive(Debug)]
pub struct Node {
    /// Unique identifier for this node.
    id: NodeId,

    /// What kind of target this node writes.
    kind: NodeKind,

    /// Human readable name, e.g. `User.friendCount`.
    label: String,

    /// Nodes whose output this node reads (parents in the DAG).
    dependencies: HashSet<NodeId>,

    /// Nodes that read this node's output (children in the DAG).
    dependents: HashSet<NodeId>,
}

impl Node {
    /// Create a new node.
    pub fn new(id: NodeId, kind: NodeKind, label: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            label: label.into(),
            dependencies: HashSet::new(),
            dependents: HashSet::new(),
        }
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the node's kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Add a dependency (a node that this node reads from).
    pub fn add_dependency(&mut self, node_id: NodeId) {
        self.dependencies.insert(node_id);
    }

    /// Remove a dependency.
    pub fn remove_dependency(&mut self, node_id: NodeId) {
        self.dependencies.remove(&node_id);
    }

    /// Get all dependencies.
    pub fn dependencies(&self) -> &HashSet<NodeId> {
        &self.dependencies
    }

    /// Add a dependent (a node that reads from this node).
    pub fn add_dependent(&mut self, node_id: NodeId) {
        self.dependents.insert(node_id);
    }

    /// Remove a dependent.
    pub fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.remove(&node_id);
    }

    /// Get all dependents.
    pub fn dependents(&self) -> &HashSet<NodeId> {
        &self.dependents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_order_by_registration() {
        let first = NodeId::from(0);
        let second = NodeId::from(1);
        assert!(first < second);
        assert_eq!(second.to_string(), "#1");
    }

    #[test]
    fn dependency_management() {
        let mut node = Node::new(NodeId::from(5), NodeKind::Property, "User.friendCount");
        let dep1 = NodeId::from(1);
        let dep2 = NodeId::from(2);

        node.add_dependency(dep1);
        node.add_dependency(dep2);

        assert!(node.dependencies().contains(&dep1));
        assert!(node.dependencies().contains(&dep2));
        assert_eq!(node.dependencies().len(), 2);

        node.remove_dependency(dep1);
        assert!(!node.dependencies().contains(&dep1));
        assert_eq!(node.dependencies().len(), 1);
        assert_eq!(node.label(), "User.friendCount");
        assert_eq!(node.kind(), NodeKind::Property);
    }
}
