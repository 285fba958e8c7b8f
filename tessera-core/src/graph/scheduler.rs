//! Dependency Graph Ordering
//!
//! The graph decides the order in which computations run. A computation must
//! never observe a dependency's old value once that dependency's own update has
//! been scheduled, so dependencies always run before their dependents.
//!
//! # Algorithm
//!
//! Kahn's algorithm over computation nodes. Nodes whose in-degree reaches zero
//! together form one phase; phases are numbered from zero and every node gets
//! its phase as its rank.
//!
//! 1. Compute in-degrees (edges between registered nodes only)
//! 2. Phase 0 is every node with in-degree zero
//! 3. Removing a phase lowers its dependents' in-degrees; the nodes that reach
//!    zero form the next phase
//! 4. Nodes left over sit on a cycle; they are appended as a final phase in
//!    registration order and reported

use std::collections::{HashMap, HashSet, VecDeque};

use super::node::{Node, NodeId, NodeKind};

/// The dependency graph over all computations.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// All nodes in the graph, indexed by ID.
    nodes: HashMap<NodeId, Node>,

    /// Registration order.
    order: Vec<NodeId>,
}

/// Result of ordering the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Phases {
    /// Topological levels, dependencies first.
    pub phases: Vec<Vec<NodeId>>,
    /// Nodes that could not be ordered because they sit on a cycle.
    pub cyclic: Vec<NodeId>,
}

impl Phases {
    /// Rank of every node: the index of its phase.
    pub fn ranks(&self) -> HashMap<NodeId, usize> {
        self.phases
            .iter()
            .enumerate()
            .flat_map(|(rank, phase)| phase.iter().map(move |id| (*id, rank)))
            .collect()
    }

    /// Flattened order.
    pub fn order(&self) -> Vec<NodeId> {
        self.phases.iter().flatten().copied().collect()
    }
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and return its id.
    pub fn add_node(&mut self, kind: NodeKind, label: impl Into<String>) -> NodeId {
        let id = NodeId::from(self.order.len() as u64);
        self.nodes.insert(id, Node::new(id, kind, label));
        self.order.push(id);
        id
    }

    /// Get a reference to a node.
    pub fn get_node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    /// Add a dependency edge: `dependent` depends on `dependency`.
    ///
    /// This means when `dependency` writes, `dependent` may need to update.
    /// Self edges are ignored: a computation reacting to its own writes is
    /// handled by the fixpoint loop, not by ordering.
    pub fn add_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if dependency == dependent {
            return;
        }
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.add_dependent(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.add_dependency(dependency);
        }
    }

    /// Remove a dependency edge.
    pub fn remove_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.remove_dependent(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.remove_dependency(dependency);
        }
    }

    /// Every node reachable from `source` through dependent edges, in BFS order.
    pub fn downstream(&self, source: NodeId) -> Vec<NodeId> {
        let mut reached = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();

        if let Some(node) = self.nodes.get(&source) {
            queue.extend(node.dependents().iter().copied());
        }

        while let Some(node_id) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }
            reached.push(node_id);
            if let Some(node) = self.nodes.get(&node_id) {
                queue.extend(node.dependents().iter().copied());
            }
        }

        reached
    }

    /// Order every node into topological phases.
    pub fn phases(&self) -> Phases {
        let mut in_degree: HashMap<NodeId, usize> = self
            .order
            .iter()
            .filter_map(|id| self.nodes.get(id).map(|n| (*id, n.dependencies().len())))
            .collect();

        let mut current: Vec<NodeId> = self
            .order
            .iter()
            .copied()
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut phases = Vec::new();
        let mut placed = HashSet::new();

        while !current.is_empty() {
            let mut next = Vec::new();
            for node_id in &current {
                placed.insert(*node_id);
                let Some(node) = self.nodes.get(node_id) else { continue };
                for dependent_id in node.dependents() {
                    if let Some(degree) = in_degree.get_mut(dependent_id) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            next.push(*dependent_id);
                        }
                    }
                }
            }
            // Keep registration order inside a phase.
            next.sort();
            phases.push(std::mem::take(&mut current));
            current = next;
        }

        let cyclic: Vec<NodeId> = self
            .order
            .iter()
            .copied()
            .filter(|id| !placed.contains(id))
            .collect();
        if !cyclic.is_empty() {
            phases.push(cyclic.clone());
        }

        Phases { phases, cyclic }
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_edges() {
        let mut graph = DependencyGraph::new();

        let source_id = graph.add_node(NodeKind::Dictionary, "total");
        let derived_id = graph.add_node(NodeKind::Dictionary, "average");

        graph.add_edge(source_id, derived_id);

        // Check the edge exists
        assert!(graph.get_node(source_id).unwrap().dependents().contains(&derived_id));
        assert!(graph.get_node(derived_id).unwrap().dependencies().contains(&source_id));

        // Remove the edge
        graph.remove_edge(source_id, derived_id);

        assert!(!graph.get_node(source_id).unwrap().dependents().contains(&derived_id));
        assert!(!graph.get_node(derived_id).unwrap().dependencies().contains(&source_id));
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn phases_follow_dependencies() {
        let mut graph = DependencyGraph::new();

        // Register out of order: chain c -> b -> a, plus independent d.
        let a = graph.add_node(NodeKind::Dictionary, "a");
        let b = graph.add_node(NodeKind::Property, "b");
        let c = graph.add_node(NodeKind::Entity, "c");
        let d = graph.add_node(NodeKind::Dictionary, "d");

        graph.add_edge(c, b);
        graph.add_edge(b, a);

        let phases = graph.phases();
        assert!(phases.cyclic.is_empty());
        assert_eq!(phases.phases, vec![vec![c, d], vec![b], vec![a]]);

        let ranks = phases.ranks();
        assert_eq!(ranks[&c], 0);
        assert_eq!(ranks[&a], 2);
        assert_eq!(phases.order(), vec![c, d, b, a]);
    }

    #[test]
    fn cycles_are_reported_and_appended() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node(NodeKind::Property, "a");
        let b = graph.add_node(NodeKind::Property, "b");
        let c = graph.add_node(NodeKind::Dictionary, "c");

        graph.add_edge(a, b);
        graph.add_edge(b, a);
        graph.add_edge(a, a);

        let phases = graph.phases();
        assert_eq!(phases.cyclic, vec![a, b]);
        assert_eq!(phases.order(), vec![c, a, b]);
    }

    #[test]
    fn downstream_walks_dependents() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node(NodeKind::Dictionary, "a");
        let b = graph.add_node(NodeKind::Dictionary, "b");
        let c = graph.add_node(NodeKind::Dictionary, "c");
        let d = graph.add_node(NodeKind::Dictionary, "d");

        graph.add_edge(a, b);
        graph.add_edge(b, c);

        assert_eq!(graph.downstream(a), vec![b, c]);
        assert!(graph.downstream(d).is_empty());
    }
}
