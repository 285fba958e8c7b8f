//! Dependency Graph
//!
//! This module implements the graph that tracks which computations read the
//! output of which other computations.
//!
//! # Overview
//!
//! The dependency graph is a directed graph where:
//!
//! - Nodes represent computations (dictionary, property, entity or relation
//!   targets)
//! - Edges represent dependencies: if B reads what A writes, there is an edge
//!   from A to B
//!
//! Edges are derived at setup from each computation's declared data deps. The
//! controller uses the resulting phases to run the computations triggered by
//! one mutation event in dependency order, and to compute initial values.
//!
//! # Ordering
//!
//! 1. Nodes are ranked by topological phase. Computations in the same phase
//!    keep their registration order.
//!
//! 2. A cycle does not fail setup. The nodes on it are appended after the
//!    acyclic phases in registration order and a warning is logged.
//!
//! 3. Both forward (dependencies) and reverse (dependents) edges are kept so
//!    that `downstream` walks never scan the whole graph.

mod node;
mod scheduler;

pub use node::{Node, NodeId, NodeKind};
pub use scheduler::{DependencyGraph, Phases};
