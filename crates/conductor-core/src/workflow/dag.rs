//! Dependency ordering and cycle detection.
//!
//! Uses `petgraph` to model dependencies as a directed graph
//! (dependency -> dependent). Topological sort detects cycles and yields an
//! order in which every node comes after the nodes it depends on.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use thiserror::Error;

/// The dependency graph contains a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cycle detected involving '{node}'")]
pub struct CycleError {
    /// One node implicated in the cycle.
    pub node: String,
}

/// A node with an id and the ids it depends on.
pub trait DependencyNode {
    fn node_id(&self) -> &str;
    fn dependencies(&self) -> &[String];
}

/// Order `nodes` so that each one follows its dependencies.
///
/// Returns indices into `nodes`. Dependencies on ids that are not part of
/// `nodes` add no edge; callers decide what an unknown dependency means.
pub fn dependency_order<N: DependencyNode>(nodes: &[N]) -> Result<Vec<usize>, CycleError> {
    if nodes.is_empty() {
        return Ok(vec![]);
    }

    let id_to_idx: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.node_id(), i))
        .collect();

    let mut graph = DiGraph::<usize, ()>::new();
    let node_indices: Vec<_> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();

    for (to_idx, node) in nodes.iter().enumerate() {
        for dep in node.dependencies() {
            if let Some(&from_idx) = id_to_idx.get(dep.as_str()) {
                graph.add_edge(node_indices[from_idx], node_indices[to_idx], ());
            }
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| CycleError {
        node: nodes[graph[cycle.node_id()]].node_id().to_string(),
    })?;

    Ok(sorted.into_iter().map(|idx| graph[idx]).collect())
}
