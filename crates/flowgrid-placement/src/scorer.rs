//! Node scoring for placement decisions.
//!
//! Best-fit bin-packing: among the nodes that can satisfy a request, prefer
//! the one that will have the least scalar capacity left over afterwards.
//! Ties are broken by node id so that ranking is deterministic.

use std::cmp::Ordering;

use flowgrid_core::{NodeId, NodeResources, ResourceRequest, Scalars};

/// A feasible node with its best-fit score.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeScore {
    pub node: NodeId,
    /// Mean fraction of each scalar dimension left after placement
    /// (0.0 = perfectly packed, 1.0 = untouched).
    pub leftover: f64,
}

/// Fraction of `before` still present in `after`, averaged over the scalar
/// dimensions the node actually offers.
pub fn leftover_fraction(before: &Scalars, after: &Scalars) -> f64 {
    let dims = [
        (before.millicores, after.millicores),
        (before.memory_bytes, after.memory_bytes),
        (before.disk_bytes, after.disk_bytes),
    ];
    let (sum, count) = dims
        .iter()
        .filter(|(total, _)| *total > 0)
        .fold((0.0, 0u32), |(sum, count), (total, left)| {
            (sum + *left as f64 / *total as f64, count + 1)
        });
    if count == 0 { 0.0 } else { sum / f64::from(count) }
}

/// Score one node, `None` if it cannot satisfy the request.
pub fn score_node(node: &NodeResources, request: &ResourceRequest) -> Option<NodeScore> {
    let sub = node.subtract(request).ok()?;
    Some(NodeScore {
        node: node.node().to_string(),
        leftover: leftover_fraction(&node.scalars(), &sub.remainder.scalars()),
    })
}

/// Score all nodes and return the feasible ones, best fit first.
pub fn rank_nodes<'a>(
    nodes: impl IntoIterator<Item = &'a NodeResources>,
    request: &ResourceRequest,
) -> Vec<NodeScore> {
    let mut scores: Vec<NodeScore> = nodes
        .into_iter()
        .filter_map(|n| score_node(n, request))
        .collect();
    scores.sort_by(|a, b| {
        a.leftover
            .partial_cmp(&b.leftover)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.node.cmp(&b.node))
    });
    scores
}
