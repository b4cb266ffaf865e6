//! Shortest-path routing over the gossip graph
//!
//! Dijkstra from the local node over every present node, then each
//! destination is mapped to the directly connected node that should carry
//! traffic for it.

use crate::mesh::graph::Graph;
use crate::mesh::identity::{IdMap, NodeId};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Where to send traffic for a destination
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Route {
    /// Directly connected node that receives the traffic
    pub next_hop: NodeId,
    /// Total path cost, in link-cost units
    pub cost: u64,
}

/// Reachability change produced by a recompute
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Availability {
    Available(NodeId),
    Unavailable(NodeId),
}

/// Distances and predecessors of a single-source shortest path run
#[derive(Debug, Default)]
pub struct PathTree {
    pub dist: IdMap<u64>,
    pub pred: IdMap<NodeId>,
}

/// Dijkstra from the local node. Only present nodes are traversed and edges
/// to unknown targets are skipped. A relaxation wins only with a strictly
/// lower cost.
pub fn shortest_paths(graph: &Graph) -> PathTree {
    let local = graph.local();
    let mut tree = PathTree::default();
    let mut heap = BinaryHeap::new();

    tree.dist.insert(local, 0);
    heap.push(Reverse((0u64, local)));

    while let Some(Reverse((dist, id))) = heap.pop() {
        if tree.dist.get(&id).is_some_and(|&best| dist > best) {
            continue;
        }
        let Some(node) = graph.get(&id) else {
            continue;
        };
        for edge in &node.outgoing {
            if edge.target == local || !graph.is_present(&edge.target) {
                continue;
            }
            let candidate = dist + u64::from(edge.cost);
            let better = tree
                .dist
                .get(&edge.target)
                .map_or(true, |&current| candidate < current);
            if better {
                tree.dist.insert(edge.target, candidate);
                tree.pred.insert(edge.target, id);
                heap.push(Reverse((candidate, edge.target)));
            }
        }
    }

    tree
}

/// Next hop for every reachable non-local node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: IdMap<Route>,
}

impl RoutingTable {
    pub fn compute(graph: &Graph) -> Self {
        let local = graph.local();
        let tree = shortest_paths(graph);
        let mut routes = IdMap::new();

        for (id, node) in graph.nodes() {
            if *id == local {
                continue;
            }
            let Some(cost) = tree.dist.get(id).copied() else {
                if node.direct {
                    log::debug!("Direct node {} has no local edge, skipping", id.short());
                }
                continue;
            };
            if node.direct {
                routes.insert(*id, Route { next_hop: *id, cost });
                continue;
            }
            if let Some(next_hop) = direct_ancestor(graph, &tree, *id) {
                routes.insert(*id, Route { next_hop, cost });
            }
        }

        Self { routes }
    }

    pub fn get(&self, id: &NodeId) -> Option<&Route> {
        self.routes.get(id)
    }

    pub fn is_reachable(&self, id: &NodeId) -> bool {
        self.routes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Route)> {
        self.routes.iter()
    }

    /// Transitions from `self` to `next`, one per node that changed
    /// reachability
    pub fn transitions(&self, next: &RoutingTable) -> Vec<Availability> {
        let gone = self
            .routes
            .keys()
            .filter(|id| !next.routes.contains_key(id))
            .map(|id| Availability::Unavailable(*id));
        let new = next
            .routes
            .keys()
            .filter(|id| !self.routes.contains_key(id))
            .map(|id| Availability::Available(*id));
        gone.chain(new).collect()
    }
}

/// Walk the predecessor chain from `id` back towards the local node and
/// return the first direct node on it
fn direct_ancestor(graph: &Graph, tree: &PathTree, id: NodeId) -> Option<NodeId> {
    let local = graph.local();
    let mut cursor = id;
    for _ in 0..=graph.len() {
        if graph.get(&cursor).is_some_and(|node| node.direct) {
            return Some(cursor);
        }
        match tree.pred.get(&cursor) {
            Some(prev) if *prev != local => cursor = *prev,
            _ => return None,
        }
    }
    None
}
