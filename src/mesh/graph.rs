//! Routing graph
//!
//! One [`GraphNode`] per known identifier, the local node included. Each node
//! owns its outgoing edges; targets keep an incoming back-reference so a
//! node's contribution can be cleaned up when it is dropped.

use crate::mesh::identity::{IdMap, IdSet, NodeId};
use serde::{Deserialize, Serialize};

/// Directed, latency-weighted edge owned by its source node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEdge {
    pub cost: u32,
    pub target: NodeId,
}

/// Routing information about one mesh participant
#[derive(Clone, Debug, Default)]
pub struct GraphNode {
    /// Reachable through a live, locally held connection
    pub direct: bool,
    /// Version of this node's own routing information
    pub version: u64,
    pub outgoing: Vec<RoutingEdge>,
    /// Sources whose edge lists currently point at this node
    pub incoming: IdSet,
    /// Direct peers that told us they can reach this node
    pub reachable_via: IdSet,
}

impl GraphNode {
    /// A node that is neither direct nor vouched for by any peer
    pub fn is_orphaned(&self) -> bool {
        !self.direct && self.reachable_via.is_empty()
    }
}

#[derive(Debug)]
pub struct Graph {
    local: NodeId,
    nodes: IdMap<GraphNode>,
}

impl Graph {
    pub fn new(local: NodeId) -> Self {
        let mut nodes = IdMap::new();
        nodes.insert(local, GraphNode::default());
        Self { local, nodes }
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    pub fn local_node(&self) -> &GraphNode {
        &self.nodes[&self.local]
    }

    pub fn get(&self, id: &NodeId) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut GraphNode> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &GraphNode)> {
        self.nodes.iter()
    }

    /// Fetch a node, creating an empty entry on first reference.
    ///
    /// A re-created node recovers its incoming back-references from the edge
    /// lists that still name it.
    pub fn get_or_create(&mut self, id: NodeId) -> &mut GraphNode {
        if !self.nodes.contains_key(&id) {
            let incoming: IdSet = self
                .nodes
                .iter()
                .filter(|(_, node)| node.outgoing.iter().any(|e| e.target == id))
                .map(|(source, _)| *source)
                .collect();
            self.nodes.insert(
                id,
                GraphNode {
                    incoming,
                    ..GraphNode::default()
                },
            );
        }
        self.nodes.entry(id).or_default()
    }

    /// Replace the whole outgoing edge list of `id`. Returns whether anything
    /// changed.
    pub fn set_edges(&mut self, id: NodeId, edges: Vec<RoutingEdge>) -> bool {
        let old = std::mem::take(&mut self.get_or_create(id).outgoing);
        if old == edges {
            self.get_or_create(id).outgoing = old;
            return false;
        }

        for edge in &old {
            if !edges.iter().any(|e| e.target == edge.target) {
                if let Some(target) = self.nodes.get_mut(&edge.target) {
                    target.incoming.remove(&id);
                }
            }
        }
        for edge in &edges {
            self.get_or_create(edge.target).incoming.insert(id);
        }
        self.get_or_create(id).outgoing = edges;
        true
    }

    pub fn add_reachable_via(&mut self, id: NodeId, via: NodeId) -> bool {
        self.get_or_create(id).reachable_via.insert(via)
    }

    pub fn remove_reachable_via(&mut self, id: &NodeId, via: &NodeId) -> bool {
        self.nodes
            .get_mut(id)
            .map(|node| node.reachable_via.remove(via))
            .unwrap_or(false)
    }

    /// Forget every route that went through `via`. Returns the number of
    /// nodes that lost an entry.
    pub fn clear_reachable_via(&mut self, via: &NodeId) -> usize {
        let mut cleared = 0;
        for node in self.nodes.values_mut() {
            if node.reachable_via.remove(via) {
                cleared += 1;
            }
        }
        cleared
    }

    /// Direct, or vouched for by at least one direct peer. The local node is
    /// always present.
    pub fn is_present(&self, id: &NodeId) -> bool {
        *id == self.local
            || self
                .nodes
                .get(id)
                .map(|node| !node.is_orphaned())
                .unwrap_or(false)
    }

    /// Drop a node and its edge back-references. The local node cannot be
    /// removed.
    pub fn remove(&mut self, id: &NodeId) -> Option<GraphNode> {
        if *id == self.local {
            return None;
        }
        let node = self.nodes.remove(id)?;
        for edge in &node.outgoing {
            if let Some(target) = self.nodes.get_mut(&edge.target) {
                target.incoming.remove(id);
            }
        }
        Some(node)
    }
}
