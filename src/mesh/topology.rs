//! Topology manager
//!
//! Owns the routing graph and the set of live peer connections, speaks the
//! routing gossip protocol and forwards routed packets. It is a plain state
//! machine: the node actor feeds it peer lifecycle changes and decoded
//! messages, and arms the broadcast timer when asked to.
//!
//! Gossip flow:
//! 1. A topology change bumps the local version and schedules a debounced
//!    [`Summary`] to every direct peer.
//! 2. A receiver asks for [`Details`] of every node whose advertised version
//!    is newer than what it holds.
//! 3. Details replace a node's edge list only when strictly newer, so stale
//!    or repeated gossip never regresses the graph.

use crate::config::MeshConfig;
use crate::mesh::graph::{Graph, RoutingEdge};
use crate::mesh::identity::{IdMap, IdSet, NodeId};
use crate::mesh::message::{
    Details, DetailsRequest, MeshMessage, NodeDetails, NodeVersion, Probe, RoutedPacket, Summary,
};
use crate::mesh::routing::{Availability, Route, RoutingTable};
use crate::network::peer::{ConnId, PeerError, PeerHandle};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

/// One live connection to a directly connected node
#[derive(Clone, Debug)]
pub struct PeerLink {
    pub handle: PeerHandle,
    /// Latest one-way latency estimate in milliseconds
    pub cost: u32,
}

/// Outcome of handing a routed packet to the manager
#[derive(Debug, PartialEq)]
pub enum Forwarded {
    /// Sent on towards its target
    Sent,
    /// Addressed to this node
    Local(RoutedPacket),
    /// Dropped: no route or hop budget exhausted
    Dropped,
}

#[derive(Clone, Debug, Serialize)]
pub struct PeerSummary {
    pub node_id: NodeId,
    pub connections: usize,
    pub cost: u32,
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RouteSummary {
    pub destination: NodeId,
    #[serde(flatten)]
    pub route: Route,
}

/// Read-only view of the manager's state
#[derive(Clone, Debug, Serialize)]
pub struct TopologySnapshot {
    pub local: NodeId,
    pub version: u64,
    pub known_nodes: usize,
    pub peers: Vec<PeerSummary>,
    pub routes: Vec<RouteSummary>,
}

pub struct TopologyManager {
    config: MeshConfig,
    graph: Graph,
    peers: IdMap<Vec<PeerLink>>,
    routes: RoutingTable,
    dirty: bool,
    broadcast_pending: bool,
    timer_requested: bool,
    events: Vec<Availability>,
    probes: HashMap<u64, (ConnId, Instant)>,
}

impl TopologyManager {
    pub fn new(local: NodeId, config: MeshConfig) -> Self {
        Self {
            config,
            graph: Graph::new(local),
            peers: IdMap::new(),
            routes: RoutingTable::default(),
            dirty: false,
            broadcast_pending: false,
            timer_requested: false,
            events: Vec::new(),
            probes: HashMap::new(),
        }
    }

    pub fn local(&self) -> NodeId {
        self.graph.local()
    }

    pub fn version(&self) -> u64 {
        self.graph.local_node().version
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    // ------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------

    /// Register a new authenticated connection. Returns `false` when the
    /// connection was refused (it claims our own identifier or is a
    /// duplicate registration).
    pub fn peer_connected(&mut self, handle: PeerHandle) -> bool {
        let id = handle.node_id;
        if id == self.local() {
            log::warn!(
                "Refusing connection {} claiming our own node id {}",
                handle.conn_id,
                id.short()
            );
            return false;
        }

        let links = self.peers.entry(id).or_default();
        if links.iter().any(|l| l.handle.conn_id == handle.conn_id) {
            return false;
        }
        log::info!(
            "Peer {} connected (conn {}, {} link(s))",
            id.short(),
            handle.conn_id,
            links.len() + 1
        );
        links.push(PeerLink {
            handle,
            cost: self.config.default_link_cost,
        });

        self.graph.get_or_create(id).direct = true;
        self.update_local_edges();
        self.dirty = true;
        self.schedule_broadcast();
        true
    }

    /// Drop a connection. When it was the last one to its node, that node
    /// stops being direct and every route learned through it is forgotten.
    pub fn peer_disconnected(&mut self, conn_id: ConnId) {
        let Some(id) = self.node_of_conn(conn_id) else {
            return;
        };
        self.probes.retain(|_, (conn, _)| *conn != conn_id);

        let now_empty = match self.peers.get_mut(&id) {
            Some(links) => {
                links.retain(|l| l.handle.conn_id != conn_id);
                links.is_empty()
            }
            None => return,
        };

        if now_empty {
            self.peers.remove(&id);
            if let Some(node) = self.graph.get_mut(&id) {
                node.direct = false;
            }
            let cleared = self.graph.clear_reachable_via(&id);
            log::info!(
                "Peer {} disconnected, {} node(s) lost a route through it",
                id.short(),
                cleared
            );
            self.update_local_edges();
            self.dirty = true;
            self.schedule_broadcast();
        } else if self.update_local_edges() {
            log::debug!("Connection {} to {} closed", conn_id, id.short());
            self.dirty = true;
            self.schedule_broadcast();
        }
    }

    pub fn link(&self, conn_id: ConnId) -> Option<&PeerLink> {
        self.peers
            .values()
            .flat_map(|links| links.iter())
            .find(|l| l.handle.conn_id == conn_id)
    }

    /// Cheapest live connection to a direct node
    pub fn link_to(&self, id: &NodeId) -> Option<&PeerLink> {
        self.peers
            .get(id)?
            .iter()
            .filter(|l| !l.handle.is_closed())
            .min_by_key(|l| l.cost)
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.peers.keys()
    }

    pub fn is_direct(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    fn node_of_conn(&self, conn_id: ConnId) -> Option<NodeId> {
        self.link(conn_id).map(|l| l.handle.node_id)
    }

    /// Rebuild the local edge list from the current peer set; bumps the
    /// local version when it changed
    fn update_local_edges(&mut self) -> bool {
        let edges: Vec<RoutingEdge> = self
            .peers
            .iter()
            .map(|(id, links)| RoutingEdge {
                cost: links.iter().map(|l| l.cost).min().unwrap_or(1),
                target: *id,
            })
            .collect();
        let local = self.local();
        if !self.graph.set_edges(local, edges) {
            return false;
        }
        if let Some(node) = self.graph.get_mut(&local) {
            node.version += 1;
            log::debug!("Local routing version is now {}", node.version);
        }
        true
    }

    // ------------------------------------------------------------------
    // Gossip
    // ------------------------------------------------------------------

    /// Handle a hop-by-hop message from connection `conn_id`. Routed packets
    /// addressed to us are handed back to the caller.
    pub fn handle_message(&mut self, conn_id: ConnId, message: MeshMessage) -> Option<RoutedPacket> {
        let Some(from) = self.link(conn_id).map(|l| l.handle.clone()) else {
            log::debug!("Ignoring {} from unregistered conn {}", message.kind(), conn_id);
            return None;
        };

        match message {
            MeshMessage::Summary(summary) => self.handle_summary(&from, summary),
            MeshMessage::DetailsRequest(request) => self.handle_details_request(&from, request),
            MeshMessage::Details(details) => {
                self.handle_details(&from, details);
            }
            MeshMessage::Probe(probe) => reply(&from, MeshMessage::ProbeReply(probe)),
            MeshMessage::ProbeReply(probe) => self.handle_probe_reply(&from, probe),
            MeshMessage::Routed(packet) => {
                if let Forwarded::Local(packet) = self.forward(packet) {
                    return Some(packet);
                }
            }
        }
        None
    }

    pub fn handle_summary(&mut self, from: &PeerHandle, summary: Summary) {
        let p = from.node_id;
        let local = self.local();
        let mut wanted = Vec::new();

        let known_p = self.graph.get(&p).map(|n| n.version).unwrap_or(0);
        if summary.version > known_p {
            wanted.push(p);
        }

        let mut mentioned = IdSet::new();
        for entry in &summary.nodes {
            if entry.id == local || entry.id == p {
                continue;
            }
            mentioned.insert(entry.id);
            let newer = self
                .graph
                .get(&entry.id)
                .map_or(true, |n| entry.version > n.version);
            if newer {
                wanted.push(entry.id);
            }
            if self.graph.add_reachable_via(entry.id, p) {
                self.dirty = true;
            }
        }

        let stale: Vec<NodeId> = self
            .graph
            .nodes()
            .filter(|(id, node)| {
                **id != local && **id != p && !node.direct && !mentioned.contains(*id)
            })
            .map(|(id, _)| *id)
            .collect();
        let mut removed = 0;
        for id in stale {
            if self.graph.remove_reachable_via(&id, &p) {
                removed += 1;
            }
        }
        if removed > 0 {
            log::debug!("{} no longer reaches {} node(s)", p.short(), removed);
            self.dirty = true;
        }

        if !wanted.is_empty() {
            reply(from, MeshMessage::DetailsRequest(DetailsRequest { ids: wanted }));
        }
    }

    pub fn handle_details_request(&mut self, from: &PeerHandle, request: DetailsRequest) {
        let entries: Vec<NodeDetails> = request
            .ids
            .iter()
            .filter_map(|id| {
                self.graph.get(id).map(|node| NodeDetails {
                    id: *id,
                    version: node.version,
                    edges: node.outgoing.clone(),
                })
            })
            .collect();
        if !entries.is_empty() {
            reply(from, MeshMessage::Details(Details { entries }));
        }
    }

    /// Apply routing details. Returns whether the graph changed.
    pub fn handle_details(&mut self, from: &PeerHandle, details: Details) -> bool {
        let p = from.node_id;
        let local = self.local();
        let mut changed = false;

        for entry in details.entries {
            if entry.id == local {
                continue;
            }
            if entry.id != p {
                changed |= self.graph.add_reachable_via(entry.id, p);
            }
            let known = self.graph.get_or_create(entry.id).version;
            if entry.version > known {
                self.graph.set_edges(entry.id, entry.edges);
                if let Some(node) = self.graph.get_mut(&entry.id) {
                    node.version = entry.version;
                }
                changed = true;
            }
        }

        if changed {
            self.dirty = true;
            self.schedule_broadcast();
        }
        changed
    }

    fn schedule_broadcast(&mut self) {
        if !self.broadcast_pending {
            self.broadcast_pending = true;
            self.timer_requested = true;
        }
    }

    /// Whether the caller must arm the debounce timer. Cleared on read.
    pub fn take_timer_request(&mut self) -> bool {
        std::mem::take(&mut self.timer_requested)
    }

    pub fn broadcast_pending(&self) -> bool {
        self.broadcast_pending
    }

    pub fn summary(&mut self) -> Summary {
        self.ensure_routes();
        Summary {
            version: self.version(),
            nodes: self
                .routes
                .iter()
                .filter_map(|(id, _)| {
                    self.graph.get(id).map(|node| NodeVersion {
                        id: *id,
                        version: node.version,
                    })
                })
                .collect(),
        }
    }

    /// Send the pending summary to every direct peer. Returns the number of
    /// peers it reached.
    pub fn flush_broadcast(&mut self) -> usize {
        self.broadcast_pending = false;
        let summary = self.summary();
        let message = MeshMessage::Summary(summary);
        let mut reached = 0;
        for id in self.peers.keys() {
            match self.send_to_direct(id, &message) {
                Ok(()) => reached += 1,
                Err(e) => log::warn!("Failed to send summary to {}: {}", id.short(), e),
            }
        }
        log::debug!("Broadcast routing summary v{} to {} peer(s)", self.version(), reached);
        reached
    }

    // ------------------------------------------------------------------
    // Latency probes
    // ------------------------------------------------------------------

    /// Probe one randomly chosen connection. Returns the probed node.
    pub fn probe_random_peer(&mut self) -> Option<NodeId> {
        let mut rng = rand::thread_rng();
        let links: Vec<&PeerLink> = self.peers.values().flat_map(|l| l.iter()).collect();
        let link = links.choose(&mut rng)?;
        let nonce: u64 = rng.gen();
        let handle = link.handle.clone();

        self.probes.insert(nonce, (handle.conn_id, Instant::now()));
        reply(&handle, MeshMessage::Probe(Probe { nonce }));
        Some(handle.node_id)
    }

    pub fn handle_probe_reply(&mut self, from: &PeerHandle, probe: Probe) {
        let Some((conn_id, sent_at)) = self.probes.remove(&probe.nonce) else {
            log::debug!("Unsolicited probe reply from {}", from.node_id.short());
            return;
        };
        if conn_id != from.conn_id {
            return;
        }
        let rtt_ms = sent_at.elapsed().as_millis();
        let cost = u32::try_from(rtt_ms / 2).unwrap_or(u32::MAX).max(1);
        self.set_link_cost(conn_id, cost);
    }

    /// Update the latency estimate of one connection
    pub fn set_link_cost(&mut self, conn_id: ConnId, cost: u32) {
        let Some(link) = self
            .peers
            .values_mut()
            .flat_map(|links| links.iter_mut())
            .find(|l| l.handle.conn_id == conn_id)
        else {
            return;
        };
        if link.cost == cost {
            return;
        }
        log::debug!(
            "Link cost to {} changed {} -> {}",
            link.handle.node_id.short(),
            link.cost,
            cost
        );
        link.cost = cost;
        if self.update_local_edges() {
            self.dirty = true;
            self.schedule_broadcast();
        }
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    fn ensure_routes(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;

        let local = self.local();
        let next = RoutingTable::compute(&self.graph);
        let transitions = self.routes.transitions(&next);

        let doomed: Vec<NodeId> = self
            .graph
            .nodes()
            .filter(|(id, node)| {
                **id != local
                    && !next.is_reachable(id)
                    && (self.routes.is_reachable(id) || node.is_orphaned())
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            self.graph.remove(id);
        }

        for transition in &transitions {
            match transition {
                Availability::Available(id) => log::info!("Node {} is now reachable", id.short()),
                Availability::Unavailable(id) => log::info!("Node {} is unreachable", id.short()),
            }
        }
        self.routes = next;
        self.events.extend(transitions);
    }

    /// Recompute routes if anything changed and return the availability
    /// transitions accumulated since the last call
    pub fn refresh(&mut self) -> Vec<Availability> {
        self.ensure_routes();
        std::mem::take(&mut self.events)
    }

    pub fn route(&mut self, target: &NodeId) -> Option<Route> {
        self.ensure_routes();
        self.routes.get(target).copied()
    }

    pub fn is_reachable(&mut self, target: &NodeId) -> bool {
        self.route(target).is_some()
    }

    /// Every currently reachable node
    pub fn reachable(&mut self) -> Vec<NodeId> {
        self.ensure_routes();
        self.routes.iter().map(|(id, _)| *id).collect()
    }

    fn send_to_direct(&self, id: &NodeId, message: &MeshMessage) -> Result<(), PeerError> {
        let link = self.link_to(id).ok_or(PeerError::Disconnected)?;
        link.handle.send(message.to_envelope()?)
    }

    /// Send a routed packet towards its target, or hand it back when it is
    /// addressed to us
    pub fn forward(&mut self, mut packet: RoutedPacket) -> Forwarded {
        if packet.target == self.local() {
            return Forwarded::Local(packet);
        }
        if packet.ttl == 0 {
            log::warn!(
                "Dropping {} from {} to {}: hop budget exhausted",
                packet.body.type_name(),
                packet.source.short(),
                packet.target.short()
            );
            return Forwarded::Dropped;
        }
        packet.ttl -= 1;

        let Some(route) = self.route(&packet.target) else {
            log::debug!(
                "No route to {} for {}",
                packet.target.short(),
                packet.body.type_name()
            );
            return Forwarded::Dropped;
        };
        match self.send_to_direct(&route.next_hop, &MeshMessage::Routed(packet)) {
            Ok(()) => Forwarded::Sent,
            Err(e) => {
                log::warn!("Failed to forward via {}: {}", route.next_hop.short(), e);
                Forwarded::Dropped
            }
        }
    }

    pub fn snapshot(&mut self) -> TopologySnapshot {
        self.ensure_routes();
        TopologySnapshot {
            local: self.local(),
            version: self.version(),
            known_nodes: self.graph.len(),
            peers: self
                .peers
                .iter()
                .map(|(id, links)| PeerSummary {
                    node_id: *id,
                    connections: links.len(),
                    cost: links.iter().map(|l| l.cost).min().unwrap_or(0),
                    addresses: links
                        .iter()
                        .filter_map(|l| l.handle.address.map(|a| a.to_string()))
                        .collect(),
                })
                .collect(),
            routes: self
                .routes
                .iter()
                .map(|(id, route)| RouteSummary {
                    destination: *id,
                    route: *route,
                })
                .collect(),
        }
    }
}

/// Best-effort send on one specific connection
fn reply(to: &PeerHandle, message: MeshMessage) {
    let result = message
        .to_envelope()
        .map_err(PeerError::from)
        .and_then(|envelope| to.send(envelope));
    if let Err(e) = result {
        log::warn!(
            "Failed to send {} to {}: {}",
            message.kind(),
            to.node_id.short(),
            e
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mesh::message::{Envelope, RoutedBody, DEFAULT_TTL};
    use tokio::sync::mpsc;

    /// In-process harness that shuttles frames between topology managers
    pub(crate) struct Sim {
        pub nodes: Vec<TopologyManager>,
        links: Vec<SimLink>,
        pub delivered: Vec<(usize, RoutedPacket)>,
    }

    struct SimLink {
        /// Receiving node index
        to: usize,
        /// Connection id of the sender as seen by the receiver
        conn_at_receiver: ConnId,
        rx: mpsc::UnboundedReceiver<Envelope>,
        /// Conn ids on both sides, for disconnects
        ends: (usize, ConnId, usize, ConnId),
    }

    impl Sim {
        pub fn new(count: usize) -> Self {
            let config = MeshConfig::default();
            Self {
                nodes: (0..count)
                    .map(|_| TopologyManager::new(NodeId::random(), config.clone()))
                    .collect(),
                links: Vec::new(),
                delivered: Vec::new(),
            }
        }

        pub fn id(&self, index: usize) -> NodeId {
            self.nodes[index].local()
        }

        /// Connect two nodes with the given link cost on both sides
        pub fn connect(&mut self, a: usize, b: usize, cost: u32) {
            let (tx_ab, rx_ab) = mpsc::unbounded_channel();
            let (tx_ba, rx_ba) = mpsc::unbounded_channel();
            let at_a = PeerHandle::new(self.id(b), None, tx_ab);
            let at_b = PeerHandle::new(self.id(a), None, tx_ba);
            let (conn_a, conn_b) = (at_a.conn_id, at_b.conn_id);

            assert!(self.nodes[a].peer_connected(at_a));
            assert!(self.nodes[b].peer_connected(at_b));
            self.nodes[a].set_link_cost(conn_a, cost);
            self.nodes[b].set_link_cost(conn_b, cost);

            let ends = (a, conn_a, b, conn_b);
            self.links.push(SimLink {
                to: b,
                conn_at_receiver: conn_b,
                rx: rx_ab,
                ends,
            });
            self.links.push(SimLink {
                to: a,
                conn_at_receiver: conn_a,
                rx: rx_ba,
                ends,
            });
        }

        pub fn disconnect(&mut self, a: usize, b: usize) {
            let mut closed = Vec::new();
            self.links.retain(|link| {
                let (x, cx, y, cy) = link.ends;
                let matches = (x == a && y == b) || (x == b && y == a);
                if matches {
                    closed.push((x, cx));
                    closed.push((y, cy));
                }
                !matches
            });
            closed.sort();
            closed.dedup();
            for (node, conn) in closed {
                self.nodes[node].peer_disconnected(conn);
            }
        }

        /// Deliver frames and fire broadcast timers until nothing moves.
        /// Returns the availability transitions seen per node.
        pub fn settle(&mut self) -> Vec<Vec<Availability>> {
            let mut events = vec![Vec::new(); self.nodes.len()];
            for _ in 0..1000 {
                let mut moved = false;
                for node in self.nodes.iter_mut() {
                    if node.take_timer_request() || node.broadcast_pending() {
                        node.flush_broadcast();
                        moved = true;
                    }
                }
                for i in 0..self.links.len() {
                    while let Ok(envelope) = self.links[i].rx.try_recv() {
                        moved = true;
                        let to = self.links[i].to;
                        let conn = self.links[i].conn_at_receiver;
                        let message = MeshMessage::from_envelope(&envelope).unwrap();
                        if let Some(packet) = self.nodes[to].handle_message(conn, message) {
                            self.delivered.push((to, packet));
                        }
                    }
                }
                for (i, node) in self.nodes.iter_mut().enumerate() {
                    events[i].extend(node.refresh());
                }
                if !moved {
                    return events;
                }
            }
            panic!("gossip did not settle");
        }
    }

    #[test]
    fn test_connect_bumps_version_and_requests_broadcast() {
        let mut sim = Sim::new(2);
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = PeerHandle::new(sim.id(1), None, tx);

        let node = &mut sim.nodes[0];
        assert_eq!(node.version(), 0);
        assert!(node.peer_connected(handle.clone()));
        assert_eq!(node.version(), 1);
        assert!(node.take_timer_request());
        assert!(!node.take_timer_request());

        // Same connection again is ignored
        assert!(!node.peer_connected(handle));
        assert_eq!(node.version(), 1);
    }

    #[test]
    fn test_refuses_own_id() {
        let mut node = TopologyManager::new(NodeId::random(), MeshConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!node.peer_connected(PeerHandle::new(node.local(), None, tx)));
    }

    #[test]
    fn test_line_converges_to_two_hop_route() {
        let mut sim = Sim::new(3);
        sim.connect(0, 1, 10);
        sim.connect(1, 2, 25);
        let events = sim.settle();

        let (a, b, c) = (sim.id(0), sim.id(1), sim.id(2));
        let route = sim.nodes[0].route(&c).unwrap();
        assert_eq!(route.next_hop, b);
        assert_eq!(route.cost, 35);

        let back = sim.nodes[2].route(&a).unwrap();
        assert_eq!(back.next_hop, b);
        assert_eq!(back.cost, 35);

        assert!(events[0].contains(&Availability::Available(c)));
        assert_eq!(
            events[0]
                .iter()
                .filter(|e| **e == Availability::Available(c))
                .count(),
            1
        );
    }

    #[test]
    fn test_repeated_details_are_idempotent() {
        let mut sim = Sim::new(3);
        sim.connect(0, 1, 10);
        sim.connect(1, 2, 10);
        sim.settle();

        let (b, c) = (sim.id(1), sim.id(2));
        let from = sim.nodes[0].link_to(&b).unwrap().handle.clone();
        let node = &mut sim.nodes[0];
        let current = node.graph().get(&c).unwrap().clone();
        let details = Details {
            entries: vec![NodeDetails {
                id: c,
                version: current.version,
                edges: current.outgoing.clone(),
            }],
        };

        assert!(!node.handle_details(&from, details.clone()));
        assert!(!node.handle_details(&from, details));
        assert!(!node.take_timer_request());
        assert_eq!(node.graph().get(&c).unwrap().outgoing, current.outgoing);
    }

    #[test]
    fn test_stale_details_are_discarded() {
        let mut sim = Sim::new(3);
        sim.connect(0, 1, 10);
        sim.connect(1, 2, 10);
        sim.settle();

        let (b, c) = (sim.id(1), sim.id(2));
        let from = sim.nodes[0].link_to(&b).unwrap().handle.clone();
        let node = &mut sim.nodes[0];
        let current = node.graph().get(&c).unwrap().clone();

        let stale = Details {
            entries: vec![NodeDetails {
                id: c,
                version: current.version - 1,
                edges: vec![],
            }],
        };
        assert!(!node.handle_details(&from, stale));
        assert_eq!(node.graph().get(&c).unwrap().outgoing, current.outgoing);
    }

    #[test]
    fn test_cutting_the_middle_makes_ends_unavailable_once() {
        let mut sim = Sim::new(3);
        sim.connect(0, 1, 10);
        sim.connect(1, 2, 10);
        sim.settle();

        let (a, b, c) = (sim.id(0), sim.id(1), sim.id(2));
        sim.disconnect(0, 1);
        sim.disconnect(1, 2);
        let events = sim.settle();

        assert!(sim.nodes[0].route(&c).is_none());
        assert!(sim.nodes[2].route(&a).is_none());
        for (node, other) in [(0, c), (2, a)] {
            let count = events[node]
                .iter()
                .filter(|e| **e == Availability::Unavailable(other))
                .count();
            assert_eq!(count, 1);
            assert!(events[node].contains(&Availability::Unavailable(b)));
        }
        // Unreachable nodes are pruned from the graph
        assert!(!sim.nodes[0].graph().contains(&c));
        assert_eq!(sim.nodes[0].graph().len(), 1);
    }

    #[test]
    fn test_disconnect_of_one_connection_keeps_node_direct() {
        let mut sim = Sim::new(2);
        sim.connect(0, 1, 10);
        sim.connect(0, 1, 4);
        sim.settle();
        let b = sim.id(1);
        assert_eq!(sim.nodes[0].route(&b).unwrap().cost, 4);

        let cheap = sim.nodes[0]
            .peers
            .get(&b)
            .and_then(|links| links.iter().find(|l| l.cost == 4))
            .map(|l| l.handle.conn_id)
            .unwrap();
        sim.nodes[0].peer_disconnected(cheap);
        let events = sim.settle();

        assert!(events[0].is_empty());
        assert!(sim.nodes[0].is_direct(&b));
        assert_eq!(sim.nodes[0].route(&b).unwrap().cost, 10);
    }

    #[test]
    fn test_routed_packet_crosses_intermediary() {
        let mut sim = Sim::new(3);
        sim.connect(0, 1, 10);
        sim.connect(1, 2, 10);
        sim.settle();

        let (a, c) = (sim.id(0), sim.id(2));
        let packet = RoutedPacket {
            source: a,
            target: c,
            ttl: DEFAULT_TTL,
            body: RoutedBody::GroupQuery,
        };
        assert_eq!(sim.nodes[0].forward(packet), Forwarded::Sent);
        sim.settle();

        assert_eq!(sim.delivered.len(), 1);
        let (at, packet) = &sim.delivered[0];
        assert_eq!(*at, 2);
        assert_eq!(packet.source, a);
        assert_eq!(packet.ttl, DEFAULT_TTL - 2);
    }

    #[test]
    fn test_packet_without_route_or_hops_is_dropped() {
        let mut sim = Sim::new(2);
        sim.connect(0, 1, 10);
        sim.settle();

        let (a, b) = (sim.id(0), sim.id(1));
        let unknown = RoutedPacket {
            source: a,
            target: NodeId::random(),
            ttl: DEFAULT_TTL,
            body: RoutedBody::GroupQuery,
        };
        assert_eq!(sim.nodes[0].forward(unknown), Forwarded::Dropped);

        let exhausted = RoutedPacket {
            source: a,
            target: b,
            ttl: 0,
            body: RoutedBody::GroupQuery,
        };
        assert_eq!(sim.nodes[0].forward(exhausted), Forwarded::Dropped);
    }

    #[test]
    fn test_routes_do_not_depend_on_connect_order() {
        // 0-1 (1), 1-2 (1), 2-3 (1), 3-4 (1), 0-2 (5)
        let edges = [(0, 1, 1), (1, 2, 1), (2, 3, 1), (3, 4, 1), (0, 2, 5)];
        let mut results = Vec::new();
        for order in [[0, 1, 2, 3, 4], [4, 3, 2, 1, 0], [2, 0, 4, 1, 3]] {
            let mut sim = Sim::new(5);
            for i in order {
                let (a, b, cost) = edges[i];
                sim.connect(a, b, cost);
                sim.settle();
            }
            let ids: Vec<NodeId> = (0..5).map(|i| sim.id(i)).collect();
            let routes: Vec<Route> = ids[1..]
                .iter()
                .map(|id| sim.nodes[0].route(id).unwrap())
                .collect();

            // Shortest path to 4 is 0-1-2-3-4; walking back from 4 the first
            // direct node is 2
            assert_eq!(routes[3], Route { next_hop: ids[2], cost: 4 });
            assert_eq!(routes[1], Route { next_hop: ids[2], cost: 2 });
            assert_eq!(routes[0], Route { next_hop: ids[1], cost: 1 });
            results.push(routes.iter().map(|r| r.cost).collect::<Vec<_>>());
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_probe_round_trip_updates_cost() {
        let mut sim = Sim::new(2);
        sim.connect(0, 1, 500);
        sim.settle();

        let b = sim.id(1);
        assert_eq!(sim.nodes[0].probe_random_peer(), Some(b));
        sim.settle();
        let cost = sim.nodes[0].route(&b).unwrap().cost;
        assert!(cost < 500);
        assert!(cost >= 1);
    }

    #[test]
    fn test_snapshot_lists_peers_and_routes() {
        let mut sim = Sim::new(3);
        sim.connect(0, 1, 10);
        sim.connect(1, 2, 10);
        sim.settle();

        let b = sim.id(1);
        let snapshot = sim.nodes[1].snapshot();
        assert_eq!(snapshot.peers.len(), 2);
        assert_eq!(snapshot.routes.len(), 2);
        assert_eq!(snapshot.local, b);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["routes"][0]["next_hop"].is_string());
    }
}
