//! Mesh node actor
//!
//! One task owns the topology manager, the pending-send table, group
//! membership and synchronized values. Everything else talks to it through
//! a [`NodeHandle`], which turns calls into [`Command`]s on an unbounded
//! queue. Timers post commands back into the same queue, so every state
//! change happens on the actor task.

use crate::config::MeshConfig;
use crate::mesh::groups::{GroupHandle, GroupRegistry, GroupSummary, MembershipChange};
use crate::mesh::identity::NodeId;
use crate::mesh::message::{Envelope, MeshMessage, RoutedBody, RoutedPacket};
use crate::mesh::reliable::{
    AcceptAll, MessageFilter, PendingTable, Responder, SendError, SendResult, Seq,
};
use crate::mesh::routing::{Availability, Route};
use crate::mesh::synced::{Outbox, PatchStrategy, SyncError, SyncedValues, ValueUpdate};
use crate::mesh::topology::{Forwarded, TopologyManager, TopologySnapshot};
use crate::network::peer::{ConnId, PeerHandle};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;

const EVENT_CAPACITY: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("mesh node is not running")]
    Stopped,
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Data message handed to the application
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub source: NodeId,
    pub kind: String,
    pub group: Option<String>,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MeshEvent {
    NodeAvailable(NodeId),
    NodeUnavailable(NodeId),
    Data(Delivery),
    GroupMemberJoined { group: String, node: NodeId },
    GroupMemberLeft { group: String, node: NodeId },
    ValueUpdated(ValueUpdate),
}

impl From<MembershipChange> for MeshEvent {
    fn from(change: MembershipChange) -> Self {
        match change {
            MembershipChange::Joined { group, node } => MeshEvent::GroupMemberJoined { group, node },
            MembershipChange::Left { group, node } => MeshEvent::GroupMemberLeft { group, node },
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    PeerConnected {
        handle: PeerHandle,
        reply: Reply<bool>,
    },
    PeerDisconnected(ConnId),
    SetLinkCost {
        conn: ConnId,
        cost: u32,
    },
    Incoming {
        conn: ConnId,
        envelope: Envelope,
    },
    Send {
        target: NodeId,
        kind: String,
        group: Option<String>,
        payload: Vec<u8>,
        timeout: Duration,
        reply: Responder,
    },
    JoinGroup {
        name: String,
        reply: Reply<GroupHandle>,
    },
    LeaveGroup {
        name: String,
        handle: GroupHandle,
    },
    GroupMembers {
        name: String,
        reply: Reply<Vec<NodeId>>,
    },
    Groups(Reply<Vec<GroupSummary>>),
    RegisterValue {
        name: String,
        initial: Value,
        strategy: Box<dyn PatchStrategy>,
        reply: Reply<Result<(), SyncError>>,
    },
    SetValue {
        name: String,
        value: Value,
        reply: Reply<Result<u64, SyncError>>,
    },
    RemoteValue {
        name: String,
        node: NodeId,
        reply: Reply<Option<(u64, Value)>>,
    },
    Route {
        target: NodeId,
        reply: Reply<Option<Route>>,
    },
    Reachable(Reply<Vec<NodeId>>),
    Snapshot(Reply<TopologySnapshot>),
    BroadcastTimer,
    Timeout {
        seq: Seq,
        token: u64,
    },
    SyncExpire,
    #[cfg(test)]
    ArmedTimers(Reply<usize>),
    Shutdown,
}

pub struct MeshNode {
    local: NodeId,
    config: MeshConfig,
    topology: TopologyManager,
    pending: PendingTable,
    /// Timeout timers of unresolved sends
    timers: HashMap<Seq, AbortHandle>,
    groups: GroupRegistry,
    synced: SyncedValues,
    filter: Box<dyn MessageFilter>,
    events: broadcast::Sender<MeshEvent>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl MeshNode {
    /// Start a node that accepts every data message
    pub fn spawn(config: MeshConfig, local: NodeId) -> NodeHandle {
        Self::spawn_with_filter(config, local, Box::new(AcceptAll))
    }

    pub fn spawn_with_filter(
        config: MeshConfig,
        local: NodeId,
        filter: Box<dyn MessageFilter>,
    ) -> NodeHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = NodeHandle {
            local,
            commands: tx.clone(),
            events: events.clone(),
            default_timeout: config.message_timeout(),
        };

        let node = MeshNode {
            local,
            topology: TopologyManager::new(local, config.clone()),
            pending: PendingTable::new(),
            timers: HashMap::new(),
            groups: GroupRegistry::new(local),
            synced: SyncedValues::new(),
            filter,
            events,
            commands: tx.downgrade(),
            config,
        };
        tokio::spawn(node.run(rx));
        handle
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        log::info!("Mesh node {} started", self.local);
        let period = self.config.probe_interval();
        let mut probe = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                _ = probe.tick() => {
                    if let Some(id) = self.topology.probe_random_peer() {
                        log::debug!("Probing latency to {}", id.short());
                    }
                }
            }
            self.after_command();
        }

        self.pending.fail_all(SendError::Shutdown);
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        log::info!("Mesh node {} stopped", self.local.short());
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::PeerConnected { handle, reply } => {
                let _ = reply.send(self.topology.peer_connected(handle));
            }
            Command::PeerDisconnected(conn) => self.topology.peer_disconnected(conn),
            Command::SetLinkCost { conn, cost } => self.topology.set_link_cost(conn, cost),
            Command::Incoming { conn, envelope } => match MeshMessage::from_envelope(&envelope) {
                Ok(message) => {
                    if let Some(packet) = self.topology.handle_message(conn, message) {
                        self.handle_routed(packet);
                    }
                }
                Err(e) => log::warn!("Dropping {} frame on conn {}: {}", envelope.kind, conn, e),
            },
            Command::Send {
                target,
                kind,
                group,
                payload,
                timeout,
                reply,
            } => self.start_send(target, kind, group, payload, timeout, reply),
            Command::JoinGroup { name, reply } => {
                let (handle, announce) = self.groups.join_local(&name);
                if announce {
                    self.announce(RoutedBody::GroupJoin { group: name });
                }
                let _ = reply.send(handle);
            }
            Command::LeaveGroup { name, handle } => {
                if self.groups.leave_local(&name, handle) {
                    self.announce(RoutedBody::GroupLeave { group: name });
                }
            }
            Command::GroupMembers { name, reply } => {
                let _ = reply.send(self.groups.members(&name));
            }
            Command::Groups(reply) => {
                let _ = reply.send(self.groups.summaries());
            }
            Command::RegisterValue {
                name,
                initial,
                strategy,
                reply,
            } => {
                let available = self.topology.reachable();
                let result = self
                    .synced
                    .register(&name, initial, strategy, &available)
                    .map(|outbox| self.send_all(outbox));
                let _ = reply.send(result);
            }
            Command::SetValue { name, value, reply } => {
                let result = self.synced.set(&name, value).map(|(version, outbox)| {
                    self.send_all(outbox);
                    version
                });
                let _ = reply.send(result);
            }
            Command::RemoteValue { name, node, reply } => {
                let _ = reply.send(self.synced.remote_value(&name, &node));
            }
            Command::Route { target, reply } => {
                let _ = reply.send(self.topology.route(&target));
            }
            Command::Reachable(reply) => {
                let _ = reply.send(self.topology.reachable());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.topology.snapshot());
            }
            Command::BroadcastTimer => {
                self.topology.flush_broadcast();
            }
            Command::Timeout { seq, token } => {
                if self.pending.expire(seq, token) {
                    self.timers.remove(&seq);
                }
            }
            Command::SyncExpire => {
                self.synced.expire(Instant::now());
            }
            #[cfg(test)]
            Command::ArmedTimers(reply) => {
                let _ = reply.send(self.timers.len());
            }
            Command::Shutdown => {}
        }
    }

    /// Arm the debounce timer if asked and act on reachability changes
    fn after_command(&mut self) {
        if self.topology.take_timer_request() {
            self.schedule(self.config.broadcast_debounce(), Command::BroadcastTimer);
        }
        loop {
            let transitions = self.topology.refresh();
            if transitions.is_empty() {
                break;
            }
            for transition in transitions {
                match transition {
                    Availability::Available(id) => self.node_available(id),
                    Availability::Unavailable(id) => self.node_unavailable(id),
                }
            }
        }
    }

    fn node_available(&mut self, id: NodeId) {
        self.emit(MeshEvent::NodeAvailable(id));
        self.send_routed(id, RoutedBody::GroupQuery);
        let outbox = self.synced.node_available(id);
        self.send_all(outbox);
    }

    fn node_unavailable(&mut self, id: NodeId) {
        self.emit(MeshEvent::NodeUnavailable(id));
        for change in self.groups.node_unavailable(&id) {
            self.emit(change.into());
        }
        // Sends awaiting `id` are left to their own deadlines
        let grace = self.config.sync_grace();
        self.synced.node_unavailable(&id, Instant::now() + grace);
        self.schedule(grace, Command::SyncExpire);
    }

    fn start_send(
        &mut self,
        target: NodeId,
        kind: String,
        group: Option<String>,
        payload: Vec<u8>,
        timeout: Duration,
        reply: Responder,
    ) {
        if target != self.local && !self.topology.is_reachable(&target) {
            log::debug!("Send of {} to {} failed: unreachable", kind, target.short());
            let _ = reply.send(Err(SendError::Unreachable(target)));
            return;
        }

        let (seq, token) = self.pending.register(target, reply);
        let body = RoutedBody::Data {
            seq,
            kind,
            group,
            payload,
        };
        if !self.send_routed(target, body) {
            self.pending.fail(seq, SendError::Unreachable(target));
            return;
        }
        // Local delivery resolves immediately
        if self.pending.contains(seq) {
            if let Some(timer) = self.schedule(timeout, Command::Timeout { seq, token }) {
                self.timers.insert(seq, timer);
            }
        }
    }

    fn handle_routed(&mut self, packet: RoutedPacket) {
        let source = packet.source;
        log::trace!("{} from {}", packet.body.type_name(), source.short());

        match packet.body {
            RoutedBody::Data {
                seq,
                kind,
                group,
                payload,
            } => {
                let verdict = match &group {
                    Some(name) if !self.groups.is_local_member(name) => {
                        Err(format!("not a member of group {}", name))
                    }
                    _ => self.filter.check(&source, &kind, &payload),
                };
                match verdict {
                    Ok(()) => {
                        self.emit(MeshEvent::Data(Delivery {
                            source,
                            kind,
                            group,
                            payload,
                        }));
                        self.send_routed(source, RoutedBody::Ack { seq });
                    }
                    Err(reason) => {
                        log::warn!("Rejecting {} from {}: {}", kind, source.short(), reason);
                        self.send_routed(source, RoutedBody::Reject { seq, reason });
                    }
                }
            }
            RoutedBody::Ack { seq } => {
                if self.pending.resolve_ack(&source, seq) {
                    self.cancel_timer(seq);
                }
            }
            RoutedBody::Reject { seq, reason } => {
                if self.pending.resolve_reject(&source, seq, reason) {
                    self.cancel_timer(seq);
                }
            }
            RoutedBody::GroupJoin { group } => {
                if self.groups.remote_join(&group, source) {
                    self.emit(MeshEvent::GroupMemberJoined {
                        group,
                        node: source,
                    });
                }
            }
            RoutedBody::GroupLeave { group } => {
                if self.groups.remote_leave(&group, &source) {
                    self.emit(MeshEvent::GroupMemberLeft {
                        group,
                        node: source,
                    });
                }
            }
            RoutedBody::GroupQuery => {
                let groups = self.groups.groups_of_local();
                self.send_routed(source, RoutedBody::GroupList { groups });
            }
            RoutedBody::GroupList { groups } => {
                for change in self.groups.reconcile(source, &groups) {
                    self.emit(change.into());
                }
            }
            body @ (RoutedBody::SyncRequest { .. }
            | RoutedBody::SyncPatch(_)
            | RoutedBody::SyncAck { .. }) => {
                let (update, outbox) = self.synced.dispatch(source, body);
                if let Some(update) = update {
                    self.emit(MeshEvent::ValueUpdated(update));
                }
                self.send_all(outbox);
            }
        }
    }

    /// Route a packet originating here. Returns `false` when it was dropped.
    fn send_routed(&mut self, target: NodeId, body: RoutedBody) -> bool {
        let packet = RoutedPacket {
            source: self.local,
            target,
            ttl: self.config.max_hops,
            body,
        };
        match self.topology.forward(packet) {
            Forwarded::Sent => true,
            Forwarded::Local(packet) => {
                self.handle_routed(packet);
                true
            }
            Forwarded::Dropped => false,
        }
    }

    fn send_all(&mut self, outbox: Outbox) {
        for (target, body) in outbox {
            self.send_routed(target, body);
        }
    }

    /// Best-effort fan-out to every reachable node
    fn announce(&mut self, body: RoutedBody) {
        for id in self.topology.reachable() {
            if !self.send_routed(id, body.clone()) {
                log::warn!("Could not announce {} to {}", body.type_name(), id.short());
            }
        }
    }

    fn emit(&self, event: MeshEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn schedule(&self, delay: Duration, command: Command) -> Option<AbortHandle> {
        let commands = self.commands.upgrade()?;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(command);
        });
        Some(task.abort_handle())
    }

    fn cancel_timer(&mut self, seq: Seq) {
        if let Some(timer) = self.timers.remove(&seq) {
            timer.abort();
        }
    }
}

/// Cloneable handle to a running [`MeshNode`]
#[derive(Clone)]
pub struct NodeHandle {
    local: NodeId,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<MeshEvent>,
    default_timeout: Duration,
}

impl NodeHandle {
    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    fn command(&self, command: Command) -> Result<(), NodeError> {
        self.commands.send(command).map_err(|_| NodeError::Stopped)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.command(make(tx))?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Reliable send with the configured default deadline
    pub async fn send(&self, target: NodeId, kind: &str, payload: Vec<u8>) -> SendResult {
        self.send_with_timeout(target, kind, payload, self.default_timeout)
            .await
    }

    pub async fn send_with_timeout(
        &self,
        target: NodeId,
        kind: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> SendResult {
        self.send_inner(target, kind, None, payload, timeout).await
    }

    async fn send_inner(
        &self,
        target: NodeId,
        kind: &str,
        group: Option<String>,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> SendResult {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                target,
                kind: kind.to_string(),
                group,
                payload,
                timeout,
                reply: tx,
            })
            .map_err(|_| SendError::Shutdown)?;
        rx.await.unwrap_or(Err(SendError::Shutdown))
    }

    /// Send to every other member of `group`, returning each member's
    /// outcome
    pub async fn send_to_group(
        &self,
        group: &str,
        kind: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<(NodeId, SendResult)>, NodeError> {
        let members = self.group_members(group).await?;
        let sends = members
            .into_iter()
            .filter(|member| *member != self.local)
            .map(|member| {
                let payload = payload.clone();
                async move {
                    let result = self
                        .send_inner(
                            member,
                            kind,
                            Some(group.to_string()),
                            payload,
                            self.default_timeout,
                        )
                        .await;
                    (member, result)
                }
            });
        Ok(futures::future::join_all(sends).await)
    }

    pub async fn join_group(&self, name: &str) -> Result<GroupHandle, NodeError> {
        self.request(|reply| Command::JoinGroup {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub fn leave_group(&self, name: &str, handle: GroupHandle) -> Result<(), NodeError> {
        self.command(Command::LeaveGroup {
            name: name.to_string(),
            handle,
        })
    }

    pub async fn group_members(&self, name: &str) -> Result<Vec<NodeId>, NodeError> {
        self.request(|reply| Command::GroupMembers {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn groups(&self) -> Result<Vec<GroupSummary>, NodeError> {
        self.request(Command::Groups).await
    }

    pub async fn register_value(
        &self,
        name: &str,
        initial: Value,
        strategy: Box<dyn PatchStrategy>,
    ) -> Result<(), NodeError> {
        let result = self
            .request(|reply| Command::RegisterValue {
                name: name.to_string(),
                initial,
                strategy,
                reply,
            })
            .await?;
        Ok(result?)
    }

    /// Publish a new local value. Returns its version.
    pub async fn set_value(&self, name: &str, value: Value) -> Result<u64, NodeError> {
        let result = self
            .request(|reply| Command::SetValue {
                name: name.to_string(),
                value,
                reply,
            })
            .await?;
        Ok(result?)
    }

    pub async fn remote_value(
        &self,
        name: &str,
        node: NodeId,
    ) -> Result<Option<(u64, Value)>, NodeError> {
        self.request(|reply| Command::RemoteValue {
            name: name.to_string(),
            node,
            reply,
        })
        .await
    }

    pub async fn route(&self, target: NodeId) -> Result<Option<Route>, NodeError> {
        self.request(|reply| Command::Route { target, reply }).await
    }

    pub async fn reachable(&self) -> Result<Vec<NodeId>, NodeError> {
        self.request(Command::Reachable).await
    }

    pub async fn snapshot(&self) -> Result<TopologySnapshot, NodeError> {
        self.request(Command::Snapshot).await
    }

    /// Admit an authenticated connection. `false` when the node refused it.
    pub async fn peer_connected(&self, handle: PeerHandle) -> Result<bool, NodeError> {
        self.request(|reply| Command::PeerConnected { handle, reply })
            .await
    }

    pub fn peer_disconnected(&self, conn: ConnId) -> Result<(), NodeError> {
        self.command(Command::PeerDisconnected(conn))
    }

    pub fn set_link_cost(&self, conn: ConnId, cost: u32) -> Result<(), NodeError> {
        self.command(Command::SetLinkCost { conn, cost })
    }

    /// Hand a frame received on `conn` to the node
    pub fn deliver(&self, conn: ConnId, envelope: Envelope) -> Result<(), NodeError> {
        self.command(Command::Incoming { conn, envelope })
    }

    pub fn shutdown(&self) {
        let _ = self.command(Command::Shutdown);
    }
}
