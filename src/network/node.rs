//! Federator network node
//!
//! Ties the transport to a mesh node: listens for inbound connections,
//! keeps dialing the configured bootstrap peers, and authenticates every
//! connection before the mesh sees it.

use crate::auth::{Credentials, FederatorRegistry};
use crate::config::NodeConfig;
use crate::crypto::{Address, KeyPair};
use crate::mesh::identity::NodeId;
use crate::mesh::node::{MeshNode, NodeHandle};
use crate::network::peer::PeerError;
use crate::network::server::{connect_to_peer, handle_connection, ConnectionContext, Server};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A running federator: mesh node plus its listener and dialers
pub struct Node {
    pub config: NodeConfig,
    ctx: Arc<ConnectionContext>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Create a node with a fresh random mesh identity
    pub fn new(config: NodeConfig, keys: KeyPair, registry: Arc<dyn FederatorRegistry>) -> Self {
        let node_id = NodeId::random();
        let mesh = MeshNode::spawn(config.mesh.clone(), node_id);
        let ctx = Arc::new(ConnectionContext {
            node: mesh,
            credentials: Credentials::new(node_id, keys),
            registry,
            handshake_timeout: config.mesh.handshake_timeout(),
        });
        Self {
            config,
            ctx,
            tasks: Vec::new(),
        }
    }

    pub fn mesh(&self) -> &NodeHandle {
        &self.ctx.node
    }

    pub fn address(&self) -> Address {
        self.ctx.credentials.keys.address()
    }

    /// Bind the listener and dial bootstrap peers. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, PeerError> {
        let server = Server::bind(self.config.port).await?;
        let local_addr = server.local_addr()?;
        self.tasks.push(tokio::spawn(server.run(self.ctx.clone())));
        log::info!(
            "Node {} ({}) started on {}",
            self.ctx.node.local_id().short(),
            self.address(),
            local_addr
        );

        for peer in self.config.bootstrap_peers.clone() {
            self.connect_to(&peer);
        }
        Ok(local_addr)
    }

    /// Keep a connection to `addr` up, redialing with backoff
    pub fn connect_to(&mut self, addr: &str) {
        let ctx = self.ctx.clone();
        let addr = addr.to_string();
        self.tasks.push(tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                match connect_to_peer(&addr).await {
                    Ok((stream, peer_addr)) => {
                        log::info!("Connected to {}", peer_addr);
                        match handle_connection(stream, peer_addr, ctx.clone(), true).await {
                            Ok(()) => backoff = INITIAL_BACKOFF,
                            Err(e) => log::warn!("Connection error with {}: {}", peer_addr, e),
                        }
                    }
                    Err(e) => log::debug!("Dial {} failed: {}", addr, e),
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }));
    }

    /// Stop the listener, the dialers and the mesh node
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.ctx.node.shutdown();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}
