//! Federator Mesh: authenticated coordination network for bridge federators
//!
//! This crate lets a small set of federator processes find each other over
//! a partially connected network and cooperate:
//! - Gossip-based topology with shortest-path (Dijkstra) routing
//! - Reliable point-to-point delivery with ack, reject and timeout
//! - Named groups with membership reconciliation
//! - Synchronized per-node values with versioned patches
//! - secp256k1 challenge-response authentication against a federator registry
//! - Quorum batch signing against the transfer contract boundary
//!
//! # Example
//!
//! ```rust,no_run
//! use federator_mesh::config::MeshConfig;
//! use federator_mesh::mesh::{MeshNode, NodeId};
//! use federator_mesh::network::memory;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let a = MeshNode::spawn(MeshConfig::default(), NodeId::random());
//! let b = MeshNode::spawn(MeshConfig::default(), NodeId::random());
//! let _link = memory::link(&a, &b, 10).await?;
//!
//! a.send(b.local_id(), "greeting", b"hello".to_vec()).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod federation;
pub mod mesh;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use api::{create_router, ApiState};
pub use auth::{AuthError, FederatorRegistry, JsonFileRegistry, StaticRegistry};
pub use config::{MeshConfig, NodeConfig};
pub use crypto::{Address, KeyPair};
pub use federation::{BatchSignature, FederationService, TransferBatch, TransferStatus};
pub use mesh::{MeshEvent, MeshNode, NodeHandle, NodeId, SendError};
pub use network::{Node, PeerError};
pub use storage::EventStore;
