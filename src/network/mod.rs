//! Networking module
//!
//! Transport for the federator mesh.
//!
//! # Features
//! - Length-prefixed framing of mesh envelopes over TCP
//! - Registry-backed authentication of every connection
//! - Redialing of bootstrap peers
//! - In-process links for trusted single-host setups

pub mod codec;
pub mod memory;
pub mod node;
pub mod peer;
pub mod server;

pub use codec::{MessageCodec, MAGIC, MAX_FRAME_SIZE};
pub use memory::{link, MemoryLink};
pub use node::Node;
pub use peer::{ConnId, PeerError, PeerHandle};
pub use server::{connect_to_peer, handle_connection, handle_stream, ConnectionContext, Server};
