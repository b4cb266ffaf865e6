//! Peer authentication
//!
//! Connections are admitted to the mesh only after both ends prove control
//! of a key listed in the federator registry.

pub mod handshake;
pub mod registry;

pub use handshake::{
    AuthError, AuthMessage, AuthenticatedPeer, ClientHandshake, Credentials, PeerSecurityContext,
    ServerHandshake,
};
pub use registry::{FederatorRegistry, JsonFileRegistry, RegistryError, StaticRegistry};
