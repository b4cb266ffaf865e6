//! Federator mesh
//!
//! Gossip-based routing between federator nodes with reliable delivery,
//! group membership and synchronized values on top.

pub mod graph;
pub mod groups;
pub mod identity;
pub mod message;
pub mod node;
pub mod reliable;
pub mod routing;
pub mod synced;
pub mod topology;

pub use groups::{GroupHandle, GroupSummary};
pub use identity::{IdMap, IdSet, NodeId};
pub use message::Envelope;
pub use node::{Delivery, MeshEvent, MeshNode, NodeError, NodeHandle};
pub use reliable::{AcceptAll, KindAllowList, MessageFilter, SendError, SendResult};
pub use routing::Route;
pub use synced::{FullValue, MergePatch, PatchStrategy, SyncError};
pub use topology::TopologySnapshot;
