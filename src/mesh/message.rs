//! Mesh wire messages
//!
//! Every frame is an [`Envelope`]: a kind string plus an opaque payload. Mesh
//! payloads are JSON so a peer running a newer build can still decode what it
//! understands and skip the rest.

use crate::mesh::graph::RoutingEdge;
use crate::mesh::identity::NodeId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const KIND_SUMMARY: &str = "mesh.summary";
pub const KIND_DETAILS_REQUEST: &str = "mesh.details-request";
pub const KIND_DETAILS: &str = "mesh.details";
pub const KIND_PROBE: &str = "mesh.probe";
pub const KIND_PROBE_REPLY: &str = "mesh.probe-reply";
pub const KIND_ROUTED: &str = "mesh.routed";

/// Default hop budget of a routed packet
pub const DEFAULT_TTL: u8 = 16;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("unknown message kind: {0}")]
    UnknownKind(String),
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Outer frame exchanged between directly connected peers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub kind: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Serialize `body` as the payload of a frame of the given kind
    pub fn encode<T: Serialize>(kind: &str, body: &T) -> Result<Self, MessageError> {
        Ok(Self {
            kind: kind.to_string(),
            payload: serde_json::to_vec(body)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Hex encoding for binary fields inside JSON payloads
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Routing-state digest broadcast after topology changes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Sender's own routing version
    pub version: u64,
    /// Every other node the sender can currently reach
    pub nodes: Vec<NodeVersion>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeVersion {
    pub id: NodeId,
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailsRequest {
    pub ids: Vec<NodeId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Details {
    pub entries: Vec<NodeDetails>,
}

/// Full neighbour list of one node at a given version
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDetails {
    pub id: NodeId,
    pub version: u64,
    pub edges: Vec<RoutingEdge>,
}

/// Latency probe; answered with the same nonce
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub nonce: u64,
}

/// How a [`ValuePatch`] is applied to the receiver's copy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchEncoding {
    /// The patch is the whole new value
    Full,
    /// JSON merge patch (RFC 7396) against the base version
    MergePatch,
}

/// One incremental step of a synchronized value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValuePatch {
    pub name: String,
    /// Version the receiver must currently hold for the patch to apply
    pub base_version: u64,
    pub version: u64,
    pub encoding: PatchEncoding,
    pub patch: serde_json::Value,
}

/// End-to-end payload carried across intermediaries
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoutedBody {
    Data {
        seq: u32,
        kind: String,
        group: Option<String>,
        #[serde(with = "hex_bytes")]
        payload: Vec<u8>,
    },
    Ack {
        seq: u32,
    },
    Reject {
        seq: u32,
        reason: String,
    },
    GroupJoin {
        group: String,
    },
    GroupLeave {
        group: String,
    },
    GroupQuery,
    GroupList {
        groups: Vec<String>,
    },
    SyncRequest {
        name: String,
        known_version: u64,
    },
    SyncPatch(ValuePatch),
    SyncAck {
        name: String,
        version: u64,
    },
}

impl RoutedBody {
    pub fn type_name(&self) -> &'static str {
        match self {
            RoutedBody::Data { .. } => "Data",
            RoutedBody::Ack { .. } => "Ack",
            RoutedBody::Reject { .. } => "Reject",
            RoutedBody::GroupJoin { .. } => "GroupJoin",
            RoutedBody::GroupLeave { .. } => "GroupLeave",
            RoutedBody::GroupQuery => "GroupQuery",
            RoutedBody::GroupList { .. } => "GroupList",
            RoutedBody::SyncRequest { .. } => "SyncRequest",
            RoutedBody::SyncPatch(_) => "SyncPatch",
            RoutedBody::SyncAck { .. } => "SyncAck",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutedPacket {
    pub source: NodeId,
    pub target: NodeId,
    /// Remaining hops before the packet is dropped
    pub ttl: u8,
    pub body: RoutedBody,
}

/// Hop-by-hop mesh protocol messages
#[derive(Clone, Debug, PartialEq)]
pub enum MeshMessage {
    Summary(Summary),
    DetailsRequest(DetailsRequest),
    Details(Details),
    Probe(Probe),
    ProbeReply(Probe),
    Routed(RoutedPacket),
}

impl MeshMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            MeshMessage::Summary(_) => KIND_SUMMARY,
            MeshMessage::DetailsRequest(_) => KIND_DETAILS_REQUEST,
            MeshMessage::Details(_) => KIND_DETAILS,
            MeshMessage::Probe(_) => KIND_PROBE,
            MeshMessage::ProbeReply(_) => KIND_PROBE_REPLY,
            MeshMessage::Routed(_) => KIND_ROUTED,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, MessageError> {
        let kind = self.kind();
        match self {
            MeshMessage::Summary(m) => Envelope::encode(kind, m),
            MeshMessage::DetailsRequest(m) => Envelope::encode(kind, m),
            MeshMessage::Details(m) => Envelope::encode(kind, m),
            MeshMessage::Probe(m) => Envelope::encode(kind, m),
            MeshMessage::ProbeReply(m) => Envelope::encode(kind, m),
            MeshMessage::Routed(m) => Envelope::encode(kind, m),
        }
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, MessageError> {
        match envelope.kind.as_str() {
            KIND_SUMMARY => Ok(MeshMessage::Summary(envelope.decode()?)),
            KIND_DETAILS_REQUEST => Ok(MeshMessage::DetailsRequest(envelope.decode()?)),
            KIND_DETAILS => Ok(MeshMessage::Details(envelope.decode()?)),
            KIND_PROBE => Ok(MeshMessage::Probe(envelope.decode()?)),
            KIND_PROBE_REPLY => Ok(MeshMessage::ProbeReply(envelope.decode()?)),
            KIND_ROUTED => Ok(MeshMessage::Routed(envelope.decode()?)),
            other => Err(MessageError::UnknownKind(other.to_string())),
        }
    }
}
