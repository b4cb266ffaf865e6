//! Node identifiers and the indices keyed by them
//!
//! A [`NodeId`] is an opaque random byte string chosen at process start. It is
//! unrelated to the federator's on-chain address. Identifiers are stored as a
//! fixed-size array so two ids compare equal exactly when their bytes do, no
//! matter which buffer they were decoded from.

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of bytes in a node identifier
pub const NODE_ID_LEN: usize = 16;

/// Map keyed by node identifier. Ordered so summaries and snapshots are
/// produced in a stable order.
pub type IdMap<V> = BTreeMap<NodeId, V>;

/// Set of node identifiers
pub type IdSet = BTreeSet<NodeId>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NodeIdError {
    #[error("node id must be {NODE_ID_LEN} bytes, got {0}")]
    InvalidLength(usize),
    #[error("node id is not valid hex")]
    InvalidHex,
}

/// Opaque per-process mesh identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Generate a fresh random identifier
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        NodeId(bytes)
    }

    /// Build an identifier from a byte slice of exactly [`NODE_ID_LEN`] bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, NodeIdError> {
        let array: [u8; NODE_ID_LEN] = bytes
            .try_into()
            .map_err(|_| NodeIdError::InvalidLength(bytes.len()))?;
        Ok(NodeId(array))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Canonical hex form, used on the wire and in logs
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First four bytes in hex, for compact log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| NodeIdError::InvalidHex)?;
        NodeId::from_slice(&bytes)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(NodeId::random(), NodeId::random());
    }

    #[test]
    fn test_equal_bytes_from_different_buffers() {
        let id = NodeId::random();
        let owned: Vec<u8> = id.as_bytes().to_vec();
        let mut padded = vec![0xAA];
        padded.extend_from_slice(id.as_bytes());

        let a = NodeId::from_slice(&owned).unwrap();
        let b = NodeId::from_slice(&padded[1..]).unwrap();
        assert_eq!(a, b);

        let mut set = IdSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn test_from_slice_checks_length() {
        assert_eq!(
            NodeId::from_slice(&[1, 2, 3]),
            Err(NodeIdError::InvalidLength(3))
        );
    }

    #[test]
    fn test_hex_and_serde() {
        let id = NodeId::random();
        assert_eq!(id.to_hex().parse::<NodeId>().unwrap(), id);

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        assert_eq!("zz".parse::<NodeId>(), Err(NodeIdError::InvalidHex));
    }
}
