//! Peer connection handles
//!
//! A [`PeerHandle`] is the mesh's reference to one live, authenticated
//! connection. The transport owns the socket; the mesh only holds the
//! sending half of the connection's outbound queue.

use crate::auth::AuthError;
use crate::crypto::Address;
use crate::mesh::identity::NodeId;
use crate::mesh::message::{Envelope, MessageError};
use crate::mesh::node::NodeError;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Mesh node error: {0}")]
    Node(#[from] NodeError),
    #[error("Connection refused by the mesh node")]
    Refused,
}

/// Identifier of one transport connection
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique connection id
pub fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Handle for sending frames to a directly connected peer
#[derive(Clone, Debug)]
pub struct PeerHandle {
    pub conn_id: ConnId,
    pub node_id: NodeId,
    /// Registry address proven during the handshake; `None` on trusted links
    pub address: Option<Address>,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl PeerHandle {
    pub fn new(
        node_id: NodeId,
        address: Option<Address>,
        tx: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            conn_id: next_conn_id(),
            node_id,
            address,
            tx,
        }
    }

    /// Queue a frame for the connection's writer task. Never blocks.
    pub fn send(&self, envelope: Envelope) -> Result<(), PeerError> {
        self.tx.send(envelope).map_err(|_| PeerError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_ids_are_unique() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = PeerHandle::new(NodeId::random(), None, tx.clone());
        let b = PeerHandle::new(NodeId::random(), None, tx);
        assert_ne!(a.conn_id, b.conn_id);
    }

    #[test]
    fn test_send_after_close_reports_disconnect() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = PeerHandle::new(NodeId::random(), None, tx);
        let envelope = Envelope {
            kind: "mesh.probe".into(),
            payload: b"{\"nonce\":1}".to_vec(),
        };
        assert!(handle.send(envelope.clone()).is_ok());

        drop(rx);
        assert!(handle.is_closed());
        assert!(matches!(handle.send(envelope), Err(PeerError::Disconnected)));
    }
}
