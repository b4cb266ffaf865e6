//! In-process links
//!
//! Connects two mesh nodes in the same process without a socket or a
//! handshake. Used by trusted single-host deployments and by tests.

use crate::mesh::message::Envelope;
use crate::mesh::node::NodeHandle;
use crate::network::peer::{ConnId, PeerError, PeerHandle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A live in-process link. Dropping it disconnects both sides.
pub struct MemoryLink {
    ends: [(NodeHandle, ConnId); 2],
    pumps: Vec<JoinHandle<()>>,
}

impl MemoryLink {
    pub fn conn_ids(&self) -> (ConnId, ConnId) {
        (self.ends[0].1, self.ends[1].1)
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
        for (node, conn) in &self.ends {
            // The node may already be gone
            let _ = node.peer_disconnected(*conn);
        }
    }
}

/// Link `a` and `b` with the given cost on both sides
pub async fn link(a: &NodeHandle, b: &NodeHandle, cost: u32) -> Result<MemoryLink, PeerError> {
    let (tx_ab, rx_ab) = mpsc::unbounded_channel();
    let (tx_ba, rx_ba) = mpsc::unbounded_channel();
    let at_a = PeerHandle::new(b.local_id(), None, tx_ab);
    let at_b = PeerHandle::new(a.local_id(), None, tx_ba);
    let (conn_a, conn_b) = (at_a.conn_id, at_b.conn_id);

    let link = MemoryLink {
        ends: [(a.clone(), conn_a), (b.clone(), conn_b)],
        pumps: vec![pump(rx_ab, b.clone(), conn_b), pump(rx_ba, a.clone(), conn_a)],
    };

    // Dropping `link` on refusal unregisters whichever side was admitted
    if !a.peer_connected(at_a).await? || !b.peer_connected(at_b).await? {
        return Err(PeerError::Refused);
    }
    a.set_link_cost(conn_a, cost)?;
    b.set_link_cost(conn_b, cost)?;
    log::debug!(
        "Linked {} and {} in process (cost {})",
        a.local_id().short(),
        b.local_id().short(),
        cost
    );
    Ok(link)
}

fn pump(mut rx: mpsc::UnboundedReceiver<Envelope>, to: NodeHandle, conn: ConnId) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if to.deliver(conn, envelope).is_err() {
                break;
            }
        }
    })
}
