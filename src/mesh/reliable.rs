//! Reliable point-to-point delivery
//!
//! Every data message carries a sequence id. The sender keeps one pending
//! entry per id until the receiver acknowledges or rejects it, or the
//! deadline passes.

use crate::mesh::identity::NodeId;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::oneshot;

pub type Seq = u32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),
    #[error("no acknowledgement before the deadline")]
    Timeout,
    #[error("rejected by receiver: {0}")]
    Rejected(String),
    #[error("mesh node is shutting down")]
    Shutdown,
}

pub type SendResult = Result<(), SendError>;

/// Completion side of a reliable send
pub type Responder = oneshot::Sender<SendResult>;

struct Pending {
    target: NodeId,
    /// Distinguishes this entry from a later one reusing the same seq
    token: u64,
    responder: Responder,
}

/// In-flight sends keyed by sequence id
#[derive(Default)]
pub struct PendingTable {
    next_seq: Seq,
    next_token: u64,
    entries: HashMap<Seq, Pending>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a send to `target`. Returns the allocated sequence id and the
    /// token a timeout must present to expire it.
    pub fn register(&mut self, target: NodeId, responder: Responder) -> (Seq, u64) {
        let mut seq = self.next_seq;
        while self.entries.contains_key(&seq) {
            seq = seq.wrapping_add(1);
        }
        self.next_seq = seq.wrapping_add(1);
        self.next_token += 1;

        let token = self.next_token;
        self.entries.insert(
            seq,
            Pending {
                target,
                token,
                responder,
            },
        );
        (seq, token)
    }

    /// Acknowledgement from `from`. Acks from any node other than the
    /// original target are ignored.
    pub fn resolve_ack(&mut self, from: &NodeId, seq: Seq) -> bool {
        self.resolve(from, seq, Ok(()))
    }

    pub fn resolve_reject(&mut self, from: &NodeId, seq: Seq, reason: String) -> bool {
        self.resolve(from, seq, Err(SendError::Rejected(reason)))
    }

    fn resolve(&mut self, from: &NodeId, seq: Seq, result: SendResult) -> bool {
        match self.entries.get(&seq) {
            Some(pending) if pending.target == *from => {}
            Some(_) => {
                log::warn!("Ignoring answer for seq {} from non-target {}", seq, from.short());
                return false;
            }
            None => {
                log::debug!("Answer for unknown seq {} from {}", seq, from.short());
                return false;
            }
        }
        self.complete(seq, result)
    }

    /// Fire the deadline of `seq`. A token from an earlier use of the same
    /// id does nothing.
    pub fn expire(&mut self, seq: Seq, token: u64) -> bool {
        if self.entries.get(&seq).map(|p| p.token) != Some(token) {
            return false;
        }
        log::debug!("Seq {} timed out", seq);
        self.complete(seq, Err(SendError::Timeout))
    }

    pub fn fail(&mut self, seq: Seq, error: SendError) -> bool {
        self.complete(seq, Err(error))
    }

    pub fn fail_all(&mut self, error: SendError) {
        for (_, pending) in self.entries.drain() {
            let _ = pending.responder.send(Err(error.clone()));
        }
    }

    fn complete(&mut self, seq: Seq, result: SendResult) -> bool {
        match self.entries.remove(&seq) {
            Some(pending) => {
                // The caller may have stopped waiting
                let _ = pending.responder.send(result);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, seq: Seq) -> bool {
        self.entries.contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Receiver-side validation of incoming data messages. Returning an error
/// rejects the message with that reason.
pub trait MessageFilter: Send + 'static {
    fn check(&self, source: &NodeId, kind: &str, payload: &[u8]) -> Result<(), String>;
}

/// Accepts every message
pub struct AcceptAll;

impl MessageFilter for AcceptAll {
    fn check(&self, _source: &NodeId, _kind: &str, _payload: &[u8]) -> Result<(), String> {
        Ok(())
    }
}

/// Accepts only the listed message kinds
pub struct KindAllowList(pub Vec<String>);

impl MessageFilter for KindAllowList {
    fn check(&self, _source: &NodeId, kind: &str, _payload: &[u8]) -> Result<(), String> {
        if self.0.iter().any(|k| k == kind) {
            Ok(())
        } else {
            Err(format!("unsupported message kind {}", kind))
        }
    }
}
