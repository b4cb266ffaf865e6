//! Challenge-response peer authentication
//!
//! Both sides prove control of a key whose address is in the federator
//! registry. The flow, after each side has sent its transport key material:
//!
//! ```text
//! client                                   server
//!   ClientHello { node_id, challenge, tag } ->
//!        <- ServerHello { node_id, challenge, tag, sig(client challenge) }
//!   ClientProof { sig(server challenge) }   ->
//!                                          <- ServerAccept
//! ```
//!
//! Each signature covers keccak256(domain ‖ signer node id ‖ challenge ‖
//! signer tag). Tags are derived from both sides' transport material, so a
//! proof relayed into a different connection does not verify.
//!
//! Any failed check moves the state machine to a terminal failed state and
//! yields the opaque [`AuthError::Rejected`]; the cause is only logged.

use crate::auth::registry::{FederatorRegistry, RegistryError};
use crate::crypto::{keccak256_parts, recover_address, sha256, Address, KeyError, KeyPair};
use crate::mesh::identity::NodeId;
use crate::mesh::message::{hex_bytes, Envelope, MessageError};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Domain separator of handshake signatures
pub const AUTH_DOMAIN: &[u8] = b"federator-mesh/auth/v1";
pub const CHALLENGE_LEN: usize = 32;

pub const KIND_TRANSPORT_HELLO: &str = "auth.transport-hello";
pub const KIND_CLIENT_HELLO: &str = "auth.client-hello";
pub const KIND_SERVER_HELLO: &str = "auth.server-hello";
pub const KIND_CLIENT_PROOF: &str = "auth.client-proof";
pub const KIND_SERVER_ACCEPT: &str = "auth.server-accept";
pub const KIND_REJECT: &str = "auth.reject";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("handshake rejected")]
    Rejected,
}

/// Detailed cause of a rejection; never sent to the peer
#[derive(Error, Debug)]
enum Failure {
    #[error("unexpected {0} message")]
    OutOfOrder(&'static str),
    #[error("security tag does not match this connection")]
    TagMismatch,
    #[error("peer claims our own node id")]
    OwnNodeId,
    #[error("challenge has the wrong length")]
    BadChallenge,
    #[error("bad signature: {0}")]
    BadSignature(#[from] KeyError),
    #[error("{0} is not an authorized federator")]
    Unauthorized(Address),
    #[error("registry lookup failed: {0}")]
    Registry(#[from] RegistryError),
}

fn reject(failure: Failure) -> AuthError {
    log::warn!("Handshake rejected: {}", failure);
    AuthError::Rejected
}

/// Transport key material of both ends of one connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSecurityContext {
    pub local_material: Vec<u8>,
    pub remote_material: Vec<u8>,
}

impl PeerSecurityContext {
    pub fn new(local_material: Vec<u8>, remote_material: Vec<u8>) -> Self {
        Self {
            local_material,
            remote_material,
        }
    }

    /// Tag this side presents
    pub fn local_tag(&self) -> [u8; 32] {
        sha256(&[self.local_material.as_slice(), &self.remote_material].concat())
    }

    /// Tag the other side must present on this connection
    pub fn expected_remote_tag(&self) -> [u8; 32] {
        sha256(&[self.remote_material.as_slice(), &self.local_material].concat())
    }
}

/// Digest signed to answer `challenge`
pub fn auth_digest(signer: &NodeId, challenge: &[u8], tag: &[u8]) -> [u8; 32] {
    keccak256_parts(&[AUTH_DOMAIN, signer.as_bytes(), challenge, tag])
}

fn new_challenge() -> Vec<u8> {
    let mut challenge = vec![0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportHello {
    #[serde(with = "hex_bytes")]
    pub material: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub node_id: NodeId,
    #[serde(with = "hex_bytes")]
    pub challenge: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub tag: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub node_id: NodeId,
    #[serde(with = "hex_bytes")]
    pub challenge: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub tag: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProof {
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAccept {}

/// Frames exchanged before a connection is admitted to the mesh
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthMessage {
    TransportHello(TransportHello),
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    ClientProof(ClientProof),
    ServerAccept(ServerAccept),
    Reject,
}

impl AuthMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMessage::TransportHello(_) => KIND_TRANSPORT_HELLO,
            AuthMessage::ClientHello(_) => KIND_CLIENT_HELLO,
            AuthMessage::ServerHello(_) => KIND_SERVER_HELLO,
            AuthMessage::ClientProof(_) => KIND_CLIENT_PROOF,
            AuthMessage::ServerAccept(_) => KIND_SERVER_ACCEPT,
            AuthMessage::Reject => KIND_REJECT,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, MessageError> {
        let kind = self.kind();
        match self {
            AuthMessage::TransportHello(m) => Envelope::encode(kind, m),
            AuthMessage::ClientHello(m) => Envelope::encode(kind, m),
            AuthMessage::ServerHello(m) => Envelope::encode(kind, m),
            AuthMessage::ClientProof(m) => Envelope::encode(kind, m),
            AuthMessage::ServerAccept(m) => Envelope::encode(kind, m),
            AuthMessage::Reject => Envelope::encode(kind, &ServerAccept {}),
        }
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, MessageError> {
        match envelope.kind.as_str() {
            KIND_TRANSPORT_HELLO => Ok(AuthMessage::TransportHello(envelope.decode()?)),
            KIND_CLIENT_HELLO => Ok(AuthMessage::ClientHello(envelope.decode()?)),
            KIND_SERVER_HELLO => Ok(AuthMessage::ServerHello(envelope.decode()?)),
            KIND_CLIENT_PROOF => Ok(AuthMessage::ClientProof(envelope.decode()?)),
            KIND_SERVER_ACCEPT => Ok(AuthMessage::ServerAccept(envelope.decode()?)),
            KIND_REJECT => Ok(AuthMessage::Reject),
            other => Err(MessageError::UnknownKind(other.to_string())),
        }
    }
}

/// Identity proven by a completed handshake
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthenticatedPeer {
    pub node_id: NodeId,
    pub address: Address,
}

/// Signing identity of the local node
#[derive(Clone, Debug)]
pub struct Credentials {
    pub node_id: NodeId,
    pub keys: KeyPair,
}

impl Credentials {
    pub fn new(node_id: NodeId, keys: KeyPair) -> Self {
        Self { node_id, keys }
    }

    fn answer(&self, challenge: &[u8], tag: &[u8]) -> Result<Vec<u8>, Failure> {
        let digest = auth_digest(&self.node_id, challenge, tag);
        Ok(self.keys.sign_recoverable(&digest)?.to_vec())
    }
}

/// Recover the signer of an answer to `challenge` and check it is a federator
fn verify_answer(
    registry: &dyn FederatorRegistry,
    signer: &NodeId,
    challenge: &[u8],
    tag: &[u8],
    signature: &[u8],
) -> Result<Address, Failure> {
    let digest = auth_digest(signer, challenge, tag);
    let address = recover_address(&digest, signature)?;
    if !registry.is_authorized(&address)? {
        return Err(Failure::Unauthorized(address));
    }
    Ok(address)
}

enum ClientState {
    Start,
    AwaitServerHello,
    AwaitAccept(AuthenticatedPeer),
    Done,
    Failed,
}

/// Initiating side of the handshake
pub struct ClientHandshake {
    credentials: Credentials,
    context: PeerSecurityContext,
    registry: Arc<dyn FederatorRegistry>,
    challenge: Vec<u8>,
    state: ClientState,
}

impl ClientHandshake {
    pub fn new(
        credentials: Credentials,
        context: PeerSecurityContext,
        registry: Arc<dyn FederatorRegistry>,
    ) -> Self {
        Self {
            credentials,
            context,
            registry,
            challenge: new_challenge(),
            state: ClientState::Start,
        }
    }

    pub fn hello(&mut self) -> Result<ClientHello, AuthError> {
        if !matches!(self.state, ClientState::Start) {
            return Err(self.fail(Failure::OutOfOrder("client hello")));
        }
        self.state = ClientState::AwaitServerHello;
        Ok(ClientHello {
            node_id: self.credentials.node_id,
            challenge: self.challenge.clone(),
            tag: self.context.local_tag().to_vec(),
        })
    }

    pub fn on_server_hello(&mut self, hello: ServerHello) -> Result<ClientProof, AuthError> {
        match self.check_server_hello(hello) {
            Ok((peer, proof)) => {
                self.state = ClientState::AwaitAccept(peer);
                Ok(proof)
            }
            Err(failure) => Err(self.fail(failure)),
        }
    }

    fn check_server_hello(
        &self,
        hello: ServerHello,
    ) -> Result<(AuthenticatedPeer, ClientProof), Failure> {
        if !matches!(self.state, ClientState::AwaitServerHello) {
            return Err(Failure::OutOfOrder("server hello"));
        }
        if hello.tag != self.context.expected_remote_tag() {
            return Err(Failure::TagMismatch);
        }
        if hello.node_id == self.credentials.node_id {
            return Err(Failure::OwnNodeId);
        }
        if hello.challenge.len() != CHALLENGE_LEN {
            return Err(Failure::BadChallenge);
        }
        let address = verify_answer(
            self.registry.as_ref(),
            &hello.node_id,
            &self.challenge,
            &hello.tag,
            &hello.signature,
        )?;

        let signature = self
            .credentials
            .answer(&hello.challenge, &self.context.local_tag())?;
        let peer = AuthenticatedPeer {
            node_id: hello.node_id,
            address,
        };
        Ok((peer, ClientProof { signature }))
    }

    pub fn on_accept(&mut self, _accept: ServerAccept) -> Result<AuthenticatedPeer, AuthError> {
        match std::mem::replace(&mut self.state, ClientState::Done) {
            ClientState::AwaitAccept(peer) => {
                log::info!(
                    "Authenticated server {} as {}",
                    peer.node_id.short(),
                    peer.address
                );
                Ok(peer)
            }
            _ => Err(self.fail(Failure::OutOfOrder("server accept"))),
        }
    }

    fn fail(&mut self, failure: Failure) -> AuthError {
        self.state = ClientState::Failed;
        reject(failure)
    }
}

enum ServerState {
    AwaitClientHello,
    AwaitProof(NodeId),
    Done,
    Failed,
}

/// Accepting side of the handshake
pub struct ServerHandshake {
    credentials: Credentials,
    context: PeerSecurityContext,
    registry: Arc<dyn FederatorRegistry>,
    challenge: Vec<u8>,
    state: ServerState,
}

impl ServerHandshake {
    pub fn new(
        credentials: Credentials,
        context: PeerSecurityContext,
        registry: Arc<dyn FederatorRegistry>,
    ) -> Self {
        Self {
            credentials,
            context,
            registry,
            challenge: new_challenge(),
            state: ServerState::AwaitClientHello,
        }
    }

    pub fn on_client_hello(&mut self, hello: ClientHello) -> Result<ServerHello, AuthError> {
        match self.check_client_hello(&hello) {
            Ok(reply) => {
                self.state = ServerState::AwaitProof(hello.node_id);
                Ok(reply)
            }
            Err(failure) => Err(self.fail(failure)),
        }
    }

    fn check_client_hello(&self, hello: &ClientHello) -> Result<ServerHello, Failure> {
        if !matches!(self.state, ServerState::AwaitClientHello) {
            return Err(Failure::OutOfOrder("client hello"));
        }
        if hello.tag != self.context.expected_remote_tag() {
            return Err(Failure::TagMismatch);
        }
        if hello.node_id == self.credentials.node_id {
            return Err(Failure::OwnNodeId);
        }
        if hello.challenge.len() != CHALLENGE_LEN {
            return Err(Failure::BadChallenge);
        }
        let tag = self.context.local_tag();
        Ok(ServerHello {
            node_id: self.credentials.node_id,
            challenge: self.challenge.clone(),
            tag: tag.to_vec(),
            signature: self.credentials.answer(&hello.challenge, &tag)?,
        })
    }

    pub fn on_client_proof(
        &mut self,
        proof: ClientProof,
    ) -> Result<(ServerAccept, AuthenticatedPeer), AuthError> {
        let ServerState::AwaitProof(client) = self.state else {
            return Err(self.fail(Failure::OutOfOrder("client proof")));
        };
        let verified = verify_answer(
            self.registry.as_ref(),
            &client,
            &self.challenge,
            &self.context.expected_remote_tag(),
            &proof.signature,
        );
        match verified {
            Ok(address) => {
                self.state = ServerState::Done;
                log::info!("Authenticated client {} as {}", client.short(), address);
                Ok((
                    ServerAccept {},
                    AuthenticatedPeer {
                        node_id: client,
                        address,
                    },
                ))
            }
            Err(failure) => Err(self.fail(failure)),
        }
    }

    fn fail(&mut self, failure: Failure) -> AuthError {
        self.state = ServerState::Failed;
        reject(failure)
    }
}
