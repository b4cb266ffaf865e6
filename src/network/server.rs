//! TCP server and connection handling
//!
//! Every connection, inbound or outbound, runs the same sequence: exchange
//! transport material, authenticate against the federator registry, hand a
//! [`PeerHandle`] to the mesh node, then pump frames until either side hangs
//! up.

use crate::auth::{
    AuthError, AuthMessage, AuthenticatedPeer, ClientHandshake, Credentials, FederatorRegistry,
    PeerSecurityContext, ServerHandshake,
};
use crate::auth::handshake::TransportHello;
use crate::crypto::KeyPair;
use crate::mesh::node::NodeHandle;
use crate::network::codec::MessageCodec;
use crate::network::peer::{PeerError, PeerHandle};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// Everything a connection task needs from its node
#[derive(Clone)]
pub struct ConnectionContext {
    pub node: NodeHandle,
    pub credentials: Credentials,
    pub registry: Arc<dyn FederatorRegistry>,
    pub handshake_timeout: Duration,
}

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
}

impl Server {
    /// Bind to a port on all interfaces
    pub async fn bind(port: u16) -> Result<Self, std::io::Error> {
        Self::bind_addr(&format!("0.0.0.0:{}", port)).await
    }

    pub async fn bind_addr(addr: &str) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("Server listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }

    /// Accept connections until the task is aborted
    pub async fn run(self, ctx: Arc<ConnectionContext>) {
        loop {
            match self.accept().await {
                Ok((stream, addr)) => {
                    log::info!("Incoming connection from {}", addr);
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, ctx, false).await {
                            log::warn!("Connection error with {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    log::error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Connect to a peer
pub async fn connect_to_peer(addr: &str) -> Result<(TcpStream, SocketAddr), PeerError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;

    let peer_addr = stream
        .peer_addr()
        .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;

    Ok((stream, peer_addr))
}

/// Handle a peer connection (both inbound and outbound)
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ConnectionContext>,
    outbound: bool,
) -> Result<(), PeerError> {
    handle_stream(stream, addr.to_string(), ctx, outbound).await
}

/// Authenticate and serve any byte stream; returns when the peer is gone
pub async fn handle_stream<S>(
    stream: S,
    label: String,
    ctx: Arc<ConnectionContext>,
    outbound: bool,
) -> Result<(), PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(stream, MessageCodec);

    let authenticated =
        tokio::time::timeout(ctx.handshake_timeout, authenticate(&mut framed, &ctx, outbound))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)?;
    let peer = match authenticated {
        Ok(peer) => peer,
        Err(e) => {
            if matches!(e, PeerError::Auth(_)) {
                // Best effort, the peer may already be gone
                let _ = send_auth(&mut framed, AuthMessage::Reject).await;
            }
            return Err(e);
        }
    };

    serve(framed, label, peer, &ctx).await
}

async fn serve<S>(
    framed: Framed<S, MessageCodec>,
    label: String,
    peer: AuthenticatedPeer,
    ctx: &ConnectionContext,
) -> Result<(), PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = PeerHandle::new(peer.node_id, Some(peer.address), tx);
    let conn = handle.conn_id;
    if !ctx.node.peer_connected(handle).await? {
        return Err(PeerError::Refused);
    }
    log::info!(
        "Peer {} ({}) connected from {}",
        peer.node_id.short(),
        peer.address,
        label
    );

    let (mut writer, mut reader) = framed.split();
    let mut write_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if let Err(e) = writer.send(envelope).await {
                log::debug!("Write failed: {}", e);
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(envelope)) => {
                    if ctx.node.deliver(conn, envelope).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Error reading from {}: {}", label, e);
                    break;
                }
                None => {
                    log::info!("Peer {} disconnected", label);
                    break;
                }
            },
            // The node dropped our handle
            _ = &mut write_task => break,
        }
    }

    write_task.abort();
    let _ = ctx.node.peer_disconnected(conn);
    Ok(())
}

async fn send_auth<S>(
    framed: &mut Framed<S, MessageCodec>,
    message: AuthMessage,
) -> Result<(), PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(message.to_envelope()?).await?;
    Ok(())
}

async fn recv_auth<S>(framed: &mut Framed<S, MessageCodec>) -> Result<AuthMessage, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(envelope)) => match AuthMessage::from_envelope(&envelope) {
            Ok(AuthMessage::Reject) => {
                log::debug!("Peer rejected the handshake");
                Err(AuthError::Rejected.into())
            }
            Ok(message) => Ok(message),
            Err(e) => {
                log::warn!("Invalid handshake frame: {}", e);
                Err(AuthError::Rejected.into())
            }
        },
        Some(Err(e)) => Err(e.into()),
        None => Err(PeerError::Disconnected),
    }
}

fn unexpected(message: &AuthMessage) -> PeerError {
    log::warn!("Unexpected {} during handshake", message.kind());
    AuthError::Rejected.into()
}

async fn authenticate<S>(
    framed: &mut Framed<S, MessageCodec>,
    ctx: &ConnectionContext,
    outbound: bool,
) -> Result<AuthenticatedPeer, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Ephemeral per connection so tags never repeat across connections
    let transport = KeyPair::generate();
    let local_material = transport.public_key.serialize().to_vec();
    send_auth(
        framed,
        AuthMessage::TransportHello(TransportHello {
            material: local_material.clone(),
        }),
    )
    .await?;
    let remote_material = match recv_auth(framed).await? {
        AuthMessage::TransportHello(hello) => hello.material,
        other => return Err(unexpected(&other)),
    };
    let context = PeerSecurityContext::new(local_material, remote_material);

    if outbound {
        let mut handshake =
            ClientHandshake::new(ctx.credentials.clone(), context, ctx.registry.clone());
        send_auth(framed, AuthMessage::ClientHello(handshake.hello()?)).await?;
        let proof = match recv_auth(framed).await? {
            AuthMessage::ServerHello(hello) => handshake.on_server_hello(hello)?,
            other => return Err(unexpected(&other)),
        };
        send_auth(framed, AuthMessage::ClientProof(proof)).await?;
        match recv_auth(framed).await? {
            AuthMessage::ServerAccept(accept) => Ok(handshake.on_accept(accept)?),
            other => Err(unexpected(&other)),
        }
    } else {
        let mut handshake =
            ServerHandshake::new(ctx.credentials.clone(), context, ctx.registry.clone());
        let reply = match recv_auth(framed).await? {
            AuthMessage::ClientHello(hello) => handshake.on_client_hello(hello)?,
            other => return Err(unexpected(&other)),
        };
        send_auth(framed, AuthMessage::ServerHello(reply)).await?;
        let (accept, peer) = match recv_auth(framed).await? {
            AuthMessage::ClientProof(proof) => handshake.on_client_proof(proof)?,
            other => return Err(unexpected(&other)),
        };
        send_auth(framed, AuthMessage::ServerAccept(accept)).await?;
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticRegistry;
    use crate::config::MeshConfig;
    use crate::mesh::identity::NodeId;
    use crate::mesh::node::MeshNode;

    fn context(keys: &KeyPair, registry: Arc<dyn FederatorRegistry>) -> Arc<ConnectionContext> {
        let id = NodeId::random();
        Arc::new(ConnectionContext {
            node: MeshNode::spawn(MeshConfig::default(), id),
            credentials: Credentials::new(id, keys.clone()),
            registry,
            handshake_timeout: Duration::from_secs(5),
        })
    }

    async fn wait_for_route(node: &NodeHandle, target: NodeId) -> bool {
        for _ in 0..100 {
            if node.route(target).await.unwrap().is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_authenticated_stream_joins_mesh() {
        let (ka, kb) = (KeyPair::generate(), KeyPair::generate());
        let registry: Arc<dyn FederatorRegistry> =
            Arc::new(StaticRegistry::new(vec![ka.address(), kb.address()]));
        let (a, b) = (context(&ka, registry.clone()), context(&kb, registry));
        let (sa, sb) = tokio::io::duplex(64 * 1024);

        let b_id = b.node.local_id();
        let a_node = a.node.clone();
        tokio::spawn(handle_stream(sa, "a".into(), a, true));
        tokio::spawn(handle_stream(sb, "b".into(), b, false));

        assert!(wait_for_route(&a_node, b_id).await);
        let snapshot = a_node.snapshot().await.unwrap();
        assert_eq!(snapshot.peers.len(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_client_is_refused() {
        let (ka, kb) = (KeyPair::generate(), KeyPair::generate());
        let registry: Arc<dyn FederatorRegistry> =
            Arc::new(StaticRegistry::new(vec![kb.address()]));
        let (a, b) = (context(&ka, registry.clone()), context(&kb, registry));
        let (a_node, b_node) = (a.node.clone(), b.node.clone());
        let (sa, sb) = tokio::io::duplex(64 * 1024);

        let client = tokio::spawn(handle_stream(sa, "a".into(), a, true));
        let server = tokio::spawn(handle_stream(sb, "b".into(), b, false));

        assert!(matches!(
            server.await.unwrap(),
            Err(PeerError::Auth(AuthError::Rejected))
        ));
        assert!(matches!(
            client.await.unwrap(),
            Err(PeerError::Auth(AuthError::Rejected)) | Err(PeerError::Disconnected)
        ));
        assert!(a_node.snapshot().await.unwrap().peers.is_empty());
        assert!(b_node.snapshot().await.unwrap().peers.is_empty());
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let ka = KeyPair::generate();
        let registry: Arc<dyn FederatorRegistry> =
            Arc::new(StaticRegistry::new(vec![ka.address()]));
        let mut ctx = (*context(&ka, registry)).clone();
        ctx.handshake_timeout = Duration::from_millis(50);
        let (sa, _sb) = tokio::io::duplex(1024);

        let result = handle_stream(sa, "silent".into(), Arc::new(ctx), false).await;
        assert!(matches!(result, Err(PeerError::HandshakeTimeout)));
    }
}
