//! End-to-end mesh scenarios

use federator_mesh::auth::{FederatorRegistry, StaticRegistry};
use federator_mesh::config::{MeshConfig, NodeConfig};
use federator_mesh::crypto::KeyPair;
use federator_mesh::federation::{
    ContractError, FederationService, InMemoryTransferContract, QuorumError, TransferBatch,
    TransferContract, TransferId, TransferStatus,
};
use federator_mesh::mesh::{MeshEvent, MeshNode, NodeHandle, NodeId};
use federator_mesh::network::{memory, Node};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn fast_config() -> MeshConfig {
    MeshConfig {
        broadcast_debounce_ms: 5,
        ..MeshConfig::default()
    }
}

fn spawn_node() -> NodeHandle {
    MeshNode::spawn(fast_config(), NodeId::random())
}

/// Poll until `node` has (or lacks) a route to `target`
async fn wait_route(node: &NodeHandle, target: NodeId, present: bool) -> bool {
    for _ in 0..500 {
        if node.route(target).await.unwrap().is_some() == present {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_members(node: &NodeHandle, group: &str, expected: &[NodeId]) -> bool {
    let mut expected = expected.to_vec();
    expected.sort();
    for _ in 0..500 {
        if node.group_members(group).await.unwrap() == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn count_unavailable(events: &mut broadcast::Receiver<MeshEvent>, id: NodeId) -> usize {
    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        if event == MeshEvent::NodeUnavailable(id) {
            count += 1;
        }
    }
    count
}

#[tokio::test]
async fn test_line_routes_through_middle() {
    let (a, b, c) = (spawn_node(), spawn_node(), spawn_node());
    let _ab = memory::link(&a, &b, 3).await.unwrap();
    let _bc = memory::link(&b, &c, 4).await.unwrap();

    let c_id = c.local_id();
    assert!(wait_route(&a, c_id, true).await);

    let route = a.route(c_id).await.unwrap().unwrap();
    assert_eq!(route.next_hop, b.local_id());
    assert_eq!(route.cost, 7);
}

#[tokio::test]
async fn test_cutting_the_middle_reports_each_loss_once() {
    let (a, b, c) = (spawn_node(), spawn_node(), spawn_node());
    let ab = memory::link(&a, &b, 1).await.unwrap();
    let bc = memory::link(&b, &c, 1).await.unwrap();
    let (a_id, c_id) = (a.local_id(), c.local_id());
    assert!(wait_route(&a, c_id, true).await);
    assert!(wait_route(&c, a_id, true).await);

    let mut a_events = a.subscribe();
    let mut c_events = c.subscribe();
    ab.close();
    bc.close();

    assert!(wait_route(&a, c_id, false).await);
    assert!(wait_route(&c, a_id, false).await);
    // Let any late gossip settle before counting
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(count_unavailable(&mut a_events, c_id), 1);
    assert_eq!(count_unavailable(&mut c_events, a_id), 1);
}

fn tcp_config() -> NodeConfig {
    NodeConfig {
        port: 0,
        mesh: MeshConfig {
            handshake_timeout_ms: 2_000,
            ..fast_config()
        },
        ..NodeConfig::default()
    }
}

#[tokio::test]
async fn test_tcp_federators_authenticate() {
    let (ka, kb) = (KeyPair::generate(), KeyPair::generate());
    let registry: Arc<dyn FederatorRegistry> =
        Arc::new(StaticRegistry::new(vec![ka.address(), kb.address()]));

    let mut server = Node::new(tcp_config(), kb, registry.clone());
    let port = server.start().await.unwrap().port();
    let mut client = Node::new(tcp_config(), ka, registry);
    client.start().await.unwrap();
    client.connect_to(&format!("127.0.0.1:{}", port));

    let server_id = server.mesh().local_id();
    assert!(wait_route(client.mesh(), server_id, true).await);

    let snapshot = server.mesh().snapshot().await.unwrap();
    assert_eq!(snapshot.peers.len(), 1);
    assert_eq!(snapshot.peers[0].node_id, client.mesh().local_id());
}

#[tokio::test]
async fn test_unregistered_signer_is_not_admitted() {
    let (ka, kb) = (KeyPair::generate(), KeyPair::generate());
    // The client's key is valid but not a federator
    let registry: Arc<dyn FederatorRegistry> = Arc::new(StaticRegistry::new(vec![kb.address()]));

    let mut server = Node::new(tcp_config(), kb, registry.clone());
    let port = server.start().await.unwrap().port();
    let mut client = Node::new(tcp_config(), ka, registry);
    client.start().await.unwrap();
    client.connect_to(&format!("127.0.0.1:{}", port));

    tokio::time::sleep(Duration::from_millis(500)).await;
    let snapshot = server.mesh().snapshot().await.unwrap();
    assert!(snapshot.peers.is_empty());
    assert!(snapshot.routes.is_empty());
    assert_eq!(server.mesh().route(client.mesh().local_id()).await.unwrap(), None);
}

#[tokio::test]
async fn test_duplicate_signer_rejected_after_mesh_collection() {
    const GROUP: &str = "federation";
    let keys: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
    let registry: Arc<dyn FederatorRegistry> =
        Arc::new(StaticRegistry::new(keys.iter().map(|k| k.address()).collect()));
    let contract = Arc::new(InMemoryTransferContract::new(registry.clone(), 2, 10));
    let transfer = TransferId([5; 32]);
    contract
        .request_transfer(transfer, KeyPair::generate().address(), 1_000)
        .unwrap();

    let mut services = Vec::new();
    let mut nodes = Vec::new();
    for key in keys {
        let node = spawn_node();
        let service = FederationService::new(node.clone(), key, contract.clone(), registry.clone());
        service.clone().spawn();
        services.push(service);
        nodes.push(node);
    }
    let _links = vec![
        memory::link(&nodes[0], &nodes[1], 1).await.unwrap(),
        memory::link(&nodes[1], &nodes[2], 1).await.unwrap(),
    ];
    for node in &nodes {
        node.join_group(GROUP).await.unwrap();
    }
    let ids: Vec<NodeId> = nodes.iter().map(|n| n.local_id()).collect();
    assert!(wait_members(&nodes[0], GROUP, &ids).await);

    let batch = TransferBatch::new(vec![transfer], TransferStatus::Sending);
    let signatures = services[0]
        .collect_signatures(GROUP, &batch, 2, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(signatures.len(), 2);

    // One signer's signature counted twice
    let doubled = vec![signatures[0].clone(), signatures[0].clone()];
    assert!(matches!(
        contract.submit_batch(&batch, &doubled),
        Err(ContractError::Quorum(QuorumError::DuplicateSigner(_)))
    ));
    assert_eq!(
        contract.transfer(&transfer).unwrap().unwrap().status,
        TransferStatus::Pending
    );

    contract.submit_batch(&batch, &signatures).unwrap();
    assert_eq!(
        contract.transfer(&transfer).unwrap().unwrap().status,
        TransferStatus::Sending
    );
}

#[tokio::test]
async fn test_late_joiner_learns_groups_by_query() {
    let (a, b) = (spawn_node(), spawn_node());
    let _ab = memory::link(&a, &b, 1).await.unwrap();
    a.join_group("signers").await.unwrap();
    b.join_group("signers").await.unwrap();
    a.join_group("watchers").await.unwrap();

    let (a_id, b_id) = (a.local_id(), b.local_id());
    assert!(wait_members(&b, "signers", &[a_id, b_id]).await);

    // Not known to anyone when the joins were broadcast
    let c = spawn_node();
    let _bc = memory::link(&b, &c, 1).await.unwrap();

    assert!(wait_members(&c, "signers", &[a_id, b_id]).await);
    assert!(wait_members(&c, "watchers", &[a_id]).await);
}
