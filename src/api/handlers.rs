//! REST API handlers for node status

use crate::crypto::Address;
use crate::mesh::groups::GroupSummary;
use crate::mesh::identity::NodeId;
use crate::mesh::node::{NodeError, NodeHandle};
use crate::mesh::topology::{PeerSummary, RouteSummary};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub node: NodeHandle,
    /// Federator address of the local key
    pub address: Address,
    pub started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(node: NodeHandle, address: Address) -> Self {
        Self {
            node,
            address,
            started_at: Utc::now(),
        }
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub address: Address,
    pub version: u64,
    pub known_nodes: usize,
    pub reachable_nodes: usize,
    pub peers: Vec<PeerSummary>,
    pub uptime_secs: i64,
}

#[derive(Serialize, Debug)]
pub struct ApiError {
    pub error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn unavailable(e: NodeError) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ApiError {
            error: e.to_string(),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn get_node_info(State(state): State<ApiState>) -> ApiResult<NodeInfo> {
    let snapshot = state.node.snapshot().await.map_err(unavailable)?;
    Ok(Json(NodeInfo {
        node_id: snapshot.local,
        address: state.address,
        version: snapshot.version,
        known_nodes: snapshot.known_nodes,
        reachable_nodes: snapshot.routes.len(),
        peers: snapshot.peers,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    }))
}

pub async fn get_routes(State(state): State<ApiState>) -> ApiResult<Vec<RouteSummary>> {
    let snapshot = state.node.snapshot().await.map_err(unavailable)?;
    Ok(Json(snapshot.routes))
}

pub async fn get_route(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
) -> ApiResult<RouteSummary> {
    let destination: NodeId = node_id.parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(ApiError {
                error: format!("Invalid node id: {}", node_id),
            }),
        )
    })?;
    match state.node.route(destination).await.map_err(unavailable)? {
        Some(route) => Ok(Json(RouteSummary { destination, route })),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ApiError {
                error: format!("No route to {}", destination),
            }),
        )),
    }
}

pub async fn get_groups(State(state): State<ApiState>) -> ApiResult<Vec<GroupSummary>> {
    Ok(Json(state.node.groups().await.map_err(unavailable)?))
}
