//! REST API routes configuration

use crate::api::handlers::{self, ApiState};
use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};

/// Create the API router with all routes
pub fn create_router(state: ApiState) -> Router {
    // Configure CORS for browser access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/node", get(handlers::get_node_info))
        .route("/api/routes", get(handlers::get_routes))
        .route("/api/routes/{node_id}", get(handlers::get_route))
        .route("/api/groups", get(handlers::get_groups))
        .with_state(state)
        .layer(cors)
}

/// Serve the API until the task is aborted
pub async fn serve(port: u16, state: ApiState) -> Result<(), std::io::Error> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Status API listening on http://{}", addr);
    axum::serve(listener, create_router(state)).await
}
