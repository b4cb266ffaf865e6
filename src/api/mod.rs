//! REST API module
//!
//! Read-only status surface of a running federator.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness check
//! - `GET /api/node` - Local identity, routing version and direct peers
//! - `GET /api/routes` - Next hop and cost for every reachable node
//! - `GET /api/routes/{node_id}` - Route to one node
//! - `GET /api/groups` - Known groups and their members

pub mod handlers;
pub mod routes;

pub use handlers::ApiState;
pub use routes::{create_router, serve};
