//! WebAPI - REST + WebSocket endpoints
//!
//! ## Responsibilities
//!
//! - HTTP API routes and request validation
//! - Frontend status subscriptions (`/ws/status`)
//! - Edge agent session (`/ws/edge`)

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        db_connected: state.coordinator.ping().await,
        edge_connected: state.hub.edge_connected().await,
        subscriber_count: state.hub.subscriber_count().await,
    };
    Json(response)
}
