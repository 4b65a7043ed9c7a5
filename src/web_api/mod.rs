//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - Device-facing endpoints (registration, heartbeat)
//! - Registry management surface for the dashboard
//! - Device command endpoints (restart, firmware)
//! - Browser WebSocket (push channel)

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let obs = state.obs_client.status().await;

    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.started_at.elapsed().as_secs(),
        obs_connected: obs.connected,
        device_count: state.registry.count().await,
        client_count: state.realtime.connection_count(),
    };

    Json(response)
}
