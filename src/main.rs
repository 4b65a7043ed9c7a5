//! Tally Relay Server
//!
//! Main entry point.

use std::sync::Arc;
use tally_relay::{
    device_gateway::DeviceGateway,
    device_registry::DeviceRegistry,
    liveness_tracker::LivenessTracker,
    obs_client::ObsClient,
    realtime_hub::RealtimeHub,
    state::{AppConfig, AppState},
    web_api,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Tally Relay v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        host = %config.host,
        port = config.port,
        obs_ws_url = %config.obs_ws_url,
        temp_dir = %config.temp_dir.display(),
        discovery_subnet = %config.discovery_subnet,
        "Configuration loaded"
    );

    // Initialize components
    let registry = Arc::new(DeviceRegistry::new());
    let realtime = Arc::new(RealtimeHub::new());
    let gateway = Arc::new(DeviceGateway::new());
    tracing::info!("DeviceRegistry, RealtimeHub, DeviceGateway initialized");

    let obs_client = Arc::new(ObsClient::new(
        config.obs_ws_url.clone(),
        config.obs_ws_password.clone(),
        registry.clone(),
        realtime.clone(),
        gateway.clone(),
    ));
    obs_client.start();
    tracing::info!("ObsClient started");

    // Start liveness sweep
    let liveness = LivenessTracker::new(registry.clone(), realtime.clone());
    liveness.start().await;
    tracing::info!("LivenessTracker started");

    // Create application state
    let state = AppState {
        config: config.clone(),
        registry,
        realtime,
        gateway,
        obs_client,
        started_at: std::time::Instant::now(),
    };

    let app = web_api::create_router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
