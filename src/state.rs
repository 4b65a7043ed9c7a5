//! Application state
//!
//! Holds all shared components and state

use crate::device_gateway::DeviceGateway;
use crate::device_registry::DeviceRegistry;
use crate::obs_client::ObsClient;
use crate::realtime_hub::RealtimeHub;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port (the firmware's default server URL points at 3000)
    pub port: u16,
    /// obs-websocket URL
    pub obs_ws_url: String,
    /// obs-websocket password, if OBS has auth enabled
    pub obs_ws_password: Option<String>,
    /// Staging directory for firmware uploads
    pub temp_dir: PathBuf,
    /// Default subnet for device discovery
    pub discovery_subnet: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            obs_ws_url: std::env::var("OBS_WS_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:4455".to_string()),
            obs_ws_password: std::env::var("OBS_WS_PASSWORD").ok(),
            temp_dir: std::env::var("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("tally-relay")),
            discovery_subnet: std::env::var("DISCOVERY_SUBNET")
                .unwrap_or_else(|_| "192.168.1.0/24".to_string()),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// DeviceRegistry (single source of truth)
    pub registry: Arc<DeviceRegistry>,
    /// RealtimeHub (browser push channel)
    pub realtime: Arc<RealtimeHub>,
    /// DeviceGateway (outbound device HTTP)
    pub gateway: Arc<DeviceGateway>,
    /// ObsClient (obs-websocket link)
    pub obs_client: Arc<ObsClient>,
    /// Process start, for the health endpoint
    pub started_at: Instant,
}
