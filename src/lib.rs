//! Tally Relay Server
//!
//! Bridges obs-websocket to ESP32 tally-light devices and browser dashboards.
//!
//! ## Architecture (7 Components)
//!
//! 1. DeviceRegistry - SSoT for device records (store + normalizer)
//! 2. LivenessTracker - periodic offline sweep
//! 3. RealtimeHub - WebSocket distribution to dashboards
//! 4. DeviceGateway - outbound device commands (restart, firmware, tally push)
//! 5. ObsClient - obs-websocket v5 link, scene-to-tally mapping
//! 6. Discovery - subnet probe for tally hardware
//! 7. WebAPI - REST endpoints + browser WebSocket
//!
//! ## Design Principles
//!
//! - SSoT: DeviceRegistry is the single source of truth; no component caches
//!   device state beyond one operation
//! - Best-effort fan-out: a slow consumer or offline device never blocks the
//!   rest; fresh heartbeats resynchronize

pub mod device_gateway;
pub mod device_registry;
pub mod discovery;
pub mod error;
pub mod liveness_tracker;
pub mod models;
pub mod obs_client;
pub mod realtime_hub;
pub mod state;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
