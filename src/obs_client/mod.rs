//! ObsClient - obs-websocket v5 control-plane link
//!
//! ## Responsibilities
//!
//! - Connect to OBS (Hello/Identify handshake, challenge auth)
//! - Track current program and preview scene
//! - Map scene changes to per-device tally states via assigned_source
//! - Push recomputed states to devices and broadcast to dashboards
//!
//! The connection loop reconnects with a fixed backoff; `obs-status` goes
//! out on every connect/disconnect so dashboards can show the link state.

use crate::device_gateway::DeviceGateway;
use crate::device_registry::{DeviceRegistry, DeviceUpdate, TallyState};
use crate::error::{Error, Result};
use crate::realtime_hub::{DeviceDelta, HubMessage, ObsStatusMessage, RealtimeHub};
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// obs-websocket EventSubscription bits: Scenes | Transitions
const EVENT_SUBSCRIPTIONS: u64 = (1 << 2) | (1 << 4);

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const REQ_PROGRAM_SCENE: &str = "initial-program-scene";
const REQ_PREVIEW_SCENE: &str = "initial-preview-scene";

/// Tracked OBS scene state
#[derive(Debug, Clone, Default)]
struct SceneState {
    connected: bool,
    program_scene: Option<String>,
    preview_scene: Option<String>,
    transition_active: bool,
}

/// ObsClient instance
pub struct ObsClient {
    url: String,
    password: Option<String>,
    registry: Arc<DeviceRegistry>,
    realtime_hub: Arc<RealtimeHub>,
    gateway: Arc<DeviceGateway>,
    state: RwLock<SceneState>,
}

impl ObsClient {
    pub fn new(
        url: String,
        password: Option<String>,
        registry: Arc<DeviceRegistry>,
        realtime_hub: Arc<RealtimeHub>,
        gateway: Arc<DeviceGateway>,
    ) -> Self {
        Self {
            url,
            password,
            registry,
            realtime_hub,
            gateway,
            state: RwLock::new(SceneState::default()),
        }
    }

    /// Current link state for the status endpoint and obs-status events
    pub async fn status(&self) -> ObsStatusMessage {
        let state = self.state.read().await;
        ObsStatusMessage {
            connected: state.connected,
            current_program_scene: state.program_scene.clone(),
            current_preview_scene: state.preview_scene.clone(),
        }
    }

    /// Recompute every device's tally against the current scenes. Called
    /// internally on scene changes and externally when an assignment edit
    /// needs an immediate state.
    pub async fn resync(&self) {
        self.recompute_tallies().await;
    }

    /// Start the connection loop
    pub fn start(self: &Arc<Self>) {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                match client.run_once().await {
                    Ok(()) => {
                        tracing::info!("OBS connection closed");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "OBS connection failed");
                    }
                }

                client.set_disconnected().await;
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });
    }

    /// One connection lifetime: handshake, initial scene fetch, event pump
    async fn run_once(&self) -> Result<()> {
        tracing::info!(url = %self.url, "Connecting to OBS");
        let (ws, _) = connect_async(&self.url)
            .await
            .map_err(|e| Error::Obs(format!("Connect failed: {e}")))?;
        let (mut write, mut read) = ws.split();

        // Hello -> Identify
        let hello = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => break serde_json::from_str::<Value>(&text)?,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(Error::Obs(format!("Handshake read failed: {e}"))),
                None => return Err(Error::Obs("Socket closed during handshake".to_string())),
            }
        };

        let mut identify = json!({
            "op": 1,
            "d": {
                "rpcVersion": 1,
                "eventSubscriptions": EVENT_SUBSCRIPTIONS,
            }
        });

        if let Some(auth) = hello.pointer("/d/authentication") {
            let password = self.password.as_deref().ok_or_else(|| {
                Error::Obs("OBS requires authentication but OBS_WS_PASSWORD is not set".to_string())
            })?;
            let salt = auth
                .get("salt")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let challenge = auth
                .get("challenge")
                .and_then(Value::as_str)
                .unwrap_or_default();
            identify["d"]["authentication"] =
                Value::String(build_auth_response(password, salt, challenge));
        }

        write
            .send(Message::Text(identify.to_string()))
            .await
            .map_err(|e| Error::Obs(format!("Identify send failed: {e}")))?;

        // Event pump; Identified (op 2) arrives first
        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| Error::Obs(format!("Read failed: {e}")))?;
            let text = match msg {
                Message::Text(text) => text,
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => break,
                _ => continue,
            };
            let envelope: Value = serde_json::from_str(&text)?;

            match envelope.get("op").and_then(Value::as_u64) {
                // Identified: link is up, fetch the initial scenes
                Some(2) => {
                    tracing::info!("OBS connection identified");
                    {
                        let mut state = self.state.write().await;
                        state.connected = true;
                    }
                    self.broadcast_obs_status().await;

                    for (request_type, request_id) in [
                        ("GetCurrentProgramScene", REQ_PROGRAM_SCENE),
                        ("GetCurrentPreviewScene", REQ_PREVIEW_SCENE),
                    ] {
                        let request = json!({
                            "op": 6,
                            "d": { "requestType": request_type, "requestId": request_id }
                        });
                        write
                            .send(Message::Text(request.to_string()))
                            .await
                            .map_err(|e| Error::Obs(format!("Request send failed: {e}")))?;
                    }
                }
                // RequestResponse: initial program/preview scene
                Some(7) => self.handle_request_response(&envelope).await,
                // Event
                Some(5) => {
                    let event_type = envelope
                        .pointer("/d/eventType")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let event_data = envelope
                        .pointer("/d/eventData")
                        .cloned()
                        .unwrap_or(Value::Null);
                    self.handle_event(&event_type, &event_data).await;
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn handle_request_response(&self, envelope: &Value) {
        let request_id = envelope
            .pointer("/d/requestId")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let scene = envelope
            .pointer("/d/responseData/sceneName")
            .or_else(|| envelope.pointer("/d/responseData/currentProgramSceneName"))
            .or_else(|| envelope.pointer("/d/responseData/currentPreviewSceneName"))
            .and_then(Value::as_str)
            .map(str::to_string);

        match request_id {
            REQ_PROGRAM_SCENE => {
                let mut state = self.state.write().await;
                state.program_scene = scene;
            }
            REQ_PREVIEW_SCENE => {
                // Fails when studio mode is off; scene stays None
                let mut state = self.state.write().await;
                state.preview_scene = scene;
            }
            _ => return,
        }
        self.recompute_tallies().await;
    }

    async fn handle_event(&self, event_type: &str, data: &Value) {
        let scene_name = data
            .get("sceneName")
            .and_then(Value::as_str)
            .map(str::to_string);

        match event_type {
            "CurrentProgramSceneChanged" => {
                let mut state = self.state.write().await;
                state.program_scene = scene_name.clone();
                state.transition_active = false;
                drop(state);
                tracing::info!(scene = ?scene_name, "Program scene changed");
                self.recompute_tallies().await;
                self.broadcast_obs_status().await;
            }
            "CurrentPreviewSceneChanged" => {
                let mut state = self.state.write().await;
                state.preview_scene = scene_name.clone();
                drop(state);
                tracing::info!(scene = ?scene_name, "Preview scene changed");
                self.recompute_tallies().await;
                self.broadcast_obs_status().await;
            }
            "SceneTransitionStarted" => {
                let mut state = self.state.write().await;
                state.transition_active = true;
                drop(state);
                self.recompute_tallies().await;
            }
            "SceneTransitionEnded" => {
                let mut state = self.state.write().await;
                state.transition_active = false;
                drop(state);
                self.recompute_tallies().await;
            }
            _ => {}
        }
    }

    /// Recompute tally for every registered device and fan out the changes
    async fn recompute_tallies(&self) {
        let (program, preview, transition) = {
            let state = self.state.read().await;
            (
                state.program_scene.clone(),
                state.preview_scene.clone(),
                state.transition_active,
            )
        };

        for record in self.registry.list().await {
            let Some(source) = record.assigned_source.clone() else {
                continue;
            };
            let next = compute_tally(
                &source,
                program.as_deref(),
                preview.as_deref(),
                transition,
            );
            if next == record.tally_state {
                continue;
            }

            let updated = self
                .registry
                .upsert(
                    &record.device_id,
                    DeviceUpdate {
                        tally_state: Some(next),
                        ..Default::default()
                    },
                )
                .await;

            tracing::info!(
                device_id = %updated.device_id,
                source = %source,
                state = %next,
                "Tally state changed"
            );

            self.realtime_hub
                .broadcast(HubMessage::TallyStatus(DeviceDelta::from(&updated)))
                .await;

            // Push to the physical device; a missed push is repaired by the
            // next heartbeat response
            if updated.online {
                if let Some(ip) = updated.ip_address.clone() {
                    let gateway = self.gateway.clone();
                    let source = source.clone();
                    tokio::spawn(async move {
                        if let Err(e) = gateway.push_tally(&ip, next, Some(&source)).await {
                            tracing::warn!(ip = %ip, error = %e, "Tally push failed");
                        }
                    });
                }
            }
        }
    }

    async fn set_disconnected(&self) {
        let was_connected = {
            let mut state = self.state.write().await;
            let was = state.connected;
            *state = SceneState::default();
            was
        };
        if was_connected {
            self.broadcast_obs_status().await;
        }
    }

    async fn broadcast_obs_status(&self) {
        let status = self.status().await;
        self.realtime_hub
            .broadcast(HubMessage::ObsStatus(status))
            .await;
    }
}

/// Map one device's assigned source against the current scene state
fn compute_tally(
    assigned_source: &str,
    program: Option<&str>,
    preview: Option<&str>,
    transition_active: bool,
) -> TallyState {
    if program == Some(assigned_source) {
        TallyState::Program
    } else if preview == Some(assigned_source) {
        if transition_active {
            TallyState::Transition
        } else {
            TallyState::Preview
        }
    } else {
        TallyState::Idle
    }
}

/// obs-websocket v5 auth: base64(sha256(base64(sha256(password + salt)) + challenge))
fn build_auth_response(password: &str, salt: &str, challenge: &str) -> String {
    let engine = base64::engine::general_purpose::STANDARD;

    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    let secret = engine.encode(hasher.finalize());

    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(challenge.as_bytes());
    engine.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_tally_program_wins() {
        assert_eq!(
            compute_tally("Cam 1", Some("Cam 1"), Some("Cam 1"), false),
            TallyState::Program
        );
    }

    #[test]
    fn test_compute_tally_preview() {
        assert_eq!(
            compute_tally("Cam 1", Some("Cam 2"), Some("Cam 1"), false),
            TallyState::Preview
        );
    }

    #[test]
    fn test_compute_tally_transition_for_incoming_scene() {
        assert_eq!(
            compute_tally("Cam 1", Some("Cam 2"), Some("Cam 1"), true),
            TallyState::Transition
        );
    }

    #[test]
    fn test_compute_tally_idle_when_unmatched() {
        assert_eq!(
            compute_tally("Cam 3", Some("Cam 1"), Some("Cam 2"), false),
            TallyState::Idle
        );
        assert_eq!(compute_tally("Cam 3", None, None, false), TallyState::Idle);
    }

    #[test]
    fn test_auth_response_is_deterministic() {
        let a = build_auth_response("tally123", "salt", "challenge");
        let b = build_auth_response("tally123", "salt", "challenge");
        assert_eq!(a, b);
        // Known vector: sha256 of password+salt then secret+challenge, both base64
        assert_eq!(a.len(), 44);

        let c = build_auth_response("tally123", "other-salt", "challenge");
        assert_ne!(a, c);
    }
}
