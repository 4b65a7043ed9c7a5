//! RealtimeHub - browser push channel
//!
//! ## Responsibilities
//!
//! - WebSocket connection management
//! - Fan-out of device/tally/OBS state changes to all connected dashboards
//!
//! Delivery is best-effort: each client gets its own unbounded channel, so a
//! slow or disconnected consumer never delays the others. There is no ack,
//! retry, or replay; a newly connecting client receives a full registry
//! snapshot and resynchronizes from there.

use crate::device_registry::DeviceRecord;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Hub message types, tagged with the event names the dashboard listens for
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum HubMessage {
    /// Registration or configuration change for one device
    #[serde(rename = "device-update")]
    DeviceUpdate(DeviceDelta),
    /// Heartbeat received from a device
    #[serde(rename = "device-heartbeat")]
    DeviceHeartbeat(DeviceDelta),
    /// Full-registry snapshot (`{deviceStatus: {<id>: {...}}}`)
    #[serde(rename = "device-status-update")]
    DeviceStatusUpdate(BulkStatus),
    /// Tally change for one device
    #[serde(rename = "tally-status")]
    TallyStatus(DeviceDelta),
    /// Raw device info (firmware queries, discovery results)
    #[serde(rename = "esp32-status")]
    Esp32Status(serde_json::Value),
    /// OBS connection state
    #[serde(rename = "obs-status")]
    ObsStatus(ObsStatusMessage),
}

/// Single-device delta
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDelta {
    pub device_id: String,
    pub state: String,
    pub source_name: Option<String>,
    pub online: bool,
    pub last_seen: Option<String>,
}

impl From<&DeviceRecord> for DeviceDelta {
    fn from(record: &DeviceRecord) -> Self {
        Self {
            device_id: record.device_id.clone(),
            state: record.tally_state.to_string(),
            source_name: record.assigned_source.clone(),
            online: record.online,
            last_seen: record.last_seen.map(|t| t.to_rfc3339()),
        }
    }
}

/// Bulk update keyed by device id
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkStatus {
    pub device_status: HashMap<String, serde_json::Value>,
}

impl BulkStatus {
    pub fn from_records(records: &[DeviceRecord]) -> Self {
        let device_status = records
            .iter()
            .map(|r| {
                (
                    r.device_id.clone(),
                    json!({
                        "deviceId": r.device_id,
                        "state": r.tally_state.to_string(),
                        "sourceName": r.assigned_source,
                        "online": r.online,
                        "lastSeen": r.last_seen.map(|t| t.to_rfc3339()),
                    }),
                )
            })
            .collect();
        Self { device_status }
    }
}

/// OBS connection state message
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObsStatusMessage {
    pub connected: bool,
    pub current_program_scene: Option<String>,
    pub current_preview_scene: Option<String>,
}

/// Client connection
struct ClientConnection {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

/// RealtimeHub instance
pub struct RealtimeHub {
    connections: RwLock<HashMap<Uuid, ClientConnection>>,
    connection_count: AtomicU64,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connection_count: AtomicU64::new(0),
        }
    }

    /// Register a new client
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut connections = self.connections.write().await;
            connections.insert(id, ClientConnection { id, tx });
        }

        self.connection_count.fetch_add(1, Ordering::Relaxed);

        tracing::info!(connection_id = %id, "Client connected");

        (id, rx)
    }

    /// Unregister a client
    pub async fn unregister(&self, id: &Uuid) {
        let mut connections = self.connections.write().await;
        if connections.remove(id).is_some() {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(connection_id = %id, "Client disconnected");
        }
    }

    /// Broadcast a message to all clients. A failed send (client gone
    /// mid-broadcast) is logged and skipped; the rest still receive.
    pub async fn broadcast(&self, message: HubMessage) {
        let json = match serde_json::to_string(&message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize hub message");
                return;
            }
        };

        let connections = self.connections.read().await;
        tracing::debug!(
            client_count = connections.len(),
            "Broadcasting to connected clients"
        );

        for conn in connections.values() {
            if let Err(e) = conn.tx.send(json.clone()) {
                tracing::warn!(connection_id = %conn.id, error = %e, "Failed to send message");
            }
        }
    }

    /// Send a message to one client (snapshot on connect)
    pub async fn send_to(&self, id: &Uuid, message: HubMessage) {
        let json = match serde_json::to_string(&message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize hub message");
                return;
            }
        };

        let connections = self.connections.read().await;
        if let Some(conn) = connections.get(id) {
            if let Err(e) = conn.tx.send(json) {
                tracing::warn!(connection_id = %id, error = %e, "Failed to send message");
            }
        }
    }

    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_registry::{DeviceRegistry, DeviceUpdate, TallyState};
    use chrono::Utc;

    #[tokio::test]
    async fn test_broadcast_reaches_all_clients() {
        let hub = RealtimeHub::new();
        let (_id1, mut rx1) = hub.register().await;
        let (_id2, mut rx2) = hub.register().await;

        let registry = DeviceRegistry::new();
        let record = registry.upsert("esp32-001", DeviceUpdate::default()).await;
        hub.broadcast(HubMessage::DeviceUpdate(DeviceDelta::from(&record)))
            .await;

        let m1 = rx1.recv().await.unwrap();
        let m2 = rx2.recv().await.unwrap();
        assert_eq!(m1, m2);

        let parsed: serde_json::Value = serde_json::from_str(&m1).unwrap();
        assert_eq!(parsed["type"], "device-update");
        assert_eq!(parsed["data"]["deviceId"], "esp32-001");
        assert_eq!(parsed["data"]["state"], "idle");
    }

    #[tokio::test]
    async fn test_dropped_client_does_not_block_others() {
        let hub = RealtimeHub::new();
        let (_id1, rx1) = hub.register().await;
        let (_id2, mut rx2) = hub.register().await;

        // Client 1 is gone but never unregistered; its channel send fails
        drop(rx1);

        let registry = DeviceRegistry::new();
        let record = registry
            .touch("esp32-002", Utc::now(), DeviceUpdate::default())
            .await;
        hub.broadcast(HubMessage::DeviceHeartbeat(DeviceDelta::from(&record)))
            .await;

        let msg = rx2.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["type"], "device-heartbeat");
        assert_eq!(parsed["data"]["online"], true);
    }

    #[tokio::test]
    async fn test_unregister_decrements_count() {
        let hub = RealtimeHub::new();
        let (id, _rx) = hub.register().await;
        assert_eq!(hub.connection_count(), 1);

        hub.unregister(&id).await;
        assert_eq!(hub.connection_count(), 0);

        // Double unregister is a no-op
        hub.unregister(&id).await;
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_bulk_status_shape() {
        let registry = DeviceRegistry::new();
        registry
            .upsert(
                "esp32-001",
                DeviceUpdate {
                    tally_state: Some(TallyState::Program),
                    ..Default::default()
                },
            )
            .await;
        let records = registry.list().await;

        let bulk = BulkStatus::from_records(&records);
        let json = serde_json::to_value(HubMessage::DeviceStatusUpdate(bulk)).unwrap();
        assert_eq!(json["type"], "device-status-update");
        assert_eq!(json["data"]["deviceStatus"]["esp32-001"]["state"], "program");
    }
}
