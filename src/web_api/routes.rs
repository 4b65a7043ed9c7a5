//! API Routes

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Multipart, Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};

use crate::device_registry::{normalize_tally_entry, normalize_update, UpdateDeviceRequest};
use crate::discovery;
use crate::error::{Error, Result};
use crate::models::{ApiResponse, CommandResponse};
use crate::realtime_hub::{BulkStatus, DeviceDelta, HubMessage};
use crate::state::AppState;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & OBS
        .route("/healthz", get(super::health_check))
        .route("/api/obs/status", get(obs_status))
        // Device-facing (ESP32 firmware calls these)
        .route("/api/esp32/register", post(register_device))
        .route("/api/heartbeat", post(heartbeat))
        // Registry management
        .route("/api/esp32/devices", get(list_devices))
        .route("/api/esp32/devices", post(create_device))
        .route("/api/esp32/devices/:id", get(get_device))
        .route("/api/esp32/devices/:id", put(update_device))
        .route("/api/esp32/devices/:id", delete(delete_device))
        .route("/api/esp32/discover", post(discover_devices))
        // Device commands
        .route("/api/esp32/devices/:id/restart", post(restart_device))
        .route("/api/esp32/devices/:id/firmware/info", get(firmware_info))
        .route(
            "/api/esp32/devices/:id/firmware/erase-old",
            post(erase_old_firmware),
        )
        .route(
            "/api/esp32/devices/:id/firmware/upload",
            post(upload_firmware),
        )
        // Tally push (browser or external controllers)
        .route("/api/tally", post(tally_update))
        // WebSocket
        .route("/api/ws", get(websocket_handler))
        .with_state(state)
}

// ========================================
// Device-facing handlers
// ========================================

/// Registration call from the firmware:
/// `{deviceId, deviceName, ipAddress, macAddress, firmware, model}`
async fn register_device(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse> {
    let normalized = normalize_update(&payload);
    let device_id = normalized
        .device_id
        .ok_or_else(|| Error::Validation("Missing deviceId".to_string()))?;

    let record = state
        .registry
        .touch(&device_id, chrono::Utc::now(), normalized.update)
        .await;

    state
        .realtime
        .broadcast(HubMessage::DeviceUpdate(DeviceDelta::from(&record)))
        .await;

    Ok(Json(ApiResponse::success(record)))
}

/// Heartbeat from the firmware: `{id, status, uptime, ip}`. The response
/// carries the authoritative tally status so a device that missed a push
/// repaints on its next beat.
async fn heartbeat(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse> {
    let normalized = normalize_update(&payload);
    let device_id = normalized
        .device_id
        .ok_or_else(|| Error::Validation("Missing device id".to_string()))?;

    // The device echoes its own displayed status in heartbeats; the server
    // is authoritative for tally, so that field is not merged back
    let mut update = normalized.update;
    update.tally_state = None;

    let seen_at = update.last_seen.unwrap_or_else(chrono::Utc::now);
    let record = state.registry.touch(&device_id, seen_at, update).await;

    state
        .realtime
        .broadcast(HubMessage::DeviceHeartbeat(DeviceDelta::from(&record)))
        .await;

    Ok(Json(json!({
        "success": true,
        "status": record.tally_state.device_status(),
        "assignedSource": record.assigned_source,
        "deviceName": record.device_name,
    })))
}

// ========================================
// Registry management handlers
// ========================================

async fn list_devices(State(state): State<AppState>) -> impl IntoResponse {
    let devices = state.registry.list().await;
    Json(ApiResponse::success(devices))
}

async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let record = state
        .registry
        .get(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("Device {id} not found")))?;
    Ok(Json(ApiResponse::success(record)))
}

/// Manual registration from the dashboard. Unlike firmware registration
/// this does not mark the device seen; it stays offline until it beats.
async fn create_device(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse> {
    let normalized = normalize_update(&payload);
    let device_id = normalized
        .device_id
        .ok_or_else(|| Error::Validation("Missing deviceId".to_string()))?;

    if state.registry.get(&device_id).await.is_some() {
        return Err(Error::Conflict(format!(
            "Device {device_id} already registered"
        )));
    }

    let record = state.registry.upsert(&device_id, normalized.update).await;

    state
        .realtime
        .broadcast(HubMessage::DeviceUpdate(DeviceDelta::from(&record)))
        .await;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(record))))
}

async fn update_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateDeviceRequest>,
) -> Result<impl IntoResponse> {
    if state.registry.get(&id).await.is_none() {
        return Err(Error::NotFound(format!("Device {id} not found")));
    }

    let record = state.registry.upsert(&id, req.into()).await;

    state
        .realtime
        .broadcast(HubMessage::DeviceUpdate(DeviceDelta::from(&record)))
        .await;

    // A changed source assignment takes its tally from the current scenes
    state.obs_client.resync().await;

    Ok(Json(ApiResponse::success(record)))
}

async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let removed = state.registry.remove(&id).await;

    if removed {
        let records = state.registry.list().await;
        state
            .realtime
            .broadcast(HubMessage::DeviceStatusUpdate(BulkStatus::from_records(
                &records,
            )))
            .await;
    }

    Json(json!({ "ok": true, "removed": removed }))
}

async fn discover_devices(
    State(state): State<AppState>,
    payload: Option<Json<Value>>,
) -> Result<impl IntoResponse> {
    let subnet = payload
        .as_ref()
        .and_then(|Json(p)| p.get("subnet").and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| state.config.discovery_subnet.clone());

    let result = discovery::discover(&subnet, &state.registry, &state.realtime).await?;
    Ok(Json(ApiResponse::success(result)))
}

// ========================================
// Device command handlers
// ========================================

/// Resolve the device's last-known address or reject the command
async fn device_ip(state: &AppState, id: &str) -> Result<String> {
    let record = state
        .registry
        .get(id)
        .await
        .ok_or_else(|| Error::NotFound(format!("Device {id} not found")))?;
    record
        .ip_address
        .ok_or_else(|| Error::Validation(format!("Device {id} has no known IP address")))
}

async fn restart_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let ip = device_ip(&state, &id).await?;
    let outcome = state.gateway.restart(&ip).await;

    state
        .realtime
        .broadcast(HubMessage::Esp32Status(json!({
            "event": "restart",
            "deviceId": id,
            "result": outcome,
        })))
        .await;

    Ok(Json(CommandResponse::from(outcome)))
}

async fn firmware_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let ip = device_ip(&state, &id).await?;
    let info = state.gateway.firmware_info(&ip).await?;
    Ok(Json(ApiResponse::success(info)))
}

async fn erase_old_firmware(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let ip = device_ip(&state, &id).await?;
    let outcome = state.gateway.erase_old_firmware(&ip).await;

    state
        .realtime
        .broadcast(HubMessage::Esp32Status(json!({
            "event": "erase-old",
            "deviceId": id,
            "result": outcome,
        })))
        .await;

    Ok(Json(CommandResponse::from(outcome)))
}

/// Stage the uploaded image to a temp file, then hand it to the gateway.
/// The gateway deletes the staged file on every exit path.
async fn upload_firmware(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    let ip = device_ip(&state, &id).await?;

    let mut staged = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(format!("Invalid multipart body: {e}")))?
    {
        if field.name() != Some("firmware") && field.file_name().is_none() {
            continue;
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| Error::Validation(format!("Failed to read firmware field: {e}")))?;
        if bytes.is_empty() {
            return Err(Error::Validation("Firmware file is empty".to_string()));
        }

        tokio::fs::create_dir_all(&state.config.temp_dir).await?;
        let path = state
            .config
            .temp_dir
            .join(format!("firmware-{}.bin", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, &bytes).await?;
        staged = Some(path);
        break;
    }

    let path =
        staged.ok_or_else(|| Error::Validation("Missing firmware file field".to_string()))?;

    let outcome = state.gateway.upload_firmware(&ip, path).await;

    state
        .realtime
        .broadcast(HubMessage::Esp32Status(json!({
            "event": "firmware-upload",
            "deviceId": id,
            "result": outcome,
        })))
        .await;

    Ok(Json(CommandResponse::from(outcome)))
}

// ========================================
// Tally push
// ========================================

/// Accepted bulk shapes: `{deviceStatus: {<id>: {...}}}`, a plain array of
/// per-device objects, or a single object with a device id. Array entries
/// without any device id alias are dropped individually.
fn extract_tally_entries(payload: &Value) -> Result<Vec<(String, Value)>> {
    if let Some(map) = payload.get("deviceStatus").and_then(Value::as_object) {
        return Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    }
    if let Some(list) = payload.as_array() {
        return Ok(list
            .iter()
            .filter_map(|entry| {
                let id = normalize_update(entry).device_id?;
                Some((id, entry.clone()))
            })
            .collect());
    }
    if let Some(id) = normalize_update(payload).device_id {
        return Ok(vec![(id, payload.clone())]);
    }
    Err(Error::Validation(
        "Expected deviceStatus map, array, or single device object".to_string(),
    ))
}

/// Bulk tally update. Entries apply independently; one malformed entry
/// never blocks the rest.
async fn tally_update(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse> {
    let entries = extract_tally_entries(&payload)?;

    let mut updated = 0usize;
    for (device_id, entry) in entries {
        let update = normalize_tally_entry(&entry);
        let record = state.registry.upsert(&device_id, update).await;
        updated += 1;

        state
            .realtime
            .broadcast(HubMessage::TallyStatus(DeviceDelta::from(&record)))
            .await;

        if record.online {
            if let Some(ip) = record.ip_address.clone() {
                let gateway = state.gateway.clone();
                let tally = record.tally_state;
                let source = record.assigned_source.clone();
                tokio::spawn(async move {
                    if let Err(e) = gateway.push_tally(&ip, tally, source.as_deref()).await {
                        tracing::warn!(ip = %ip, error = %e, "Tally push failed");
                    }
                });
            }
        }
    }

    Ok(Json(json!({ "success": true, "updated": updated })))
}

// ========================================
// WebSocket
// ========================================

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let (conn_id, mut rx) = state.realtime.register().await;

    // New consumers resynchronize from a full snapshot
    let records = state.registry.list().await;
    state
        .realtime
        .send_to(
            &conn_id,
            HubMessage::DeviceStatusUpdate(BulkStatus::from_records(&records)),
        )
        .await;
    state
        .realtime
        .send_to(
            &conn_id,
            HubMessage::ObsStatus(state.obs_client.status().await),
        )
        .await;

    // Forward hub messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => {
                    tracing::info!(connection_id = %conn_id, "WebSocket client closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(connection_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
        conn_id
    });

    let conn_id = tokio::select! {
        _ = send_task => conn_id,
        result = recv_task => result.unwrap_or(conn_id),
    };

    state.realtime.unregister(&conn_id).await;
}

async fn obs_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.obs_client.status().await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_registry::{DeviceRegistry, TallyState};
    use serde_json::json;

    #[test]
    fn test_extract_device_status_map() {
        let payload = json!({
            "deviceStatus": {
                "esp32-001": { "state": "live", "online": true },
                "esp32-002": { "online": false },
            }
        });
        let mut entries = extract_tally_entries(&payload).unwrap();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "esp32-001");
        assert_eq!(entries[1].0, "esp32-002");
    }

    #[test]
    fn test_extract_array_fallback() {
        let payload = json!([
            { "deviceId": "esp32-001", "state": "preview" },
            { "no_id_here": true },
            { "id": "esp32-003", "state": "live" },
        ]);
        let entries = extract_tally_entries(&payload).unwrap();
        // Entry without any id alias is dropped, the rest survive
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "esp32-001");
        assert_eq!(entries[1].0, "esp32-003");
    }

    #[test]
    fn test_extract_single_object() {
        let payload = json!({ "deviceId": "esp32-001", "state": "live" });
        let entries = extract_tally_entries(&payload).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_extract_rejects_shapeless_payload() {
        assert!(extract_tally_entries(&json!({ "foo": 1 })).is_err());
        assert!(extract_tally_entries(&json!("nope")).is_err());
    }

    #[tokio::test]
    async fn test_bulk_entries_apply_independently() {
        let registry = DeviceRegistry::new();
        let payload = json!({
            "deviceStatus": {
                "esp32-001": { "state": "live", "online": true },
                "esp32-002": { "online": false },
            }
        });

        for (device_id, entry) in extract_tally_entries(&payload).unwrap() {
            let update = normalize_tally_entry(&entry);
            registry.upsert(&device_id, update).await;
        }

        // The well-formed entry lands as program
        let a = registry.get("esp32-001").await.unwrap();
        assert_eq!(a.tally_state, TallyState::Program);
        // The entry missing a state still resolves to idle, not garbage
        let b = registry.get("esp32-002").await.unwrap();
        assert_eq!(b.tally_state, TallyState::Idle);
    }
}
