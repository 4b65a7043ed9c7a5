//! Inbound payload normalization
//!
//! The HTTP API, the browser push channel, and the device's self-reported
//! info all name the same fields differently (the firmware heartbeat sends
//! `id`/`ip` where its registration sends `deviceId`/`ipAddress`). Every
//! inbound payload passes through `normalize_update` so alias fallback
//! chains never spread across call sites. Per field, the first alias
//! present wins.
//!
//! A caller-supplied `online` flag is never read: online is always derived
//! from `last_seen` by the store.

use super::types::{DeviceUpdate, TallyState};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

const DEVICE_ID: &[&str] = &["deviceId", "device_id", "id"];
const DEVICE_NAME: &[&str] = &["deviceName", "device_name", "name"];
const IP_ADDRESS: &[&str] = &["ipAddress", "ip_address", "ip"];
const MAC_ADDRESS: &[&str] = &["macAddress", "mac_address", "mac"];
const ASSIGNED_SOURCE: &[&str] = &["assignedSource", "assigned_source", "sourceName", "source"];
const TALLY_STATE: &[&str] = &["tallyStatus", "tallyState", "state", "status"];
const FIRMWARE: &[&str] = &["firmware", "firmwareVersion", "firmware_version"];
const MODEL: &[&str] = &["model", "deviceModel", "device_model"];
const LAST_SEEN: &[&str] = &["lastSeen", "last_seen", "timestamp"];

/// A normalized inbound payload: the id it addresses plus the canonical
/// partial update.
#[derive(Debug, Clone, Default)]
pub struct NormalizedUpdate {
    pub device_id: Option<String>,
    pub update: DeviceUpdate,
}

/// Translate an inbound payload of arbitrary shape into canonical fields.
/// Fields absent under all aliases stay untouched (merge semantics).
pub fn normalize_update(payload: &Value) -> NormalizedUpdate {
    NormalizedUpdate {
        device_id: first_string(payload, DEVICE_ID),
        update: DeviceUpdate {
            device_name: first_string(payload, DEVICE_NAME),
            ip_address: first_string(payload, IP_ADDRESS),
            mac_address: first_string(payload, MAC_ADDRESS),
            assigned_source: first_string(payload, ASSIGNED_SOURCE),
            tally_state: first_string(payload, TALLY_STATE)
                .map(|s| TallyState::parse(&s)),
            firmware: first_string(payload, FIRMWARE),
            model: first_string(payload, MODEL),
            last_seen: first_timestamp(payload, LAST_SEEN),
        },
    }
}

/// Normalize one entry of a bulk tally update. Unlike the merge path, a
/// missing or unrecognized state resolves to Idle: the state is the point
/// of a tally message, and garbage must not reach consumers.
pub fn normalize_tally_entry(payload: &Value) -> DeviceUpdate {
    let mut normalized = normalize_update(payload).update;
    normalized.tally_state = Some(normalized.tally_state.unwrap_or(TallyState::Idle));
    normalized
}

fn first_string(payload: &Value, aliases: &[&str]) -> Option<String> {
    aliases
        .iter()
        .find_map(|key| payload.get(key))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn first_timestamp(payload: &Value, aliases: &[&str]) -> Option<DateTime<Utc>> {
    let value = aliases.iter().find_map(|key| payload.get(key))?;
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}
