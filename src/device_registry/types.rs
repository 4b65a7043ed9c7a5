//! DeviceRegistry type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tally state mirrored between OBS and the physical device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TallyState {
    /// Source is neither in program nor preview
    #[default]
    Idle,
    /// Source is in the preview scene
    Preview,
    /// Source is in the program scene (on air)
    Program,
    /// Source is entering program via an active transition
    Transition,
}

impl TallyState {
    /// Parse a wire value. Returns `None` only when the value is absent;
    /// present-but-unrecognized strings resolve to `Idle` so garbage never
    /// propagates to consumers.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "program" | "live" | "pgm" | "on-air" => Self::Program,
            "preview" | "pvw" | "standby" => Self::Preview,
            "transition" => Self::Transition,
            _ => Self::Idle,
        }
    }

    /// Status string the ESP32 firmware renders ("Live" lights the red pulse)
    pub fn device_status(&self) -> &'static str {
        match self {
            Self::Program => "Live",
            Self::Preview => "Preview",
            Self::Transition => "Transition",
            Self::Idle => "Idle",
        }
    }
}

impl std::fmt::Display for TallyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Preview => write!(f, "preview"),
            Self::Program => write!(f, "program"),
            Self::Transition => write!(f, "transition"),
        }
    }
}

/// One registered tally device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Stable unique id, device-chosen (e.g. "tally-AA:BB:CC:DD:EE:FF")
    pub device_id: String,
    pub device_name: String,
    /// Last-known address; serialized as "Unknown" when absent
    #[serde(serialize_with = "unknown_if_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    /// OBS source this device mirrors; None = idle
    pub assigned_source: Option<String>,
    pub tally_state: TallyState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Derived from last_seen against the liveness window; refreshed on
    /// every read and on the periodic sweep
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

fn unknown_if_none<S>(ip: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match ip {
        Some(ip) => serializer.serialize_str(ip),
        None => serializer.serialize_str("Unknown"),
    }
}

impl DeviceRecord {
    pub fn new(device_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let device_id = device_id.into();
        Self {
            device_name: device_id.clone(),
            device_id,
            ip_address: None,
            mac_address: None,
            assigned_source: None,
            tally_state: TallyState::Idle,
            firmware: None,
            model: None,
            online: false,
            last_seen: None,
            registered_at: now,
        }
    }

    /// Merge a partial update. Unspecified fields are left untouched.
    pub fn apply(&mut self, update: DeviceUpdate) {
        if let Some(name) = update.device_name {
            self.device_name = name;
        }
        if let Some(ip) = update.ip_address {
            self.ip_address = Some(ip);
        }
        if let Some(mac) = update.mac_address {
            self.mac_address = Some(mac);
        }
        if let Some(source) = update.assigned_source {
            // Empty string clears the assignment (dashboard sends "" for "none")
            self.assigned_source = if source.is_empty() { None } else { Some(source) };
        }
        if let Some(state) = update.tally_state {
            self.tally_state = state;
        }
        if let Some(fw) = update.firmware {
            self.firmware = Some(fw);
        }
        if let Some(model) = update.model {
            self.model = Some(model);
        }
        if let Some(seen) = update.last_seen {
            self.last_seen = Some(seen);
        }
    }

    /// Re-derive the online flag from last_seen
    pub fn refresh_online(&mut self, now: DateTime<Utc>, window_secs: i64) {
        self.online = match self.last_seen {
            Some(seen) => (now - seen).num_seconds() <= window_secs,
            None => false,
        };
    }
}

/// Partial update merged into a DeviceRecord. Produced by the normalizer;
/// `online` is intentionally absent (always derived, never taken from input).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    pub device_name: Option<String>,
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
    pub assigned_source: Option<String>,
    pub tally_state: Option<TallyState>,
    pub firmware: Option<String>,
    pub model: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl DeviceUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Browser-driven device edit (fixed shape, no aliasing needed)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDeviceRequest {
    pub device_name: Option<String>,
    pub assigned_source: Option<String>,
    pub ip_address: Option<String>,
}

impl From<UpdateDeviceRequest> for DeviceUpdate {
    fn from(req: UpdateDeviceRequest) -> Self {
        Self {
            device_name: req.device_name,
            assigned_source: req.assigned_source,
            ip_address: req.ip_address,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_program_aliases() {
        assert_eq!(TallyState::parse("live"), TallyState::Program);
        assert_eq!(TallyState::parse("Live"), TallyState::Program);
        assert_eq!(TallyState::parse("program"), TallyState::Program);
        assert_eq!(TallyState::parse("PGM"), TallyState::Program);
    }

    #[test]
    fn test_parse_preview_aliases() {
        assert_eq!(TallyState::parse("preview"), TallyState::Preview);
        assert_eq!(TallyState::parse("PVW"), TallyState::Preview);
    }

    #[test]
    fn test_parse_unrecognized_defaults_to_idle() {
        assert_eq!(TallyState::parse("garbage"), TallyState::Idle);
        assert_eq!(TallyState::parse(""), TallyState::Idle);
        assert_eq!(TallyState::parse("ERROR"), TallyState::Idle);
    }

    #[test]
    fn test_device_status_strings() {
        assert_eq!(TallyState::Program.device_status(), "Live");
        assert_eq!(TallyState::Preview.device_status(), "Preview");
        assert_eq!(TallyState::Idle.device_status(), "Idle");
    }

    #[test]
    fn test_record_serializes_unknown_ip() {
        let record = DeviceRecord::new("esp32-001", Utc::now());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["ipAddress"], "Unknown");
        assert_eq!(json["tallyState"], "idle");
        assert_eq!(json["online"], false);
    }

    #[test]
    fn test_apply_clears_source_on_empty_string() {
        let mut record = DeviceRecord::new("esp32-001", Utc::now());
        record.apply(DeviceUpdate {
            assigned_source: Some("Camera 1".to_string()),
            ..Default::default()
        });
        assert_eq!(record.assigned_source.as_deref(), Some("Camera 1"));

        record.apply(DeviceUpdate {
            assigned_source: Some(String::new()),
            ..Default::default()
        });
        assert!(record.assigned_source.is_none());
    }
}
