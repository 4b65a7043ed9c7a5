//! In-memory device record store

use super::types::{DeviceRecord, DeviceUpdate};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Seconds without contact before a device is considered offline
pub const LIVENESS_WINDOW_SECS: i64 = 30;

/// Canonical set of DeviceRecords keyed by device_id.
///
/// Concurrent upsert/remove against the same id serialize on the write lock,
/// so racing updates (heartbeat vs. user edit) apply as sequential merges.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Merge partial fields into an existing record, or create a new record
    /// for an unseen id. Returns the resulting record.
    pub async fn upsert(&self, device_id: &str, update: DeviceUpdate) -> DeviceRecord {
        let now = Utc::now();
        let mut devices = self.devices.write().await;
        let record = devices
            .entry(device_id.to_string())
            .or_insert_with(|| {
                tracing::info!(device_id = %device_id, "Device registered");
                DeviceRecord::new(device_id, now)
            });
        record.apply(update);
        record.refresh_online(now, LIVENESS_WINDOW_SECS);
        record.clone()
    }

    /// Record fresh contact from the device and return the updated record.
    /// Merges any accompanying fields in the same lock hold.
    pub async fn touch(
        &self,
        device_id: &str,
        seen_at: DateTime<Utc>,
        update: DeviceUpdate,
    ) -> DeviceRecord {
        let mut merged = update;
        merged.last_seen = Some(merged.last_seen.unwrap_or(seen_at));
        self.upsert(device_id, merged).await
    }

    pub async fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        let now = Utc::now();
        let devices = self.devices.read().await;
        devices.get(device_id).map(|r| {
            let mut record = r.clone();
            record.refresh_online(now, LIVENESS_WINDOW_SECS);
            record
        })
    }

    /// Delete a record. Idempotent: removing an absent id is a no-op.
    pub async fn remove(&self, device_id: &str) -> bool {
        let mut devices = self.devices.write().await;
        let removed = devices.remove(device_id).is_some();
        if removed {
            tracing::info!(device_id = %device_id, "Device removed");
        }
        removed
    }

    /// Snapshot of all records. Mutations after the snapshot is taken are
    /// not observed by the caller.
    pub async fn list(&self) -> Vec<DeviceRecord> {
        let now = Utc::now();
        let devices = self.devices.read().await;
        devices
            .values()
            .map(|r| {
                let mut record = r.clone();
                record.refresh_online(now, LIVENESS_WINDOW_SECS);
                record
            })
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Devices mirroring the given OBS source
    pub async fn assigned_to(&self, source: &str) -> Vec<DeviceRecord> {
        self.list()
            .await
            .into_iter()
            .filter(|r| r.assigned_source.as_deref() == Some(source))
            .collect()
    }

    /// Eager sweep: flip records whose last_seen fell out of the liveness
    /// window from online to offline. Returns the flipped records so the
    /// caller can broadcast each transition. Never marks a device online.
    pub async fn sweep_offline(&self, now: DateTime<Utc>) -> Vec<DeviceRecord> {
        let mut flipped = Vec::new();
        let mut devices = self.devices.write().await;
        for record in devices.values_mut() {
            if !record.online {
                continue;
            }
            let stale = match record.last_seen {
                Some(seen) => (now - seen).num_seconds() > LIVENESS_WINDOW_SECS,
                None => true,
            };
            if stale {
                record.online = false;
                flipped.push(record.clone());
            }
        }
        flipped
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_registry::TallyState;
    use chrono::Duration;

    #[tokio::test]
    async fn test_upsert_creates_record_with_defaults() {
        let registry = DeviceRegistry::new();
        registry.upsert("esp32-001", DeviceUpdate::default()).await;

        let record = registry.get("esp32-001").await.unwrap();
        assert_eq!(record.device_id, "esp32-001");
        assert!(record.ip_address.is_none());
        assert_eq!(record.tally_state, TallyState::Idle);
        assert!(!record.online);
    }

    #[tokio::test]
    async fn test_disjoint_upserts_union() {
        let registry = DeviceRegistry::new();
        registry
            .upsert(
                "esp32-001",
                DeviceUpdate {
                    ip_address: Some("192.168.1.50".to_string()),
                    ..Default::default()
                },
            )
            .await;
        registry
            .upsert(
                "esp32-001",
                DeviceUpdate {
                    device_name: Some("Cam Left".to_string()),
                    ..Default::default()
                },
            )
            .await;
        registry
            .upsert(
                "esp32-001",
                DeviceUpdate {
                    mac_address: Some("AA:BB:CC:DD:EE:FF".to_string()),
                    ..Default::default()
                },
            )
            .await;

        let record = registry.get("esp32-001").await.unwrap();
        assert_eq!(record.ip_address.as_deref(), Some("192.168.1.50"));
        assert_eq!(record.device_name, "Cam Left");
        assert_eq!(record.mac_address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
    }

    #[tokio::test]
    async fn test_partial_update_preserves_unspecified_fields() {
        let registry = DeviceRegistry::new();
        registry
            .upsert(
                "esp32-001",
                DeviceUpdate {
                    device_name: Some("Cam Left".to_string()),
                    ip_address: Some("192.168.1.50".to_string()),
                    ..Default::default()
                },
            )
            .await;
        registry
            .upsert(
                "esp32-001",
                DeviceUpdate {
                    tally_state: Some(TallyState::Program),
                    ..Default::default()
                },
            )
            .await;

        let record = registry.get("esp32-001").await.unwrap();
        assert_eq!(record.device_name, "Cam Left");
        assert_eq!(record.ip_address.as_deref(), Some("192.168.1.50"));
        assert_eq!(record.tally_state, TallyState::Program);
    }

    #[tokio::test]
    async fn test_touch_marks_online() {
        let registry = DeviceRegistry::new();
        let seen = Utc::now();
        let record = registry
            .touch("esp32-001", seen, DeviceUpdate::default())
            .await;
        assert!(record.online);
        assert_eq!(record.last_seen, Some(seen));
    }

    #[tokio::test]
    async fn test_remove_nonexistent_is_noop() {
        let registry = DeviceRegistry::new();
        registry.upsert("esp32-001", DeviceUpdate::default()).await;

        assert!(!registry.remove("esp32-999").await);
        assert_eq!(registry.count().await, 1);
        assert!(registry.remove("esp32-001").await);
        assert!(!registry.remove("esp32-001").await);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_stale_record_reads_offline() {
        let registry = DeviceRegistry::new();
        let stale = Utc::now() - Duration::seconds(LIVENESS_WINDOW_SECS + 5);
        registry
            .upsert(
                "esp32-001",
                DeviceUpdate {
                    last_seen: Some(stale),
                    ..Default::default()
                },
            )
            .await;

        let record = registry.get("esp32-001").await.unwrap();
        assert!(!record.online);
    }

    #[tokio::test]
    async fn test_sweep_flips_stale_online_records() {
        let registry = DeviceRegistry::new();
        let now = Utc::now();
        registry
            .touch("fresh", now, DeviceUpdate::default())
            .await;
        registry
            .touch("stale", now, DeviceUpdate::default())
            .await;

        let later = now + Duration::seconds(LIVENESS_WINDOW_SECS + 1);
        let flipped = registry.sweep_offline(later).await;
        // Both were touched at `now`, both are past the window at `later`
        assert_eq!(flipped.len(), 2);
        assert!(flipped.iter().all(|r| !r.online));

        // Second sweep sees nothing online, flips nothing
        let flipped = registry.sweep_offline(later).await;
        assert!(flipped.is_empty());
    }

    #[tokio::test]
    async fn test_assigned_to_filters_by_source() {
        let registry = DeviceRegistry::new();
        registry
            .upsert(
                "a",
                DeviceUpdate {
                    assigned_source: Some("Camera 1".to_string()),
                    ..Default::default()
                },
            )
            .await;
        registry
            .upsert(
                "b",
                DeviceUpdate {
                    assigned_source: Some("Camera 2".to_string()),
                    ..Default::default()
                },
            )
            .await;
        registry.upsert("c", DeviceUpdate::default()).await;

        let matched = registry.assigned_to("Camera 1").await;
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].device_id, "a");
    }
}
