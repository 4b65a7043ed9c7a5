//! DeviceRegistry - Tally Device Record Store
//!
//! ## Responsibilities
//!
//! - Canonical set of DeviceRecords keyed by device_id (single source of truth)
//! - Merge-style upserts from heartbeats, pushes, OBS events, user edits
//! - Online status derivation from last_seen against the liveness window
//! - Inbound payload normalization (field-name aliasing)
//!
//! All other components receive an `Arc<DeviceRegistry>`; nothing caches
//! device state beyond a single operation.

pub mod normalizer;
mod store;
mod types;

pub use normalizer::{normalize_tally_entry, normalize_update, NormalizedUpdate};
pub use store::{DeviceRegistry, LIVENESS_WINDOW_SECS};
pub use types::{DeviceRecord, DeviceUpdate, TallyState, UpdateDeviceRequest};
