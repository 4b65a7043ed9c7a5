//! Device discovery - subnet probe for tally hardware
//!
//! Probes every host in a CIDR range for the firmware's
//! `GET /api/device-info` endpoint and upserts responders into the registry.
//! The probe is the external collaborator here; registration itself is just
//! a normalized Store upsert like any other inbound channel.

use crate::device_registry::{normalize_update, DeviceRegistry};
use crate::error::{Error, Result};
use crate::realtime_hub::{HubMessage, RealtimeHub};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

/// Per-host probe timeout
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Hosts probed concurrently
const PROBE_CONCURRENCY: usize = 32;

/// Discovery outcome summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResult {
    pub scanned: usize,
    pub found: Vec<String>,
}

/// Parse CIDR notation into the host addresses it covers
pub fn parse_cidr(cidr: &str) -> Result<Vec<Ipv4Addr>> {
    if !cidr.contains('/') {
        return cidr
            .parse::<Ipv4Addr>()
            .map(|ip| vec![ip])
            .map_err(|e| Error::Validation(format!("Invalid IP: {e}")));
    }

    let (base, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::Validation(format!("Invalid CIDR: {cidr}")))?;
    let base: Ipv4Addr = base
        .parse()
        .map_err(|e| Error::Validation(format!("Invalid IP: {e}")))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|e| Error::Validation(format!("Invalid prefix: {e}")))?;
    if !(16..=32).contains(&prefix) {
        return Err(Error::Validation(format!(
            "Prefix /{prefix} out of range (16-32)"
        )));
    }

    let base_u32 = u32::from(base);
    let mask = if prefix == 32 {
        u32::MAX
    } else {
        !((1u32 << (32 - prefix)) - 1)
    };
    let network = base_u32 & mask;
    let broadcast = network | !mask;

    if prefix >= 31 {
        return Ok((network..=broadcast).map(Ipv4Addr::from).collect());
    }
    // Skip network and broadcast addresses
    Ok(((network + 1)..broadcast).map(Ipv4Addr::from).collect())
}

/// Probe a subnet and register every responding tally device
pub async fn discover(
    cidr: &str,
    registry: &Arc<DeviceRegistry>,
    realtime_hub: &Arc<RealtimeHub>,
) -> Result<DiscoveryResult> {
    let hosts = parse_cidr(cidr)?;
    let scanned = hosts.len();
    tracing::info!(cidr = %cidr, hosts = scanned, "Starting device discovery");

    let client = reqwest::Client::new();
    let responses: Vec<(Ipv4Addr, serde_json::Value)> = stream::iter(hosts)
        .map(|ip| {
            let client = client.clone();
            async move {
                let url = format!("http://{ip}/api/device-info");
                let resp = client.get(&url).timeout(PROBE_TIMEOUT).send().await.ok()?;
                if !resp.status().is_success() {
                    return None;
                }
                let info: serde_json::Value = resp.json().await.ok()?;
                Some((ip, info))
            }
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .filter_map(|found| async move { found })
        .collect()
        .await;

    let mut found = Vec::new();
    for (ip, info) in responses {
        let normalized = normalize_update(&info);
        // Only tally firmware reports a deviceId; other HTTP hosts are skipped
        let Some(device_id) = normalized.device_id else {
            continue;
        };

        let mut update = normalized.update;
        update.ip_address = Some(update.ip_address.unwrap_or_else(|| ip.to_string()));

        let record = registry.touch(&device_id, Utc::now(), update).await;
        tracing::info!(device_id = %record.device_id, ip = %ip, "Discovered device");

        realtime_hub
            .broadcast(HubMessage::Esp32Status(serde_json::json!({
                "event": "discovered",
                "deviceId": record.device_id,
                "ipAddress": ip.to_string(),
            })))
            .await;

        found.push(device_id);
    }

    tracing::info!(cidr = %cidr, found = found.len(), "Discovery finished");
    Ok(DiscoveryResult { scanned, found })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_ip() {
        let hosts = parse_cidr("192.168.1.50").unwrap();
        assert_eq!(hosts, vec![Ipv4Addr::new(192, 168, 1, 50)]);
    }

    #[test]
    fn test_parse_slash_24() {
        let hosts = parse_cidr("192.168.1.0/24").unwrap();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(192, 168, 1, 254));
    }

    #[test]
    fn test_parse_slash_30_skips_network_and_broadcast() {
        let hosts = parse_cidr("10.0.0.0/30").unwrap();
        assert_eq!(
            hosts,
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
        );
    }

    #[test]
    fn test_parse_rejects_wide_prefixes() {
        // A /8 sweep is 16M HTTP probes; refuse it
        assert!(parse_cidr("10.0.0.0/8").is_err());
        assert!(parse_cidr("not-an-ip/24").is_err());
        assert!(parse_cidr("10.0.0.0/33").is_err());
    }
}
