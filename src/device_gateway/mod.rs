//! DeviceGateway - imperative device commands
//!
//! ## Responsibilities
//!
//! - Restart, firmware upload, firmware erase-old, firmware info against a
//!   device's last-known IP
//! - Outcome classification: Success / Failure / AssumedSuccess
//!
//! ## The AssumedSuccess heuristic
//!
//! The on-device OTA library tears the HTTP socket down the same way whether
//! the flash failed or the device is rebooting into the new image, so a
//! connection-reset mid-request is indistinguishable from success. Reset-class
//! errors therefore classify as `AssumedSuccess` after one short reachability
//! probe; an unreachable device is still AssumedSuccess (no response during a
//! flash is expected), not a hard failure. Only explicit error responses and
//! plain timeouts are failures.

mod outcome;

pub use outcome::CommandOutcome;

use crate::error::{Error, Result};
use crate::models::CommandResponse;
use std::path::PathBuf;
use std::time::Duration;

const TALLY_TIMEOUT: Duration = Duration::from_secs(3);
const RESTART_TIMEOUT: Duration = Duration::from_secs(5);
const INFO_TIMEOUT: Duration = Duration::from_secs(5);
const ERASE_TIMEOUT: Duration = Duration::from_secs(10);
// Flash writes on the device take tens of seconds
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(90);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Deletes the staged firmware file on every exit path of an upload
struct TempFirmware {
    path: PathBuf,
}

impl Drop for TempFirmware {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove staged firmware");
            }
        }
    }
}

/// DeviceGateway instance
pub struct DeviceGateway {
    client: reqwest::Client,
}

impl DeviceGateway {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Push the current tally state to the device display. Best-effort: the
    /// next heartbeat response resynchronizes a device that missed a push.
    pub async fn push_tally(
        &self,
        ip: &str,
        state: crate::device_registry::TallyState,
        source: Option<&str>,
    ) -> Result<()> {
        let url = format!("http://{ip}/api/tally");
        let mut body = serde_json::json!({ "tallyStatus": state.device_status() });
        if let Some(source) = source {
            body["assignedSource"] = serde_json::Value::String(source.to_string());
        }

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .timeout(TALLY_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Tally push failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::Network(format!(
                "Tally push returned HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Restart the device. Sends the JSON API route first and falls back to
    /// the legacy HTML route older firmware serves.
    pub async fn restart(&self, ip: &str) -> CommandOutcome {
        let url = format!("http://{ip}/api/restart");
        let result = self
            .client
            .post(&url)
            .timeout(RESTART_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                let legacy = format!("http://{ip}/restart");
                let result = self
                    .client
                    .get(&legacy)
                    .timeout(RESTART_TIMEOUT)
                    .send()
                    .await;
                self.classify(ip, "restart", result).await
            }
            other => self.classify(ip, "restart", other).await,
        }
    }

    /// Query firmware/partition info from the device
    pub async fn firmware_info(&self, ip: &str) -> Result<serde_json::Value> {
        let url = format!("http://{ip}/api/firmware/info");
        let resp = self
            .client
            .get(&url)
            .timeout(INFO_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Firmware info query failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::Network(format!(
                "Firmware info query returned HTTP {}",
                resp.status()
            )));
        }

        Ok(resp.json().await?)
    }

    /// Erase the inactive OTA partition
    pub async fn erase_old_firmware(&self, ip: &str) -> CommandOutcome {
        let url = format!("http://{ip}/api/firmware/erase-old");
        let result = self
            .client
            .post(&url)
            .timeout(ERASE_TIMEOUT)
            .send()
            .await;
        self.classify(ip, "erase-old", result).await
    }

    /// Upload a firmware image staged at `path`. The staged file is deleted
    /// on every exit path (success, failure, early return).
    pub async fn upload_firmware(&self, ip: &str, path: PathBuf) -> CommandOutcome {
        let _cleanup = TempFirmware { path: path.clone() };

        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) => {
                return CommandOutcome::Failure {
                    message: format!("Failed to read staged firmware: {e}"),
                }
            }
        };
        let size = bytes.len();

        tracing::info!(ip = %ip, size_bytes = size, "Uploading firmware");

        let part = reqwest::multipart::Part::bytes(bytes).file_name("firmware.bin");
        let form = reqwest::multipart::Form::new().part("firmware", part);

        let url = format!("http://{ip}/update");
        let result = self
            .client
            .post(&url)
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await;

        self.classify(ip, "firmware upload", result).await
    }

    /// One short reachability check against the device info endpoint
    async fn probe(&self, ip: &str) -> bool {
        let url = format!("http://{ip}/api/device-info");
        matches!(
            self.client.get(&url).timeout(PROBE_TIMEOUT).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }

    /// Classify a request result into a command outcome
    async fn classify(
        &self,
        ip: &str,
        command: &str,
        result: std::result::Result<reqwest::Response, reqwest::Error>,
    ) -> CommandOutcome {
        match result {
            Ok(resp) if resp.status().is_success() => {
                let message = resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|body| body.get("message")?.as_str().map(str::to_string))
                    .unwrap_or_else(|| format!("{command} succeeded"));
                CommandOutcome::Success { message }
            }
            Ok(resp) => CommandOutcome::Failure {
                message: format!("{command} returned HTTP {}", resp.status()),
            },
            Err(e) if is_connection_reset(&e) => {
                tracing::info!(
                    ip = %ip,
                    command = %command,
                    "Connection reset mid-request, probing before assuming success"
                );
                let reachable = self.probe(ip).await;
                CommandOutcome::AssumedSuccess {
                    message: if reachable {
                        format!("{command}: device reset the connection and is back up, assuming success")
                    } else {
                        format!("{command}: device reset the connection (likely rebooting/flashing), assuming success")
                    },
                }
            }
            Err(e) if e.is_timeout() => CommandOutcome::Failure {
                message: format!("{command} timed out"),
            },
            Err(e) => CommandOutcome::Failure {
                message: format!("{command} failed: {e}"),
            },
        }
    }
}

impl Default for DeviceGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl From<CommandOutcome> for CommandResponse {
    fn from(outcome: CommandOutcome) -> Self {
        match outcome {
            CommandOutcome::Success { message } => CommandResponse::success(message),
            CommandOutcome::AssumedSuccess { message } => CommandResponse::assumed(message),
            CommandOutcome::Failure { message } => CommandResponse::failure(message),
        }
    }
}

/// Reset-class errors: the peer closed the socket mid-exchange. Walks the
/// error source chain down to the underlying io::Error.
pub(crate) fn is_connection_reset(err: &reqwest::Error) -> bool {
    use std::error::Error as _;

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        source = cause.source();
    }

    // hyper wraps some resets without a reachable io::Error
    let text = err.to_string();
    text.contains("connection reset") || text.contains("broken pipe")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_firmware_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firmware.bin");
        std::fs::write(&path, b"binary").unwrap();
        assert!(path.exists());

        {
            let _cleanup = TempFirmware { path: path.clone() };
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_temp_firmware_drop_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.bin");
        // Never created; drop must not panic
        let _cleanup = TempFirmware { path };
    }

    #[tokio::test]
    async fn test_refused_connection_is_failure_not_assumed() {
        let gateway = DeviceGateway::new();
        // Nothing listens on port 1: connection refused, not reset-class
        let outcome = gateway.erase_old_firmware("127.0.0.1:1").await;
        assert!(matches!(outcome, CommandOutcome::Failure { .. }));
    }

    #[tokio::test]
    async fn test_upload_missing_file_fails_and_cleans_up() {
        let gateway = DeviceGateway::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");

        let outcome = gateway.upload_firmware("127.0.0.1:1", path.clone()).await;
        assert!(matches!(outcome, CommandOutcome::Failure { .. }));
        assert!(!path.exists());
    }
}
