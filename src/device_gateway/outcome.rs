//! Command outcome classification

use serde::Serialize;

/// Terminal state of a device command. A command starts pending (the request
/// in flight, bounded by its timeout) and resolves to exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Explicit success response from the device
    Success { message: String },
    /// Connection reset mid-request: the device is most likely rebooting or
    /// flashing itself, so the command is assumed to have taken effect
    AssumedSuccess { message: String },
    /// Explicit error response, timeout, or transport failure
    Failure { message: String },
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, Self::Failure { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Success { message }
            | Self::AssumedSuccess { message }
            | Self::Failure { message } => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assumed_success_counts_as_success() {
        let outcome = CommandOutcome::AssumedSuccess {
            message: "device reset the connection".to_string(),
        };
        assert!(outcome.succeeded());
        assert!(outcome.message().contains("reset"));
    }

    #[test]
    fn test_failure_does_not() {
        let outcome = CommandOutcome::Failure {
            message: "timed out".to_string(),
        };
        assert!(!outcome.succeeded());
    }
}
