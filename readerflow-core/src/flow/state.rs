//! Alert states of the card reader connection flow
//!
//! Exactly one [`ConnectionAlertState`] is current at any time. Renderers get
//! it as part of an [`AlertSnapshot`] together with the actions that state
//! offers, and send back only actions taken from that snapshot.

use crate::error::ReaderError;
use crate::types::{Generation, ReaderId};
use serde::Serialize;
use std::fmt;

/// Instruction shown while the handshake with a reader runs
pub const CONNECTING_INSTRUCTIONS: &str =
    "Keep the reader nearby and powered on while it connects";

/// What the user currently sees
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionAlertState {
    /// No connection flow in progress
    Idle,

    /// Actively searching for nearby readers
    ScanningForReaders,

    /// Discovery failed, e.g. Bluetooth is off
    ScanningFailed { error: ReaderError },

    /// One candidate reader found
    ReaderFound { reader: ReaderId },

    /// Several candidates found; scanning continues and the list may grow
    MultipleReadersFound { readers: Vec<ReaderId> },

    /// Handshake in progress
    Connecting {
        reader: ReaderId,
        instructions: &'static str,
    },

    /// Handshake failed, can be retried
    ConnectingFailed { reader: ReaderId, error: ReaderError },

    /// Handshake failed and retrying cannot help
    ConnectingFailedNonRetryable { error: ReaderError },

    /// Reader battery too low to connect
    ConnectingFailedChargeReader,

    /// The store address must be completed before connecting
    ConnectingFailedUpdateAddress { settings_url: String },

    /// The store postal code must be fixed before connecting
    ConnectingFailedUpdatePostalCode,

    /// Firmware installation in progress; required updates cannot be cancelled
    UpdatingFirmware { required: bool, progress: f32 },

    /// Firmware update failed, can be retried
    UpdateFailed { error: ReaderError },

    /// Firmware update failed and retrying cannot help
    UpdateFailedNonRetryable { error: ReaderError },

    /// Firmware update failed because the reader battery is low
    UpdateFailedLowBattery { battery_level: Option<f32> },

    /// Firmware installed, advances to connected on its own
    UpdateCompleted,

    /// Reader connected
    Connected { reader: ReaderId },

    /// Payment capture failed after the reader connected
    CaptureFailed { error: ReaderError },
}

impl Default for ConnectionAlertState {
    fn default() -> Self {
        Self::Idle
    }
}

impl ConnectionAlertState {
    /// Short stable name, used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionAlertState::Idle => "idle",
            ConnectionAlertState::ScanningForReaders => "scanning_for_readers",
            ConnectionAlertState::ScanningFailed { .. } => "scanning_failed",
            ConnectionAlertState::ReaderFound { .. } => "reader_found",
            ConnectionAlertState::MultipleReadersFound { .. } => "multiple_readers_found",
            ConnectionAlertState::Connecting { .. } => "connecting",
            ConnectionAlertState::ConnectingFailed { .. } => "connecting_failed",
            ConnectionAlertState::ConnectingFailedNonRetryable { .. } => {
                "connecting_failed_non_retryable"
            }
            ConnectionAlertState::ConnectingFailedChargeReader => "connecting_failed_charge_reader",
            ConnectionAlertState::ConnectingFailedUpdateAddress { .. } => {
                "connecting_failed_update_address"
            }
            ConnectionAlertState::ConnectingFailedUpdatePostalCode => {
                "connecting_failed_update_postal_code"
            }
            ConnectionAlertState::UpdatingFirmware { .. } => "updating_firmware",
            ConnectionAlertState::UpdateFailed { .. } => "update_failed",
            ConnectionAlertState::UpdateFailedNonRetryable { .. } => "update_failed_non_retryable",
            ConnectionAlertState::UpdateFailedLowBattery { .. } => "update_failed_low_battery",
            ConnectionAlertState::UpdateCompleted => "update_completed",
            ConnectionAlertState::Connected { .. } => "connected",
            ConnectionAlertState::CaptureFailed { .. } => "capture_failed",
        }
    }

    /// Whether this is one of the failure alerts
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ConnectionAlertState::ScanningFailed { .. }
                | ConnectionAlertState::ConnectingFailed { .. }
                | ConnectionAlertState::ConnectingFailedNonRetryable { .. }
                | ConnectionAlertState::ConnectingFailedChargeReader
                | ConnectionAlertState::ConnectingFailedUpdateAddress { .. }
                | ConnectionAlertState::ConnectingFailedUpdatePostalCode
                | ConnectionAlertState::UpdateFailed { .. }
                | ConnectionAlertState::UpdateFailedNonRetryable { .. }
                | ConnectionAlertState::UpdateFailedLowBattery { .. }
                | ConnectionAlertState::CaptureFailed { .. }
        )
    }
}

impl fmt::Display for ConnectionAlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A user action offered by the current alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    Cancel,
    Dismiss,
    Retry,
    Connect(ReaderId),
    ContinueSearch,
    Done,
}

impl fmt::Display for AlertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertAction::Cancel => write!(f, "cancel"),
            AlertAction::Dismiss => write!(f, "dismiss"),
            AlertAction::Retry => write!(f, "retry"),
            AlertAction::Connect(reader) => write!(f, "connect {}", reader),
            AlertAction::ContinueSearch => write!(f, "continue_search"),
            AlertAction::Done => write!(f, "done"),
        }
    }
}

/// Read-only view of the flow handed to renderers
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertSnapshot {
    pub generation: Generation,
    pub state: ConnectionAlertState,
    pub actions: Vec<AlertAction>,
}

impl AlertSnapshot {
    /// Whether the snapshot offers `action`
    pub fn offers(&self, action: &AlertAction) -> bool {
        self.actions.contains(action)
    }
}

/// Where in the flow the user cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationSource {
    SearchingForReader,
    FoundReader,
    FoundSeveralReaders,
    ConnectionError,
    ReaderSoftwareUpdate,
    Other,
}

impl CancellationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationSource::SearchingForReader => "searching_for_reader",
            CancellationSource::FoundReader => "found_reader",
            CancellationSource::FoundSeveralReaders => "found_several_readers",
            CancellationSource::ConnectionError => "connection_error",
            CancellationSource::ReaderSoftwareUpdate => "reader_software_update",
            CancellationSource::Other => "unknown",
        }
    }
}

impl fmt::Display for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a connection session ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlowOutcome {
    Connected { reader: ReaderId },
    Cancelled { source: CancellationSource },
    Failed { error: ReaderError },
}

impl fmt::Display for FlowOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowOutcome::Connected { reader } => write!(f, "connected to {}", reader),
            FlowOutcome::Cancelled { source } => write!(f, "cancelled ({})", source),
            FlowOutcome::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_idle() {
        assert_eq!(ConnectionAlertState::default(), ConnectionAlertState::Idle);
        assert_eq!(AlertSnapshot::default().actions, Vec::<AlertAction>::new());
    }

    #[test]
    fn test_failure_states() {
        assert!(ConnectionAlertState::ConnectingFailedChargeReader.is_failure());
        assert!(ConnectionAlertState::UpdateFailedLowBattery {
            battery_level: None
        }
        .is_failure());
        assert!(!ConnectionAlertState::ScanningForReaders.is_failure());
        assert!(!ConnectionAlertState::Connected {
            reader: ReaderId::from("R1")
        }
        .is_failure());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", ConnectionAlertState::UpdateCompleted), "update_completed");
        assert_eq!(
            format!("{}", AlertAction::Connect(ReaderId::from("R1"))),
            "connect R1"
        );
        assert_eq!(
            format!(
                "{}",
                FlowOutcome::Cancelled {
                    source: CancellationSource::FoundReader
                }
            ),
            "cancelled (found_reader)"
        );
    }

    #[test]
    fn test_snapshot_serializes_with_state_tag() {
        let snapshot = AlertSnapshot {
            generation: Generation::default(),
            state: ConnectionAlertState::ReaderFound {
                reader: ReaderId::from("R1"),
            },
            actions: vec![AlertAction::Connect(ReaderId::from("R1")), AlertAction::Cancel],
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"]["state"], "reader_found");
        assert_eq!(json["state"]["reader"], "R1");
        assert_eq!(json["actions"][0]["connect"], "R1");
        assert_eq!(json["actions"][1], "cancel");
    }
}
