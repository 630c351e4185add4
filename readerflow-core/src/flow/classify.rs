//! Classification of raw reader errors into failure alerts
//!
//! Runs once, when a connect or update result reaches the controller. The
//! resulting alert is a leaf that is never classified again.

use crate::config::FlowConfig;
use crate::error::ReaderError;

/// How a failed connection attempt is presented
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectFailure {
    Retryable,
    NonRetryable,
    ChargeReader,
    UpdateAddress { settings_url: String },
    UpdatePostalCode,
    /// The reader failed while installing an update during the handshake
    Update(UpdateFailure),
}

/// How a failed firmware update is presented
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateFailure {
    Retryable,
    NonRetryable,
    LowBattery { battery_level: Option<f32> },
}

fn is_incompatible(error: &ReaderError) -> bool {
    matches!(
        error,
        ReaderError::ReaderIncompatible
            | ReaderError::UnsupportedReaderVersion
            | ReaderError::UnsupportedSdk
            | ReaderError::BluetoothLowEnergyUnsupported
    )
}

/// Classify an error reported by `connect`
pub fn classify_connect_failure(error: &ReaderError, config: &FlowConfig) -> ConnectFailure {
    if error.is_software_update_error() {
        return ConnectFailure::Update(classify_update_failure(error));
    }

    match error {
        ReaderError::BatteryCriticallyLow => ConnectFailure::ChargeReader,
        ReaderError::IncompleteStoreAddress { admin_url } => ConnectFailure::UpdateAddress {
            settings_url: admin_url
                .clone()
                .unwrap_or_else(|| config.store_settings_url.clone()),
        },
        ReaderError::InvalidPostalCode => ConnectFailure::UpdatePostalCode,
        e if is_incompatible(e) => ConnectFailure::NonRetryable,
        _ => ConnectFailure::Retryable,
    }
}

/// Classify an error reported by `update_firmware`
pub fn classify_update_failure(error: &ReaderError) -> UpdateFailure {
    match error {
        ReaderError::SoftwareUpdateFailedBatteryLow { battery_level } => UpdateFailure::LowBattery {
            battery_level: *battery_level,
        },
        e if is_incompatible(e) => UpdateFailure::NonRetryable,
        _ => UpdateFailure::Retryable,
    }
}
