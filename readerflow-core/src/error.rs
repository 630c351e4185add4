//! Error types for the readerflow connection flow
//!
//! This module defines the raw reader errors reported by a discovery service,
//! the errors returned for rejected user actions, and the configuration and
//! storage errors surfaced by the rest of the crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the readerflow crates
#[derive(Error, Debug)]
pub enum FlowError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors related to scripted scenario files
    #[error("Scenario error: {0}")]
    Scenario(#[from] ScenarioError),

    /// Errors related to the known reader memory
    #[error("Known reader error: {0}")]
    KnownReader(#[from] KnownReaderError),

    /// A user action the current alert does not allow
    #[error("Transition rejected: {0}")]
    Transition(#[from] TransitionError),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Failed to save configuration file: {path}")]
    SaveFailed { path: String },

    #[error("Invalid store settings URL: {url}")]
    InvalidUrl { url: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// Errors raised while loading a scripted discovery scenario
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("Failed to read scenario file {path}: {message}")]
    ReadFailed { path: String, message: String },

    #[error("Failed to parse scenario: {message}")]
    ParseFailed { message: String },

    #[error("Invalid firmware progress {0}: must be between 0.0 and 1.0")]
    InvalidProgress(f32),
}

/// Known reader memory errors
#[derive(Error, Debug)]
pub enum KnownReaderError {
    #[error("Failed to read known reader file {path}: {message}")]
    ReadFailed { path: String, message: String },

    #[error("Failed to write known reader file {path}: {message}")]
    WriteFailed { path: String, message: String },

    #[error("Known reader store lock poisoned")]
    LockPoisoned,
}

/// User actions rejected by the connection flow controller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Action {action} is not offered in state {state}")]
    NotOffered { action: String, state: &'static str },

    #[error("A required firmware update cannot be cancelled")]
    MandatoryUpdateInProgress,

    #[error("Reader {reader} is not among the discovered readers")]
    UnknownReader { reader: String },

    #[error("Nothing to retry in state {state}")]
    NotRetryable { state: &'static str },
}

/// Raw errors reported by a reader discovery service
///
/// Modelled on the card reader SDK's underlying errors that can occur while
/// scanning, connecting, updating firmware or capturing a payment. The flow
/// controller classifies these exactly once, when the result is received.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReaderError {
    #[error("Bluetooth is turned off")]
    BluetoothDisabled,

    #[error("Bluetooth error, the app may not have permission to use Bluetooth")]
    BluetoothError,

    #[error("Scanning for Bluetooth readers timed out")]
    BluetoothScanTimedOut,

    #[error("Connecting to the Bluetooth reader timed out")]
    BluetoothConnectTimedOut,

    #[error("The Bluetooth reader disconnected unexpectedly")]
    BluetoothDisconnected,

    #[error("Bluetooth Low Energy is not supported on this device")]
    BluetoothLowEnergyUnsupported,

    #[error("Location services are disabled")]
    LocationServicesDisabled,

    #[error("The reader battery is critically low, charge it before connecting")]
    BatteryCriticallyLow,

    #[error("The reader is busy")]
    ReaderBusy,

    #[error("The reader is in use by another device")]
    ReaderInUse,

    #[error("Could not communicate with the reader")]
    ReaderCommunicationError,

    #[error("The reader is not compatible")]
    ReaderIncompatible,

    #[error("The reader software version is not supported")]
    UnsupportedReaderVersion,

    #[error("The reader SDK version is not supported")]
    UnsupportedSdk,

    #[error("The store address is incomplete")]
    IncompleteStoreAddress { admin_url: Option<String> },

    #[error("The store postal code is invalid")]
    InvalidPostalCode,

    #[error("Reader software update failed")]
    SoftwareUpdateFailed,

    #[error("Reader software update failed while communicating with the reader")]
    SoftwareUpdateFailedReader,

    #[error("Reader software update failed while communicating with the update server")]
    SoftwareUpdateFailedServer,

    #[error("Reader software update was interrupted")]
    SoftwareUpdateInterrupted,

    #[error("Reader software update failed because the reader battery is low")]
    SoftwareUpdateFailedBatteryLow { battery_level: Option<f32> },

    #[error("The payment was declined by the card reader")]
    PaymentDeclinedByReader,

    #[error("The payment processor returned an error")]
    ProcessorApiError,

    #[error("Not connected to the internet")]
    NotConnectedToInternet,

    #[error("{message}")]
    Other { message: String },
}

impl ReaderError {
    /// Returns true if the error belongs to the reader software update family
    pub fn is_software_update_error(&self) -> bool {
        matches!(
            self,
            ReaderError::SoftwareUpdateFailed
                | ReaderError::SoftwareUpdateFailedReader
                | ReaderError::SoftwareUpdateFailedServer
                | ReaderError::SoftwareUpdateInterrupted
                | ReaderError::SoftwareUpdateFailedBatteryLow { .. }
        )
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, FlowError>;
