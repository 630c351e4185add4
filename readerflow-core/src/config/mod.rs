//! Configuration module
//!
//! Handles the tunables of the connection flow and loading/saving them from
//! TOML files.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

pub mod toml_config;

/// Connection flow configuration
///
/// Every field has a default so a partial `[flow]` table is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// How long a scan window lasts before "no readers yet" is logged again.
    /// Finding zero readers never ends the scan on its own.
    #[serde(default = "default_scan_window")]
    pub scan_window_secs: u64,

    /// How long the update-completed alert stays up before advancing to connected
    #[serde(default = "default_update_completed_dwell")]
    pub update_completed_dwell_ms: u64,

    /// Progress at which an optional firmware update can no longer be cancelled
    #[serde(default = "default_cancel_cutoff")]
    pub optional_update_cancel_cutoff: f32,

    /// Connect straight away when the remembered reader shows up in a scan
    #[serde(default = "default_auto_connect")]
    pub auto_connect_known_reader: bool,

    /// Store settings page used when the reader reports an incomplete address
    /// without its own admin URL
    #[serde(default = "default_settings_url")]
    pub store_settings_url: String,
}

fn default_scan_window() -> u64 {
    10
}
fn default_update_completed_dwell() -> u64 {
    1000
}
fn default_cancel_cutoff() -> f32 {
    0.995
}
fn default_auto_connect() -> bool {
    true
}
fn default_settings_url() -> String {
    "https://example.com/wp-admin/admin.php?page=wc-settings&tab=general".to_string()
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            scan_window_secs: default_scan_window(),
            update_completed_dwell_ms: default_update_completed_dwell(),
            optional_update_cancel_cutoff: default_cancel_cutoff(),
            auto_connect_known_reader: default_auto_connect(),
            store_settings_url: default_settings_url(),
        }
    }
}

impl FlowConfig {
    /// Validate the configuration
    ///
    /// # Returns
    ///
    /// * `Ok(())` if all fields are valid
    /// * `Err(ConfigError)` with the first validation error encountered
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_window_secs < 1 || self.scan_window_secs > 300 {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "scan_window_secs must be between 1 and 300, got: {}",
                    self.scan_window_secs
                ),
            });
        }

        if self.update_completed_dwell_ms > 10_000 {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "update_completed_dwell_ms must be at most 10000, got: {}",
                    self.update_completed_dwell_ms
                ),
            });
        }

        if !(self.optional_update_cancel_cutoff > 0.0 && self.optional_update_cancel_cutoff <= 1.0)
        {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "optional_update_cancel_cutoff must be in (0.0, 1.0], got: {}",
                    self.optional_update_cancel_cutoff
                ),
            });
        }

        self.validate_settings_url()
    }

    /// Validate store_settings_url is a valid HTTP/HTTPS URL
    fn validate_settings_url(&self) -> Result<(), ConfigError> {
        use url::Url;

        match Url::parse(&self.store_settings_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
            _ => Err(ConfigError::InvalidUrl {
                url: self.store_settings_url.clone(),
            }),
        }
    }

    /// Scan window as a duration
    pub fn scan_window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.scan_window_secs)
    }

    /// Update-completed dwell as a duration
    pub fn update_completed_dwell(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.update_completed_dwell_ms)
    }
}
