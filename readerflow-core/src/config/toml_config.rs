//! TOML configuration file I/O
//!
//! Handles loading and saving the flow configuration to/from TOML files
//! in the user's configuration directory.

use crate::config::FlowConfig;
use crate::error::{ConfigError, FlowError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete TOML configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Connection flow settings
    #[serde(default)]
    pub flow: FlowConfig,
}

impl TomlConfig {
    /// Create a new TOML configuration
    pub fn new(flow: FlowConfig) -> Self {
        Self { flow }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, FlowError> {
        use tracing::{debug, warn};

        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FlowError::Config(ConfigError::LoadFailed {
                path: path.to_string_lossy().to_string(),
            }),
            _ => FlowError::Config(ConfigError::IoError {
                message: format!("Failed to read config file: {}", e),
            }),
        })?;

        let config: TomlConfig = toml::from_str(&contents).map_err(|e| {
            FlowError::Config(ConfigError::ValidationError {
                message: format!("Failed to parse config file: {}", e),
            })
        })?;

        config.flow.validate().map_err(|e| {
            warn!("Flow configuration validation failed: {}", e);
            FlowError::Config(e)
        })?;

        debug!(
            "Loaded flow configuration: scan_window={}s, update_dwell={}ms, cancel_cutoff={}, auto_connect={}",
            config.flow.scan_window_secs,
            config.flow.update_completed_dwell_ms,
            config.flow.optional_update_cancel_cutoff,
            config.flow.auto_connect_known_reader
        );

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), FlowError> {
        self.flow.validate()?;

        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Config(ConfigError::IoError {
                    message: format!("Failed to create config directory: {}", e),
                })
            })?;
        }

        std::fs::write(path, contents).map_err(|_e| {
            FlowError::Config(ConfigError::SaveFailed {
                path: path.to_string_lossy().to_string(),
            })
        })?;

        Ok(())
    }
}

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default known reader file name
const KNOWN_READER_FILE_NAME: &str = "known_reader.toml";

/// Get the default configuration directory
///
/// Returns ~/.config/readerflow, or READERFLOW_CONFIG_DIR if set
pub fn get_config_dir() -> Result<PathBuf, FlowError> {
    if let Ok(config_dir) = std::env::var("READERFLOW_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }

    let home = std::env::var("HOME").map_err(|_| {
        FlowError::Config(ConfigError::IoError {
            message: "HOME environment variable not set".to_string(),
        })
    })?;

    Ok(PathBuf::from(home).join(".config").join("readerflow"))
}

/// Get the default configuration file path
pub fn get_config_path() -> Result<PathBuf, FlowError> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Get the default known reader file path
pub fn get_known_reader_path() -> Result<PathBuf, FlowError> {
    Ok(get_config_dir()?.join(KNOWN_READER_FILE_NAME))
}

/// Check if a configuration file exists
pub fn config_exists() -> Result<bool, FlowError> {
    Ok(get_config_path()?.exists())
}

/// Load the flow configuration from the default TOML file
///
/// A missing file yields the defaults; a malformed or invalid file is an error.
pub fn load_config() -> Result<FlowConfig, FlowError> {
    let config_path = get_config_path()?;
    if !config_path.exists() {
        tracing::debug!("No configuration at {:?}, using defaults", config_path);
        return Ok(FlowConfig::default());
    }
    load_config_from_path(&config_path)
}

/// Load the flow configuration from a specific TOML file
pub fn load_config_from_path<P: AsRef<Path>>(path: P) -> Result<FlowConfig, FlowError> {
    Ok(TomlConfig::from_file(path.as_ref())?.flow)
}

/// Save the flow configuration to the default TOML file
pub fn save_config(config: &FlowConfig) -> Result<(), FlowError> {
    let config_path = get_config_path()?;
    save_config_to_path(config, &config_path)
}

/// Save the flow configuration to a specific TOML file
pub fn save_config_to_path<P: AsRef<Path>>(config: &FlowConfig, path: P) -> Result<(), FlowError> {
    TomlConfig::new(config.clone()).to_file(path.as_ref())?;
    tracing::info!("Saved flow configuration to {:?}", path.as_ref());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let original = FlowConfig {
            scan_window_secs: 20,
            update_completed_dwell_ms: 250,
            optional_update_cancel_cutoff: 0.9,
            auto_connect_known_reader: false,
            store_settings_url: "https://shop.example.com/wp-admin/admin.php?page=wc-settings"
                .to_string(),
        };

        save_config_to_path(&original, &config_path).unwrap();
        let loaded = load_config_from_path(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_missing_file_is_load_failed() {
        let temp_dir = tempdir().unwrap();
        let result = load_config_from_path(temp_dir.path().join("absent.toml"));

        assert!(matches!(
            result,
            Err(FlowError::Config(ConfigError::LoadFailed { .. }))
        ));
    }

    #[test]
    fn test_invalid_values_are_rejected_on_load() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "[flow]\nscan_window_secs = 0\n").unwrap();

        assert!(load_config_from_path(&config_path).is_err());
    }

    #[test]
    fn test_invalid_config_is_not_saved() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let config = FlowConfig {
            store_settings_url: "mailto:owner@example.com".to_string(),
            ..FlowConfig::default()
        };

        assert!(save_config_to_path(&config, &config_path).is_err());
        assert!(!config_path.exists());
    }
}
