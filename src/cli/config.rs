//! Config command implementation

use anyhow::Context;
use readerflow_core::config::{toml_config, toml_config::TomlConfig, FlowConfig};
use readerflow_core::error::FlowError;
use std::path::PathBuf;

/// Write the default configuration to the config directory
pub fn run_config_init(force: bool) -> anyhow::Result<()> {
    let path = toml_config::get_config_path()?;

    if toml_config::config_exists()? && !force {
        println!("Configuration already exists at {}", path.display());
        println!("Use --force to overwrite it.");
        return Ok(());
    }

    toml_config::save_config(&FlowConfig::default())?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Print the configuration the simulator would use
pub fn run_config_show(path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = match &path {
        Some(path) => toml_config::load_config_from_path(path)
            .with_context(|| format!("Could not load {}", path.display()))?,
        None => toml_config::load_config()?,
    };

    let contents = toml::to_string_pretty(&TomlConfig::new(config)).map_err(FlowError::from)?;
    match path {
        Some(path) => println!("# {}", path.display()),
        None => println!("# {}", toml_config::get_config_path()?.display()),
    }
    print!("{}", contents);
    Ok(())
}
