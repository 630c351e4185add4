//! readerflow - card reader connection flow simulator
//!
//! Runs the card reader connection flow against a scripted discovery
//! service so every alert, failure and retry path can be walked through
//! from a terminal.

use clap::{Parser, Subcommand};
use readerflow_core::{error::FlowError, init_logging};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "readerflow")]
#[command(about = "Card reader discovery and connection flow simulator")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one connection session against a scripted scenario
    Simulate {
        /// Scenario file describing what the discovery service reports
        #[arg(short, long)]
        scenario: PathBuf,

        /// Configuration file (defaults to ~/.config/readerflow/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Pick actions automatically instead of prompting
        #[arg(long)]
        auto: bool,

        /// Retries the autopilot attempts before cancelling
        #[arg(long, default_value_t = 1)]
        max_retries: u32,

        /// Print snapshots and the outcome as JSON lines
        #[arg(long)]
        json: bool,

        /// Forget the remembered reader before starting
        #[arg(long)]
        forget_known_reader: bool,
    },
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write the default configuration
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show {
        /// Configuration file to read instead of the default
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// Exit code for an error that stopped the command
fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<FlowError>() {
        // Configuration and scenario problems (exit code 2)
        Some(FlowError::Config(_))
        | Some(FlowError::Scenario(_))
        | Some(FlowError::TomlSerialize(_)) => 2,
        // Known reader storage is part of the local setup (exit code 2)
        Some(FlowError::KnownReader(_)) => 2,
        // Everything else happened while running (exit code 1)
        _ => 1,
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    let result = match cli.command {
        Commands::Simulate {
            scenario,
            config,
            auto,
            max_retries,
            json,
            forget_known_reader,
        } => cli::simulate::run_simulate(cli::simulate::SimulateOptions {
            scenario,
            config,
            auto,
            max_retries,
            json,
            forget_known_reader,
        }),
        Commands::Config { action } => match action {
            ConfigCommands::Init { force } => cli::config::run_config_init(force).map(|()| 0),
            ConfigCommands::Show { config } => cli::config::run_config_show(config).map(|()| 0),
        },
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(exit_code(&e));
        }
    }
}
