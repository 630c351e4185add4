//! Core library for the readerflow card reader connection tool
//!
//! This crate provides the connection flow state machine, the discovery
//! service contract it drives, and the configuration and storage around it.

pub mod error;
pub mod types;

pub mod analytics;
pub mod config;
pub mod discovery;
pub mod flow;
pub mod known_reader;

/// Initialize logging infrastructure
///
/// Sets up tracing with systemd journal logging when running under systemd.
/// Otherwise logs to stderr with pretty formatting, at DEBUG when `verbose`.
pub fn init_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    #[cfg(target_os = "linux")]
    {
        if std::env::var("JOURNAL_STREAM").is_ok() {
            let journal_layer = tracing_journald::layer()?;
            tracing_subscriber::registry()
                .with(journal_layer)
                .with(level)
                .init();
            return Ok(());
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr),
        )
        .with(level)
        .init();

    Ok(())
}
