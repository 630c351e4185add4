//! Simulate command implementation
//!
//! Runs a single connection session against a scripted discovery service,
//! rendering every alert snapshot and feeding actions back either from the
//! terminal or from a simple autopilot.

use anyhow::Context;
use colored::Colorize;
use readerflow_core::analytics::TracingAnalytics;
use readerflow_core::config::{toml_config, FlowConfig};
use readerflow_core::discovery::{Scenario, ScriptedDiscoveryService};
use readerflow_core::error::FlowError;
use readerflow_core::flow::{
    AlertAction, AlertSnapshot, Collaborators, ConnectionAlertState, FlowHandle, FlowOutcome,
    FlowRunner,
};
use readerflow_core::known_reader::{FileKnownReaderStore, KnownReaderStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{debug, info};

/// Options of `readerflow simulate`
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub scenario: PathBuf,
    pub config: Option<PathBuf>,
    pub auto: bool,
    pub max_retries: u32,
    pub json: bool,
    pub forget_known_reader: bool,
}

/// Run the simulate command
///
/// # Returns
///
/// The process exit code: 0 when the session connected or was cancelled,
/// 1 when it ended in a failure.
pub fn run_simulate(options: SimulateOptions) -> anyhow::Result<i32> {
    let config = match &options.config {
        Some(path) => toml_config::load_config_from_path(path)
            .with_context(|| format!("Could not load configuration {}", path.display()))?,
        None => toml_config::load_config()?,
    };
    config.validate().map_err(FlowError::from)?;

    let scenario = Scenario::from_file(&options.scenario)
        .map_err(FlowError::from)
        .with_context(|| format!("Could not load scenario {}", options.scenario.display()))?;

    let known_readers = FileKnownReaderStore::new(toml_config::get_known_reader_path()?);
    if options.forget_known_reader {
        known_readers.forget().map_err(FlowError::from)?;
        info!("Forgot known reader at {:?}", known_readers.path());
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;
    let outcome = runtime.block_on(simulate(config, scenario, known_readers, &options))?;

    let renderer = Renderer { json: options.json };
    renderer.outcome(outcome.as_ref())?;

    Ok(match outcome {
        Some(FlowOutcome::Connected { .. }) | Some(FlowOutcome::Cancelled { .. }) => 0,
        Some(FlowOutcome::Failed { .. }) | None => 1,
    })
}

async fn simulate(
    config: FlowConfig,
    scenario: Scenario,
    known_readers: FileKnownReaderStore,
    options: &SimulateOptions,
) -> anyhow::Result<Option<FlowOutcome>> {
    let collaborators = Collaborators {
        discovery: Arc::new(ScriptedDiscoveryService::new(scenario)),
        analytics: Arc::new(TracingAnalytics),
        known_readers: Arc::new(known_readers),
    };
    let (runner, handle) = FlowRunner::new(config, collaborators).map_err(FlowError::from)?;
    let mut snapshots = handle.subscribe();
    let runner_task = tokio::spawn(runner.run());

    let renderer = Renderer { json: options.json };
    let mut autopilot = Autopilot::new(options.max_retries);
    let mut input = if options.auto {
        None
    } else {
        Some(BufReader::new(tokio::io::stdin()).lines())
    };
    let mut snapshot = handle.current();

    handle.start();

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    debug!("Flow runner finished");
                    break;
                }
                snapshot = snapshots.borrow_and_update().clone();
                renderer.snapshot(&snapshot)?;

                if options.auto {
                    if let Some(action) = autopilot.choose(&snapshot) {
                        renderer.note(&format!("autopilot: {}", action));
                        handle.perform(action);
                    }
                } else if !snapshot.actions.is_empty() {
                    prompt(&snapshot);
                }
            }

            line = next_line(&mut input), if !snapshot.actions.is_empty() => {
                match line.context("Failed to read from stdin")? {
                    Some(line) => apply_choice(&handle, &snapshot, &line),
                    None => {
                        renderer.note("stdin closed, cancelling");
                        input = None;
                        handle.cancel();
                    }
                }
            }
        }
    }

    runner_task.await.context("Flow runner task failed")
}

async fn next_line(input: &mut Option<Lines<BufReader<Stdin>>>) -> std::io::Result<Option<String>> {
    match input {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

fn prompt(snapshot: &AlertSnapshot) {
    let choices: Vec<String> = snapshot
        .actions
        .iter()
        .enumerate()
        .map(|(i, action)| format!("[{}] {}", i + 1, action))
        .collect();
    eprintln!("{} {}", "choose:".bold(), choices.join("  "));
}

fn apply_choice(handle: &FlowHandle, snapshot: &AlertSnapshot, line: &str) {
    let line = line.trim();
    let chosen = line
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| snapshot.actions.get(i))
        .or_else(|| {
            snapshot
                .actions
                .iter()
                .find(|action| action.to_string() == line)
        });

    match chosen {
        Some(action) => {
            handle.perform(action.clone());
        }
        None => eprintln!("{} {:?}", "unknown choice".yellow(), line),
    }
}

/// Picks actions without a human at the keyboard
#[derive(Debug)]
struct Autopilot {
    max_retries: u32,
    retries: u32,
}

impl Autopilot {
    fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            retries: 0,
        }
    }

    /// Next action for `snapshot`, `None` to wait for the flow to move on
    fn choose(&mut self, snapshot: &AlertSnapshot) -> Option<AlertAction> {
        let actions = &snapshot.actions;

        if let Some(connect) = actions
            .iter()
            .find(|action| matches!(action, AlertAction::Connect(_)))
        {
            return Some(connect.clone());
        }
        if snapshot.offers(&AlertAction::Done) {
            return Some(AlertAction::Done);
        }
        if snapshot.offers(&AlertAction::Retry) {
            if self.retries < self.max_retries {
                self.retries += 1;
                return Some(AlertAction::Retry);
            }
            return Some(AlertAction::Cancel);
        }
        if snapshot.offers(&AlertAction::Dismiss) {
            return Some(AlertAction::Dismiss);
        }
        if snapshot.state.is_failure() && snapshot.offers(&AlertAction::Cancel) {
            return Some(AlertAction::Cancel);
        }
        None
    }
}

/// Prints snapshots as colored text or JSON lines
#[derive(Debug, Clone, Copy)]
struct Renderer {
    json: bool,
}

impl Renderer {
    fn snapshot(&self, snapshot: &AlertSnapshot) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(snapshot)?);
            return Ok(());
        }

        let headline = describe(&snapshot.state);
        let headline = if snapshot.state.is_failure() {
            headline.red().bold()
        } else if matches!(snapshot.state, ConnectionAlertState::Connected { .. }) {
            headline.green().bold()
        } else {
            headline.cyan()
        };
        println!("{} {}", format!("[{}]", snapshot.generation).dimmed(), headline);
        Ok(())
    }

    fn outcome(&self, outcome: Option<&FlowOutcome>) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::json!({ "result": outcome }));
            return Ok(());
        }

        match outcome {
            Some(outcome @ FlowOutcome::Connected { .. }) => {
                println!("{} {}", "✓".green(), outcome)
            }
            Some(outcome @ FlowOutcome::Cancelled { .. }) => {
                println!("{} {}", "-".yellow(), outcome)
            }
            Some(outcome @ FlowOutcome::Failed { .. }) => println!("{} {}", "✗".red(), outcome),
            None => println!("{} session did not finish", "✗".red()),
        }
        Ok(())
    }

    fn note(&self, message: &str) {
        if !self.json {
            eprintln!("{}", message.dimmed());
        }
    }
}

fn describe(state: &ConnectionAlertState) -> String {
    use ConnectionAlertState as S;

    match state {
        S::Idle => "Idle".to_string(),
        S::ScanningForReaders => "Scanning for readers...".to_string(),
        S::ScanningFailed { error } => format!("Scanning failed: {}", error),
        S::ReaderFound { reader } => format!("Found reader {}", reader),
        S::MultipleReadersFound { readers } => {
            let readers: Vec<&str> = readers.iter().map(|r| r.as_str()).collect();
            format!("Found {} readers: {}", readers.len(), readers.join(", "))
        }
        S::Connecting {
            reader,
            instructions,
        } => format!("Connecting to {}. {}", reader, instructions),
        S::ConnectingFailed { reader, error } => {
            format!("Connecting to {} failed: {}", reader, error)
        }
        S::ConnectingFailedNonRetryable { error } => format!("Cannot connect: {}", error),
        S::ConnectingFailedChargeReader => {
            "Reader battery is too low, charge it before connecting".to_string()
        }
        S::ConnectingFailedUpdateAddress { settings_url } => {
            format!("Complete the store address at {}", settings_url)
        }
        S::ConnectingFailedUpdatePostalCode => "Fix the store postal code".to_string(),
        S::UpdatingFirmware { required, progress } => format!(
            "Installing {} firmware update: {:.0}%",
            if *required { "required" } else { "optional" },
            progress * 100.0
        ),
        S::UpdateFailed { error } => format!("Firmware update failed: {}", error),
        S::UpdateFailedNonRetryable { error } => {
            format!("Firmware update cannot complete: {}", error)
        }
        S::UpdateFailedLowBattery { battery_level } => match battery_level {
            Some(level) => format!(
                "Firmware update failed, reader battery at {:.0}%",
                level * 100.0
            ),
            None => "Firmware update failed, reader battery is low".to_string(),
        },
        S::UpdateCompleted => "Firmware update complete".to_string(),
        S::Connected { reader } => format!("Connected to {}", reader),
        S::CaptureFailed { error } => format!("Payment capture failed: {}", error),
    }
}
