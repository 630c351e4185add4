//! Scripted discovery service
//!
//! Plays back a [`Scenario`] loaded from TOML instead of talking to hardware.
//! Each scan, connect and update attempt takes the next script in its list;
//! once a list is exhausted its last entry repeats. Every call is recorded so
//! callers can check which operations the flow asked for.

use super::{DiscoveryEvent, FirmwareUpdate, OperationContext, ReaderDiscoveryService};
use crate::error::{ReaderError, ScenarioError};
use crate::types::{Generation, ReaderId};
use serde::Deserialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Scripted behaviour for every discovery operation
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Scenario {
    /// One script per scan attempt
    #[serde(default)]
    pub scans: Vec<ScanScript>,

    /// One script per connect attempt
    #[serde(default)]
    pub connects: Vec<ConnectScript>,

    /// One script per firmware update attempt
    #[serde(default)]
    pub updates: Vec<UpdateScript>,
}

/// Steps played back for one scan attempt
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScanScript {
    #[serde(default)]
    pub steps: Vec<ScanStep>,
}

/// A single discovery update, or a scan failure when `error` is set
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScanStep {
    #[serde(default)]
    pub delay_ms: u64,

    #[serde(default)]
    pub readers: Vec<ReaderId>,

    #[serde(default)]
    pub error: Option<ReaderError>,
}

/// Outcome of one connect attempt
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConnectScript {
    #[serde(default)]
    pub delay_ms: u64,

    #[serde(default)]
    pub update: FirmwareUpdate,

    #[serde(default)]
    pub error: Option<ReaderError>,
}

/// Steps played back for one firmware update attempt
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UpdateScript {
    #[serde(default)]
    pub steps: Vec<UpdateStep>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum UpdateStep {
    Progress {
        fraction: f32,
        #[serde(default)]
        delay_ms: u64,
    },
    Completed {
        #[serde(default)]
        delay_ms: u64,
    },
    Failed {
        error: ReaderError,
        #[serde(default)]
        delay_ms: u64,
    },
}

impl Scenario {
    /// Parse a scenario from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = toml::from_str(contents).map_err(|e| ScenarioError::ParseFailed {
            message: e.to_string(),
        })?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Load a scenario from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ScenarioError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ScenarioError::ReadFailed {
            path: path.to_string_lossy().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Check that every progress step is a valid fraction
    pub fn validate(&self) -> Result<(), ScenarioError> {
        for script in &self.updates {
            for step in &script.steps {
                if let UpdateStep::Progress { fraction, .. } = step {
                    if !(0.0_f32..=1.0).contains(fraction) {
                        return Err(ScenarioError::InvalidProgress(*fraction));
                    }
                }
            }
        }
        Ok(())
    }
}

/// A discovery operation the flow asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryCall {
    StartScan { generation: Generation },
    Connect { reader: ReaderId, generation: Generation },
    UpdateFirmware { generation: Generation },
    Cancel,
}

#[derive(Debug, Default)]
struct Attempts {
    scans: usize,
    connects: usize,
    updates: usize,
}

/// Discovery service that replays a [`Scenario`]
///
/// Playback needs a tokio runtime. Without one, calls are still recorded but
/// nothing is emitted, which lets synchronous callers drive events by hand.
#[derive(Debug, Default)]
pub struct ScriptedDiscoveryService {
    scenario: Scenario,
    calls: Mutex<Vec<DiscoveryCall>>,
    attempts: Mutex<Attempts>,
    in_flight: Mutex<Vec<CancellationToken>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pick the script for attempt `n`, repeating the last one when exhausted
fn script_for<T>(scripts: &[T], attempt: usize) -> Option<&T> {
    scripts.get(attempt).or_else(|| scripts.last())
}

impl ScriptedDiscoveryService {
    /// Create a service that plays back `scenario`
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            ..Self::default()
        }
    }

    /// Every call received so far, in order
    pub fn calls(&self) -> Vec<DiscoveryCall> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: DiscoveryCall) {
        debug!(?call, "Discovery call");
        lock(&self.calls).push(call);
    }

    fn next_attempt(&self, pick: impl FnOnce(&mut Attempts) -> &mut usize) -> usize {
        let mut attempts = lock(&self.attempts);
        let counter = pick(&mut *attempts);
        let attempt = *counter;
        *counter += 1;
        attempt
    }

    fn scan_events(&self, attempt: usize) -> Vec<(u64, DiscoveryEvent)> {
        let Some(script) = script_for(&self.scenario.scans, attempt) else {
            return Vec::new();
        };
        script
            .steps
            .iter()
            .map(|step| {
                let event = match &step.error {
                    Some(error) => DiscoveryEvent::ScanFailed {
                        error: error.clone(),
                    },
                    None => DiscoveryEvent::ReadersFound {
                        readers: step.readers.clone(),
                    },
                };
                (step.delay_ms, event)
            })
            .collect()
    }

    fn connect_events(&self, reader: &ReaderId, attempt: usize) -> Vec<(u64, DiscoveryEvent)> {
        let script = script_for(&self.scenario.connects, attempt)
            .cloned()
            .unwrap_or_default();
        let event = match script.error {
            Some(error) => DiscoveryEvent::ConnectFailed {
                reader: reader.clone(),
                error,
            },
            None => DiscoveryEvent::ConnectSucceeded {
                reader: reader.clone(),
                update: script.update,
            },
        };
        vec![(script.delay_ms, event)]
    }

    fn update_events(&self, attempt: usize) -> Vec<(u64, DiscoveryEvent)> {
        let Some(script) = script_for(&self.scenario.updates, attempt) else {
            return vec![(0, DiscoveryEvent::UpdateCompleted)];
        };
        script
            .steps
            .iter()
            .map(|step| match step {
                UpdateStep::Progress { fraction, delay_ms } => (
                    *delay_ms,
                    DiscoveryEvent::UpdateProgress {
                        fraction: *fraction,
                    },
                ),
                UpdateStep::Completed { delay_ms } => (*delay_ms, DiscoveryEvent::UpdateCompleted),
                UpdateStep::Failed { error, delay_ms } => (
                    *delay_ms,
                    DiscoveryEvent::UpdateFailed {
                        error: error.clone(),
                    },
                ),
            })
            .collect()
    }

    fn play(&self, ctx: OperationContext, events: Vec<(u64, DiscoveryEvent)>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, scripted operation {} not played", ctx.generation);
            return;
        };

        let mut in_flight = lock(&self.in_flight);
        in_flight.retain(|token| !token.is_cancelled());
        in_flight.push(ctx.cancel.clone());
        drop(in_flight);

        runtime.spawn(async move {
            for (delay_ms, event) in events {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        debug!("Scripted operation {} cancelled", ctx.generation);
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                }
                if !ctx.sink.emit(event) {
                    return;
                }
            }
        });
    }
}

impl ReaderDiscoveryService for ScriptedDiscoveryService {
    fn start_scan(&self, ctx: OperationContext) {
        self.record(DiscoveryCall::StartScan {
            generation: ctx.generation,
        });
        let attempt = self.next_attempt(|a| &mut a.scans);
        let events = self.scan_events(attempt);
        self.play(ctx, events);
    }

    fn connect(&self, reader: &ReaderId, ctx: OperationContext) {
        self.record(DiscoveryCall::Connect {
            reader: reader.clone(),
            generation: ctx.generation,
        });
        let attempt = self.next_attempt(|a| &mut a.connects);
        let events = self.connect_events(reader, attempt);
        self.play(ctx, events);
    }

    fn update_firmware(&self, ctx: OperationContext) {
        self.record(DiscoveryCall::UpdateFirmware {
            generation: ctx.generation,
        });
        let attempt = self.next_attempt(|a| &mut a.updates);
        let events = self.update_events(attempt);
        self.play(ctx, events);
    }

    fn cancel(&self) {
        self.record(DiscoveryCall::Cancel);
        for token in lock(&self.in_flight).drain(..) {
            token.cancel();
        }
    }
}
