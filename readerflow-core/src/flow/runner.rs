//! Async driver for the connection flow
//!
//! [`FlowRunner::run`] owns the controller on a single task and serialises
//! user commands, discovery events and timers through one `select!` loop.
//! Hosts talk to it through a cloneable [`FlowHandle`].

use crate::config::FlowConfig;
use crate::discovery::TaggedEvent;
use crate::error::{ConfigError, ReaderError, TransitionError};
use crate::flow::controller::{Collaborators, ConnectionFlowController};
use crate::flow::state::{AlertAction, AlertSnapshot, ConnectionAlertState, FlowOutcome};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Commands accepted by a running flow
#[derive(Debug, Clone, PartialEq)]
pub enum FlowCommand {
    /// Begin a session
    Start,

    /// Cancel the session
    Cancel,

    /// Retry the failed operation
    Retry,

    /// Apply an action from the current snapshot
    Perform(AlertAction),

    /// The user returned from the store settings page
    ReturnedFromSettings,

    /// Payment capture failed on the connected reader
    CaptureFailed(ReaderError),

    /// Stop the runner
    Shutdown,
}

/// Cloneable handle to a running flow
///
/// Methods only enqueue commands and never block.
#[derive(Debug, Clone)]
pub struct FlowHandle {
    command_tx: mpsc::UnboundedSender<FlowCommand>,
    snapshot_rx: watch::Receiver<AlertSnapshot>,
}

impl FlowHandle {
    fn send(&self, command: FlowCommand) -> bool {
        if self.command_tx.send(command).is_err() {
            warn!("Flow runner has stopped, command dropped");
            return false;
        }
        true
    }

    pub fn start(&self) -> bool {
        self.send(FlowCommand::Start)
    }

    pub fn cancel(&self) -> bool {
        self.send(FlowCommand::Cancel)
    }

    pub fn retry(&self) -> bool {
        self.send(FlowCommand::Retry)
    }

    pub fn perform(&self, action: AlertAction) -> bool {
        self.send(FlowCommand::Perform(action))
    }

    pub fn returned_from_settings(&self) -> bool {
        self.send(FlowCommand::ReturnedFromSettings)
    }

    pub fn report_capture_failure(&self, error: ReaderError) -> bool {
        self.send(FlowCommand::CaptureFailed(error))
    }

    pub fn shutdown(&self) -> bool {
        self.send(FlowCommand::Shutdown)
    }

    /// A new receiver of alert snapshots
    pub fn subscribe(&self) -> watch::Receiver<AlertSnapshot> {
        self.snapshot_rx.clone()
    }

    /// The latest published snapshot
    pub fn current(&self) -> AlertSnapshot {
        self.snapshot_rx.borrow().clone()
    }
}

/// Runs a [`ConnectionFlowController`] on a tokio task
pub struct FlowRunner {
    controller: ConnectionFlowController,
    events_rx: mpsc::UnboundedReceiver<TaggedEvent>,
    command_rx: mpsc::UnboundedReceiver<FlowCommand>,
}

impl FlowRunner {
    /// Create a runner and the handle that drives it
    ///
    /// Fails when `config` does not pass [`FlowConfig::validate`].
    pub fn new(
        config: FlowConfig,
        collaborators: Collaborators,
    ) -> Result<(Self, FlowHandle), ConfigError> {
        config.validate()?;

        let (controller, events_rx) = ConnectionFlowController::new(config, collaborators);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let handle = FlowHandle {
            command_tx,
            snapshot_rx: controller.subscribe(),
        };
        let runner = Self {
            controller,
            events_rx,
            command_rx,
        };

        Ok((runner, handle))
    }

    /// Process commands and events until a session ends
    ///
    /// # Returns
    ///
    /// The session outcome, or `None` when the runner was shut down (or every
    /// handle dropped) before a session finished.
    pub async fn run(mut self) -> Option<FlowOutcome> {
        let dwell = self.controller.config().update_completed_dwell();

        let mut scan_window = interval(self.controller.config().scan_window());
        scan_window.set_missed_tick_behavior(MissedTickBehavior::Delay);
        scan_window.tick().await; // Consume first immediate tick

        let mut auto_advance_at: Option<Instant> = None;

        loop {
            let auto_advance = async move {
                match auto_advance_at {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(FlowCommand::Shutdown) => {
                            info!("Flow runner shutting down");
                            self.controller.shutdown();
                            return self.controller.outcome().cloned();
                        }
                        Some(command) => self.apply(command),
                        None => {
                            info!("All flow handles dropped, stopping runner");
                            self.controller.shutdown();
                            return self.controller.outcome().cloned();
                        }
                    }
                }

                Some(event) = self.events_rx.recv() => {
                    self.controller.handle_event(event);
                }

                _ = scan_window.tick() => {
                    self.controller.on_scan_window_elapsed();
                }

                _ = auto_advance => {
                    auto_advance_at = None;
                    self.controller.complete_update_presentation();
                }
            }

            if *self.controller.state() == ConnectionAlertState::UpdateCompleted {
                if auto_advance_at.is_none() {
                    debug!("Update completed, advancing in {:?}", dwell);
                    auto_advance_at = Some(Instant::now() + dwell);
                }
            } else {
                auto_advance_at = None;
            }

            if let Some(outcome) = self.controller.outcome() {
                return Some(outcome.clone());
            }
        }
    }

    fn apply(&mut self, command: FlowCommand) {
        debug!("Applying {:?} in {}", command, self.controller.state());

        let result: Result<(), TransitionError> = match command {
            FlowCommand::Start => {
                self.controller.start();
                Ok(())
            }
            FlowCommand::Cancel => self.controller.cancel(),
            FlowCommand::Retry => self.controller.retry(),
            FlowCommand::Perform(action) => self.controller.perform(action),
            FlowCommand::ReturnedFromSettings => self.controller.returned_from_settings(),
            FlowCommand::CaptureFailed(error) => self.controller.on_capture_failed(error),
            FlowCommand::Shutdown => Ok(()),
        };

        if let Err(e) = result {
            warn!("Command rejected: {}", e);
        }
    }
}
