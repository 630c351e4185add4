//! Connection flow controller
//!
//! Owns the alert state and drives the discovery service. Every mutation goes
//! through the methods here; renderers observe the flow through
//! [`AlertSnapshot`]s published on a watch channel.

use crate::analytics::{AnalyticsEvent, AnalyticsSink};
use crate::config::FlowConfig;
use crate::discovery::{
    DiscoveryEvent, EventSink, FirmwareUpdate, OperationContext, ReaderDiscoveryService,
    TaggedEvent,
};
use crate::error::{ReaderError, TransitionError};
use crate::flow::classify::{
    classify_connect_failure, classify_update_failure, ConnectFailure, UpdateFailure,
};
use crate::flow::state::{
    AlertAction, AlertSnapshot, CancellationSource, ConnectionAlertState, FlowOutcome,
    CONNECTING_INSTRUCTIONS,
};
use crate::known_reader::KnownReaderStore;
use crate::types::{Generation, ReaderId};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Services the controller talks to
#[derive(Clone)]
pub struct Collaborators {
    pub discovery: Arc<dyn ReaderDiscoveryService>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub known_readers: Arc<dyn KnownReaderStore>,
}

/// The discovery operation a retry replays
#[derive(Debug, Clone, PartialEq)]
enum Operation {
    Scan,
    Connect(ReaderId),
    Update { required: bool },
}

/// State machine for connecting to a card reader
pub struct ConnectionFlowController {
    config: FlowConfig,
    discovery: Arc<dyn ReaderDiscoveryService>,
    analytics: Arc<dyn AnalyticsSink>,
    known_readers: Arc<dyn KnownReaderStore>,

    state: ConnectionAlertState,
    generation: Generation,
    snapshot_tx: watch::Sender<AlertSnapshot>,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,

    /// Parent token of every operation in the current generation
    session_token: CancellationToken,
    /// Token of the running scan, stopped once a connection starts
    scan_token: Option<CancellationToken>,
    last_operation: Option<Operation>,

    found: Vec<ReaderId>,
    skipped: Vec<ReaderId>,
    list_mode: bool,
    known_reader: Option<ReaderId>,
    auto_connect_attempted: bool,
    connected_reader: Option<ReaderId>,
    empty_scan_windows: u32,
    outcome: Option<FlowOutcome>,
}

impl ConnectionFlowController {
    /// Create a controller in `Idle`
    ///
    /// # Returns
    ///
    /// The controller and the receiving end of the channel its discovery
    /// operations report to. Events read from it go back in via
    /// [`handle_event`](Self::handle_event).
    pub fn new(
        config: FlowConfig,
        collaborators: Collaborators,
    ) -> (Self, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(AlertSnapshot::default());

        let controller = Self {
            config,
            discovery: collaborators.discovery,
            analytics: collaborators.analytics,
            known_readers: collaborators.known_readers,
            state: ConnectionAlertState::Idle,
            generation: Generation::default(),
            snapshot_tx,
            events_tx,
            session_token: CancellationToken::new(),
            scan_token: None,
            last_operation: None,
            found: Vec::new(),
            skipped: Vec::new(),
            list_mode: false,
            known_reader: None,
            auto_connect_attempted: false,
            connected_reader: None,
            empty_scan_windows: 0,
            outcome: None,
        };

        (controller, events_rx)
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn state(&self) -> &ConnectionAlertState {
        &self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Current state with the actions it offers
    pub fn snapshot(&self) -> AlertSnapshot {
        AlertSnapshot {
            generation: self.generation,
            state: self.state.clone(),
            actions: self.available_actions(),
        }
    }

    /// Receiver of every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<AlertSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Whether a session is running
    pub fn is_active(&self) -> bool {
        self.state != ConnectionAlertState::Idle
    }

    /// Outcome of the last finished session, `None` while one is running
    pub fn outcome(&self) -> Option<&FlowOutcome> {
        if self.is_active() {
            return None;
        }
        self.outcome.as_ref()
    }

    /// Actions the current state offers, in display order
    pub fn available_actions(&self) -> Vec<AlertAction> {
        use ConnectionAlertState as S;

        match &self.state {
            S::Idle | S::Connecting { .. } | S::UpdateCompleted => Vec::new(),
            S::ScanningForReaders => vec![AlertAction::Cancel],
            S::ScanningFailed { .. } | S::CaptureFailed { .. } => vec![AlertAction::Dismiss],
            S::ReaderFound { reader } => vec![
                AlertAction::Connect(reader.clone()),
                AlertAction::ContinueSearch,
                AlertAction::Cancel,
            ],
            S::MultipleReadersFound { readers } => readers
                .iter()
                .cloned()
                .map(AlertAction::Connect)
                .chain(std::iter::once(AlertAction::Cancel))
                .collect(),
            S::ConnectingFailed { .. }
            | S::ConnectingFailedUpdateAddress { .. }
            | S::ConnectingFailedUpdatePostalCode
            | S::UpdateFailed { .. } => vec![AlertAction::Retry, AlertAction::Cancel],
            S::ConnectingFailedNonRetryable { .. }
            | S::ConnectingFailedChargeReader
            | S::UpdateFailedNonRetryable { .. }
            | S::UpdateFailedLowBattery { .. } => vec![AlertAction::Cancel],
            S::UpdatingFirmware { required, progress } => {
                if self.update_cancellable(*required, *progress) {
                    vec![AlertAction::Cancel]
                } else {
                    Vec::new()
                }
            }
            S::Connected { .. } => vec![AlertAction::Done],
        }
    }

    fn update_cancellable(&self, required: bool, progress: f32) -> bool {
        !required && progress < self.config.optional_update_cancel_cutoff
    }

    /// Apply an action taken from a snapshot
    ///
    /// Actions the current state does not offer are rejected without touching
    /// the state.
    #[tracing::instrument(
        skip(self),
        fields(state = self.state.name(), generation = %self.generation)
    )]
    pub fn perform(&mut self, action: AlertAction) -> Result<(), TransitionError> {
        if !self.available_actions().contains(&action) {
            if let AlertAction::Connect(reader) = &action {
                if matches!(
                    self.state,
                    ConnectionAlertState::ReaderFound { .. }
                        | ConnectionAlertState::MultipleReadersFound { .. }
                ) {
                    return Err(TransitionError::UnknownReader {
                        reader: reader.to_string(),
                    });
                }
            }
            return Err(self.not_offered(&action.to_string()));
        }

        match action {
            AlertAction::Cancel => self.cancel(),
            AlertAction::Dismiss => self.dismiss(),
            AlertAction::Retry => self.retry(),
            AlertAction::Connect(reader) => self.on_connect_requested(reader),
            AlertAction::ContinueSearch => self.continue_search(),
            AlertAction::Done => self.done(),
        }
    }

    /// Begin a session: `Idle` to `ScanningForReaders`
    ///
    /// Does nothing while a session is already running.
    #[tracing::instrument(skip(self), fields(generation = %self.generation))]
    pub fn start(&mut self) {
        if self.is_active() {
            debug!("Connection flow already running in {}", self.state);
            return;
        }

        self.found.clear();
        self.skipped.clear();
        self.list_mode = false;
        self.auto_connect_attempted = false;
        self.connected_reader = None;
        self.empty_scan_windows = 0;
        self.outcome = None;
        self.known_reader = self.load_known_reader();

        self.next_generation();
        self.launch_scan();
        self.transition(ConnectionAlertState::ScanningForReaders);
    }

    /// End the session from wherever it is
    ///
    /// Aborts in-flight discovery work and raises the generation so late
    /// results are dropped. Refused while a required update installs, and
    /// while an optional update is past the cancel cutoff.
    #[tracing::instrument(
        skip(self),
        fields(state = self.state.name(), generation = %self.generation)
    )]
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        match &self.state {
            ConnectionAlertState::Idle => {
                debug!("Nothing to cancel");
                return Ok(());
            }
            ConnectionAlertState::UpdatingFirmware { required: true, .. } => {
                warn!("Refusing to cancel a required firmware update");
                return Err(TransitionError::MandatoryUpdateInProgress);
            }
            ConnectionAlertState::UpdatingFirmware {
                required: false,
                progress,
            } if !self.update_cancellable(false, *progress) => {
                warn!("Firmware update at {:.1}% is too far along to cancel", progress * 100.0);
                return Err(self.not_offered("cancel"));
            }
            ConnectionAlertState::Connected { .. } | ConnectionAlertState::CaptureFailed { .. } => {
                // Closing after a connection keeps the connected outcome
                self.finish();
                return Ok(());
            }
            ConnectionAlertState::ScanningFailed { error } => {
                self.outcome = Some(FlowOutcome::Failed {
                    error: error.clone(),
                });
                self.finish();
                return Ok(());
            }
            _ => {}
        }

        let source = self.cancellation_source();
        info!("Connection flow cancelled from {}", source);

        self.abort_in_flight();
        self.track(AnalyticsEvent::FlowCancelled { source });
        self.outcome = Some(FlowOutcome::Cancelled { source });
        self.finish();
        Ok(())
    }

    /// Tear down without recording a cancellation, used when the host goes away
    pub fn shutdown(&mut self) {
        if self.is_active() {
            info!("Shutting down connection flow in {}", self.state);
            self.abort_in_flight();
        }
    }

    /// A scan reported the readers it can see
    #[tracing::instrument(
        skip(self, readers),
        fields(count = readers.len(), state = self.state.name())
    )]
    pub fn on_readers_discovered(&mut self, readers: Vec<ReaderId>) {
        if !matches!(
            self.state,
            ConnectionAlertState::ScanningForReaders
                | ConnectionAlertState::ReaderFound { .. }
                | ConnectionAlertState::MultipleReadersFound { .. }
        ) {
            debug!("Ignoring discovered readers in {}", self.state);
            return;
        }

        for reader in readers {
            if !self.found.contains(&reader) {
                self.found.push(reader);
            }
        }
        if self.found.len() > 1 {
            self.list_mode = true;
        }
        self.prune_skipped();

        match self.state {
            ConnectionAlertState::ScanningForReaders => self.advance_from_scanning(),
            ConnectionAlertState::MultipleReadersFound { .. } => {
                self.transition(ConnectionAlertState::MultipleReadersFound {
                    readers: self.found.clone(),
                });
            }
            // The single-reader prompt stays up; continue_search shows the rest
            _ => debug!("Reader prompt already shown, {} readers known", self.found.len()),
        }
    }

    /// A scan could not run
    #[tracing::instrument(skip(self), fields(state = self.state.name()))]
    pub fn on_scan_failed(&mut self, error: ReaderError) {
        if !matches!(
            self.state,
            ConnectionAlertState::ScanningForReaders
                | ConnectionAlertState::ReaderFound { .. }
                | ConnectionAlertState::MultipleReadersFound { .. }
        ) {
            debug!("Ignoring scan failure in {}: {}", self.state, error);
            return;
        }

        warn!("Reader discovery failed: {}", error);
        self.stop_scan();
        self.track(AnalyticsEvent::DiscoveryFailed {
            error: error.clone(),
        });
        self.transition(ConnectionAlertState::ScanningFailed { error });
    }

    /// Each elapsed scan window; zero readers never ends the scan
    pub fn on_scan_window_elapsed(&mut self) {
        if self.state == ConnectionAlertState::ScanningForReaders && self.found.is_empty() {
            self.empty_scan_windows += 1;
            info!(
                windows = self.empty_scan_windows,
                "Still scanning, no readers found yet"
            );
        }
    }

    /// The user picked a reader
    #[tracing::instrument(skip(self), fields(state = self.state.name()))]
    pub fn on_connect_requested(&mut self, reader: ReaderId) -> Result<(), TransitionError> {
        let known = match &self.state {
            ConnectionAlertState::ReaderFound { reader: candidate } => candidate == &reader,
            ConnectionAlertState::MultipleReadersFound { readers } => readers.contains(&reader),
            _ => return Err(self.not_offered("connect")),
        };
        if !known {
            warn!("Connect requested for undiscovered reader {}", reader);
            return Err(TransitionError::UnknownReader {
                reader: reader.to_string(),
            });
        }

        self.begin_connect(reader);
        Ok(())
    }

    /// The handshake with the reader finished
    #[tracing::instrument(skip(self, result), fields(state = self.state.name()))]
    pub fn on_connect_result(&mut self, result: Result<FirmwareUpdate, ReaderError>) {
        let ConnectionAlertState::Connecting { reader, .. } = &self.state else {
            debug!("Ignoring connect result in {}", self.state);
            return;
        };
        let reader = reader.clone();

        match result {
            Ok(update) => {
                info!("Connected to reader {}, firmware update: {:?}", reader, update);
                self.remember_reader(&reader);
                self.connected_reader = Some(reader.clone());
                match update {
                    FirmwareUpdate::NotNeeded => self.enter_connected(reader),
                    FirmwareUpdate::Optional => self.begin_update(false),
                    FirmwareUpdate::Required => self.begin_update(true),
                }
            }
            Err(error) => {
                warn!("Connecting to reader {} failed: {}", reader, error);
                self.found.clear();

                match classify_connect_failure(&error, &self.config) {
                    ConnectFailure::Update(failure) => self.enter_update_failure(failure, error),
                    failure => {
                        self.track(AnalyticsEvent::ConnectionFailed {
                            reader: reader.clone(),
                            error: error.clone(),
                        });
                        let next = match failure {
                            ConnectFailure::NonRetryable => {
                                ConnectionAlertState::ConnectingFailedNonRetryable { error }
                            }
                            ConnectFailure::ChargeReader => {
                                ConnectionAlertState::ConnectingFailedChargeReader
                            }
                            ConnectFailure::UpdateAddress { settings_url } => {
                                ConnectionAlertState::ConnectingFailedUpdateAddress {
                                    settings_url,
                                }
                            }
                            ConnectFailure::UpdatePostalCode => {
                                ConnectionAlertState::ConnectingFailedUpdatePostalCode
                            }
                            _ => ConnectionAlertState::ConnectingFailed { reader, error },
                        };
                        self.transition(next);
                    }
                }
            }
        }
    }

    /// Firmware installation progressed; the state variant stays the same
    pub fn on_firmware_update_progress(&mut self, fraction: f32) {
        let ConnectionAlertState::UpdatingFirmware { required, .. } = self.state else {
            debug!("Ignoring update progress in {}", self.state);
            return;
        };
        if !fraction.is_finite() {
            warn!("Ignoring invalid update progress {}", fraction);
            return;
        }

        self.transition(ConnectionAlertState::UpdatingFirmware {
            required,
            progress: fraction.clamp(0.0, 1.0),
        });
    }

    /// Firmware installation finished
    #[tracing::instrument(skip(self, result), fields(state = self.state.name()))]
    pub fn on_firmware_update_result(&mut self, result: Result<(), ReaderError>) {
        if !matches!(self.state, ConnectionAlertState::UpdatingFirmware { .. }) {
            debug!("Ignoring update result in {}", self.state);
            return;
        }

        match result {
            Ok(()) => {
                info!("Reader firmware update completed");
                self.transition(ConnectionAlertState::UpdateCompleted);
            }
            Err(error) => {
                warn!("Reader firmware update failed: {}", error);
                let failure = classify_update_failure(&error);
                self.enter_update_failure(failure, error);
            }
        }
    }

    /// Leave `UpdateCompleted` for `Connected` once it has been presented
    ///
    /// Returns false when the flow is no longer showing the completed update.
    pub fn complete_update_presentation(&mut self) -> bool {
        if self.state != ConnectionAlertState::UpdateCompleted {
            return false;
        }
        let Some(reader) = self.connected_reader.clone() else {
            warn!("Update completed without a connected reader");
            return false;
        };

        self.enter_connected(reader);
        true
    }

    /// Replay the operation that failed
    #[tracing::instrument(
        skip(self),
        fields(state = self.state.name(), generation = %self.generation)
    )]
    pub fn retry(&mut self) -> Result<(), TransitionError> {
        let retryable = matches!(
            self.state,
            ConnectionAlertState::ConnectingFailed { .. }
                | ConnectionAlertState::ConnectingFailedUpdateAddress { .. }
                | ConnectionAlertState::ConnectingFailedUpdatePostalCode
                | ConnectionAlertState::UpdateFailed { .. }
        );
        let operation = match (&self.last_operation, retryable) {
            (Some(operation), true) => operation.clone(),
            _ => {
                return Err(TransitionError::NotRetryable {
                    state: self.state.name(),
                })
            }
        };

        info!("Retrying {:?}", operation);
        self.next_generation();

        match operation {
            Operation::Scan => {
                self.found.clear();
                self.launch_scan();
                self.transition(ConnectionAlertState::ScanningForReaders);
            }
            Operation::Connect(reader) => self.begin_connect(reader),
            Operation::Update { required } => self.begin_update(required),
        }
        Ok(())
    }

    /// The user came back from the store settings page
    pub fn returned_from_settings(&mut self) -> Result<(), TransitionError> {
        match self.state {
            ConnectionAlertState::ConnectingFailedUpdateAddress { .. }
            | ConnectionAlertState::ConnectingFailedUpdatePostalCode => self.retry(),
            _ => Err(self.not_offered("returned_from_settings")),
        }
    }

    /// Skip the offered reader and keep looking
    #[tracing::instrument(skip(self), fields(state = self.state.name()))]
    pub fn continue_search(&mut self) -> Result<(), TransitionError> {
        let ConnectionAlertState::ReaderFound { reader } = &self.state else {
            return Err(self.not_offered("continue_search"));
        };
        let reader = reader.clone();

        debug!("Skipping reader {}", reader);
        if !self.skipped.contains(&reader) {
            self.skipped.push(reader);
        }
        self.prune_skipped();

        self.transition(ConnectionAlertState::ScanningForReaders);
        self.advance_from_scanning();
        Ok(())
    }

    /// Close a dismissable alert
    pub fn dismiss(&mut self) -> Result<(), TransitionError> {
        match &self.state {
            ConnectionAlertState::ScanningFailed { error } => {
                self.outcome = Some(FlowOutcome::Failed {
                    error: error.clone(),
                });
                self.finish();
                Ok(())
            }
            ConnectionAlertState::CaptureFailed { .. } => {
                self.finish();
                Ok(())
            }
            _ => Err(self.not_offered("dismiss")),
        }
    }

    /// Acknowledge the connected reader and end the session
    pub fn done(&mut self) -> Result<(), TransitionError> {
        if !matches!(self.state, ConnectionAlertState::Connected { .. }) {
            return Err(self.not_offered("done"));
        }
        self.finish();
        Ok(())
    }

    /// Payment capture failed on the connected reader
    #[tracing::instrument(skip(self), fields(state = self.state.name()))]
    pub fn on_capture_failed(&mut self, error: ReaderError) -> Result<(), TransitionError> {
        if !matches!(self.state, ConnectionAlertState::Connected { .. }) {
            return Err(self.not_offered("report_capture_failure"));
        }

        warn!("Payment capture failed: {}", error);
        self.track(AnalyticsEvent::CaptureFailed {
            error: error.clone(),
        });
        self.transition(ConnectionAlertState::CaptureFailed { error });
        Ok(())
    }

    /// Route an event from the discovery service
    ///
    /// Events from an earlier generation are dropped.
    pub fn handle_event(&mut self, tagged: TaggedEvent) {
        if tagged.generation != self.generation {
            debug!(
                "Dropping stale event from generation {} (current {}): {:?}",
                tagged.generation, self.generation, tagged.event
            );
            return;
        }

        match tagged.event {
            DiscoveryEvent::ReadersFound { readers } => self.on_readers_discovered(readers),
            DiscoveryEvent::ScanFailed { error } => self.on_scan_failed(error),
            DiscoveryEvent::ConnectSucceeded { reader, update } => {
                if self.is_connecting_to(&reader) {
                    self.on_connect_result(Ok(update));
                } else {
                    debug!("Ignoring connect success for {}", reader);
                }
            }
            DiscoveryEvent::ConnectFailed { reader, error } => {
                if self.is_connecting_to(&reader) {
                    self.on_connect_result(Err(error));
                } else {
                    debug!("Ignoring connect failure for {}", reader);
                }
            }
            DiscoveryEvent::UpdateProgress { fraction } => {
                self.on_firmware_update_progress(fraction)
            }
            DiscoveryEvent::UpdateCompleted => self.on_firmware_update_result(Ok(())),
            DiscoveryEvent::UpdateFailed { error } => self.on_firmware_update_result(Err(error)),
        }
    }

    fn is_connecting_to(&self, reader: &ReaderId) -> bool {
        matches!(&self.state, ConnectionAlertState::Connecting { reader: r, .. } if r == reader)
    }

    /// Pick the alert to show after new readers or a skipped one
    fn advance_from_scanning(&mut self) {
        if let Some(known) = self.known_reader.clone() {
            if !self.auto_connect_attempted && self.found.contains(&known) {
                info!("Known reader {} found, connecting automatically", known);
                self.auto_connect_attempted = true;
                self.begin_connect(known);
                return;
            }
        }

        if self.list_mode {
            self.transition(ConnectionAlertState::MultipleReadersFound {
                readers: self.found.clone(),
            });
        } else if let Some(reader) = self.found.first().cloned() {
            self.transition(ConnectionAlertState::ReaderFound { reader });
        }
    }

    fn prune_skipped(&mut self) {
        if self.list_mode {
            return;
        }
        let skipped = &self.skipped;
        self.found.retain(|reader| !skipped.contains(reader));
    }

    fn begin_connect(&mut self, reader: ReaderId) {
        self.stop_scan();
        self.last_operation = Some(Operation::Connect(reader.clone()));
        self.discovery.connect(&reader, self.operation_context());
        self.transition(ConnectionAlertState::Connecting {
            reader,
            instructions: CONNECTING_INSTRUCTIONS,
        });
    }

    fn begin_update(&mut self, required: bool) {
        self.last_operation = Some(Operation::Update { required });
        self.discovery.update_firmware(self.operation_context());
        self.transition(ConnectionAlertState::UpdatingFirmware {
            required,
            progress: 0.0,
        });
    }

    fn launch_scan(&mut self) {
        let ctx = self.operation_context();
        self.scan_token = Some(ctx.cancel.clone());
        self.last_operation = Some(Operation::Scan);
        self.discovery.start_scan(ctx);
    }

    fn stop_scan(&mut self) {
        if let Some(token) = self.scan_token.take() {
            token.cancel();
        }
    }

    fn enter_update_failure(&mut self, failure: UpdateFailure, error: ReaderError) {
        self.track(AnalyticsEvent::SoftwareUpdateFailed {
            error: error.clone(),
        });
        let next = match failure {
            UpdateFailure::Retryable => ConnectionAlertState::UpdateFailed { error },
            UpdateFailure::NonRetryable => ConnectionAlertState::UpdateFailedNonRetryable { error },
            UpdateFailure::LowBattery { battery_level } => {
                ConnectionAlertState::UpdateFailedLowBattery { battery_level }
            }
        };
        self.transition(next);
    }

    fn enter_connected(&mut self, reader: ReaderId) {
        self.track(AnalyticsEvent::ConnectionSucceeded {
            reader: reader.clone(),
        });
        self.outcome = Some(FlowOutcome::Connected {
            reader: reader.clone(),
        });
        self.transition(ConnectionAlertState::Connected { reader });
    }

    fn finish(&mut self) {
        self.stop_scan();
        self.session_token.cancel();
        self.last_operation = None;
        self.transition(ConnectionAlertState::Idle);
        if let Some(outcome) = &self.outcome {
            info!("Connection flow finished: {}", outcome);
        }
    }

    fn abort_in_flight(&mut self) {
        self.stop_scan();
        self.discovery.cancel();
        self.next_generation();
    }

    /// Raise the generation and cancel everything tied to the previous one
    fn next_generation(&mut self) {
        self.session_token.cancel();
        self.session_token = CancellationToken::new();
        self.generation = self.generation.next();
        debug!("Generation is now {}", self.generation);
    }

    fn operation_context(&self) -> OperationContext {
        OperationContext {
            generation: self.generation,
            cancel: self.session_token.child_token(),
            sink: EventSink::new(self.generation, self.events_tx.clone()),
        }
    }

    fn cancellation_source(&self) -> CancellationSource {
        use ConnectionAlertState as S;

        match self.state {
            S::ScanningForReaders => CancellationSource::SearchingForReader,
            S::ReaderFound { .. } => CancellationSource::FoundReader,
            S::MultipleReadersFound { .. } => CancellationSource::FoundSeveralReaders,
            S::ConnectingFailed { .. }
            | S::ConnectingFailedNonRetryable { .. }
            | S::ConnectingFailedChargeReader
            | S::ConnectingFailedUpdateAddress { .. }
            | S::ConnectingFailedUpdatePostalCode => CancellationSource::ConnectionError,
            S::UpdatingFirmware { .. }
            | S::UpdateFailed { .. }
            | S::UpdateFailedNonRetryable { .. }
            | S::UpdateFailedLowBattery { .. }
            | S::UpdateCompleted => CancellationSource::ReaderSoftwareUpdate,
            _ => CancellationSource::Other,
        }
    }

    fn load_known_reader(&self) -> Option<ReaderId> {
        if !self.config.auto_connect_known_reader {
            return None;
        }
        match self.known_readers.load() {
            Ok(reader) => reader,
            Err(e) => {
                warn!("Could not load known reader: {}", e);
                None
            }
        }
    }

    fn remember_reader(&self, reader: &ReaderId) {
        if let Err(e) = self.known_readers.remember(reader) {
            warn!("Could not remember reader {}: {}", reader, e);
        }
    }

    fn track(&self, event: AnalyticsEvent) {
        self.analytics.track(event);
    }

    fn not_offered(&self, action: &str) -> TransitionError {
        TransitionError::NotOffered {
            action: action.to_string(),
            state: self.state.name(),
        }
    }

    fn transition(&mut self, next: ConnectionAlertState) {
        if self.state.name() != next.name() {
            info!(
                from = self.state.name(),
                to = next.name(),
                generation = %self.generation,
                "Alert state transition"
            );
        }
        self.state = next;
        self.snapshot_tx.send_replace(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::MemoryAnalytics;
    use crate::discovery::scripted::DiscoveryCall;
    use crate::discovery::ScriptedDiscoveryService;
    use crate::known_reader::MemoryKnownReaderStore;

    fn controller() -> (ConnectionFlowController, Arc<MemoryAnalytics>) {
        let analytics = Arc::new(MemoryAnalytics::new());
        let collaborators = Collaborators {
            discovery: Arc::new(ScriptedDiscoveryService::default()),
            analytics: analytics.clone(),
            known_readers: Arc::new(MemoryKnownReaderStore::default()),
        };
        let (controller, _events) =
            ConnectionFlowController::new(FlowConfig::default(), collaborators);
        (controller, analytics)
    }

    #[test]
    fn test_starts_idle_without_outcome() {
        let (controller, _) = controller();

        assert_eq!(controller.state(), &ConnectionAlertState::Idle);
        assert!(controller.available_actions().is_empty());
        assert!(controller.outcome().is_none());
    }

    #[test]
    fn test_start_is_noop_while_running() {
        let (mut controller, _) = controller();

        controller.start();
        let generation = controller.generation();
        controller.start();

        assert_eq!(controller.generation(), generation);
        assert_eq!(controller.state(), &ConnectionAlertState::ScanningForReaders);
    }

    #[test]
    fn test_progress_updates_in_place() {
        let (mut controller, _) = controller();
        controller.start();
        controller.on_readers_discovered(vec![ReaderId::from("R1")]);
        controller.on_connect_requested(ReaderId::from("R1")).unwrap();
        controller.on_connect_result(Ok(FirmwareUpdate::Optional));

        controller.on_firmware_update_progress(0.5);
        assert_eq!(
            controller.state(),
            &ConnectionAlertState::UpdatingFirmware {
                required: false,
                progress: 0.5
            }
        );
        assert_eq!(controller.available_actions(), vec![AlertAction::Cancel]);

        controller.on_firmware_update_progress(0.996);
        assert!(controller.available_actions().is_empty());
        assert!(controller.cancel().is_err());
    }

    #[test]
    fn test_stale_generation_dropped() {
        let (mut controller, _) = controller();
        controller.start();
        let stale = controller.generation();
        controller.cancel().unwrap();
        controller.start();

        controller.handle_event(TaggedEvent {
            generation: stale,
            event: DiscoveryEvent::ReadersFound {
                readers: vec![ReaderId::from("R1")],
            },
        });

        assert_eq!(controller.state(), &ConnectionAlertState::ScanningForReaders);
    }

    #[test]
    fn test_cancel_records_source_and_analytics() {
        let (mut controller, analytics) = controller();
        controller.start();
        controller.on_readers_discovered(vec![ReaderId::from("R1")]);

        controller.cancel().unwrap();

        assert_eq!(
            controller.outcome(),
            Some(&FlowOutcome::Cancelled {
                source: CancellationSource::FoundReader
            })
        );
        assert_eq!(analytics.names(), vec!["card_reader_connection_canceled"]);
    }

    #[test]
    fn test_scan_window_never_ends_scan() {
        let (mut controller, _) = controller();
        controller.start();

        for _ in 0..5 {
            controller.on_scan_window_elapsed();
        }
        controller.on_readers_discovered(Vec::new());

        assert_eq!(controller.state(), &ConnectionAlertState::ScanningForReaders);
    }

    #[test]
    fn test_connect_stops_scan_without_discovery_cancel() {
        let discovery = Arc::new(ScriptedDiscoveryService::default());
        let collaborators = Collaborators {
            discovery: discovery.clone(),
            analytics: Arc::new(MemoryAnalytics::new()),
            known_readers: Arc::new(MemoryKnownReaderStore::default()),
        };
        let (mut controller, _events) =
            ConnectionFlowController::new(FlowConfig::default(), collaborators);

        controller.start();
        controller.on_readers_discovered(vec![ReaderId::from("R1")]);
        controller.on_connect_requested(ReaderId::from("R1")).unwrap();

        let generation = controller.generation();
        assert_eq!(
            discovery.calls(),
            vec![
                DiscoveryCall::StartScan { generation },
                DiscoveryCall::Connect {
                    reader: ReaderId::from("R1"),
                    generation
                },
            ]
        );
    }
}
