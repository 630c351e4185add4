//! Reader discovery collaborator
//!
//! The discovery service performs scanning, connection and firmware updates
//! on behalf of the connection flow. Its methods return immediately; results
//! arrive later as [`DiscoveryEvent`]s pushed through the [`EventSink`] held in
//! each operation's [`OperationContext`].

use crate::error::ReaderError;
use crate::types::{Generation, ReaderId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod scripted;

pub use scripted::{Scenario, ScriptedDiscoveryService};

/// Firmware update the reader asks for once connected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareUpdate {
    /// Reader is up to date
    #[default]
    NotNeeded,
    /// An update is available and may be skipped
    Optional,
    /// The reader cannot take payments until the update is installed
    Required,
}

/// Events emitted by a discovery service
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// Current set of readers seen by the scan
    ReadersFound { readers: Vec<ReaderId> },

    /// Scanning could not start or stopped with an error
    ScanFailed { error: ReaderError },

    /// Handshake with the reader completed
    ConnectSucceeded {
        reader: ReaderId,
        update: FirmwareUpdate,
    },

    /// Handshake with the reader failed
    ConnectFailed { reader: ReaderId, error: ReaderError },

    /// Firmware installation progress, 0.0 to 1.0
    UpdateProgress { fraction: f32 },

    /// Firmware installation finished
    UpdateCompleted,

    /// Firmware installation failed
    UpdateFailed { error: ReaderError },
}

/// A discovery event stamped with the generation of the operation that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub generation: Generation,
    pub event: DiscoveryEvent,
}

/// Sending half used by discovery services to report back to the flow
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: Generation,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSink {
    /// Create a sink that tags every event with `generation`
    pub fn new(generation: Generation, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    /// Deliver an event to the flow
    ///
    /// Returns false once the flow has shut down.
    pub fn emit(&self, event: DiscoveryEvent) -> bool {
        let tagged = TaggedEvent {
            generation: self.generation,
            event,
        };
        if self.tx.send(tagged).is_err() {
            tracing::warn!("Discovery event dropped, flow receiver closed");
            return false;
        }
        true
    }
}

/// Everything a discovery operation needs to report back and notice cancellation
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub generation: Generation,
    pub cancel: CancellationToken,
    pub sink: EventSink,
}

impl OperationContext {
    /// Whether the flow has abandoned this operation
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Performs Bluetooth scanning, connection and firmware updates
///
/// Implementations must not block: every method starts work and returns.
pub trait ReaderDiscoveryService: Send + Sync {
    /// Begin scanning; report `ReadersFound` or `ScanFailed` repeatedly until cancelled
    fn start_scan(&self, ctx: OperationContext);

    /// Connect to `reader`; report exactly one `ConnectSucceeded` or `ConnectFailed`
    fn connect(&self, reader: &ReaderId, ctx: OperationContext);

    /// Install the pending firmware; report progress then `UpdateCompleted` or `UpdateFailed`
    fn update_firmware(&self, ctx: OperationContext);

    /// Best-effort abort of whatever is in flight
    fn cancel(&self);
}
