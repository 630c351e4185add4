//! Card reader connection flow
//!
//! The state machine that walks a merchant from "find a reader" to "reader
//! connected", plus the async runner that hosts it.

pub mod classify;
pub mod controller;
pub mod runner;
pub mod state;

pub use classify::{
    classify_connect_failure, classify_update_failure, ConnectFailure, UpdateFailure,
};
pub use controller::{Collaborators, ConnectionFlowController};
pub use runner::{FlowCommand, FlowHandle, FlowRunner};
pub use state::{
    AlertAction, AlertSnapshot, CancellationSource, ConnectionAlertState, FlowOutcome,
    CONNECTING_INSTRUCTIONS,
};
