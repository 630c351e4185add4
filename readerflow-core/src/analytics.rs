//! Analytics side channel
//!
//! The flow reports terminal and failure transitions here. Tracking is
//! fire-and-forget: sinks must return immediately and never fail the flow.

use crate::error::ReaderError;
use crate::flow::CancellationSource;
use crate::types::ReaderId;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Events emitted on terminal and failure transitions
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyticsEvent {
    DiscoveryFailed {
        error: ReaderError,
    },
    ConnectionFailed {
        reader: ReaderId,
        error: ReaderError,
    },
    ConnectionSucceeded {
        reader: ReaderId,
    },
    SoftwareUpdateFailed {
        error: ReaderError,
    },
    FlowCancelled {
        source: CancellationSource,
    },
    CaptureFailed {
        error: ReaderError,
    },
}

impl AnalyticsEvent {
    /// Stable event name used by analytics backends
    pub fn name(&self) -> &'static str {
        match self {
            AnalyticsEvent::DiscoveryFailed { .. } => "card_reader_discovery_failed",
            AnalyticsEvent::ConnectionFailed { .. } => "card_reader_connection_failed",
            AnalyticsEvent::ConnectionSucceeded { .. } => "card_reader_connection_success",
            AnalyticsEvent::SoftwareUpdateFailed { .. } => "card_reader_software_update_failed",
            AnalyticsEvent::FlowCancelled { .. } => "card_reader_connection_canceled",
            AnalyticsEvent::CaptureFailed { .. } => "card_present_capture_failed",
        }
    }
}

/// Receiver of analytics events
pub trait AnalyticsSink: Send + Sync {
    fn track(&self, event: AnalyticsEvent);
}

/// Writes analytics events to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnalytics;

impl AnalyticsSink for TracingAnalytics {
    fn track(&self, event: AnalyticsEvent) {
        info!(
            target: "readerflow::analytics",
            event = event.name(),
            details = ?event,
            "Tracked analytics event"
        );
    }
}

/// An analytics event with the time it was tracked
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEvent {
    pub at: DateTime<Utc>,
    pub event: AnalyticsEvent,
}

/// Keeps tracked events in memory, for hosts that batch uploads and for tests
#[derive(Debug, Default)]
pub struct MemoryAnalytics {
    events: Mutex<Vec<TrackedEvent>>,
}

impl MemoryAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    /// All tracked events, oldest first
    pub fn tracked(&self) -> Vec<TrackedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of all tracked events, oldest first
    pub fn names(&self) -> Vec<&'static str> {
        self.tracked().iter().map(|t| t.event.name()).collect()
    }
}

impl AnalyticsSink for MemoryAnalytics {
    fn track(&self, event: AnalyticsEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TrackedEvent {
                at: Utc::now(),
                event,
            });
    }
}
