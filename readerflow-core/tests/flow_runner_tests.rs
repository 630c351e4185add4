//! Integration tests for the async flow runner
//!
//! Runs whole sessions against the scripted discovery service with short
//! delays, choosing actions from the published snapshots the way a renderer
//! would.

use readerflow_core::analytics::MemoryAnalytics;
use readerflow_core::config::FlowConfig;
use readerflow_core::discovery::scripted::DiscoveryCall;
use readerflow_core::discovery::{Scenario, ScriptedDiscoveryService};
use readerflow_core::error::{ConfigError, ReaderError};
use readerflow_core::flow::{
    AlertAction, AlertSnapshot, CancellationSource, Collaborators, ConnectionAlertState,
    FlowHandle, FlowOutcome, FlowRunner,
};
use readerflow_core::known_reader::{KnownReaderStore, MemoryKnownReaderStore};
use readerflow_core::types::ReaderId;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Session {
    runner: FlowRunner,
    handle: FlowHandle,
    discovery: Arc<ScriptedDiscoveryService>,
    analytics: Arc<MemoryAnalytics>,
    known_readers: Arc<MemoryKnownReaderStore>,
}

fn test_config() -> FlowConfig {
    FlowConfig {
        scan_window_secs: 1,
        update_completed_dwell_ms: 20,
        ..FlowConfig::default()
    }
}

fn build_collaborators(
    scenario: &str,
) -> (
    Collaborators,
    Arc<ScriptedDiscoveryService>,
    Arc<MemoryAnalytics>,
    Arc<MemoryKnownReaderStore>,
) {
    let scenario = Scenario::from_toml_str(scenario).expect("Scenario should parse");
    let discovery = Arc::new(ScriptedDiscoveryService::new(scenario));
    let analytics = Arc::new(MemoryAnalytics::new());
    let known_readers = Arc::new(MemoryKnownReaderStore::default());
    let collaborators = Collaborators {
        discovery: discovery.clone(),
        analytics: analytics.clone(),
        known_readers: known_readers.clone(),
    };
    (collaborators, discovery, analytics, known_readers)
}

fn session(scenario: &str) -> Session {
    let (collaborators, discovery, analytics, known_readers) = build_collaborators(scenario);
    let (runner, handle) =
        FlowRunner::new(test_config(), collaborators).expect("Test config should be valid");

    Session {
        runner,
        handle,
        discovery,
        analytics,
        known_readers,
    }
}

/// Run a session, answering each snapshot with `choose`
///
/// Returns the outcome and every state name that was observed.
async fn drive(
    session: Session,
    mut choose: impl FnMut(&AlertSnapshot) -> Option<AlertAction> + Send + 'static,
) -> (Option<FlowOutcome>, Vec<&'static str>) {
    let handle = session.handle.clone();
    let mut snapshots = handle.subscribe();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_driver = seen.clone();

    let driver = tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            seen_by_driver.lock().unwrap().push(snapshot.state.name());
            if let Some(action) = choose(&snapshot) {
                handle.perform(action);
            }
        }
    });

    session.handle.start();
    let outcome = tokio::time::timeout(Duration::from_secs(5), session.runner.run())
        .await
        .expect("Session should finish");
    driver.await.expect("Driver should not panic");

    let seen = seen.lock().unwrap().clone();
    (outcome, seen)
}

fn connect_then_done(snapshot: &AlertSnapshot) -> Option<AlertAction> {
    snapshot
        .actions
        .iter()
        .find(|action| matches!(action, AlertAction::Connect(_) | AlertAction::Done))
        .cloned()
}

#[tokio::test]
async fn test_session_connects_through_required_update() {
    // Given: One reader that needs a firmware update
    let s = session(
        r#"
[[scans]]
steps = [{ delay_ms = 5, readers = ["R1"] }]

[[connects]]
delay_ms = 5
update = "required"

[[updates]]
steps = [
  { step = "progress", fraction = 0.5, delay_ms = 5 },
  { step = "completed", delay_ms = 5 },
]
"#,
    );
    let discovery = s.discovery.clone();
    let analytics = s.analytics.clone();
    let known_readers = s.known_readers.clone();

    // When: The user connects and acknowledges
    let (outcome, seen) = drive(s, connect_then_done).await;

    // Then: The session ends connected after passing through the update
    assert_eq!(
        outcome,
        Some(FlowOutcome::Connected {
            reader: ReaderId::from("R1")
        })
    );
    assert!(seen.contains(&"update_completed"), "seen: {:?}", seen);
    assert!(seen.contains(&"connected"), "seen: {:?}", seen);
    assert!(discovery
        .calls()
        .iter()
        .any(|c| matches!(c, DiscoveryCall::UpdateFirmware { .. })));
    assert_eq!(analytics.names(), vec!["card_reader_connection_success"]);
    assert_eq!(
        known_readers.load().unwrap(),
        Some(ReaderId::from("R1"))
    );
}

#[tokio::test]
async fn test_session_retries_failed_connection() {
    // Given: The first connect times out, the second succeeds
    let s = session(
        r#"
[[scans]]
steps = [{ delay_ms = 5, readers = ["R1"] }]

[[connects]]
delay_ms = 5
error = { kind = "bluetooth_connect_timed_out" }

[[connects]]
delay_ms = 5
"#,
    );
    let discovery = s.discovery.clone();

    // When: The user retries once
    let (outcome, seen) = drive(s, |snapshot| {
        if snapshot.offers(&AlertAction::Retry) {
            return Some(AlertAction::Retry);
        }
        connect_then_done(snapshot)
    })
    .await;

    // Then: The reader connects on the second attempt without a new scan
    assert_eq!(
        outcome,
        Some(FlowOutcome::Connected {
            reader: ReaderId::from("R1")
        })
    );
    assert!(seen.contains(&"connecting_failed"), "seen: {:?}", seen);
    let calls = discovery.calls();
    assert_eq!(
        calls
            .iter()
            .filter(|c| matches!(c, DiscoveryCall::Connect { .. }))
            .count(),
        2
    );
    assert_eq!(
        calls
            .iter()
            .filter(|c| matches!(c, DiscoveryCall::StartScan { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_handle_cancel_during_connect() {
    // Given: A slow handshake
    let s = session(
        r#"
[[scans]]
steps = [{ delay_ms = 5, readers = ["R1"] }]

[[connects]]
delay_ms = 200
"#,
    );
    let analytics = s.analytics.clone();
    let known_readers = s.known_readers.clone();
    let canceller = s.handle.clone();

    // When: The host cancels while the reader is connecting
    let (outcome, _) = drive(s, move |snapshot| match &snapshot.state {
        ConnectionAlertState::ReaderFound { reader } => Some(AlertAction::Connect(reader.clone())),
        ConnectionAlertState::Connecting { .. } => {
            canceller.cancel();
            None
        }
        _ => None,
    })
    .await;

    // Then: The late connect success never lands
    assert_eq!(
        outcome,
        Some(FlowOutcome::Cancelled {
            source: CancellationSource::Other
        })
    );
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(analytics.names(), vec!["card_reader_connection_canceled"]);
    assert_eq!(known_readers.load().unwrap(), None);
}

#[tokio::test]
async fn test_scan_failure_dismissed() {
    let s = session(
        r#"
[[scans]]
steps = [{ delay_ms = 5, error = { kind = "bluetooth_disabled" } }]
"#,
    );

    let (outcome, seen) = drive(s, |snapshot| {
        snapshot
            .offers(&AlertAction::Dismiss)
            .then_some(AlertAction::Dismiss)
    })
    .await;

    assert_eq!(
        outcome,
        Some(FlowOutcome::Failed {
            error: ReaderError::BluetoothDisabled
        })
    );
    assert!(seen.contains(&"scanning_failed"), "seen: {:?}", seen);
}

#[tokio::test]
async fn test_multiple_readers_pick_second() {
    let s = session(
        r#"
[[scans]]
steps = [
  { delay_ms = 5, readers = ["A", "B"] },
]
"#,
    );

    let (outcome, _) = drive(s, |snapshot| match &snapshot.state {
        ConnectionAlertState::MultipleReadersFound { readers } => {
            Some(AlertAction::Connect(readers[1].clone()))
        }
        ConnectionAlertState::Connected { .. } => Some(AlertAction::Done),
        _ => None,
    })
    .await;

    assert_eq!(
        outcome,
        Some(FlowOutcome::Connected {
            reader: ReaderId::from("B")
        })
    );
}

#[tokio::test]
async fn test_shutdown_before_session_finishes() {
    let s = session("");
    let handle = s.handle.clone();

    handle.start();
    handle.shutdown();
    let outcome = tokio::time::timeout(Duration::from_secs(1), s.runner.run())
        .await
        .expect("Runner should stop");

    assert_eq!(outcome, None);
    assert!(!handle.start(), "Commands after shutdown are dropped");
}

#[test]
fn test_zero_scan_window_rejected() {
    // Given: A config that was built by hand without validation
    let config = FlowConfig {
        scan_window_secs: 0,
        ..FlowConfig::default()
    };
    let (collaborators, discovery, _, _) = build_collaborators("");

    // When: Creating a runner from it
    let result = FlowRunner::new(config, collaborators);

    // Then: It is refused before any timer is built
    assert!(matches!(
        result,
        Err(ConfigError::ValidationError { ref message }) if message.contains("scan_window_secs")
    ));
    assert!(discovery.calls().is_empty());
}

#[tokio::test]
async fn test_capture_failure_reported_through_handle() {
    let s = session(
        r#"
[[scans]]
steps = [{ delay_ms = 5, readers = ["R1"] }]
"#,
    );
    let reporter = s.handle.clone();
    let analytics = s.analytics.clone();

    let (outcome, seen) = drive(s, move |snapshot| match &snapshot.state {
        ConnectionAlertState::ReaderFound { reader } => Some(AlertAction::Connect(reader.clone())),
        ConnectionAlertState::Connected { .. } => {
            reporter.report_capture_failure(ReaderError::PaymentDeclinedByReader);
            None
        }
        ConnectionAlertState::CaptureFailed { .. } => Some(AlertAction::Dismiss),
        _ => None,
    })
    .await;

    assert_eq!(
        outcome,
        Some(FlowOutcome::Connected {
            reader: ReaderId::from("R1")
        })
    );
    assert!(seen.contains(&"capture_failed"), "seen: {:?}", seen);
    assert_eq!(
        analytics.names(),
        vec![
            "card_reader_connection_success",
            "card_present_capture_failed"
        ]
    );
}
