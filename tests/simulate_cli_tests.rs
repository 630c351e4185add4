//! Integration tests for the simulate and config commands
//!
//! Runs the built binary with the autopilot against scenario files written to
//! a temporary config directory.

use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

const READERFLOW_BINARY: &str = env!("CARGO_BIN_EXE_readerflow");

fn write_scenario(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("scenario.toml");
    std::fs::write(&path, contents).expect("Failed to write scenario");
    path
}

fn simulate(config_dir: &Path, scenario: &Path, extra: &[&str]) -> Output {
    Command::new(READERFLOW_BINARY)
        .env("READERFLOW_CONFIG_DIR", config_dir)
        .arg("simulate")
        .arg("--scenario")
        .arg(scenario)
        .args(["--auto", "--json"])
        .args(extra)
        .output()
        .expect("Failed to run readerflow simulate")
}

fn last_line(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .last()
        .unwrap_or_default()
        .to_string()
}

#[test]
fn test_simulate_help() {
    let output = Command::new(READERFLOW_BINARY)
        .args(["simulate", "--help"])
        .output()
        .expect("Failed to run readerflow simulate --help");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--scenario"));
    assert!(stdout.contains("--auto"));
}

#[test]
fn test_simulate_connects() {
    // Given: A reader that connects straight away
    let dir = TempDir::new().unwrap();
    let scenario = write_scenario(
        &dir,
        r#"
[[scans]]
steps = [{ delay_ms = 10, readers = ["CHB204909005931"] }]
"#,
    );

    // When: The autopilot runs the session
    let output = simulate(dir.path(), &scenario, &[]);

    // Then: It exits cleanly with a connected result and remembers the reader
    assert_eq!(output.status.code(), Some(0), "{:?}", output);
    let result: serde_json::Value = serde_json::from_str(&last_line(&output)).unwrap();
    assert_eq!(result["result"]["outcome"], "connected");
    assert_eq!(result["result"]["reader"], "CHB204909005931");

    let known = std::fs::read_to_string(dir.path().join("known_reader.toml")).unwrap();
    assert!(known.contains("CHB204909005931"));
}

#[test]
fn test_simulate_low_battery_cancels() {
    let dir = TempDir::new().unwrap();
    let scenario = write_scenario(
        &dir,
        r#"
[[scans]]
steps = [{ delay_ms = 10, readers = ["R1"] }]

[[connects]]
error = { kind = "battery_critically_low" }
"#,
    );

    let output = simulate(dir.path(), &scenario, &[]);

    assert_eq!(output.status.code(), Some(0), "{:?}", output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("connecting_failed_charge_reader"));
    let result: serde_json::Value = serde_json::from_str(&last_line(&output)).unwrap();
    assert_eq!(result["result"]["outcome"], "cancelled");
    assert_eq!(result["result"]["source"], "connection_error");
}

#[test]
fn test_simulate_scan_failure_exits_with_failure() {
    let dir = TempDir::new().unwrap();
    let scenario = write_scenario(
        &dir,
        r#"
[[scans]]
steps = [{ delay_ms = 10, error = { kind = "bluetooth_disabled" } }]
"#,
    );

    let output = simulate(dir.path(), &scenario, &[]);

    assert_eq!(output.status.code(), Some(1), "{:?}", output);
    let result: serde_json::Value = serde_json::from_str(&last_line(&output)).unwrap();
    assert_eq!(result["result"]["outcome"], "failed");
    assert_eq!(result["result"]["error"]["kind"], "bluetooth_disabled");
}

#[test]
fn test_simulate_invalid_scenario_is_config_error() {
    let dir = TempDir::new().unwrap();
    let scenario = write_scenario(
        &dir,
        "[[updates]]\nsteps = [{ step = \"progress\", fraction = 3.0 }]\n",
    );

    let output = simulate(dir.path(), &scenario, &[]);

    assert_eq!(output.status.code(), Some(2), "{:?}", output);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid firmware progress"));
}

#[test]
fn test_simulate_missing_scenario_is_config_error() {
    let dir = TempDir::new().unwrap();

    let output = simulate(dir.path(), &dir.path().join("absent.toml"), &[]);

    assert_eq!(output.status.code(), Some(2), "{:?}", output);
}

#[test]
fn test_config_init_then_show() {
    let dir = TempDir::new().unwrap();

    let init = Command::new(READERFLOW_BINARY)
        .env("READERFLOW_CONFIG_DIR", dir.path())
        .args(["config", "init"])
        .output()
        .expect("Failed to run readerflow config init");
    assert!(init.status.success(), "{:?}", init);
    assert!(dir.path().join("config.toml").exists());

    let show = Command::new(READERFLOW_BINARY)
        .env("READERFLOW_CONFIG_DIR", dir.path())
        .args(["config", "show"])
        .output()
        .expect("Failed to run readerflow config show");
    assert!(show.status.success(), "{:?}", show);
    let stdout = String::from_utf8_lossy(&show.stdout);
    assert!(stdout.contains("[flow]"));
    assert!(stdout.contains("scan_window_secs = 10"));
}
