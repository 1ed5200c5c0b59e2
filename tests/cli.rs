mod common;

use serde_json::Value;
use std::{process::Command, sync::Arc};

use common::{line, FakeFactory, FakePlc};
use stationlink::cli::actions::probe_stations;

fn example_config() -> String {
    format!(
        "{}/config/stationlink.example.toml",
        env!("CARGO_MANIFEST_DIR")
    )
}

fn stationlink() -> Command {
    Command::new(env!("CARGO_BIN_EXE_stationlink"))
}

#[test]
fn test_cli_help() {
    let output = stationlink()
        .arg("--help")
        .output()
        .expect("Failed to execute stationlink binary");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage: stationlink"));
}

#[test]
fn test_cli_check_example_json() {
    let output = stationlink()
        .args(["--config", &example_config(), "--check", "--json"])
        .output()
        .expect("Failed to execute stationlink binary");

    assert!(output.status.success());
    let summary: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["valid"], true);
    assert_eq!(summary["stations"].as_array().unwrap().len(), 3);
    assert_eq!(summary["mes"], true);
}

#[test]
fn test_cli_check_station_filter() {
    let output = stationlink()
        .args(["-c", &example_config(), "--check", "-j", "-s", "press-1"])
        .output()
        .expect("Failed to execute stationlink binary");
    assert!(output.status.success());
    let summary: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["stations"], serde_json::json!(["press-1"]));

    let output = stationlink()
        .args(["-c", &example_config(), "--check", "-s", "op99"])
        .output()
        .expect("Failed to execute stationlink binary");
    assert!(!output.status.success());
}

#[test]
fn test_cli_missing_config_fails() {
    let output = stationlink()
        .args(["--config", "/nonexistent/stationlink.toml", "--check"])
        .output()
        .expect("Failed to execute stationlink binary");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to load config"));
}

#[test]
fn test_probe_reads_without_writing() {
    let config = line();
    let plc = FakePlc::new();
    plc.set("DB1.DBX0.0", true);
    plc.set("DB2.DBX0.2", true);
    plc.set_text("DB1.DBB10", "SN-9");

    let reports = probe_stations(&config, Arc::new(FakeFactory(plc.clone())));

    assert_eq!(reports.len(), 2);
    let op10 = &reports[0];
    assert_eq!(op10.station, "op10");
    assert!(op10.bits.unwrap().request);
    assert_eq!(op10.serial.as_deref(), Some("SN-9"));
    assert!(op10.error.is_none());
    assert!(reports[1].bits.unwrap().ok);
    assert_eq!(reports[1].serial, None);
    assert!(plc.writes().is_empty());
}

#[test]
fn test_probe_reports_link_errors() {
    let config = line();
    let plc = FakePlc::new();
    plc.with(|mem| mem.offline = true);

    let reports = probe_stations(&config, Arc::new(FakeFactory(plc)));
    assert!(reports
        .iter()
        .all(|r| r.bits.is_none() && r.error.is_some()));
}
