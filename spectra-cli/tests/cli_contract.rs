use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn spectra_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("spectra"));
    cmd.env("HOME", home).env("NO_COLOR", "1");
    cmd
}

fn write_config(home: &Path, yaml: &str) {
    let root = home.join(".spectra");
    fs::create_dir_all(&root).expect("create .spectra");
    fs::write(root.join("config.yaml"), yaml).expect("write config");
}

#[test]
fn help_lists_every_command_group() {
    let home = TempDir::new().expect("home");
    let assert = spectra_cmd(home.path()).arg("--help").assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8");
    for group in ["daemon", "sweep", "health", "watch", "grid", "device", "config"] {
        assert!(stdout.contains(group), "help is missing {group}");
    }
}

#[test]
fn config_without_file_prints_defaults() {
    let home = TempDir::new().expect("home");
    spectra_cmd(home.path())
        .args(["config", "--json"])
        .assert()
        .success()
        .stdout(contains("\"program\": \"hackrf_sweep\""))
        .stdout(contains("\"reconcile_debounce_ms\": 1000"));

    spectra_cmd(home.path())
        .arg("config")
        .assert()
        .success()
        .stdout(contains("missing, using defaults"));
}

#[test]
fn config_file_overrides_are_reported() {
    let home = TempDir::new().expect("home");
    write_config(
        home.path(),
        "capture:\n  program: /opt/sdr/bin/sweeper\nfailures:\n  per_frequency_threshold: 4\n",
    );
    spectra_cmd(home.path())
        .arg("config")
        .assert()
        .success()
        .stdout(contains("/opt/sdr/bin/sweeper"))
        .stdout(contains("blacklist after 4 failures"));
}

#[test]
fn malformed_config_names_the_file() {
    let home = TempDir::new().expect("home");
    write_config(home.path(), "capture: [not, a, mapping\n");
    spectra_cmd(home.path())
        .arg("config")
        .assert()
        .failure()
        .stderr(contains("config.yaml"));
}

#[test]
fn health_without_daemon_reports_not_running() {
    let home = TempDir::new().expect("home");
    spectra_cmd(home.path())
        .arg("health")
        .assert()
        .success()
        .stdout(contains("daemon is not running"));
    spectra_cmd(home.path())
        .args(["health", "--json"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"))
        .stdout(contains("spectra.sock"));
}

#[test]
fn daemon_stop_without_daemon_is_not_an_error() {
    let home = TempDir::new().expect("home");
    spectra_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("daemon is not running"));
}

#[test]
fn session_commands_without_daemon_carry_a_hint() {
    let home = TempDir::new().expect("home");
    spectra_cmd(home.path())
        .args(["sweep", "status"])
        .assert()
        .failure()
        .stderr(contains("daemon is not running"))
        .stderr(contains("spectra daemon start"));
}

#[test]
fn watch_gives_up_after_max_retries() {
    let home = TempDir::new().expect("home");
    spectra_cmd(home.path())
        .args(["watch", "--max-retries", "1", "--retry-secs", "0.05"])
        .assert()
        .failure()
        .stderr(contains("waiting for daemon"))
        .stderr(contains("hint:"));
}

#[test]
fn sweep_start_requires_a_frequency_and_a_known_unit() {
    let home = TempDir::new().expect("home");
    spectra_cmd(home.path())
        .args(["sweep", "start"])
        .assert()
        .failure()
        .stderr(contains("--freq"));
    spectra_cmd(home.path())
        .args(["sweep", "start", "--freq", "100", "--unit", "parsec"])
        .assert()
        .failure()
        .stderr(contains("parsec"));
    spectra_cmd(home.path())
        .args(["sweep", "start", "--freq", "100", "--cycle-time", "-2"])
        .assert()
        .failure()
        .stderr(contains("--cycle-time").or(contains("unexpected argument")));
}
