//! CLI integration tests
//!
//! Tests the command-line interface using assert_cmd

use assert_cmd::Command;
use predicates::prelude::*;

/// Get a command for the peercoms binary
fn peercoms_cmd() -> Command {
    Command::cargo_bin("peercoms").unwrap()
}

// ─────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_help_flag() {
    peercoms_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("peercoms"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("version"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version_command() {
    peercoms_cmd()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("peercoms"))
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_short_version_flag() {
    peercoms_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("peercoms"));
}

// ─────────────────────────────────────────────────────────────────
// Config Command Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_show_default() {
    peercoms_cmd()
        .arg("config")
        .arg("show")
        .assert()
        .success()
        .stdout(predicate::str::contains("[node]"))
        .stdout(predicate::str::contains("[coordinator]"))
        .stdout(predicate::str::contains("[transport]"))
        .stdout(predicate::str::contains("[logging]"));
}

#[test]
fn test_config_validate_default() {
    // Default config should always be valid
    peercoms_cmd()
        .arg("config")
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_config_validate_nonexistent_file() {
    peercoms_cmd()
        .arg("config")
        .arg("validate")
        .arg("--config")
        .arg("/nonexistent/path/node.toml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found").or(predicate::str::contains("Error")));
}

#[test]
fn test_config_init_help() {
    peercoms_cmd()
        .arg("config")
        .arg("init")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialize"))
        .stdout(predicate::str::contains("--path"))
        .stdout(predicate::str::contains("--force"));
}

// ─────────────────────────────────────────────────────────────────
// Run Command Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_run_help() {
    peercoms_cmd()
        .arg("run")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Run a peer node"))
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--seed"))
        .stdout(predicate::str::contains("--group"));
}

#[test]
fn test_run_with_invalid_config() {
    peercoms_cmd()
        .arg("run")
        .arg("--config")
        .arg("/nonexistent/node.toml")
        .assert()
        .failure();
}

#[test]
fn test_run_with_bad_seed() {
    peercoms_cmd()
        .arg("run")
        .arg("--seed")
        .arg("not-an-address")
        .assert()
        .failure()
        .stderr(predicate::str::contains("host:port"));
}

// ─────────────────────────────────────────────────────────────────
// Verbosity Flag Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_verbose_flag() {
    peercoms_cmd().arg("-v").arg("version").assert().success();
}

#[test]
fn test_very_verbose_flag() {
    peercoms_cmd().arg("-vv").arg("version").assert().success();
}

#[test]
fn test_quiet_flag() {
    peercoms_cmd().arg("--quiet").arg("version").assert().success();
}

// ─────────────────────────────────────────────────────────────────
// Error Handling Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_unknown_command() {
    peercoms_cmd()
        .arg("unknown-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_missing_subcommand() {
    peercoms_cmd().assert().failure();
}
