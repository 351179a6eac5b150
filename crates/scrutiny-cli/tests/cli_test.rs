//! Integration tests for the `scrutiny` CLI binary.
//!
//! These tests validate argument parsing, help output, shell completions,
//! config handling, and error exit codes, all without a live server.
#![allow(clippy::unwrap_used)]

use std::net::TcpListener;
use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────

/// Build a [`Command`] for the `scrutiny` binary with env isolation.
///
/// Clears all `SCRUTINY_*` env vars and points config directories at a
/// nonexistent path so tests never touch the user's real configuration.
fn scrutiny_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("scrutiny");
    cmd.env("HOME", "/tmp/scrutiny-cli-test-nonexistent")
        .env("XDG_CONFIG_HOME", "/tmp/scrutiny-cli-test-nonexistent")
        .env_remove("SCRUTINY_PROFILE")
        .env_remove("SCRUTINY_CONFIG")
        .env_remove("SCRUTINY_HOST")
        .env_remove("SCRUTINY_PORT")
        .env_remove("SCRUTINY_TIMEOUT")
        .env_remove("SCRUTINY_OUTPUT")
        .env_remove("RUST_LOG");
    cmd
}

/// Same, reading and writing `config` instead of the platform path.
fn scrutiny_with_config(config: &Path) -> assert_cmd::Command {
    let mut cmd = scrutiny_cmd();
    cmd.arg("--config").arg(config);
    cmd
}

/// A loopback port with nothing listening on it.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Concatenate stdout + stderr from a command output for flexible matching.
fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{stdout}{stderr}")
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_no_args_shows_help() {
    let output = scrutiny_cmd().output().unwrap();
    assert_eq!(output.status.code(), Some(2), "Expected exit code 2");
    let text = combined_output(&output);
    assert!(
        text.contains("Usage"),
        "Expected 'Usage' in output:\n{text}"
    );
}

#[test]
fn test_help_flag() {
    scrutiny_cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("Scrutiny")
            .and(predicate::str::contains("status"))
            .and(predicate::str::contains("watch"))
            .and(predicate::str::contains("write"))
            .and(predicate::str::contains("link")),
    );
}

#[test]
fn test_version_flag() {
    scrutiny_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("scrutiny"));
}

// ── Shell completions ───────────────────────────────────────────────

#[test]
fn test_completions_bash() {
    scrutiny_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty().not());
}

#[test]
fn test_completions_zsh() {
    scrutiny_cmd()
        .args(["completions", "zsh"])
        .assert()
        .success()
        .stdout(predicate::str::contains("#compdef"));
}

// ── Argument validation (no connection attempted) ───────────────────

#[test]
fn test_invalid_subcommand() {
    let output = scrutiny_cmd().arg("foobar").output().unwrap();
    assert!(
        !output.status.success(),
        "Expected failure for invalid subcommand"
    );
    let text = combined_output(&output);
    assert!(
        text.contains("unrecognized") || text.contains("foobar"),
        "Expected error mentioning invalid subcommand:\n{text}"
    );
}

#[test]
fn test_write_requires_assignment_syntax() {
    let output = scrutiny_cmd()
        .args(["write", "/alias/speed"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(combined_output(&output).contains("PATH=VALUE"));
}

#[test]
fn test_write_rejects_bad_expression_before_connecting() {
    let port = closed_port();
    let output = scrutiny_cmd()
        .args(["--port", &port.to_string(), "write", "/alias/speed=1+(2*"])
        .output()
        .unwrap();
    // Usage error, not a connection failure.
    assert_eq!(output.status.code(), Some(2));
    assert!(combined_output(&output).contains("invalid value for /alias/speed"));
}

#[test]
fn test_link_set_validates_locally() {
    let output = scrutiny_cmd()
        .args([
            "link",
            "set",
            r#"{"type":"canbus","interface":"socketcan","subconfig":{"channel":"can0"},"txid":1,"rxid":2,"fd":false,"bitrate_switch":true}"#,
        ])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(combined_output(&output).contains("bitrate switch requires CAN FD"));
}

#[test]
fn test_watch_count_requires_follow() {
    let output = scrutiny_cmd()
        .args(["watch", "/alias/x", "--count", "3"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_list_rejects_unknown_type() {
    let output = scrutiny_cmd()
        .args(["list", "--type", "register"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(combined_output(&output).contains("rpv"));
}

#[test]
fn test_invalid_output_format() {
    let output = scrutiny_cmd()
        .args(["--output", "invalid", "status"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let text = combined_output(&output);
    assert!(
        text.contains("invalid") || text.contains("possible values"),
        "Expected error about valid output formats:\n{text}"
    );
}

// ── Connection errors ───────────────────────────────────────────────

#[test]
fn test_unreachable_server_exits_with_connection_code() {
    let port = closed_port();
    let output = scrutiny_cmd()
        .args(["--host", "127.0.0.1", "--port", &port.to_string(), "status"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(7), "{}", combined_output(&output));
    assert!(combined_output(&output).contains("connect"));
}

#[test]
fn test_unknown_profile_exits_with_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let output = scrutiny_with_config(&dir.path().join("config.toml"))
        .args(["--profile", "lab", "status"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(4));
    assert!(combined_output(&output).contains("lab"));
}

// ── Config ──────────────────────────────────────────────────────────

#[test]
fn test_config_show_no_config() {
    // A missing file renders the built-in defaults.
    let dir = tempfile::tempdir().unwrap();
    scrutiny_with_config(&dir.path().join("config.toml"))
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("default_profile"));
}

#[test]
fn test_config_init_and_profiles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scrutiny").join("config.toml");

    scrutiny_with_config(&path)
        .args(["config", "init", "--name", "bench", "--server-host", "10.0.0.7"])
        .assert()
        .success();
    assert!(path.exists());

    scrutiny_with_config(&path)
        .args(["--output", "plain", "config", "profiles"])
        .assert()
        .success()
        .stdout(predicate::str::diff("bench\n"));

    scrutiny_with_config(&path)
        .args(["config", "profiles"])
        .assert()
        .success()
        .stdout(predicate::str::contains("10.0.0.7:8765").and(predicate::str::contains("bench *")));

    // A second init must not clobber the file.
    let output = scrutiny_with_config(&path)
        .args(["config", "init"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_config_use_switches_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
default_profile = "a"

[profiles.a]
host = "alpha"

[profiles.b]
host = "bravo"
port = 9000
"#,
    )
    .unwrap();

    scrutiny_with_config(&path)
        .args(["config", "use", "b"])
        .assert()
        .success();
    let saved = std::fs::read_to_string(&path).unwrap();
    assert!(saved.contains(r#"default_profile = "b""#), "{saved}");

    let output = scrutiny_with_config(&path)
        .args(["config", "use", "c"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(4));
    assert!(combined_output(&output).contains("a, b"));
}

#[test]
fn test_config_path_honors_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custom.toml");
    scrutiny_with_config(&path)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("custom.toml"));
}

// ── Subcommand help discovery ───────────────────────────────────────

#[test]
fn test_stats_subcommands_exist() {
    scrutiny_cmd()
        .args(["stats", "--help"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("server")
                .and(predicate::str::contains("count"))
                .and(predicate::str::contains("local")),
        );
}

#[test]
fn test_link_subcommands_exist() {
    scrutiny_cmd()
        .args(["link", "--help"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("show")
                .and(predicate::str::contains("apply"))
                .and(predicate::str::contains("set"))
                .and(predicate::str::contains("disable")),
        );
}

#[test]
fn test_catalog_commands_exist() {
    scrutiny_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("list")
                .and(predicate::str::contains("device"))
                .and(predicate::str::contains("sfd")),
        );
    scrutiny_cmd()
        .args(["list", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--max-per-response"));
}
