//! Integration tests for the `vrn-agent` binary.
//!
//! Argument parsing, configuration checking and startup failures; none
//! of these start a long-running agent.
#![allow(clippy::unwrap_used)]

use std::io::Write;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

const HOST: &str = "6f1c2b3a-0000-4000-8000-000000000001";

// ── Helpers ─────────────────────────────────────────────────────────

/// The binary with its environment isolated from the user's config.
fn agent_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("vrn-agent");
    cmd.env("HOME", "/tmp/vrn-agent-test-nonexistent")
        .env("XDG_CONFIG_HOME", "/tmp/vrn-agent-test-nonexistent")
        .env_remove("VRN_CONFIG")
        .env_remove("VRN_AGENT__HOST_ID")
        .env_remove("RUST_LOG");
    cmd
}

fn file(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

fn valid_config() -> tempfile::NamedTempFile {
    file(&format!(
        "[agent]\nhost_id = \"{HOST}\"\n\n[switch]\nlisten_addr = \"127.0.0.1:0\"\n"
    ))
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_no_args_shows_help() {
    let output = agent_cmd().output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Usage"));
}

#[test]
fn test_help_lists_commands() {
    agent_cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("run").and(predicate::str::contains("check-config")),
    );
}

#[test]
fn test_version_flag() {
    agent_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("vrn-agent"));
}

// ── check-config ────────────────────────────────────────────────────

#[test]
fn test_check_config_prints_resolved_settings() {
    let config = valid_config();
    agent_cmd()
        .arg("-c")
        .arg(config.path())
        .arg("check-config")
        .assert()
        .success()
        .stdout(
            predicate::str::contains(HOST)
                .and(predicate::str::contains("30s"))
                .and(predicate::str::contains("127.0.0.1:0"))
                .and(predicate::str::contains("vrn-port-id")),
        );
}

#[test]
fn test_check_config_without_host_id_fails() {
    let config = file("[store]\nroot_path = \"/vrn\"\n");
    agent_cmd()
        .arg("-c")
        .arg(config.path())
        .arg("check-config")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("agent.host_id"));
}

#[test]
fn test_missing_default_config_needs_host_id() {
    agent_cmd().arg("check-config").assert().code(3);
}

#[test]
fn test_check_config_validates_topology() {
    let config = valid_config();
    let seed = file(
        r#"{ "bridges": [{ "id": "00000000-0000-0000-0000-000000000001", "name": "br0" }],
             "ports": [{ "id": "00000000-0000-0000-0000-000000000011",
                         "device_id": "00000000-0000-0000-0000-000000000001" }] }"#,
    );
    agent_cmd()
        .arg("-c")
        .arg(config.path())
        .arg("check-config")
        .arg("--topology")
        .arg(seed.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("2 entities"));
}

#[test]
fn test_dangling_port_in_topology_is_rejected() {
    let config = valid_config();
    let seed = file(
        r#"{ "ports": [{ "id": "00000000-0000-0000-0000-000000000011",
                         "device_id": "00000000-0000-0000-0000-000000000001" }] }"#,
    );
    agent_cmd()
        .arg("-c")
        .arg(config.path())
        .arg("check-config")
        .arg("-t")
        .arg(seed.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid topology seed"));
}

// ── run ─────────────────────────────────────────────────────────────

#[test]
fn test_run_with_invalid_config_exits_before_starting() {
    let config = file("[switch]\narp_timeout_ms = 0\n");
    agent_cmd()
        .arg("-c")
        .arg(config.path())
        .arg("run")
        .assert()
        .code(3);
}

#[test]
fn test_run_with_missing_topology_file_fails() {
    let config = valid_config();
    agent_cmd()
        .arg("-c")
        .arg(config.path())
        .args(["run", "--topology", "/tmp/vrn-agent-test-nonexistent/topology.json"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Cannot read topology file"));
}
