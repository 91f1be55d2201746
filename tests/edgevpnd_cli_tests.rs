//! Integration tests for edgevpnd
//!
//! Only the offline subcommands are exercised; `run` needs the VPN daemon.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn edgevpnd() -> Command {
    Command::cargo_bin("edgevpnd").unwrap()
}

/// Write a config whose state lives inside `dir`
fn write_config(dir: &Path, extra: &str) -> PathBuf {
    let path = dir.join("edgevpn.toml");
    let content = format!(
        r#"
[server]
vpn_port = 8443
db_path = "{db}"

[network]
ip_pool = "10.8.0.0/24"
dns = ["1.1.1.1"]

{extra}
"#,
        db = dir.join("edgevpn.db").display(),
        extra = extra
    );
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_help_command() {
    edgevpnd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Control plane for an ocserv VPN edge"));
}

#[test]
fn test_render_config() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");

    edgevpnd()
        .arg("--config")
        .arg(&config)
        .arg("render-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("tcp-port = 8443"))
        .stdout(predicate::str::contains("ipv4-network = 10.8.0.0/24"))
        .stdout(predicate::str::contains("dns = 1.1.1.1"));
}

#[test]
fn test_show_config_fills_defaults() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");

    edgevpnd()
        .arg("--config")
        .arg(&config)
        .arg("show-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("vpn_port = 8443"))
        .stdout(predicate::str::contains("idle_timeout = 3600"))
        .stdout(predicate::str::contains("binary = \"ocserv\""));
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "[system]\nidle_timeout = 0\n");

    edgevpnd()
        .arg("--config")
        .arg(&config)
        .arg("show-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("idle_timeout"));
}

#[test]
fn test_listings_on_fresh_database() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");

    edgevpnd()
        .arg("--config")
        .arg(&config)
        .arg("list-leases")
        .assert()
        .success()
        .stdout(predicate::str::contains("ADDRESS"));

    edgevpnd()
        .arg("--config")
        .arg(&config)
        .arg("list-online")
        .assert()
        .success()
        .stdout(predicate::str::contains("USERNAME"));

    edgevpnd()
        .arg("--config")
        .arg(&config)
        .args(["audit-log", "--limit", "5"])
        .assert()
        .success();

    assert!(dir.path().join("edgevpn.db").exists());
}

#[test]
fn test_unknown_group() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");

    edgevpnd()
        .arg("--config")
        .arg(&config)
        .args(["list-leases", "--group", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("group nope"));
}

#[test]
fn test_status_when_daemon_unreachable() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "[daemon]\ncontrol_binary = \"false\"\n");

    edgevpnd()
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Daemon:       stopped"))
        .stdout(predicate::str::contains("Active users: -"));
}
