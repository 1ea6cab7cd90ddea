#![allow(clippy::unwrap_used, clippy::expect_used)]

//! CLI smoke tests for the chainstack binary: help output, configuration
//! validation and the read-only commands against an empty stack.

use std::path::Path;
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

fn run_chainstack(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_chainstack"))
        .args(args)
        .env("HOME", home)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("failed to execute chainstack")
}

fn write_config(tmp: &TempDir) -> std::path::PathBuf {
    let path = tmp.path().join("stack.yml");
    std::fs::write(
        &path,
        format!(
            "server:\n  home_dir: {}\nsimulators:\n  - chain_id: 1337\n    port: 48655\n    program: /opt/simd/bin/simd\n",
            tmp.path().join("home").display()
        ),
    )
    .unwrap();
    path
}

#[test]
fn help_lists_the_subcommands() {
    let tmp = TempDir::new().unwrap();
    let output = run_chainstack(tmp.path(), &["--help"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for subcommand in ["up", "down", "status", "pids", "check"] {
        assert!(stdout.contains(subcommand), "help should list {subcommand}");
    }
}

#[test]
fn check_validates_a_config_file() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp);

    let output = run_chainstack(tmp.path(), &["--config", config.to_str().unwrap(), "check"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("configuration is valid"));
    assert!(stdout.contains("1337"));
}

#[test]
fn missing_config_file_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let output = run_chainstack(tmp.path(), &["--config", "/definitely/not/there.yml", "check"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"));
}

#[test]
fn status_reports_absent_services_on_an_idle_host() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp);

    let output = run_chainstack(tmp.path(), &["--config", config.to_str().unwrap(), "status"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("simulator@127.0.0.1:48655#1337"));
    assert!(stdout.contains("Absent"));
}

#[test]
fn pids_renders_an_empty_table_on_an_idle_host() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp);

    let output = run_chainstack(tmp.path(), &["--config", config.to_str().unwrap(), "pids"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("no managed processes running"));
}

#[test]
fn print_config_renders_the_effective_configuration() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp);

    let output = run_chainstack(
        tmp.path(),
        &["--config", config.to_str().unwrap(), "--print-config"],
    );

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"chain_id\": 1337"));
}
