//! Entry point and CLI binaries, run as real processes.

use std::process::Command;

use remlaunch::{Payload, PAYLOAD_ENV};

fn entry() -> Command {
    Command::new(env!("CARGO_BIN_EXE_remlaunch-entry"))
}

fn cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_remlaunch"))
}

#[test]
fn test_entry_prints_result() {
    let output = entry()
        .env(PAYLOAD_ENV, Payload::new("add").with_arg(3).with_arg(5).encode())
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "8\n");
}

#[test]
fn test_entry_without_payload_fails_loudly() {
    let output = entry().env_remove(PAYLOAD_ENV).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("REMLAUNCH_PAYLOAD"));
}

#[test]
fn test_entry_reports_function_failure() {
    let output = entry()
        .env(PAYLOAD_ENV, Payload::new("fail").with_arg("disk full").encode())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("disk full"));
}

#[test]
fn test_entry_rejects_unknown_function() {
    let output = entry()
        .env(PAYLOAD_ENV, Payload::new("no_such_function").encode())
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_cli_encode_feeds_entry() {
    let encoded = cli()
        .args(["encode", "add", "3", "--kwarg", "extra=5"])
        .output()
        .unwrap();
    assert!(encoded.status.success());
    let payload = String::from_utf8(encoded.stdout).unwrap();

    let output = entry().env(PAYLOAD_ENV, payload.trim()).output().unwrap();
    assert_eq!(String::from_utf8_lossy(&output.stdout), "8\n");
}

#[test]
fn test_cli_decode_prints_triple() {
    let encoded = Payload::new("echo").with_arg("hi").encode();
    let output = cli().args(["decode", &encoded]).output().unwrap();
    assert!(output.status.success());
    let triple: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(triple, serde_json::json!(["echo", ["hi"], {}]));
}

#[test]
fn test_cli_plan_prints_script_without_running() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("remlaunch.toml");
    std::fs::write(
        &file,
        "[launcher]\ntype = \"local\"\n\n[runner]\ntype = \"shell\"\n\n[launch]\nlaunch_dir = \"/tmp/remlaunch-plan-test\"\n",
    )
    .unwrap();

    let output = cli()
        .args(["plan", "--file"])
        .arg(&file)
        .args(["--defaults", "/nonexistent/defaults.toml", "--parallel", "2", "echo", "hi"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let script = String::from_utf8(output.stdout).unwrap();
    assert!(script.starts_with("#!/bin/bash"));
    assert_eq!(script.matches("REMLAUNCH_PAYLOAD=").count(), 2);
    assert!(!std::path::Path::new("/tmp/remlaunch-plan-test/launch.log").exists());
}

#[test]
fn test_cli_bad_launch_file_exits_with_config_code() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("remlaunch.toml");
    std::fs::write(&file, "[launcher]\ntype = \"teleport\"\n").unwrap();

    let output = cli()
        .args(["plan", "--file"])
        .arg(&file)
        .arg("echo")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}
