#![cfg(all(unix, feature = "cli"))]

use std::path::PathBuf;
use std::process::{Command, Output};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/instrlink-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn instrlink(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_instrlink"))
        .arg("--log-level")
        .arg("error")
        .arg("--format")
        .arg("json")
        .args(args)
        .env_remove("INSTRLINK_CONFIG")
        .output()
        .expect("instrlink should run")
}

#[test]
fn version_prints_package_version() {
    let output = instrlink(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("instrlink {}", env!("CARGO_PKG_VERSION")));
}

#[test]
fn read_from_simulated_device() {
    let output = instrlink(&["read", "0x10", "--target", "sim://bench"]);
    assert!(output.status.success(), "{output:?}");
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be json");
    assert_eq!(value["register"], "0x10");
    assert_eq!(value["raw"], "0x00000000");
}

#[test]
fn write_named_register_with_config() {
    let dir = unique_temp_dir("write");
    let config = dir.join("kit.json");
    std::fs::write(
        &config,
        r#"{
            "command": {"transport": "sim", "target": "sim://bench"},
            "schema": {"inline": {"registers": [
                {"name": "STATUS", "address": "0x10", "bit_width": 8}
            ]}}
        }"#,
    )
    .expect("config should be writable");

    let output = instrlink(&["--config", config.to_str().unwrap(), "write", "STATUS", "5"]);
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"written\":true"));
    assert!(stdout.contains("\"address\":\"0x10\""));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unknown_register_returns_60() {
    let output = instrlink(&["read", "NOPE", "--target", "sim://bench"]);
    assert_eq!(output.status.code(), Some(60));
    assert!(String::from_utf8_lossy(&output.stderr).contains("NOPE"));
}

#[test]
fn missing_command_section_returns_64() {
    let output = instrlink(&["read", "0x10"]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn config_with_unknown_option_returns_64() {
    let dir = unique_temp_dir("badcfg");
    let config = dir.join("kit.json");
    std::fs::write(&config, r#"{"command": {"transport": "sim", "target": "sim://a", "speed": 1}}"#)
        .expect("config should be writable");

    let output = instrlink(&["--config", config.to_str().unwrap(), "read", "0x10"]);
    assert_eq!(output.status.code(), Some(64));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn dump_walks_consecutive_words() {
    let output = instrlink(&["dump", "0x100", "12", "--target", "sim://bench"]);
    assert!(output.status.success(), "{output:?}");
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be json");
    assert_eq!(value["length"], 12);
    assert_eq!(value["words"].as_array().map(Vec::len), Some(3));
}

#[test]
fn refused_tcp_target_returns_3() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let target = format!("tcp://127.0.0.1:{port}");
    let output = instrlink(&["read", "0x10", "--target", &target]);
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn exec_runs_icd_command_against_simulator() {
    let dir = unique_temp_dir("exec");
    let config = dir.join("kit.json");
    std::fs::write(
        &config,
        r#"{
            "command": {"transport": "sim", "target": "sim://bench"},
            "icd": {"document": {"inline": {
                "param": {"freq": ["double", 1.0], "locked": ["uint32", 7]},
                "command": {"tune": {
                    "send": [["uint32", "0x5F5F5F5F"], ["uint32", 1], ["uint32", 0], ["uint32", 0], "freq"],
                    "recv": [["uint32", "0xCFCFCFCF"], ["uint32", 1], ["uint32", 0], ["uint32", 0],
                             ["uint32", 0], "locked"]
                }}
            }}}
        }"#,
    )
    .expect("config should be writable");

    let output = instrlink(&[
        "--config",
        config.to_str().unwrap(),
        "exec",
        "freq",
        "--set",
        "freq=2.5",
    ]);
    assert!(output.status.success(), "{output:?}");
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be json");
    assert_eq!(value["commands"], serde_json::json!(["tune"]));
    assert_eq!(value["params"]["freq"], 2.5);
    assert_eq!(value["params"]["locked"], 0);

    let output = instrlink(&["--config", config.to_str().unwrap(), "exec", "nope"]);
    assert_eq!(output.status.code(), Some(60));

    let _ = std::fs::remove_dir_all(&dir);
}
