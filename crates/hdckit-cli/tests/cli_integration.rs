use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;

fn hdckit() -> Command {
    let mut cmd = Command::cargo_bin("hdckit").unwrap();
    cmd.env_remove("HDCKIT_SERIAL")
        .env_remove("HDCKIT_HOST")
        .env_remove("HDCKIT_PORT");
    cmd
}

fn temp_config(name: &str, contents: Option<&str>) -> PathBuf {
    let path = std::env::temp_dir().join(format!("hdckit-cli-{}-{}.json", name, std::process::id()));
    match contents {
        Some(text) => std::fs::write(&path, text).unwrap(),
        None => {
            let _ = std::fs::remove_file(&path);
        }
    }
    path
}

#[test]
fn test_help_exits_zero() {
    hdckit()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("hdckit"))
        .stdout(predicate::str::contains("devices"))
        .stdout(predicate::str::contains("capture"));
}

#[test]
fn test_version_exits_zero() {
    hdckit()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_fport_help_lists_actions() {
    hdckit()
        .args(["fport", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("add"))
        .stdout(predicate::str::contains("rm"))
        .stdout(predicate::str::contains("ls"));
}

#[test]
fn test_unreachable_server_is_connection_error() {
    let config = temp_config("unreachable", None);
    hdckit()
        .args(["--config", config.to_str().unwrap(), "--port", "1", "devices"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Connection error"));
}

#[test]
fn test_port_from_environment() {
    let config = temp_config("env-port", None);
    hdckit()
        .env("HDCKIT_PORT", "1")
        .args(["--config", config.to_str().unwrap(), "kill"])
        .assert()
        .code(2);
}

#[test]
fn test_malformed_config_fails() {
    let config = temp_config("malformed", Some("{ not json"));
    hdckit()
        .args(["--config", config.to_str().unwrap(), "devices"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Action failed"));
    let _ = std::fs::remove_file(config);
}

#[test]
fn test_too_many_combo_keys_rejected_by_parser() {
    hdckit()
        .args(["key", "ctrl_left", "shift_left", "alt_left", "a"])
        .assert()
        .failure();
}

#[test]
fn test_shell_requires_command() {
    hdckit().arg("shell").assert().failure();
}
