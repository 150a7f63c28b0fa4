//! Black-box checks of the `flowd-server` binary's command-line surface.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn missing_config_flag_is_a_usage_error() {
    Command::cargo_bin("flowd-server")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("--config"));
}

#[test]
fn nonexistent_config_file_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("flowd-server")
        .unwrap()
        .arg("--config")
        .arg(dir.path().join("missing.yaml"))
        .arg("--run-dir")
        .arg(dir.path())
        .assert()
        .failure();
}
