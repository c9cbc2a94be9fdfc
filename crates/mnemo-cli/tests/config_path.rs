use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn config_path_uses_mnemo_home() {
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("mnemo")
        .env("MNEMO_HOME", dir.path())
        .env_remove("MNEMO_CONFIG")
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains(dir.path().to_str().unwrap()))
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn config_flag_overrides_path() {
    let dir = tempdir().unwrap();
    let custom = dir.path().join("custom.toml");

    cargo_bin_cmd!("mnemo")
        .args(["--config", custom.to_str().unwrap(), "config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("custom.toml"));
}

#[test]
fn config_init_creates_file() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.toml");

    assert!(!config_path.exists());

    cargo_bin_cmd!("mnemo")
        .env("MNEMO_HOME", dir.path())
        .env_remove("MNEMO_CONFIG")
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created config at"));

    let contents = fs::read_to_string(&config_path).unwrap();
    assert!(contents.contains("model ="));
    assert!(contents.contains("[shell]"));
}

#[test]
fn config_init_fails_if_exists() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("config.toml"), "# existing config").unwrap();

    cargo_bin_cmd!("mnemo")
        .env("MNEMO_HOME", dir.path())
        .env_remove("MNEMO_CONFIG")
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn malformed_config_is_reported() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("config.toml"), "model = [").unwrap();

    cargo_bin_cmd!("mnemo")
        .env("MNEMO_HOME", dir.path())
        .env_remove("MNEMO_CONFIG")
        .env("ANTHROPIC_API_KEY", "test-api-key")
        .env("ANTHROPIC_BASE_URL", "http://127.0.0.1:9")
        .args(["--root", dir.path().to_str().unwrap(), "exec", "-p", "hi"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("load config"));
}
