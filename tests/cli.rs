use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

const OVERRIDES: [&str; 8] = [
    "TASKGATE_LOG_LEVEL",
    "TASKGATE_LOG_FORMAT",
    "TASKGATE_CAPACITY",
    "TASKGATE_WINDOW_SECS",
    "TASKGATE_STORE_BACKEND",
    "TASKGATE_STORE_PATH",
    "TASKGATE_TASK_LOG",
    "TASKGATE_PORT",
];

fn taskgate() -> Command {
    let mut cmd = Command::cargo_bin("taskgate").unwrap();
    for var in OVERRIDES {
        cmd.env_remove(var);
    }
    cmd
}

/// Config using a SQLite store so state carries across invocations
fn write_config(dir: &Path, capacity: u32) -> std::path::PathBuf {
    let path = dir.join("config.toml");
    let content = format!(
        r#"
[limiter]
capacity = {capacity}

[executor]
log_path = "{log}"

[store]
backend = "sqlite"
path = "{db}"
"#,
        log = dir.join("task.log").display(),
        db = dir.join("state.db").display(),
    );
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_cli_version() {
    taskgate()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("taskgate 0.1.0"));
}

#[test]
fn test_cli_help() {
    taskgate()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Per-user rate-limited task admission",
        ));
}

#[test]
fn test_cli_submit_missing_user_id() {
    taskgate()
        .arg("submit")
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "required arguments were not provided",
        ));
}

#[test]
fn test_cli_missing_config_file() {
    taskgate()
        .args(["--config", "/nonexistent/taskgate.toml", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn test_cli_config_prints_effective_values() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), 7);

    taskgate()
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("capacity = 7"))
        .stdout(predicate::str::contains("backend = \"sqlite\""));
}

#[test]
fn test_cli_env_override() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), 7);

    taskgate()
        .env("TASKGATE_CAPACITY", "3")
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("capacity = 3"));
}

#[test]
fn test_cli_submit_executes_then_queues() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), 1);

    taskgate()
        .arg("--config")
        .arg(&config)
        .args(["submit", "u1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"executed\""))
        .stdout(predicate::str::contains("Task completed."));

    taskgate()
        .arg("--config")
        .arg(&config)
        .args(["submit", "u1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"queued\""))
        .stdout(predicate::str::contains("Task queued due to rate limit."));

    taskgate()
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pending\": 1"));

    let log = std::fs::read_to_string(dir.path().join("task.log")).unwrap();
    assert_eq!(log.lines().count(), 1);
    assert!(log.starts_with("u1-task completed at-"));
}

#[test]
fn test_cli_submit_blank_user_id() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), 1);

    taskgate()
        .arg("--config")
        .arg(&config)
        .args(["submit", " "])
        .assert()
        .failure()
        .stderr(predicate::str::contains("user_id is required"));
}
