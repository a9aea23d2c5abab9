//! Lifecycle command tests: configure/list/remove/start/stop and the
//! status detection they hinge on, all against temp directories.

use std::fs;

use freight_endpoint::commands::{self, EndpointStatus};
use freight_sdk::config::{
    self, EndpointConfig, local_hostname, pid_file_path, write_config,
};
use uuid::Uuid;

const NAME: &str = "default";
const PORT: u16 = 1234;

/// A PID that is a valid i32 but (on any real kernel) never allocated.
const DEAD_PID: i32 = 2_000_000_000;

fn write_endpoint(dir: &std::path::Path, name: &str, host: Option<&str>) -> EndpointConfig {
    let config = EndpointConfig {
        name: name.to_string(),
        uuid: Uuid::new_v4(),
        host: host.map(str::to_string),
        port: PORT,
        peer_port: 0,
        relay_addr: None,
    };
    write_config(&config, &dir.join(name)).unwrap();
    config
}

fn write_pid(dir: &std::path::Path, name: &str, pid: i32) {
    fs::write(pid_file_path(&dir.join(name)), pid.to_string()).unwrap();
}

#[test]
fn status_progression() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();

    // No directory at all.
    assert_eq!(commands::get_status(NAME, dir), EndpointStatus::Unknown);

    // Directory without a readable config.
    fs::create_dir_all(dir.join(NAME)).unwrap();
    assert_eq!(commands::get_status(NAME, dir), EndpointStatus::Unknown);

    // Valid config, no PID file.
    write_endpoint(dir, NAME, None);
    assert_eq!(commands::get_status(NAME, dir), EndpointStatus::Stopped);

    // PID file naming a live process (ourselves).
    write_pid(dir, NAME, std::process::id() as i32);
    assert_eq!(commands::get_status(NAME, dir), EndpointStatus::Running);

    // PID file naming a dead process.
    write_pid(dir, NAME, DEAD_PID);
    assert_eq!(commands::get_status(NAME, dir), EndpointStatus::Hanging);
}

#[test]
fn status_hanging_on_a_foreign_host() {
    let tmp = tempfile::tempdir().unwrap();
    write_endpoint(tmp.path(), NAME, Some("abcd"));
    // Even a live PID is meaningless when stamped by another host.
    write_pid(tmp.path(), NAME, std::process::id() as i32);
    assert_eq!(
        commands::get_status(NAME, tmp.path()),
        EndpointStatus::Hanging
    );
}

#[test]
fn configure_creates_a_fresh_identity() {
    let tmp = tempfile::tempdir().unwrap();
    let config = commands::configure_endpoint(
        NAME,
        PORT,
        0,
        Some("relay.example:8765".to_string()),
        tmp.path(),
    )
    .unwrap();

    assert_eq!(config.name, NAME);
    assert!(config.host.is_none());
    assert_eq!(config.port, PORT);
    assert_eq!(config.relay_addr.as_deref(), Some("relay.example:8765"));

    let read = config::read_config(&tmp.path().join(NAME)).unwrap();
    assert_eq!(read, config);
    assert_eq!(commands::get_status(NAME, tmp.path()), EndpointStatus::Stopped);
}

#[test]
fn configure_rejects_bad_names() {
    let tmp = tempfile::tempdir().unwrap();
    let err = commands::configure_endpoint("abc?", PORT, 0, None, tmp.path()).unwrap_err();
    assert!(err.to_string().contains("alphanumeric"));
    assert!(!tmp.path().join("abc?").exists());
}

#[test]
fn configure_refuses_existing_endpoints() {
    let tmp = tempfile::tempdir().unwrap();
    commands::configure_endpoint(NAME, PORT, 0, None, tmp.path()).unwrap();
    let err = commands::configure_endpoint(NAME, PORT, 0, None, tmp.path()).unwrap_err();
    assert!(err.to_string().contains("already exists"));
}

#[test]
fn list_is_fine_with_an_empty_dir() {
    let tmp = tempfile::tempdir().unwrap();
    commands::list_endpoints(tmp.path()).unwrap();
    commands::configure_endpoint(NAME, PORT, 0, None, tmp.path()).unwrap();
    commands::list_endpoints(tmp.path()).unwrap();
}

#[test]
fn remove_deletes_a_stopped_endpoint() {
    let tmp = tempfile::tempdir().unwrap();
    commands::configure_endpoint(NAME, PORT, 0, None, tmp.path()).unwrap();
    assert_eq!(config::get_configs(tmp.path()).len(), 1);

    commands::remove_endpoint(NAME, tmp.path()).unwrap();
    assert!(config::get_configs(tmp.path()).is_empty());
}

#[test]
fn remove_refuses_missing_and_running_endpoints() {
    let tmp = tempfile::tempdir().unwrap();
    let err = commands::remove_endpoint(NAME, tmp.path()).unwrap_err();
    assert!(err.to_string().contains("does not exist"));

    write_endpoint(tmp.path(), NAME, None);
    write_pid(tmp.path(), NAME, std::process::id() as i32);
    let err = commands::remove_endpoint(NAME, tmp.path()).unwrap_err();
    assert!(err.to_string().contains("must be stopped"));
}

#[tokio::test]
async fn start_refuses_missing_and_invalid_endpoints() {
    let tmp = tempfile::tempdir().unwrap();
    let err = commands::start_endpoint(NAME, false, tmp.path())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("does not exist"));

    fs::create_dir_all(tmp.path().join(NAME)).unwrap();
    fs::write(tmp.path().join(NAME).join(config::CONFIG_FILE), "not json").unwrap();
    let err = commands::start_endpoint(NAME, false, tmp.path())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("valid configuration"));
}

#[tokio::test]
async fn start_refuses_running_endpoints() {
    let tmp = tempfile::tempdir().unwrap();
    write_endpoint(tmp.path(), NAME, Some(&local_hostname()));
    write_pid(tmp.path(), NAME, std::process::id() as i32);

    let err = commands::start_endpoint(NAME, false, tmp.path())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already running"));
}

#[tokio::test]
async fn start_refuses_an_endpoint_hanging_on_another_host() {
    let tmp = tempfile::tempdir().unwrap();
    write_endpoint(tmp.path(), NAME, Some("abcd"));
    write_pid(tmp.path(), NAME, 1);

    let err = commands::start_endpoint(NAME, false, tmp.path())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("abcd"));
}

#[test]
fn stop_handles_every_state() {
    let tmp = tempfile::tempdir().unwrap();

    // Unknown endpoint is an error.
    let err = commands::stop_endpoint(NAME, tmp.path()).unwrap_err();
    assert!(err.to_string().contains("does not exist"));

    // Stopped endpoint is a successful no-op.
    write_endpoint(tmp.path(), NAME, None);
    commands::stop_endpoint(NAME, tmp.path()).unwrap();

    // Stale same-host PID file is cleaned up.
    write_pid(tmp.path(), NAME, DEAD_PID);
    commands::stop_endpoint(NAME, tmp.path()).unwrap();
    assert!(!pid_file_path(&tmp.path().join(NAME)).exists());
}

#[test]
fn stop_refuses_an_endpoint_hanging_on_another_host() {
    let tmp = tempfile::tempdir().unwrap();
    write_endpoint(tmp.path(), NAME, Some("abcd"));
    write_pid(tmp.path(), NAME, 1);

    let err = commands::stop_endpoint(NAME, tmp.path()).unwrap_err();
    assert!(err.to_string().contains("abcd"));
    assert!(
        pid_file_path(&tmp.path().join(NAME)).exists(),
        "foreign PID file must be left alone"
    );
}
