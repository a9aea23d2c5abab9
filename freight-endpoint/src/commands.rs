//! Endpoint lifecycle commands.
//!
//! The on-disk contract: one directory per endpoint under the freight
//! dir, holding the config and, while running, a PID file stamped with
//! the starting host. A PID file on another host (or pointing at a dead
//! process) marks the endpoint as hanging until cleaned up.

use std::fs;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use freight_sdk::config::{
    self, EndpointConfig, local_hostname, pid_file_path, read_config, write_config,
};

use crate::server::EndpointServer;

/// Externally visible state of a configured endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    /// No directory, or no readable configuration.
    Unknown,
    /// Configured but not running.
    Stopped,
    /// PID file naming a live process on this host.
    Running,
    /// PID file naming a dead process, or written on another host.
    Hanging,
}

/// Determine the state of the endpoint `name` under `freight_dir`.
pub fn get_status(name: &str, freight_dir: &Path) -> EndpointStatus {
    let dir = freight_dir.join(name);
    if !dir.is_dir() {
        return EndpointStatus::Unknown;
    }
    let Ok(config) = read_config(&dir) else {
        return EndpointStatus::Unknown;
    };
    let pid_path = pid_file_path(&dir);
    if !pid_path.exists() {
        return EndpointStatus::Stopped;
    }
    // A PID is only meaningful on the host that wrote it.
    if let Some(host) = &config.host {
        if *host != local_hostname() {
            return EndpointStatus::Hanging;
        }
    }
    match read_pid(&pid_path) {
        Some(pid) if pid_alive(pid) => EndpointStatus::Running,
        _ => EndpointStatus::Hanging,
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn pid_alive(pid: i32) -> bool {
    pid > 0 && unsafe { libc::kill(pid, 0) == 0 }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Create a new endpoint directory with a freshly minted identity.
pub fn configure_endpoint(
    name: &str,
    port: u16,
    peer_port: u16,
    relay_addr: Option<String>,
    freight_dir: &Path,
) -> Result<EndpointConfig> {
    if !valid_name(name) {
        bail!("endpoint names must be alphanumeric ('-' and '_' allowed), got {name:?}");
    }
    let dir = freight_dir.join(name);
    if dir.exists() {
        bail!("endpoint {name} already exists at {}", dir.display());
    }
    let config = EndpointConfig {
        name: name.to_string(),
        uuid: Uuid::new_v4(),
        host: None,
        port,
        peer_port,
        relay_addr,
    };
    write_config(&config, &dir)?;
    tracing::info!(uuid = %config.uuid, "Configured endpoint {name}");
    Ok(config)
}

/// Log the endpoints configured under `freight_dir`.
pub fn list_endpoints(freight_dir: &Path) -> Result<()> {
    let configs = config::get_configs(freight_dir);
    if configs.is_empty() {
        tracing::info!("No endpoints configured in {}", freight_dir.display());
        return Ok(());
    }
    for config in configs {
        let host = config.host.as_deref().unwrap_or("-");
        tracing::info!(
            "{} {} {}:{} ({:?})",
            config.name,
            config.uuid,
            host,
            config.port,
            get_status(&config.name, freight_dir),
        );
    }
    Ok(())
}

/// Remove a stopped endpoint's directory.
pub fn remove_endpoint(name: &str, freight_dir: &Path) -> Result<()> {
    match get_status(name, freight_dir) {
        EndpointStatus::Unknown => bail!("endpoint {name} does not exist"),
        EndpointStatus::Running | EndpointStatus::Hanging => {
            bail!("endpoint {name} must be stopped before it can be removed")
        }
        EndpointStatus::Stopped => {}
    }
    fs::remove_dir_all(freight_dir.join(name))
        .with_context(|| format!("failed to remove endpoint {name}"))?;
    tracing::info!("Removed endpoint {name}");
    Ok(())
}

/// Start the endpoint `name`, either in-process (serving until the
/// gateway exits) or as a detached child process.
pub async fn start_endpoint(name: &str, detach: bool, freight_dir: &Path) -> Result<()> {
    let dir = freight_dir.join(name);
    match get_status(name, freight_dir) {
        EndpointStatus::Unknown => {
            if dir.is_dir() {
                bail!("endpoint {name} does not contain a valid configuration");
            }
            bail!("endpoint {name} does not exist");
        }
        EndpointStatus::Running => bail!("endpoint {name} is already running"),
        EndpointStatus::Hanging => {
            let config = read_config(&dir)?;
            if let Some(host) = &config.host {
                if *host != local_hostname() {
                    bail!(
                        "endpoint {name} was started on a host named {host}; stop it there first"
                    );
                }
            }
            tracing::debug!("Removing invalid PID file for {name}");
            let _ = fs::remove_file(pid_file_path(&dir));
        }
        EndpointStatus::Stopped => {}
    }

    let mut config = read_config(&dir)?;
    config.host = Some(local_hostname());
    write_config(&config, &dir)?;

    if detach {
        let exe = std::env::current_exe().context("failed to locate the endpoint binary")?;
        let child = std::process::Command::new(exe)
            .arg("start")
            .arg(name)
            .arg("--freight-dir")
            .arg(freight_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn detached endpoint process")?;
        tracing::info!("Started endpoint {name} as a detached process (pid {})", child.id());
        return Ok(());
    }

    let pid_path = pid_file_path(&dir);
    fs::write(&pid_path, std::process::id().to_string())
        .with_context(|| format!("failed to write {}", pid_path.display()))?;
    tracing::info!(uuid = %config.uuid, "Starting endpoint {name}");
    let result = EndpointServer::new(config).run().await;
    let _ = fs::remove_file(&pid_path);
    result
}

/// Stop a running endpoint and clean up its PID file.
pub fn stop_endpoint(name: &str, freight_dir: &Path) -> Result<()> {
    let dir = freight_dir.join(name);
    match get_status(name, freight_dir) {
        EndpointStatus::Unknown => bail!("endpoint {name} does not exist"),
        EndpointStatus::Stopped => {
            tracing::info!("Endpoint {name} is not running");
            Ok(())
        }
        EndpointStatus::Hanging => {
            let config = read_config(&dir)?;
            if let Some(host) = &config.host {
                if *host != local_hostname() {
                    bail!(
                        "endpoint {name} was started on a host named {host}; stop it there first"
                    );
                }
            }
            tracing::debug!("Removing invalid PID file for {name}");
            let _ = fs::remove_file(pid_file_path(&dir));
            tracing::info!("Endpoint {name} is not running");
            Ok(())
        }
        EndpointStatus::Running => {
            let pid_path = pid_file_path(&dir);
            if let Some(pid) = read_pid(&pid_path) {
                unsafe {
                    libc::kill(pid, libc::SIGTERM);
                }
                tracing::info!("Stopped endpoint {name} (pid {pid})");
            }
            let _ = fs::remove_file(&pid_path);
            Ok(())
        }
    }
}
