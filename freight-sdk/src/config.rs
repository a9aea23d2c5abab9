//! Persisted endpoint configuration.
//!
//! Each configured endpoint owns one directory under the freight home
//! dir (`~/.freight/<name>/` by default) holding an `endpoint.json`
//! and, while the endpoint is running, a `daemon.pid` file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FabricError;

/// Config file name inside an endpoint directory.
pub const CONFIG_FILE: &str = "endpoint.json";

/// PID file name inside an endpoint directory. Its absence means the
/// endpoint is not running on this host.
pub const PID_FILE: &str = "daemon.pid";

/// Persisted configuration of a single endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    /// Identity, minted once at configure time.
    pub uuid: Uuid,
    /// Host the endpoint last started on. `None` until first start.
    #[serde(default)]
    pub host: Option<String>,
    /// HTTP gateway port.
    pub port: u16,
    /// Peer data-channel listener port (0 = OS-assigned per start).
    #[serde(default)]
    pub peer_port: u16,
    /// Signaling relay address (`host:port`). Without one the endpoint
    /// serves only local requests.
    #[serde(default)]
    pub relay_addr: Option<String>,
}

/// Default freight home directory (`~/.freight`).
pub fn home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".freight")
}

/// Local hostname, used as the default endpoint name and for the
/// PID-file host check.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Read the configuration from an endpoint directory.
pub fn read_config(endpoint_dir: &Path) -> Result<EndpointConfig, FabricError> {
    let path = endpoint_dir.join(CONFIG_FILE);
    let raw = fs::read_to_string(&path)
        .map_err(|e| FabricError::Config(format!("unable to read {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| FabricError::Config(format!("unable to parse {}: {e}", path.display())))
}

/// Write the configuration into an endpoint directory, creating it if
/// needed.
pub fn write_config(config: &EndpointConfig, endpoint_dir: &Path) -> Result<(), FabricError> {
    fs::create_dir_all(endpoint_dir)
        .map_err(|e| FabricError::Config(format!("unable to create {}: {e}", endpoint_dir.display())))?;
    let path = endpoint_dir.join(CONFIG_FILE);
    let raw = serde_json::to_string_pretty(config)
        .map_err(|e| FabricError::Config(e.to_string()))?;
    fs::write(&path, raw)
        .map_err(|e| FabricError::Config(format!("unable to write {}: {e}", path.display())))
}

/// Scan a freight directory for endpoint configurations, skipping
/// entries that are missing or fail to parse.
pub fn get_configs(freight_dir: &Path) -> Vec<EndpointConfig> {
    let mut configs = Vec::new();
    let entries = match fs::read_dir(freight_dir) {
        Ok(entries) => entries,
        Err(_) => return configs,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match read_config(&path) {
            Ok(config) => configs.push(config),
            Err(e) => {
                tracing::debug!("skipping {}: {e}", path.display());
            }
        }
    }
    configs.sort_by(|a, b| a.name.cmp(&b.name));
    configs
}

/// Path of the PID file inside an endpoint directory.
pub fn pid_file_path(endpoint_dir: &Path) -> PathBuf {
    endpoint_dir.join(PID_FILE)
}
