// src/controller/config.rs

//! Controller process configuration, loaded from a JSON file on disk with an
//! environment-variable fallback for the path, mirroring the original's
//! `MINDIE_MS_CONTROLLER_CONFIG_FILE_PATH` convention.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_cluster_synchronization_seconds() -> u64 {
    5
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}
fn default_worker_request_timeout_ms() -> u64 {
    3000
}
fn default_alarm_listener_port() -> u16 {
    8443
}
fn default_metrics_port() -> u16 {
    9100
}
fn default_etcd_lease_ttl_secs() -> i64 {
    20
}
fn default_coordinator_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

/// One accelerator slot on a seed node, as read from the static fleet-topology file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedServerInfo {
    pub device_id: u64,
    pub npu_id: u64,
}

/// A statically configured fleet member. The Controller has no service-discovery
/// mechanism of its own (the original relies on a ranktable file describing the
/// deployment-time fleet topology), so this is the periodically re-scanned source
/// `StatusUpdater` diffs against via `NodeStore::detect_node_changes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedNodeConfig {
    pub id: u64,
    pub host_id: String,
    pub ip: String,
    pub port: String,
    pub mgmt_port: String,
    #[serde(default)]
    pub metric_port: String,
    #[serde(default)]
    pub inter_comm_port: String,
    #[serde(default)]
    pub group_id: u64,
    #[serde(default)]
    pub server_info_list: Vec<SeedServerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub node_id: String,
    pub etcd_endpoints: Vec<String>,
    #[serde(default = "default_etcd_lease_ttl_secs")]
    pub etcd_lease_ttl_secs: i64,
    #[serde(default = "default_cluster_synchronization_seconds")]
    pub cluster_synchronization_seconds: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_worker_request_timeout_ms")]
    pub worker_request_timeout_ms: u64,
    #[serde(default = "default_alarm_listener_port")]
    pub alarm_listener_port: u16,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Base URL of the Coordinator's management listener, e.g. `http://host:8080`.
    /// The push loop POSTs the fleet snapshot to `{coordinator_base_url}/v1/instances/refresh`.
    #[serde(default = "default_coordinator_base_url")]
    pub coordinator_base_url: String,
    /// The static fleet topology `StatusUpdater`'s discovery loop re-scans every
    /// tick, seeding `NodeStore` with new/reappearing ids and dropping vanished ones.
    #[serde(default)]
    pub seed_nodes: Vec<SeedNodeConfig>,
}

impl ControllerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading controller config at {}", path.display()))?;
        let config: ControllerConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing controller config at {}", path.display()))?;
        Ok(config)
    }

    /// Resolves the config path from the CLI argument, falling back to the
    /// `MINDIE_MS_CONTROLLER_CONFIG_FILE_PATH` environment variable.
    pub fn resolve_path(cli_arg: Option<&str>) -> Result<String> {
        if let Some(path) = cli_arg {
            return Ok(path.to_string());
        }
        std::env::var("MINDIE_MS_CONTROLLER_CONFIG_FILE_PATH")
            .context("no config path given and MINDIE_MS_CONTROLLER_CONFIG_FILE_PATH is unset")
    }

    pub fn cluster_synchronization_interval(&self) -> Duration {
        Duration::from_secs(self.cluster_synchronization_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn worker_request_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_request_timeout_ms)
    }
}
