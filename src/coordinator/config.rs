// src/coordinator/config.rs

//! Coordinator process configuration. Unlike the Controller, the Coordinator takes
//! its listen addresses directly on the command line (mirroring the original's
//! `coordinator <predict_ip> <predict_port> <manage_ip> <manage_port>` argv), and
//! everything else from a JSON config file resolved the same way.

use crate::coordinator::scheduler::SchedulePolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_schedule_timeout_ms() -> u64 {
    2000
}
fn default_req_congestion_alarm_threshold() -> u64 {
    512
}
fn default_req_congestion_clear_threshold() -> u64 {
    256
}
fn default_schedule_policy() -> SchedulePolicy {
    SchedulePolicy::LoadBalance
}
fn default_worker_request_timeout_ms() -> u64 {
    3000
}
fn default_metrics_port() -> u16 {
    9101
}
fn default_etcd_lease_ttl_secs() -> i64 {
    20
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub node_id: String,
    pub etcd_endpoints: Vec<String>,
    #[serde(default = "default_etcd_lease_ttl_secs")]
    pub etcd_lease_ttl_secs: i64,
    #[serde(default = "default_schedule_timeout_ms")]
    pub schedule_timeout_ms: u64,
    #[serde(default = "default_schedule_policy")]
    pub schedule_policy: SchedulePolicy,
    #[serde(default = "default_req_congestion_alarm_threshold")]
    pub req_congestion_alarm_threshold: u64,
    #[serde(default = "default_req_congestion_clear_threshold")]
    pub req_congestion_clear_threshold: u64,
    #[serde(default = "default_worker_request_timeout_ms")]
    pub worker_request_timeout_ms: u64,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl CoordinatorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading coordinator config at {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing coordinator config at {}", path.display()))
    }

    pub fn resolve_path(cli_arg: Option<&str>) -> Result<String> {
        if let Some(path) = cli_arg {
            return Ok(path.to_string());
        }
        std::env::var("MINDIE_MS_COORDINATOR_CONFIG_FILE_PATH")
            .context("no config path given and MINDIE_MS_COORDINATOR_CONFIG_FILE_PATH is unset")
    }

    pub fn schedule_timeout(&self) -> Duration {
        Duration::from_millis(self.schedule_timeout_ms)
    }

    pub fn worker_request_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Addresses passed on the `coordinator` subcommand's own argv, not the config file.
#[derive(Debug, Clone)]
pub struct CoordinatorAddrs {
    pub predict_ip: String,
    pub predict_port: u16,
    pub manage_ip: String,
    pub manage_port: u16,
}
