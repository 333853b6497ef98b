// src/controller/mod.rs

//! The Controller process: tracks fleet inventory, assigns PREFILL/DECODE/FLEX
//! roles, detects node churn, and forwards alarms. Only the elected leader polls
//! and pushes; followers still serve alarm ingest and metrics. Entry point mirrors
//! the single-JoinSet-of-background-tasks shape used for every long-running mode
//! in this binary.

pub mod alarm_listener;
pub mod config;
pub mod node_store;
pub mod status_updater;

use crate::core::alarm_pipeline::AlarmPipeline;
use crate::core::heartbeat::HeartbeatProducer;
use crate::core::leader::{EtcdLockPolicy, LeaderAgent, RoleHandler};
use crate::core::ring::{Ring, WriteMode};
use crate::core::worker_client::WorkerClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use config::ControllerConfig;
use node_store::NodeStore;
use status_updater::StatusUpdater;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const HB_CTRL_SHM_NAME: &str = "/smu_ctrl_heartbeat_shm";
const HB_CTRL_SEM_NAME: &str = "/smu_ctrl_heartbeat_sem";
const ALARM_CTRL_SHM_NAME: &str = "/mindie_controller_alarms";
const ALARM_CTRL_SEM_NAME: &str = "/mindie_controller_alarms_sem";
const DEFAULT_ALARM_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// No-op leadership hook for the Controller: the process doesn't need to reset any
/// in-memory state across a promotion, since `NodeStore` is valid regardless of
/// role, but it still logs so leadership transitions show up in the journal.
struct ControllerRoleHandler;

#[async_trait]
impl RoleHandler for ControllerRoleHandler {
    async fn on_promote(&self, first_time: bool) {
        if first_time {
            info!("controller promoted to leader on startup");
        } else {
            info!("controller re-promoted to leader");
        }
    }

    async fn on_demote(&self) {
        info!("controller demoted to follower");
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        crate::core::metrics::gather_metrics(),
    )
}

async fn run_metrics_server(port: u16, mut shutdown_rx: broadcast::Receiver<()>) {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(port, error = %e, "failed to bind controller metrics server");
            return;
        }
    };
    info!(%addr, "controller metrics server up");
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
        })
        .await
    {
        warn!(error = %e, "controller metrics server exited with error");
    }
}

pub async fn run(config_path: &str) -> Result<()> {
    let config = ControllerConfig::from_file(config_path)
        .with_context(|| format!("loading controller config from {config_path}"))?;

    info!(node_id = %config.node_id, "starting controller");

    let node_store = Arc::new(NodeStore::new());

    let alarm_ring = Arc::new(
        Ring::open_with_size(
            ALARM_CTRL_SHM_NAME,
            ALARM_CTRL_SEM_NAME,
            DEFAULT_ALARM_BUFFER_BYTES,
            WriteMode::Retain,
        )
        .context("opening controller alarm ring")?,
    );
    let alarm_pipeline = Arc::new(AlarmPipeline::new(alarm_ring));

    let worker_client = WorkerClient::new(config.worker_request_timeout(), alarm_pipeline.clone())
        .context("building worker client")?;

    let lock_policy = Arc::new(
        EtcdLockPolicy::connect(
            &config.etcd_endpoints,
            "/controller/leader",
            config.node_id.clone(),
            config.etcd_lease_ttl_secs,
        )
        .await
        .context("connecting to etcd for leader election")?,
    );
    let leader = Arc::new(LeaderAgent::new(
        lock_policy,
        Arc::new(ControllerRoleHandler),
    ));
    leader.start().await.context("starting leader agent")?;

    let status_updater = Arc::new(StatusUpdater::new(
        node_store.clone(),
        leader.clone(),
        worker_client.clone(),
        config.cluster_synchronization_interval(),
        config.coordinator_base_url.clone(),
        config.seed_nodes.clone(),
    ));

    let heartbeat = HeartbeatProducer::new(
        HB_CTRL_SHM_NAME,
        HB_CTRL_SEM_NAME,
        config.heartbeat_interval(),
    )
    .context("opening controller heartbeat ring")?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks: JoinSet<()> = JoinSet::new();

    tasks.spawn(status_updater.run());
    tasks.spawn(heartbeat.run());
    tasks.spawn(alarm_pipeline.clone().run(shutdown_tx.subscribe()));
    tasks.spawn(alarm_listener::run(
        config.alarm_listener_port,
        alarm_pipeline,
        worker_client,
        node_store.clone(),
        shutdown_tx.subscribe(),
    ));
    tasks.spawn(run_metrics_server(config.metrics_port, shutdown_tx.subscribe()));

    tokio::select! {
        _ = crate::core::shutdown::await_shutdown_signal() => {
            info!("controller shutting down");
        }
        _ = tasks.join_next() => {
            warn!("a controller background task exited unexpectedly");
        }
    }

    let _ = shutdown_tx.send(());
    leader.stop().await;
    Ok(())
}
