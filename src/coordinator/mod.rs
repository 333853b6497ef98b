// src/coordinator/mod.rs

//! The Coordinator process: admits inference requests, schedules them onto a
//! (PREFILL, DECODE) pair, dispatches and streams the response, and retries
//! retryable failures. Entry point mirrors the Controller's single-JoinSet shape.

pub mod cluster_nodes;
pub mod config;
pub mod control_listener;
pub mod data_listener;
pub mod exception_monitor;
pub mod req_manager;
pub mod request_repeater;
pub mod scheduler;

use crate::core::errors::ErrorKind;
use crate::core::heartbeat::HeartbeatProducer;
use crate::core::leader::{EtcdLockPolicy, LeaderAgent, RoleHandler};
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use cluster_nodes::ClusterNodes;
use config::{CoordinatorAddrs, CoordinatorConfig};
use data_listener::DataListenerState;
use exception_monitor::{ExceptionEvent, ExceptionHandler, ExceptionMonitor};
use req_manager::ReqManager;
use request_repeater::RequestRepeater;
use scheduler::Scheduler;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const HB_COORD_SHM_NAME: &str = "/smu_coord_heartbeat_shm";
const HB_COORD_SEM_NAME: &str = "/smu_coord_heartbeat_sem";

/// Surfaces every exception reaching the monitor as a structured log line; the
/// retry itself happens inline in `data_listener::dispatch` via `RequestRepeater`,
/// so this handler's job is observability, not recovery.
struct AlarmLoggingHandler;

#[async_trait]
impl ExceptionHandler for AlarmLoggingHandler {
    async fn handle(&self, event: &ExceptionEvent) {
        warn!(req_id = %event.req_id, kind = %event.kind, detail = %event.detail, "request exception");
    }
}

/// The Coordinator has no leadership-gated background loop today (scheduling and
/// request handling run regardless of role), but still campaigns for leadership so
/// a future cluster-wide coordinator task has a place to hook in, and so its
/// liveness is visible the same way the Controller's is.
struct CoordinatorRoleHandler;

#[async_trait]
impl RoleHandler for CoordinatorRoleHandler {
    async fn on_promote(&self, first_time: bool) {
        if first_time {
            info!("coordinator promoted to leader on startup");
        } else {
            info!("coordinator re-promoted to leader");
        }
    }

    async fn on_demote(&self) {
        info!("coordinator demoted to follower");
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
            error!(port, error = %e, "failed to bind coordinator metrics server");
            return;
        }
    };
    info!(%addr, "coordinator metrics server up");
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
        })
        .await
    {
        warn!(error = %e, "coordinator metrics server exited with error");
    }
}

pub async fn run(config_path: &str, addrs: CoordinatorAddrs) -> Result<()> {
    let config = CoordinatorConfig::from_file(config_path)
        .with_context(|| format!("loading coordinator config from {config_path}"))?;

    info!(node_id = %config.node_id, ?addrs, "starting coordinator");

    let cluster_nodes = Arc::new(ClusterNodes::new());
    let req_manager = Arc::new(ReqManager::new(
        config.req_congestion_alarm_threshold,
        config.req_congestion_clear_threshold,
    ));
    let http = reqwest::Client::builder()
        .timeout(config.worker_request_timeout())
        .build()?;

    let lock_policy = Arc::new(
        EtcdLockPolicy::connect(
            &config.etcd_endpoints,
            "/coordinator/leader",
            config.node_id.clone(),
            config.etcd_lease_ttl_secs,
        )
        .await
        .context("connecting to etcd for leader election")?,
    );
    let leader = Arc::new(LeaderAgent::new(lock_policy, Arc::new(CoordinatorRoleHandler)));
    leader.start().await.context("starting leader agent")?;

    let (scheduler_handle, scheduler) = Scheduler::new(cluster_nodes.clone(), 1024);
    let (exception_handle, mut exception_monitor) = ExceptionMonitor::new(1024);
    let alarm_handler: Arc<dyn ExceptionHandler> = Arc::new(AlarmLoggingHandler);
    for kind in [
        ErrorKind::ConnPErr,
        ErrorKind::ConnDErr,
        ErrorKind::ConnMixErr,
        ErrorKind::SendPErr,
        ErrorKind::SendMixErr,
        ErrorKind::ScheduleTimeout,
        ErrorKind::FirstTokenTimeout,
        ErrorKind::InferTimeout,
        ErrorKind::TokenizerTimeout,
        ErrorKind::UserDisConn,
        ErrorKind::DecodeDisConn,
        ErrorKind::Retry,
        ErrorKind::RetryDuplicateReqId,
    ] {
        exception_monitor.register(kind, alarm_handler.clone());
    }
    let heartbeat = HeartbeatProducer::new(HB_COORD_SHM_NAME, HB_COORD_SEM_NAME, config.heartbeat_interval())
        .context("opening coordinator heartbeat ring")?;

    let repeater = Arc::new(RequestRepeater::new(
        req_manager.clone(),
        scheduler_handle.clone(),
        config.schedule_timeout(),
        config.schedule_policy,
    ));

    let data_state = DataListenerState {
        req_manager: req_manager.clone(),
        cluster_nodes: cluster_nodes.clone(),
        scheduler: scheduler_handle,
        http,
        schedule_timeout: config.schedule_timeout(),
        policy: config.schedule_policy,
        exception: exception_handle,
        repeater,
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks: JoinSet<()> = JoinSet::new();

    tasks.spawn(scheduler.run());
    tasks.spawn(exception_monitor.run());
    tasks.spawn(heartbeat.run());
    tasks.spawn(data_listener::run(addrs.predict_port, data_state, shutdown_tx.subscribe()));
    tasks.spawn(control_listener::run(
        addrs.manage_port,
        req_manager.clone(),
        cluster_nodes.clone(),
        leader.clone(),
        shutdown_tx.subscribe(),
    ));
    tasks.spawn(run_metrics_server(config.metrics_port, shutdown_tx.subscribe()));

    tokio::select! {
        _ = crate::core::shutdown::await_shutdown_signal() => {
            info!("coordinator shutting down");
        }
        _ = tasks.join_next() => {
            warn!("a coordinator background task exited unexpectedly");
        }
    }

    let _ = shutdown_tx.send(());
    leader.stop().await;
    Ok(())
}
