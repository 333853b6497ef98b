// src/controller/alarm_listener.rs

//! HTTP ingest surface for alarms raised by a Coordinator or a worker's inference
//! engine, plus the termination endpoint used to tell a worker to shut down.
//! Grounded on the original `AlarmListener`'s route set.
//!
//! The two alarm routes are deliberately not shared: `/v1/alarm/coordinator` carries
//! a validated, schema-checked batch (`CoordinatorAlarmHandler`), while
//! `/v1/alarm/llm_engine` has no agreed-upon schema yet and is log-only
//! (`ServerAlarmHandler`: "The alarm format of the llm component has not yet been
//! determined. It is only recorded in the log and not queued").

use crate::core::alarm::{parse_coordinator_alarm_batch, records_to_payloads, CoordinatorStatusFilter};
use crate::core::alarm_pipeline::AlarmPipeline;
use crate::core::errors::ControlPlaneError;
use crate::core::worker_client::WorkerClient;
use crate::controller::node_store::NodeStore;
use axum::{Router, extract::State, http::StatusCode, routing::post};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Clone)]
struct AlarmListenerState {
    pipeline: Arc<AlarmPipeline>,
    worker_client: WorkerClient,
    node_store: Arc<NodeStore>,
    status_filter: Arc<CoordinatorStatusFilter>,
}

async fn coordinator_alarm_handler(
    State(state): State<AlarmListenerState>,
    body: axum::body::Bytes,
) -> Result<StatusCode, ControlPlaneError> {
    let (valid, any_dropped) = parse_coordinator_alarm_batch(&body)?;
    if !valid.is_empty() && state.status_filter.admits(&valid) {
        for payload in records_to_payloads(&valid) {
            state.pipeline.enqueue(payload);
        }
    }
    if any_dropped {
        return Err(ControlPlaneError::InvalidParameter(
            "coordinator alarm batch contained one or more invalid records".to_string(),
        ));
    }
    Ok(StatusCode::ACCEPTED)
}

async fn llm_engine_alarm_handler(body: axum::body::Bytes) -> StatusCode {
    info!(body = %String::from_utf8_lossy(&body), "llm engine alarm received (log-only, schema not yet defined)");
    StatusCode::ACCEPTED
}

#[derive(serde::Deserialize)]
struct TerminateServiceRequest {
    ip: String,
    port: String,
}

async fn terminate_service_handler(
    State(state): State<AlarmListenerState>,
    axum::Json(req): axum::Json<TerminateServiceRequest>,
) -> Result<StatusCode, ControlPlaneError> {
    let node = state
        .node_store
        .get_node_by_addr(&req.ip, &req.port)
        .ok_or_else(|| ControlPlaneError::NotFound(format!("no node at {}:{}", req.ip, req.port)))?;

    state.worker_client.terminate_service(&node).await?;

    for &peer_id in &node.dp_group_peers {
        state.node_store.add_expired_node(peer_id);
        state.node_store.update_node_delete_time(peer_id);
    }

    Ok(StatusCode::OK)
}

pub fn router(
    pipeline: Arc<AlarmPipeline>,
    worker_client: WorkerClient,
    node_store: Arc<NodeStore>,
) -> Router {
    let state = AlarmListenerState {
        pipeline,
        worker_client,
        node_store,
        status_filter: Arc::new(CoordinatorStatusFilter::new()),
    };
    Router::new()
        .route("/v1/alarm/coordinator", post(coordinator_alarm_handler))
        .route("/v1/alarm/llm_engine", post(llm_engine_alarm_handler))
        .route("/v1/terminate-service", post(terminate_service_handler))
        .with_state(state)
}

pub async fn run(
    port: u16,
    pipeline: Arc<AlarmPipeline>,
    worker_client: WorkerClient,
    node_store: Arc<NodeStore>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let app = router(pipeline, worker_client, node_store);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(port, error = %e, "failed to bind alarm listener");
            return;
        }
    };
    info!(%addr, "alarm listener up");
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("alarm listener shutting down");
        })
        .await
    {
        warn!(error = %e, "alarm listener exited with error");
    }
}
