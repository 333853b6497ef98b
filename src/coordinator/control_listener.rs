// src/coordinator/control_listener.rs

//! Management-plane HTTP surface: ingests the Controller's fleet snapshot,
//! online/offline a worker, list in-flight tasks, cross-check a worker's own task
//! view ahead of a role change, and report readiness. Grounded on
//! `ControllerListener`'s management route set.

use crate::coordinator::cluster_nodes::{ClusterNodes, RefreshRequest};
use crate::coordinator::req_manager::ReqManager;
use crate::core::errors::ControlPlaneError;
use crate::core::leader::LeaderAgent;
use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Clone)]
struct ControlListenerState {
    req_manager: Arc<ReqManager>,
    cluster_nodes: Arc<ClusterNodes>,
    leader: Arc<LeaderAgent>,
}

impl ControlListenerState {
    /// Ready once a fleet snapshot has produced at least one schedulable
    /// (PREFILL, DECODE) pair; a bare-started process with an empty fleet mirror is
    /// reported not-ready rather than accepting requests it cannot schedule.
    fn is_ready(&self) -> bool {
        self.cluster_nodes.is_schedulable()
    }
}

#[derive(Serialize)]
struct TasksResponse {
    in_flight: usize,
}

async fn query_tasks_handler(State(state): State<ControlListenerState>) -> impl IntoResponse {
    axum::Json(TasksResponse { in_flight: state.req_manager.count() })
}

fn readiness_status(ready: bool) -> StatusCode {
    if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE }
}

async fn readiness_handler(State(state): State<ControlListenerState>) -> impl IntoResponse {
    readiness_status(state.is_ready())
}

/// `/v1/startup`: reports ready once this process has mirrored a schedulable
/// fleet, so an orchestrator doesn't route traffic here before the Controller's
/// first refresh push has landed.
async fn startup_handler(State(state): State<ControlListenerState>) -> impl IntoResponse {
    readiness_status(state.is_ready())
}

/// `/v1/health`, `/v2/health/live`: process-liveness only, never fleet-dependent.
async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn health_ready_handler(State(state): State<ControlListenerState>) -> impl IntoResponse {
    readiness_status(state.is_ready())
}

async fn model_ready_handler(
    State(state): State<ControlListenerState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    readiness_status(state.cluster_nodes.has_active_model(&name))
}

async fn refresh_handler(
    State(state): State<ControlListenerState>,
    axum::Json(body): axum::Json<RefreshRequest>,
) -> impl IntoResponse {
    match state.cluster_nodes.refresh(body) {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "rejected instance refresh");
            StatusCode::from_u16(e.kind().http_status()).unwrap_or(StatusCode::BAD_REQUEST)
        }
    }
}

#[derive(Deserialize)]
struct IdsBody {
    ids: Vec<u64>,
}

async fn online_handler(
    State(state): State<ControlListenerState>,
    axum::Json(body): axum::Json<IdsBody>,
) -> impl IntoResponse {
    state.cluster_nodes.activate_instances(&body.ids);
    StatusCode::OK
}

async fn offline_handler(
    State(state): State<ControlListenerState>,
    axum::Json(body): axum::Json<IdsBody>,
) -> impl IntoResponse {
    state.cluster_nodes.close_instances(&body.ids);
    StatusCode::OK
}

#[derive(Deserialize)]
struct InstanceTasksQuery {
    id: Vec<u64>,
}

async fn instance_tasks_handler(
    State(state): State<ControlListenerState>,
    Query(q): Query<InstanceTasksQuery>,
) -> impl IntoResponse {
    let tasks: Vec<i64> = q.id.iter().map(|id| state.cluster_nodes.task_count(*id)).collect();
    axum::Json(serde_json::json!({ "tasks": tasks }))
}

#[derive(Deserialize)]
struct QueryTasksBody {
    p_id: u64,
    d_id: u64,
    role_change_type: String,
}

#[derive(Serialize)]
struct QueryTasksResponse {
    is_end: bool,
}

async fn instance_query_tasks_handler(
    State(state): State<ControlListenerState>,
    axum::Json(body): axum::Json<QueryTasksBody>,
) -> Result<impl IntoResponse, ControlPlaneError> {
    let changing_prefill = match body.role_change_type.as_str() {
        "prefill" | "PREFILL" => true,
        "decode" | "DECODE" => false,
        other => {
            return Err(ControlPlaneError::InvalidInput(format!(
                "unknown role_change_type {other}"
            )));
        }
    };
    let is_end = state
        .cluster_nodes
        .query_tasks_is_end(body.p_id, body.d_id, changing_prefill);
    Ok(axum::Json(QueryTasksResponse { is_end }))
}

pub fn router(
    req_manager: Arc<ReqManager>,
    cluster_nodes: Arc<ClusterNodes>,
    leader: Arc<LeaderAgent>,
) -> Router {
    let state = ControlListenerState { req_manager, cluster_nodes, leader };
    Router::new()
        .route("/v1/tasks", get(query_tasks_handler))
        .route("/v1/readiness", get(readiness_handler))
        .route("/v1/startup", get(startup_handler))
        .route("/v1/health", get(liveness_handler))
        .route("/v2/health/live", get(liveness_handler))
        .route("/v2/health/ready", get(health_ready_handler))
        .route("/v2/models/{name}/ready", get(model_ready_handler))
        .route("/v1/refresh", post(refresh_handler))
        .route("/v1/instances/refresh", post(refresh_handler))
        .route("/v1/instances/online", post(online_handler))
        .route("/v1/instances/offline", post(offline_handler))
        .route("/v1/instances/tasks", get(instance_tasks_handler))
        .route("/v1/instances/query_tasks", post(instance_query_tasks_handler))
        .with_state(state)
}

pub async fn run(
    port: u16,
    req_manager: Arc<ReqManager>,
    cluster_nodes: Arc<ClusterNodes>,
    leader: Arc<LeaderAgent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let app = router(req_manager, cluster_nodes, leader);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(port, error = %e, "failed to bind control listener");
            return;
        }
    };
    info!(%addr, "control listener up");
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("control listener shutting down");
        })
        .await
    {
        warn!(error = %e, "control listener exited with error");
    }
}
