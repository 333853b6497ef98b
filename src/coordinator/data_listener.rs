// src/coordinator/data_listener.rs

//! The data-plane HTTP surface: accepts client inference requests in any of the
//! five supported client protocols, admits them into `ReqManager`, schedules a
//! (PREFILL, DECODE) pair racing `scheduleTimeout`, dispatches to the PREFILL
//! worker, and relays the DECODE worker's streamed response back to the client
//! over a bounded channel so a slow client never blocks the upstream read.

use crate::core::errors::ControlPlaneError;
use crate::coordinator::cluster_nodes::ClusterNodes;
use crate::coordinator::exception_monitor::{ExceptionEvent, ExceptionMonitorHandle};
use crate::coordinator::req_manager::{ClientProtocol, ReqManager, Request, RequestState};
use crate::coordinator::request_repeater::RequestRepeater;
use crate::coordinator::scheduler::{SchedulePolicy, SchedulerHandle};
use axum::{
    Router,
    body::Body,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct DataListenerState {
    pub req_manager: Arc<ReqManager>,
    pub cluster_nodes: Arc<ClusterNodes>,
    pub scheduler: SchedulerHandle,
    pub http: Client,
    pub schedule_timeout: Duration,
    pub policy: SchedulePolicy,
    pub exception: ExceptionMonitorHandle,
    pub repeater: Arc<RequestRepeater>,
}

/// Pulls the prompt text and stream flag out of a client's native request body.
/// Each protocol has its own field name for the prompt: Triton's `text_input`,
/// TGI's `inputs`, OpenAI's `messages` (chat) or `prompt` (completions), MindIE's
/// `prompt`, and the tokenizer's `text`.
fn extract_prompt_and_stream(
    protocol: ClientProtocol,
    body: &Value,
) -> Result<(String, bool), ControlPlaneError> {
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let prompt = match protocol {
        ClientProtocol::OpenAi => {
            if let Some(messages) = body.get("messages").and_then(Value::as_array) {
                messages
                    .iter()
                    .filter(|m| m.get("role").and_then(Value::as_str) == Some("user"))
                    .filter_map(|m| m.get("content").and_then(Value::as_str))
                    .last()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        ControlPlaneError::InvalidInput(
                            "chat completion requires at least one user message".to_string(),
                        )
                    })?
            } else {
                body.get("prompt")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        ControlPlaneError::InvalidInput("completion requires a prompt".to_string())
                    })?
            }
        }
        ClientProtocol::Triton => body
            .get("text_input")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ControlPlaneError::InvalidInput("triton request requires text_input".to_string()))?,
        ClientProtocol::Tgi => body
            .get("inputs")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ControlPlaneError::InvalidInput("tgi request requires inputs".to_string()))?,
        ClientProtocol::MindIe => body
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ControlPlaneError::InvalidInput("mindie request requires a prompt".to_string()))?,
        ClientProtocol::Tokenizer => body
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ControlPlaneError::InvalidInput("tokenizer request requires text".to_string()))?,
    };
    Ok((prompt, stream))
}

/// Shared entry point for every route: parses the body per `protocol`, optionally
/// overriding the stream flag (the `*_stream` routes always stream regardless of
/// what the body says), and hands off to `dispatch`.
async fn dispatch_raw(
    state: DataListenerState,
    protocol: ClientProtocol,
    force_stream: Option<bool>,
    body: Value,
) -> Result<Response, ControlPlaneError> {
    let (prompt, parsed_stream) = extract_prompt_and_stream(protocol, &body)?;
    let stream = force_stream.unwrap_or(parsed_stream);
    dispatch(state, protocol, stream, prompt).await
}

async fn triton_handler(
    State(state): State<DataListenerState>,
    axum::Json(body): axum::Json<Value>,
) -> Result<Response, ControlPlaneError> {
    dispatch_raw(state, ClientProtocol::Triton, None, body).await
}

async fn tgi_handler(
    State(state): State<DataListenerState>,
    axum::Json(body): axum::Json<Value>,
) -> Result<Response, ControlPlaneError> {
    dispatch_raw(state, ClientProtocol::Tgi, None, body).await
}

async fn tgi_stream_handler(
    State(state): State<DataListenerState>,
    axum::Json(body): axum::Json<Value>,
) -> Result<Response, ControlPlaneError> {
    dispatch_raw(state, ClientProtocol::Tgi, Some(true), body).await
}

async fn openai_handler(
    State(state): State<DataListenerState>,
    axum::Json(body): axum::Json<Value>,
) -> Result<Response, ControlPlaneError> {
    dispatch_raw(state, ClientProtocol::OpenAi, None, body).await
}

async fn mindie_handler(
    State(state): State<DataListenerState>,
    axum::Json(body): axum::Json<Value>,
) -> Result<Response, ControlPlaneError> {
    dispatch_raw(state, ClientProtocol::MindIe, None, body).await
}

async fn tokenizer_handler(
    State(state): State<DataListenerState>,
    axum::Json(body): axum::Json<Value>,
) -> Result<Response, ControlPlaneError> {
    dispatch_raw(state, ClientProtocol::Tokenizer, None, body).await
}

/// Reports a dispatch failure to the exception monitor (for alarms/metrics) and
/// asks `RequestRepeater` for a fresh pair. Returns the new pair on success, or the
/// terminal error once retry budget is exhausted or the failure isn't retryable.
async fn report_and_retry(
    state: &DataListenerState,
    req_id: &str,
    kind: crate::core::errors::ErrorKind,
    detail: String,
) -> Result<(u64, u64), ControlPlaneError> {
    state
        .exception
        .report(ExceptionEvent { req_id: req_id.to_string(), kind, detail })
        .await;
    state.repeater.retry(req_id, kind).await
}

/// One (PREFILL, DECODE) dispatch attempt: posts the prompt to PREFILL, then opens
/// the streamed response from DECODE. Returns the classified failure kind and
/// detail on either leg so the caller can decide whether to retry.
async fn try_dispatch_pair(
    state: &DataListenerState,
    req_id: &str,
    prompt: &str,
    pair: (u64, u64),
) -> std::result::Result<reqwest::Response, (crate::core::errors::ErrorKind, String)> {
    use crate::core::errors::ErrorKind;

    let prefill = state
        .cluster_nodes
        .get_instance(pair.0)
        .ok_or((ErrorKind::ConnPErr, format!("prefill instance {} vanished", pair.0)))?;
    let decode = state
        .cluster_nodes
        .get_instance(pair.1)
        .ok_or((ErrorKind::ConnDErr, format!("decode instance {} vanished", pair.1)))?;

    let prefill_url = format!("http://{}:{}/v1/prefill", prefill.ip, prefill.port);
    state
        .http
        .post(&prefill_url)
        .json(&serde_json::json!({"req_id": req_id, "prompt": prompt}))
        .send()
        .await
        .map_err(|e| (ErrorKind::ConnPErr, format!("prefill dispatch to {prefill_url} failed: {e}")))?;

    let decode_url = format!("http://{}:{}/v1/decode", decode.ip, decode.port);
    state
        .http
        .post(&decode_url)
        .json(&serde_json::json!({"req_id": req_id}))
        .send()
        .await
        .map_err(|e| (ErrorKind::ConnDErr, format!("decode stream from {decode_url} failed: {e}")))
}

async fn dispatch(
    state: DataListenerState,
    protocol: ClientProtocol,
    stream: bool,
    prompt: String,
) -> Result<Response, ControlPlaneError> {
    let request = Request::new(protocol, stream, prompt.len() as u64, prompt.clone());
    let req_id = state.req_manager.admit(request);

    let scheduled = state.scheduler.schedule(state.policy, None);
    let mut pair = match tokio::time::timeout(state.schedule_timeout, scheduled).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            state.req_manager.finish(&req_id, RequestState::Exception);
            return Err(e);
        }
        Err(_) => {
            state.req_manager.finish(&req_id, RequestState::Timeout);
            return Err(ControlPlaneError::ScheduleTimeout(state.schedule_timeout));
        }
    };
    state.req_manager.mark_sent_to_p(&req_id, pair.0, pair.1);

    let upstream = loop {
        info!(req_id, %protocol, prefill_id = pair.0, decode_id = pair.1, "dispatching request");
        match try_dispatch_pair(&state, &req_id, &prompt, pair).await {
            Ok(resp) => break resp,
            Err((kind, detail)) => {
                warn!(req_id, %kind, detail, "dispatch attempt failed, asking for retry");
                match report_and_retry(&state, &req_id, kind, detail).await {
                    Ok(new_pair) => pair = new_pair,
                    Err(e) => {
                        state.req_manager.finish(&req_id, RequestState::Exception);
                        return Err(e);
                    }
                }
            }
        }
    };
    state.req_manager.mark_streaming(&req_id);

    // Relay the DECODE worker's response over a bounded channel so a slow client
    // applies backpressure to the upstream read rather than buffering unbounded
    // output in this task.
    let (tx, rx) = mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(32);
    let req_manager = state.req_manager.clone();
    let req_id_for_task = req_id.clone();
    tokio::spawn(async move {
        let mut upstream_bytes = upstream.bytes_stream();
        let mut failed = false;
        while let Some(chunk) = upstream_bytes.next().await {
            let forwarded = match chunk {
                Ok(bytes) => tx.send(Ok(bytes)).await,
                Err(e) => {
                    failed = true;
                    tx.send(Err(std::io::Error::other(e.to_string()))).await
                }
            };
            if forwarded.is_err() {
                break;
            }
        }
        req_manager.finish(&req_id_for_task, if failed { RequestState::Exception } else { RequestState::Finished });
    });

    let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

pub fn router(state: DataListenerState) -> Router {
    Router::new()
        .route("/v2/models/{*rest}", post(triton_handler))
        .route("/", post(tgi_stream_handler))
        .route("/generate_stream", post(tgi_stream_handler))
        .route("/generate", post(tgi_handler))
        .route("/v1/completions", post(openai_handler))
        .route("/v1/chat/completions", post(openai_handler))
        .route("/infer", post(mindie_handler))
        .route("/infer_token", post(mindie_handler))
        .route("/v1/tokenizer", post(tokenizer_handler))
        .with_state(state)
}

pub async fn run(port: u16, state: DataListenerState, mut shutdown_rx: broadcast::Receiver<()>) {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(port, error = %e, "failed to bind data listener");
            return;
        }
    };
    info!(%addr, "data listener up");
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("data listener shutting down");
        })
        .await
    {
        warn!(error = %e, "data listener exited with error");
    }
}
