// src/core/worker_client.rs

//! Typed HTTP client the Controller uses to query and assign roles to worker
//! processes. Backed by one shared `reqwest::Client` so TCP/TLS connections are
//! pooled across calls to the same worker, mirroring the original's separate
//! connection/handler/async-client split folded into one component.
//!
//! Grounded on `ServerRequestHandler`: `QueryInstanceInfo`/`IsValidStaticInfoResp`,
//! `UpdateNodeStatus`/`IsValidNodeStatusResp`/`ParseNodeStatusPeers`, `LoopPostPDRole`,
//! `TerminateService`, `GetAvailableNodes`/`CheckGroupNodeAvailable`, and `CheckStatus`.

use crate::controller::node_store::{NodeInfo, NodeRole, NodeStore, RoleState};
use crate::core::alarm::AlarmPayload;
use crate::core::alarm_pipeline::AlarmPipeline;
use crate::core::errors::{ControlPlaneError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::warn;

const MAX_AVAIL_NUM: u64 = 5000;
const CACHE_BLOCK_SIZE_MIN: u64 = 1;
const CACHE_BLOCK_SIZE_MAX: u64 = 128;
const MAX_OUTPUT_LEN_MIN: u64 = 1;
const MAX_OUTPUT_LEN_MAX: u64 = 4_294_967_294;
const MAX_SEQ_LEN_MAX: u64 = 4_294_967_295;

/// The static configuration a worker reports once, from `GET /config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStaticInfo {
    #[serde(rename = "modelName")]
    pub model_name: String,
    #[serde(rename = "maxSeqLen")]
    pub max_seq_len: u64,
    #[serde(rename = "maxOutputLen")]
    pub max_output_len: u64,
    #[serde(rename = "cacheBlockSize")]
    pub block_size: u64,
}

impl WorkerStaticInfo {
    fn validate(&self) -> bool {
        self.max_seq_len <= MAX_SEQ_LEN_MAX
            && (MAX_OUTPUT_LEN_MIN..=MAX_OUTPUT_LEN_MAX).contains(&self.max_output_len)
            && (CACHE_BLOCK_SIZE_MIN..=CACHE_BLOCK_SIZE_MAX).contains(&self.block_size)
            && !self.model_name.trim().is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ServiceStatus {
    #[serde(rename = "roleStatus")]
    role_status: String,
    #[serde(rename = "currentRole")]
    current_role: String,
}

impl ServiceStatus {
    fn validate(&self) -> bool {
        matches!(self.role_status.as_str(), "RoleUnknown" | "RoleSwitching" | "RoleReady")
            && matches!(self.current_role.as_str(), "prefill" | "decode" | "flex" | "none")
    }
}

#[derive(Debug, Deserialize)]
struct LinkPeer {
    target: u64,
    link: String,
}

#[derive(Debug, Deserialize, Default)]
struct LinkStatus {
    #[serde(default)]
    peers: Vec<LinkPeer>,
}

#[derive(Debug, Deserialize, Default)]
struct ResourceStatusV2 {
    #[serde(rename = "availSlotsNum", default)]
    avail_slots_num: u64,
    #[serde(rename = "availBlockNum", default)]
    avail_block_num: u64,
    #[serde(rename = "totalAvailNpuSlotsNum")]
    total_avail_npu_slots_num: Option<u64>,
    #[serde(rename = "totalAvailNpuBlockNum")]
    total_avail_npu_block_num: Option<u64>,
    #[serde(rename = "maxAvailNpuBlockNum")]
    max_avail_npu_block_num: Option<u64>,
    #[serde(rename = "waitingRequestNum", default)]
    waiting_request_num: u64,
    #[serde(rename = "linkStatus", default)]
    link_status: LinkStatus,
}

impl ResourceStatusV2 {
    fn is_multi_node(&self) -> bool {
        self.total_avail_npu_slots_num.is_some() || self.total_avail_npu_block_num.is_some()
    }

    fn validate(&self) -> bool {
        if self.is_multi_node() {
            [self.total_avail_npu_slots_num, self.total_avail_npu_block_num, self.max_avail_npu_block_num]
                .into_iter()
                .flatten()
                .all(|v| v <= MAX_AVAIL_NUM)
        } else {
            self.avail_slots_num <= MAX_AVAIL_NUM && self.avail_block_num <= MAX_AVAIL_NUM
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusV2Response {
    service: ServiceStatus,
    resource: ResourceStatusV2,
}

/// The dynamic status a worker reports on every poll, normalized from either the
/// nested v2 `{service, resource}` shape or the legacy flat v1 shape.
#[derive(Debug, Clone, Default)]
pub struct WorkerDynamicInfo {
    pub role_status: String,
    pub current_role: String,
    pub avail_slots: u64,
    pub avail_blocks: u64,
    pub queue_depth: u64,
    pub peers: Vec<u64>,
    /// Set only on a multi-node worker's first status report, used to commit
    /// `NodeStaticInfo::total_slots`/`total_blocks` once.
    pub total_slots: Option<u64>,
    pub total_blocks: Option<u64>,
}

impl WorkerDynamicInfo {
    /// Maps the worker-reported `RoleReady`/`RoleSwitching`/`RoleUnknown` string onto
    /// the Controller's own `RoleState` enum.
    pub fn role_state(&self) -> RoleState {
        match self.role_status.as_str() {
            "RoleReady" => RoleState::Ready,
            "RoleSwitching" => RoleState::Switching,
            _ => RoleState::Unknown,
        }
    }

    pub fn current_role_enum(&self) -> NodeRole {
        match self.current_role.as_str() {
            "prefill" => NodeRole::Prefill,
            "decode" => NodeRole::Decode,
            "flex" => NodeRole::Flex,
            _ => NodeRole::Undef,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusV1Response {
    #[serde(rename = "roleStatus")]
    role_status: String,
    #[serde(rename = "currentRole")]
    current_role: String,
    #[serde(rename = "availSlotsNum", default)]
    avail_slots_num: u64,
    #[serde(rename = "availBlockNum", default)]
    avail_block_num: u64,
    #[serde(rename = "waitingRequestNum", default)]
    waiting_request_num: u64,
}

/// Role this node is being assigned, as posted to `/role/{role}[v2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostRoleMode {
    V1,
    V2,
}

#[derive(Debug, Serialize)]
struct PostRoleV1Body {
    peers: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<u64>,
}

#[derive(Debug, Serialize)]
struct PostRoleV2Body {
    local: Vec<crate::controller::node_store::ServerInfo>,
    peers: Vec<Vec<crate::controller::node_store::ServerInfo>>,
}

#[derive(Debug, Deserialize)]
struct PostRoleResponse {
    #[serde(default)]
    result: String,
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn role_path_segment(role: NodeRole) -> &'static str {
    match role {
        NodeRole::Prefill => "prefill",
        NodeRole::Decode => "decode",
        NodeRole::Flex => "flex",
        NodeRole::Undef => "flex",
    }
}

/// A shared HTTP client for talking to worker processes.
#[derive(Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
    alarm_pipeline: Arc<AlarmPipeline>,
}

impl WorkerClient {
    pub fn new(request_timeout: Duration, alarm_pipeline: Arc<AlarmPipeline>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http, alarm_pipeline })
    }

    fn base_url(node: &NodeInfo) -> String {
        format!("http://{}:{}", node.ip, node.mgmt_port)
    }

    fn emit_exception_alarm(&self, node: &NodeInfo, unreachable: bool, detail: String) {
        let code = if unreachable { "SERVER_NO_REPLY" } else { "SERVER_RESPONSE_ERROR" };
        self.alarm_pipeline
            .enqueue(AlarmPayload::server_exception(node.id.to_string(), code, detail, now_millis()));
    }

    pub async fn get_config(&self, node: &NodeInfo) -> Result<WorkerStaticInfo> {
        let url = format!("{}/config", Self::base_url(node));
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ControlPlaneError::Unreachable(format!("get_config {url}: status {}", resp.status())));
        }
        let info: WorkerStaticInfo = resp.json().await?;
        if !info.validate() {
            return Err(ControlPlaneError::InvalidParameter(format!("worker {url} reported invalid static info")));
        }
        Ok(info)
    }

    async fn get_status_v2(&self, node: &NodeInfo) -> Result<WorkerDynamicInfo> {
        let url = format!("{}/v2/status", Self::base_url(node));
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ControlPlaneError::Unreachable(format!("get_status_v2 {url}: status {}", resp.status())));
        }
        let parsed: StatusV2Response = resp.json().await?;
        if !parsed.service.validate() || !parsed.resource.validate() {
            return Err(ControlPlaneError::InvalidParameter(format!("worker {url} reported invalid status")));
        }
        let peers = parsed
            .resource
            .link_status
            .peers
            .iter()
            .filter(|p| p.link == "ok")
            .map(|p| p.target)
            .collect();
        let (avail_slots, avail_blocks, total_slots, total_blocks) = if parsed.resource.is_multi_node() {
            (
                parsed.resource.total_avail_npu_slots_num.unwrap_or(0),
                parsed.resource.total_avail_npu_block_num.unwrap_or(0),
                parsed.resource.total_avail_npu_slots_num,
                parsed.resource.total_avail_npu_block_num,
            )
        } else {
            (parsed.resource.avail_slots_num, parsed.resource.avail_block_num, None, None)
        };
        Ok(WorkerDynamicInfo {
            role_status: parsed.service.role_status,
            current_role: parsed.service.current_role,
            avail_slots,
            avail_blocks,
            queue_depth: parsed.resource.waiting_request_num,
            peers,
            total_slots,
            total_blocks,
        })
    }

    async fn get_status_v1(&self, node: &NodeInfo) -> Result<WorkerDynamicInfo> {
        let url = format!("{}/v1/status", Self::base_url(node));
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ControlPlaneError::Unreachable(format!("get_status_v1 {url}: status {}", resp.status())));
        }
        let parsed: StatusV1Response = resp.json().await?;
        if parsed.avail_slots_num > MAX_AVAIL_NUM || parsed.avail_block_num > MAX_AVAIL_NUM {
            return Err(ControlPlaneError::InvalidParameter(format!("worker {url} reported invalid status")));
        }
        Ok(WorkerDynamicInfo {
            role_status: parsed.role_status,
            current_role: parsed.current_role,
            avail_slots: parsed.avail_slots_num,
            avail_blocks: parsed.avail_block_num,
            queue_depth: parsed.waiting_request_num,
            peers: Vec::new(),
            total_slots: None,
            total_blocks: None,
        })
    }

    /// Prefers the nested v2 status shape, falling back to the legacy flat v1 one.
    pub async fn get_status(&self, node: &NodeInfo) -> Result<WorkerDynamicInfo> {
        match self.get_status_v2(node).await {
            Ok(info) => Ok(info),
            Err(_) => self.get_status_v1(node).await,
        }
    }

    /// Polls a node's status; on failure raises a `SERVER_NO_REPLY`/
    /// `SERVER_RESPONSE_ERROR` alarm and marks the node `UNKNOWN`, mirroring
    /// `UpdateNodeStatus`'s `AddServerEventToAlarmMgr` + `UpdateRoleState` pair.
    pub async fn poll_status(&self, node_store: &NodeStore, node: &NodeInfo) -> Result<WorkerDynamicInfo> {
        match self.get_status(node).await {
            Ok(info) => Ok(info),
            Err(e) => {
                let unreachable = matches!(e, ControlPlaneError::Unreachable(_) | ControlPlaneError::HttpClient(_));
                self.emit_exception_alarm(node, unreachable, e.to_string());
                node_store.update_role_state(node.id, RoleState::Unknown, false, node.is_initialized);
                Err(e)
            }
        }
    }

    /// Polls `nodes` concurrently, marking each one's alarm/role-state failure path.
    pub async fn poll_status_batch(
        &self,
        node_store: &NodeStore,
        nodes: &[NodeInfo],
    ) -> Vec<(u64, Result<WorkerDynamicInfo>)> {
        let futures = nodes.iter().map(|node| {
            let client = self.clone();
            let node = node.clone();
            async move {
                let res = client.poll_status(node_store, &node).await;
                (node.id, res)
            }
        });
        futures::future::join_all(futures).await
    }

    fn build_post_role_v2_body(node_store: &NodeStore, node: &NodeInfo) -> PostRoleV2Body {
        let peers = node
            .peers
            .iter()
            .filter_map(|peer_id| node_store.get_node(*peer_id))
            .filter(|peer| !peer.is_deleted())
            .map(|peer| peer.server_info_list)
            .collect();
        PostRoleV2Body { local: node.server_info_list.clone(), peers }
    }

    /// Pushes a role assignment, retrying every 5 seconds up to 1440 times while the
    /// worker reports anything other than `"ok"`, and bailing out early if the fleet's
    /// ranktable changes mid-wait. Grounded on `LoopPostPDRole`.
    pub async fn post_single_role(
        &self,
        node_store: &NodeStore,
        node_id: u64,
        mode: PostRoleMode,
    ) -> Result<()> {
        const MAX_RETRIES: u32 = 1440;
        const RETRY_DELAY: Duration = Duration::from_secs(5);

        let baseline_ranktable_change = node_store.ranktable_change_time();

        for _ in 0..MAX_RETRIES {
            let Some(node) = node_store.get_node(node_id) else {
                return Err(ControlPlaneError::NotFound(format!("node {node_id} not tracked")));
            };
            let role_segment = role_path_segment(node.role);
            let url = match mode {
                PostRoleMode::V1 => format!("{}/role/{role_segment}", Self::base_url(&node)),
                PostRoleMode::V2 => format!("{}/role/{role_segment}v2", Self::base_url(&node)),
            };

            let send_result = match mode {
                PostRoleMode::V1 => {
                    let body = PostRoleV1Body { peers: node.peers.clone(), group_id: None };
                    self.http.post(&url).json(&body).send().await
                }
                PostRoleMode::V2 => {
                    let body = Self::build_post_role_v2_body(node_store, &node);
                    self.http.post(&url).json(&body).send().await
                }
            };

            let resp = match send_result {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    node_store.update_role_state(node_id, RoleState::Unknown, false, false);
                    return Err(ControlPlaneError::Unreachable(format!(
                        "post_single_role {url}: status {}",
                        resp.status()
                    )));
                }
                Err(e) => {
                    node_store.update_role_state(node_id, RoleState::Unknown, false, false);
                    return Err(e.into());
                }
            };

            let parsed: PostRoleResponse = match resp.json().await {
                Ok(p) => p,
                Err(e) => {
                    node_store.update_role_state(node_id, RoleState::Unknown, false, false);
                    return Err(e.into());
                }
            };

            if parsed.result == "ok" {
                node_store.update_role_state(node_id, RoleState::Switching, true, true);
                return Ok(());
            }

            time::sleep(RETRY_DELAY).await;
            if node_store.ranktable_change_time() != baseline_ranktable_change {
                return Err(ControlPlaneError::OperationRepeat(
                    "ranktable changed while waiting for role assignment to apply".to_string(),
                ));
            }
        }
        Err(ControlPlaneError::Unreachable(format!(
            "post_single_role for node {node_id} exhausted its retry budget"
        )))
    }

    pub async fn terminate_service(&self, node: &NodeInfo) -> Result<()> {
        let url = format!("{}/stop?mode=Force", Self::base_url(node));
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ControlPlaneError::Unreachable(format!("terminate_service {url}: status {}", resp.status())));
        }
        Ok(())
    }

    /// Polls `ids` (already-known fleet members) until every one has either committed
    /// its static info or the ranktable changes mid-scan, grounded on
    /// `GetAvailableNodes`/`CheckGroupNodeAvailable`: partitions into nodes that
    /// finished successfully and nodes that never reported in, honoring the
    /// distributed-deployment rule that a node only counts "available" once every
    /// `dp_group_peers` has also finished.
    pub async fn get_available_nodes(
        &self,
        node_store: &NodeStore,
        ids: &[u64],
        attempts: u32,
    ) -> (Vec<u64>, Vec<u64>) {
        let baseline_ranktable_change = node_store.ranktable_change_time();
        let mut finished: HashSet<u64> = HashSet::new();

        for _ in 0..attempts {
            if finished.len() == ids.len() {
                break;
            }
            for &id in ids {
                if finished.contains(&id) {
                    continue;
                }
                let Some(node) = node_store.get_node(id) else { continue };
                if self.get_config(&node).await.is_ok() {
                    if let Ok(status) = self.get_status(&node).await {
                        node_store.update_node_dynamic_status(
                            id,
                            status.current_role_enum(),
                            status.role_state(),
                            status.peers,
                        );
                        finished.insert(id);
                    }
                }
            }
            if node_store.ranktable_change_time() != baseline_ranktable_change {
                break;
            }
            if finished.len() < ids.len() {
                time::sleep(Duration::from_secs(1)).await;
            }
        }

        let mut available = Vec::new();
        let mut faulty = Vec::new();
        for &id in ids {
            let is_available = finished.contains(&id)
                && node_store
                    .get_node(id)
                    .map(|n| n.dp_group_peers.iter().all(|p| finished.contains(p)))
                    .unwrap_or(false);
            if is_available {
                available.push(id);
            } else {
                faulty.push(id);
            }
        }
        (available, faulty)
    }

    /// Polls `ids` until each is `RoleReady`, `unknown`, or `attempts` is exhausted,
    /// grounded on `CheckStatusByVec`/`CheckStatus`'s early-exit once
    /// `unknown.len() + ready.len() == ids.len()`.
    pub async fn check_status(&self, node_store: &NodeStore, ids: &[u64], attempts: u32) -> (Vec<u64>, Vec<u64>) {
        let mut ready: HashSet<u64> = HashSet::new();
        let mut unknown: HashSet<u64> = HashSet::new();

        for _ in 0..attempts {
            if ready.len() + unknown.len() >= ids.len() {
                break;
            }
            for &id in ids {
                if ready.contains(&id) || unknown.contains(&id) {
                    continue;
                }
                let Some(node) = node_store.get_node(id) else { continue };
                match self.get_status(&node).await {
                    Ok(status) if status.role_state() == RoleState::Ready => {
                        ready.insert(id);
                    }
                    Ok(_) => {}
                    Err(_) => {
                        unknown.insert(id);
                    }
                }
            }
            if ready.len() + unknown.len() < ids.len() {
                time::sleep(Duration::from_secs(1)).await;
            } else {
                break;
            }
        }

        let ready_ids: Vec<u64> = ids.iter().copied().filter(|id| ready.contains(id)).collect();
        let unready_ids: Vec<u64> = ids.iter().copied().filter(|id| !ready.contains(id)).collect();
        warn!(unknown = unknown.len(), "check_status: nodes never reached RoleReady");
        (ready_ids, unready_ids)
    }
}
