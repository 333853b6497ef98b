// src/controller/status_updater.rs

//! Polls worker status and pushes role assignments, gated on leadership. Runs three
//! independent 1 Hz-checked loops (discovery, poll, push) the way the original runs
//! its threads, each waking every `cluster_synchronization_seconds` but re-checking
//! its `running` flag once a second so `Stop` returns promptly.

use crate::controller::config::SeedNodeConfig;
use crate::controller::node_store::{NodeInfo, NodeRole, NodeStore, RoleState, ServerInfo};
use crate::coordinator::cluster_nodes::{
    InstanceRole, RefreshDynamicInfo, RefreshInstance, RefreshRequest, RefreshStaticInfo,
};
use crate::core::errors::Result;
use crate::core::leader::LeaderAgent;
use crate::core::worker_client::{PostRoleMode, WorkerClient};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

pub struct StatusUpdater {
    node_store: Arc<NodeStore>,
    leader: Arc<LeaderAgent>,
    worker_client: WorkerClient,
    sync_interval: Duration,
    running: Arc<AtomicBool>,
    http: reqwest::Client,
    coordinator_base_url: String,
    seed_nodes: Vec<SeedNodeConfig>,
}

impl StatusUpdater {
    pub fn new(
        node_store: Arc<NodeStore>,
        leader: Arc<LeaderAgent>,
        worker_client: WorkerClient,
        sync_interval: Duration,
        coordinator_base_url: String,
        seed_nodes: Vec<SeedNodeConfig>,
    ) -> Self {
        Self {
            node_store,
            leader,
            worker_client,
            sync_interval,
            running: Arc::new(AtomicBool::new(true)),
            http: reqwest::Client::new(),
            coordinator_base_url,
            seed_nodes,
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Spawns the discovery, poll, and push loops, returning when any exits (which
    /// only happens on shutdown, since all loop until `running` is cleared).
    pub async fn run(self: Arc<Self>) {
        let discovery_self = Arc::clone(&self);
        let poll_self = Arc::clone(&self);
        let push_self = Arc::clone(&self);
        let refresh_self = Arc::clone(&self);
        let mut tasks = tokio::task::JoinSet::new();
        tasks.spawn(discovery_self.run_discovery_loop());
        tasks.spawn(poll_self.run_poll_loop());
        tasks.spawn(push_self.run_push_loop());
        tasks.spawn(refresh_self.run_refresh_push_loop());
        while tasks.join_next().await.is_some() {}
    }

    async fn wait_one_tick(&self) {
        let mut waited = Duration::ZERO;
        while waited < self.sync_interval && self.running.load(Ordering::SeqCst) {
            time::sleep(Duration::from_secs(1)).await;
            waited += Duration::from_secs(1);
        }
    }

    async fn run_discovery_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            if self.leader.is_leader() {
                debug!("status_updater: rescanning seed fleet topology");
                self.rescan_seed_nodes();
            }
            self.wait_one_tick().await;
        }
    }

    async fn run_poll_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            if self.leader.is_leader() {
                debug!("status_updater: polling all nodes");
                if let Err(e) = self.update_all_node_status().await {
                    warn!(error = %e, "status_updater: poll pass failed");
                }
            }
            self.wait_one_tick().await;
        }
    }

    async fn run_push_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            if self.leader.is_leader() {
                debug!("status_updater: pushing pending role assignments");
                if let Err(e) = self.send_node_status().await {
                    warn!(error = %e, "status_updater: push pass failed");
                }
            }
            self.wait_one_tick().await;
        }
    }

    async fn run_refresh_push_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            if self.leader.is_leader() {
                debug!("status_updater: pushing fleet snapshot to coordinator");
                if let Err(e) = self.push_refresh_snapshot().await {
                    warn!(error = %e, "status_updater: refresh push failed");
                }
            }
            self.wait_one_tick().await;
        }
    }

    /// Diffs the configured seed topology against `NodeStore`, seeding new and
    /// reappeared ids and letting `detect_node_changes` evict vanished ones.
    /// Grounded on the discovery step `LoopFaultScan` runs against the ranktable
    /// file before the poll loop's per-node status scan.
    fn rescan_seed_nodes(&self) {
        if self.seed_nodes.is_empty() {
            return;
        }
        let by_id: HashMap<u64, &SeedNodeConfig> = self.seed_nodes.iter().map(|s| (s.id, s)).collect();
        let scanned: Vec<(u64, Vec<ServerInfo>)> = self
            .seed_nodes
            .iter()
            .map(|s| {
                let layout = s
                    .server_info_list
                    .iter()
                    .map(|si| ServerInfo { device_id: si.device_id, npu_id: si.npu_id })
                    .collect();
                (s.id, layout)
            })
            .collect();

        let changes = self.node_store.detect_node_changes(&scanned);
        for id in changes.new_ids.into_iter().chain(changes.reappear_ids.into_iter()) {
            let Some(seed) = by_id.get(&id) else { continue };
            let mut node = NodeInfo::new(
                id,
                seed.host_id.clone(),
                seed.ip.clone(),
                seed.port.clone(),
                seed.mgmt_port.clone(),
            );
            node.metric_port = seed.metric_port.clone();
            node.inter_comm_port = seed.inter_comm_port.clone();
            node.server_info_list = seed
                .server_info_list
                .iter()
                .map(|si| ServerInfo { device_id: si.device_id, npu_id: si.npu_id })
                .collect();
            node.dp_group_peers = self
                .seed_nodes
                .iter()
                .filter(|s| s.group_id == seed.group_id && s.id != seed.id)
                .map(|s| s.id)
                .collect();
            self.node_store.add_node(node);
        }
        if !changes.removed_ids.is_empty() {
            self.node_store.update_ranktable_change_time();
        }
    }

    /// Renders the tracked fleet into a `RefreshRequest` and POSTs it to the
    /// Coordinator's `/v1/instances/refresh`, so the Coordinator's scheduling view
    /// stays in step with the Controller's authoritative inventory.
    async fn push_refresh_snapshot(&self) -> Result<()> {
        let nodes = self.node_store.get_all_nodes();
        let ids: Vec<u64> = nodes.keys().copied().collect();
        let instances = nodes
            .values()
            .filter(|n| n.role != NodeRole::Undef && !n.is_deleted())
            .map(|n| RefreshInstance {
                id: n.id,
                ip: n.ip.clone(),
                port: n.port.clone(),
                metric_port: n.metric_port.clone(),
                inter_comm_port: n.inter_comm_port.clone(),
                model_name: n.model_name.clone(),
                static_info: RefreshStaticInfo {
                    group_id: n.id,
                    role: match n.role {
                        NodeRole::Prefill => InstanceRole::Prefill,
                        NodeRole::Decode => InstanceRole::Decode,
                        NodeRole::Flex | NodeRole::Undef => InstanceRole::Flex,
                    },
                    p_percentage: n.static_info.flex_p_ratio,
                    max_seq_len: n.static_info.max_seq_len,
                    max_output_len: n.static_info.max_output_len,
                    total_slots_num: n.static_info.total_slots,
                    total_block_num: n.static_info.total_blocks,
                    block_size: n.static_info.block_size,
                    label: n.static_info.label.clone(),
                    virtual_id: n.virtual_id,
                },
                dynamic_info: RefreshDynamicInfo {
                    avail_slots_num: n.dynamic_info.avail_slots,
                    avail_block_num: n.dynamic_info.avail_blocks,
                    peers: n.peers.clone(),
                    prefix_hash: Vec::new(),
                },
            })
            .collect();

        let body = RefreshRequest { ids, instances };
        let url = format!("{}/v1/instances/refresh", self.coordinator_base_url.trim_end_matches('/'));
        let resp = self.http.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "coordinator rejected fleet refresh");
        }
        Ok(())
    }

    /// Polls every tracked node's dynamic status and updates `NodeStore` accordingly.
    /// A poll failure is handled entirely inside `WorkerClient::poll_status`, which
    /// raises the exception alarm and marks the node `UNKNOWN` itself.
    async fn update_all_node_status(&self) -> Result<()> {
        let nodes: Vec<NodeInfo> = self.node_store.get_all_nodes().into_values().collect();
        let results = self.worker_client.poll_status_batch(&self.node_store, &nodes).await;
        for (id, result) in results {
            if let Ok(info) = result {
                self.node_store
                    .update_node_dynamic_status(id, info.current_role_enum(), info.role_state(), info.peers);
            }
        }
        Ok(())
    }

    /// Pushes a role assignment to every node for which `is_post_role_needed` holds.
    async fn send_node_status(&self) -> Result<()> {
        for id in self.node_store.get_all_node_ids() {
            if !self.node_store.is_post_role_needed(id) {
                continue;
            }
            match self.worker_client.post_single_role(&self.node_store, id, PostRoleMode::V2).await {
                Ok(()) => {}
                Err(e) => warn!(id, error = %e, "post_single_role failed"),
            }
        }
        Ok(())
    }
}
