// src/controller/node_store.rs

//! `NodeStore` is the Controller's authoritative, in-memory fleet inventory: the live
//! node map, the faulty-node map, routing groups, and the fleet-diff algorithm used to
//! notice new/removed/reappeared nodes between successive scans.
//!
//! Mirrors the original `NodeStatus` class field-for-field; kept behind one
//! `parking_lot::RwLock` (rather than per-node `dashmap` locking, as the teacher's
//! `ClusterState` uses for its node map) because `detect_node_changes` must read a
//! fully consistent snapshot of the whole node map at once.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use strum_macros::{Display, EnumString};

/// The role a worker is assigned (or has requested) within a routing group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeRole {
    Prefill,
    Decode,
    Flex,
    Undef,
}

/// Whether a role assignment has been acknowledged by the worker yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum RoleState {
    Unknown,
    Switching,
    Ready,
}

/// Whether a worker currently has spare capacity to accept new assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InferenceType {
    Available,
    InitializingStaticTotalInfo,
    PrefillUpdatingPeers,
    Unavailable,
}

/// One accelerator slot in a node's hardware layout, as reported in `serverInfoList`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub device_id: u64,
    pub npu_id: u64,
}

/// The figures a worker reports once at startup and does not expect to change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStaticInfo {
    pub max_seq_len: u64,
    pub max_output_len: u64,
    pub block_size: u64,
    pub total_slots: u64,
    pub total_blocks: u64,
    pub flex_p_ratio: u64,
    pub label: Option<String>,
}

/// The figures a worker reports on every status poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDynamicInfo {
    pub avail_slots: u64,
    pub avail_blocks: u64,
    pub queue_depth: u64,
}

/// A worker's authoritative record, as tracked by the Controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: u64,
    pub virtual_id: u64,
    pub host_id: String,
    pub ip: String,
    pub port: String,
    pub mgmt_port: String,
    pub metric_port: String,
    pub inter_comm_port: String,
    pub is_healthy: bool,
    pub is_initialized: bool,
    pub inference_type: InferenceType,
    pub role: NodeRole,
    pub current_role: NodeRole,
    pub role_state: RoleState,
    pub model_name: String,
    pub peers: Vec<u64>,
    pub active_peers: Vec<u64>,
    /// Other nodes in this node's data-parallel group; cascaded by the terminate-
    /// service handler when this node is torn down, distinct from `peers`.
    pub dp_group_peers: Vec<u64>,
    /// Unix seconds at which this node was marked for deletion; zero while live.
    pub delete_time: u64,
    pub init_retry_times: u64,
    pub is_inherited: bool,
    pub inherited_id: u64,
    pub is_role_change_node: bool,
    pub is_static_info_committed: bool,
    pub server_info_list: Vec<ServerInfo>,
    pub static_info: NodeStaticInfo,
    pub dynamic_info: NodeDynamicInfo,
}

impl NodeInfo {
    pub fn new(id: u64, host_id: String, ip: String, port: String, mgmt_port: String) -> Self {
        Self {
            id,
            virtual_id: id,
            host_id,
            ip,
            port,
            mgmt_port,
            metric_port: String::new(),
            inter_comm_port: String::new(),
            is_healthy: false,
            is_initialized: false,
            inference_type: InferenceType::Available,
            role: NodeRole::Undef,
            current_role: NodeRole::Undef,
            role_state: RoleState::Unknown,
            model_name: String::new(),
            peers: Vec::new(),
            active_peers: Vec::new(),
            dp_group_peers: Vec::new(),
            delete_time: 0,
            init_retry_times: 0,
            is_inherited: false,
            inherited_id: 0,
            is_role_change_node: false,
            is_static_info_committed: false,
            server_info_list: Vec::new(),
            static_info: NodeStaticInfo::default(),
            dynamic_info: NodeDynamicInfo::default(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.delete_time != 0
    }
}

/// A routing domain: a group's PREFILL and DECODE worker ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Group {
    pub prefill_ids: Vec<u64>,
    pub decode_ids: Vec<u64>,
    pub flex_ids: Vec<u64>,
}

/// The output of a fleet diff between the previously tracked node set and a freshly
/// scanned one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeChanges {
    pub new_ids: Vec<u64>,
    pub removed_ids: Vec<u64>,
    pub reappear_ids: Vec<u64>,
}

/// Retirement horizon: a node missing from a scan for longer than this is reported as
/// removed rather than merely absent-this-round.
const NODE_RETIREMENT_SECONDS: u64 = 120;

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Default)]
struct NodeStoreInner {
    nodes: HashMap<u64, NodeInfo>,
    faulty_nodes: HashMap<u64, NodeInfo>,
    groups: HashMap<u64, Group>,
    expired_node_ids: HashSet<u64>,
    /// ids removed from `nodes` in a previous scan, with the unix-second timestamp
    /// they were removed at and the hardware layout they carried, used to classify a
    /// reappearance vs. a stale retry vs. a layout change masquerading as one.
    recently_removed: HashMap<u64, (u64, Vec<ServerInfo>)>,
}

/// The Controller's authoritative fleet inventory.
pub struct NodeStore {
    inner: RwLock<NodeStoreInner>,
    ranktable_change_time: AtomicI64,
}

impl Default for NodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(NodeStoreInner::default()),
            ranktable_change_time: AtomicI64::new(-1),
        }
    }

    pub fn add_node(&self, node: NodeInfo) {
        let mut inner = self.inner.write();
        inner.recently_removed.remove(&node.id);
        inner.nodes.insert(node.id, node);
    }

    pub fn add_faulty_node(&self, node: NodeInfo) {
        let mut inner = self.inner.write();
        inner.nodes.remove(&node.id);
        inner.faulty_nodes.insert(node.id, node);
    }

    pub fn add_expired_node(&self, id: u64) {
        self.inner.write().expired_node_ids.insert(id);
    }

    /// Updates the dynamic fields reported by a worker's status poll.
    pub fn update_node_dynamic_status(
        &self,
        id: u64,
        current_role: NodeRole,
        role_state: RoleState,
        peers: Vec<u64>,
    ) -> bool {
        let mut inner = self.inner.write();
        let Some(node) = inner.nodes.get_mut(&id) else {
            return false;
        };
        node.current_role = current_role;
        node.role_state = role_state;
        node.peers = peers;
        true
    }

    pub fn update_role_state(&self, id: u64, role_state: RoleState, is_healthy: bool, is_initialized: bool) -> bool {
        let mut inner = self.inner.write();
        let Some(node) = inner.nodes.get_mut(&id) else {
            return false;
        };
        node.role_state = role_state;
        node.is_healthy = is_healthy;
        node.is_initialized = is_initialized;
        true
    }

    pub fn update_role_state_and_peers(
        &self,
        group_id: u64,
        id: u64,
        role_state: RoleState,
        peers: Vec<u64>,
    ) -> bool {
        let mut inner = self.inner.write();
        let Some(node) = inner.nodes.get_mut(&id) else {
            return false;
        };
        node.role_state = role_state;
        node.peers = peers.clone();
        inner
            .groups
            .entry(group_id)
            .or_default()
            .prefill_ids
            .retain(|x| *x != id);
        true
    }

    /// Replaces a node's full record, keyed by id.
    pub fn update_node(&self, id: u64, node_info: NodeInfo) {
        self.inner.write().nodes.insert(id, node_info);
    }

    pub fn update_node_delete_time(&self, id: u64) {
        let mut inner = self.inner.write();
        let now = now_unix_secs();
        if let Some(node) = inner.nodes.get_mut(&id) {
            node.delete_time = now;
        }
    }

    pub fn remove_node(&self, id: u64) {
        let mut inner = self.inner.write();
        let layout = inner
            .nodes
            .get(&id)
            .map(|n| n.server_info_list.clone())
            .unwrap_or_default();
        inner.nodes.remove(&id);
        inner.faulty_nodes.remove(&id);
        inner
            .recently_removed
            .insert(id, (now_unix_secs(), layout));
    }

    /// Returns a deep copy of the node, so callers never hold the store's lock
    /// across an `.await`.
    pub fn get_node(&self, id: u64) -> Option<NodeInfo> {
        self.inner.read().nodes.get(&id).cloned()
    }

    /// Looks a node up by its listen address rather than its id, for handlers that
    /// only receive `(ip, port)` over the wire.
    pub fn get_node_by_addr(&self, ip: &str, port: &str) -> Option<NodeInfo> {
        self.inner
            .read()
            .nodes
            .values()
            .find(|n| n.ip == ip && n.port == port)
            .cloned()
    }

    pub fn get_all_nodes(&self) -> HashMap<u64, NodeInfo> {
        self.inner.read().nodes.clone()
    }

    pub fn get_all_faulty_nodes(&self) -> HashMap<u64, NodeInfo> {
        self.inner.read().faulty_nodes.clone()
    }

    pub fn get_all_node_ids(&self) -> Vec<u64> {
        self.inner.read().nodes.keys().copied().collect()
    }

    pub fn get_expired_node_ids(&self) -> HashSet<u64> {
        self.inner.read().expired_node_ids.clone()
    }

    pub fn add_group(&self, group_id: u64, group: Group) {
        self.inner.write().groups.insert(group_id, group);
    }

    pub fn get_group(&self, group_id: u64) -> Option<Group> {
        self.inner.read().groups.get(&group_id).cloned()
    }

    /// Diffs a freshly taken fleet scan (id plus reported hardware layout) against the
    /// currently tracked node set, reporting ids that are new, ids that vanished, and
    /// ids that were recently removed but have reappeared within the retirement
    /// horizon. Proposed ids already marked expired are ignored outright. A
    /// reappearing id whose hardware layout no longer matches what it carried before
    /// removal is reported as both removed and new, since the worker behind that id
    /// is no longer the same physical instance.
    pub fn detect_node_changes(&self, scanned: &[(u64, Vec<ServerInfo>)]) -> NodeChanges {
        let mut inner = self.inner.write();
        let scanned_ids: HashSet<u64> = scanned.iter().map(|(id, _)| *id).collect();
        let known: HashSet<u64> = inner.nodes.keys().copied().collect();

        let mut changes = NodeChanges::default();
        let now = now_unix_secs();

        for (id, layout) in scanned {
            let id = *id;
            if known.contains(&id) || inner.expired_node_ids.contains(&id) {
                continue;
            }
            if let Some((removed_at, prior_layout)) = inner.recently_removed.get(&id).cloned() {
                if now.saturating_sub(removed_at) <= NODE_RETIREMENT_SECONDS {
                    inner.recently_removed.remove(&id);
                    if !prior_layout.is_empty() && !layout.is_empty() && prior_layout != *layout {
                        changes.removed_ids.push(id);
                        changes.new_ids.push(id);
                    } else {
                        changes.reappear_ids.push(id);
                    }
                    continue;
                }
            }
            changes.new_ids.push(id);
        }

        for &id in &known {
            if !scanned_ids.contains(&id) {
                changes.removed_ids.push(id);
                let layout = inner
                    .nodes
                    .get(&id)
                    .map(|n| n.server_info_list.clone())
                    .unwrap_or_default();
                inner.recently_removed.insert(id, (now, layout));
                inner.nodes.remove(&id);
            }
        }

        changes.new_ids.sort_unstable();
        changes.removed_ids.sort_unstable();
        changes.reappear_ids.sort_unstable();
        changes
    }

    /// A node needs its role (re-)posted if it has never been initialized, or it is
    /// healthy but the worker hasn't yet acknowledged the currently assigned role.
    pub fn is_post_role_needed(&self, id: u64) -> bool {
        let inner = self.inner.read();
        let Some(node) = inner.nodes.get(&id) else {
            return false;
        };
        if node.is_deleted() {
            return false;
        }
        !node.is_initialized || (node.is_healthy && node.role_state != RoleState::Ready)
    }

    pub fn is_ignored_in_pd_separate(&self, id: u64) -> bool {
        let inner = self.inner.read();
        inner
            .nodes
            .get(&id)
            .map(|n| n.role == NodeRole::Undef || n.is_deleted())
            .unwrap_or(true)
    }

    pub fn is_ignored_in_single_node(&self, id: u64) -> bool {
        let inner = self.inner.read();
        inner
            .nodes
            .get(&id)
            .map(|n| n.is_deleted())
            .unwrap_or(true)
    }

    pub fn is_node_linked_by_peer(&self, peer: u64, id: u64) -> bool {
        let inner = self.inner.read();
        inner
            .nodes
            .get(&id)
            .map(|n| n.peers.contains(&peer) || n.active_peers.contains(&peer))
            .unwrap_or(false)
    }

    pub fn update_ranktable_change_time(&self) {
        self.ranktable_change_time
            .store(now_unix_secs() as i64, Ordering::SeqCst);
    }

    pub fn ranktable_change_time(&self) -> i64 {
        self.ranktable_change_time.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node(id: u64) -> NodeInfo {
        NodeInfo::new(id, format!("host-{id}"), "127.0.0.1".into(), "8000".into(), "8001".into())
    }

    fn scan(ids: &[u64]) -> Vec<(u64, Vec<ServerInfo>)> {
        ids.iter().map(|&id| (id, Vec::new())).collect()
    }

    proptest::proptest! {
        /// A scanned id is reported new iff it wasn't already known, and a known id is
        /// reported removed iff it's absent from the scan, across a fresh `NodeStore`
        /// with no retirement-horizon history to complicate reappearance.
        #[test]
        fn detect_node_changes_partitions_scanned_and_known_ids(
            known_ids in proptest::collection::hash_set(0u64..50, 0..10),
            scanned_ids in proptest::collection::hash_set(0u64..50, 0..10),
        ) {
            let store = NodeStore::new();
            for &id in &known_ids {
                store.add_node(sample_node(id));
            }
            let scan_input = scan(&scanned_ids.iter().copied().collect::<Vec<_>>());
            let changes = store.detect_node_changes(&scan_input);

            let new_set: HashSet<u64> = changes.new_ids.iter().copied().collect();
            let removed_set: HashSet<u64> = changes.removed_ids.iter().copied().collect();

            proptest::prop_assert_eq!(&new_set, &(&scanned_ids - &known_ids));
            proptest::prop_assert_eq!(&removed_set, &(&known_ids - &scanned_ids));
            proptest::prop_assert!(changes.reappear_ids.is_empty());
        }
    }

    #[test]
    fn detect_node_changes_reports_new_and_removed() {
        let store = NodeStore::new();
        store.add_node(sample_node(1));
        store.add_node(sample_node(2));

        let changes = store.detect_node_changes(&scan(&[1, 3]));
        assert_eq!(changes.new_ids, vec![3]);
        assert_eq!(changes.removed_ids, vec![2]);
        assert!(changes.reappear_ids.is_empty());
    }

    #[test]
    fn detect_node_changes_evicts_removed_node_so_it_can_later_reappear() {
        let store = NodeStore::new();
        store.add_node(sample_node(1));
        store.add_node(sample_node(2));

        store.detect_node_changes(&scan(&[1]));
        assert!(store.get_node(2).is_none(), "node dropped from scan must be evicted");

        let changes = store.detect_node_changes(&scan(&[1, 2]));
        assert_eq!(changes.reappear_ids, vec![2]);
    }

    #[test]
    fn detect_node_changes_reports_reappearance_within_horizon() {
        let store = NodeStore::new();
        store.add_node(sample_node(1));
        store.remove_node(1);
        let changes = store.detect_node_changes(&scan(&[1]));
        assert_eq!(changes.reappear_ids, vec![1]);
        assert!(changes.new_ids.is_empty());
    }

    #[test]
    fn detect_node_changes_ignores_expired_proposed_ids() {
        let store = NodeStore::new();
        store.add_expired_node(7);
        let changes = store.detect_node_changes(&scan(&[7]));
        assert!(changes.new_ids.is_empty());
        assert!(changes.reappear_ids.is_empty());
        assert!(changes.removed_ids.is_empty());
    }

    #[test]
    fn detect_node_changes_reports_layout_change_as_removed_and_new() {
        let store = NodeStore::new();
        let mut node = sample_node(1);
        node.server_info_list = vec![ServerInfo { device_id: 0, npu_id: 0 }];
        store.add_node(node);
        store.remove_node(1);

        let rescanned = vec![(1, vec![ServerInfo { device_id: 1, npu_id: 3 }])];
        let changes = store.detect_node_changes(&rescanned);
        assert_eq!(changes.removed_ids, vec![1]);
        assert_eq!(changes.new_ids, vec![1]);
        assert!(changes.reappear_ids.is_empty());
    }

    #[test]
    fn is_post_role_needed_true_until_initialized() {
        let store = NodeStore::new();
        store.add_node(sample_node(5));
        assert!(store.is_post_role_needed(5));

        let mut node = store.get_node(5).unwrap();
        node.is_initialized = true;
        node.is_healthy = true;
        node.role_state = RoleState::Ready;
        store.update_node(5, node);
        assert!(!store.is_post_role_needed(5));
    }

    #[test]
    fn get_node_returns_independent_copy() {
        let store = NodeStore::new();
        store.add_node(sample_node(9));
        let mut copy = store.get_node(9).unwrap();
        copy.model_name = "mutated".to_string();
        assert_ne!(store.get_node(9).unwrap().model_name, "mutated");
    }
}
