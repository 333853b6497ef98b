// src/coordinator/cluster_nodes.rs

//! The Coordinator's mirror of the worker fleet: one `ClusterInstance` per worker,
//! plus virtualization of a FLEX worker into a PREFILL-side and DECODE-side id so
//! the scheduler and request router can treat it like two ordinary instances.
//! Grounded on `ClusterNodes`'s `ProcessFlexInstance` / `ProcSchedulerInfoUnderFlexSituation`
//! / `ProcTaskQuaryDInstanceIdUnderFlexSituation` family.

use crate::core::errors::{ControlPlaneError, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Bit set on a FLEX instance's id to produce its virtual DECODE-side id. Instance
/// ids below this value are never assigned, so the virtual id space never collides
/// with a real one.
pub const DECODE_SPLIT_MASK: u64 = 4096;
pub const FLEX_INSTANCE_P_PERCENTAGE_MAX: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Hash)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceRole {
    Prefill,
    Decode,
    Flex,
}

#[derive(Debug, Clone)]
pub struct ClusterInstance {
    pub id: u64,
    pub ip: String,
    pub port: String,
    pub role: InstanceRole,
    pub model_name: String,
    /// P/D Group this instance belongs to; the scheduler only pairs a PREFILL and
    /// a DECODE instance that share a `group_id`.
    pub group_id: u64,
    pub total_slots: u64,
    pub total_blocks: u64,
    pub avail_slots: u64,
    pub avail_blocks: u64,
    pub peers: Vec<u64>,
    pub prefix_hash: Option<u64>,
    /// Cleared by `/v1/instances/offline`; an inactive instance is skipped by the
    /// scheduler even though it remains in the fleet mirror.
    pub active: bool,
}

impl ClusterInstance {
    pub fn new(id: u64, ip: impl Into<String>, port: impl Into<String>, role: InstanceRole, model_name: impl Into<String>) -> Self {
        Self {
            id,
            ip: ip.into(),
            port: port.into(),
            role,
            model_name: model_name.into(),
            group_id: 0,
            total_slots: 0,
            total_blocks: 0,
            avail_slots: 0,
            avail_blocks: 0,
            peers: Vec::new(),
            prefix_hash: None,
            active: true,
        }
    }

    fn from_refresh(instance: &RefreshInstance) -> Self {
        let mut ci = Self::new(
            instance.id,
            instance.ip.clone(),
            instance.port.clone(),
            instance.static_info.role,
            instance.model_name.clone(),
        );
        ci.group_id = instance.static_info.group_id;
        ci.total_slots = instance.static_info.total_slots_num;
        ci.total_blocks = instance.static_info.total_block_num;
        ci.avail_slots = instance.dynamic_info.avail_slots_num;
        ci.avail_blocks = instance.dynamic_info.avail_block_num;
        ci.peers = instance.dynamic_info.peers.clone();
        ci.prefix_hash = instance.dynamic_info.prefix_hash.first().copied();
        ci
    }
}

/// The live instance-level scheduling figures the scheduler reads and writes while
/// allocating a request.
#[derive(Debug, Clone, Copy)]
pub struct InstanceScheduleInfo {
    pub id: u64,
    pub allocated_slots: u64,
    pub allocated_blocks: u64,
}

/// The FLEX worker's current virtualization split, `None` when no FLEX worker is
/// registered.
#[derive(Debug, Clone, Copy)]
struct FlexSplit {
    flex_id: u64,
    p_percentage: u64,
}

impl FlexSplit {
    fn decode_virtual_id(&self) -> u64 {
        self.flex_id | DECODE_SPLIT_MASK
    }

    /// A FLEX worker materializes as two distinct instances only when its PREFILL
    /// share is strictly between 0 and 100 percent; at the extremes it behaves like
    /// an ordinary single-role instance.
    fn is_split_into_two(&self) -> bool {
        self.p_percentage > 0 && self.p_percentage < FLEX_INSTANCE_P_PERCENTAGE_MAX
    }
}

/// The static figures a worker reports once, carried in a `/v1/instances/refresh` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshStaticInfo {
    pub group_id: u64,
    pub role: InstanceRole,
    #[serde(default)]
    pub p_percentage: u64,
    pub max_seq_len: u64,
    pub max_output_len: u64,
    pub total_slots_num: u64,
    pub total_block_num: u64,
    pub block_size: u64,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub virtual_id: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshDynamicInfo {
    #[serde(default)]
    pub avail_slots_num: u64,
    #[serde(default)]
    pub avail_block_num: u64,
    #[serde(default)]
    pub peers: Vec<u64>,
    #[serde(default)]
    pub prefix_hash: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshInstance {
    pub id: u64,
    pub ip: String,
    pub port: String,
    #[serde(default)]
    pub metric_port: String,
    #[serde(default)]
    pub inter_comm_port: String,
    pub model_name: String,
    pub static_info: RefreshStaticInfo,
    #[serde(default)]
    pub dynamic_info: RefreshDynamicInfo,
}

/// The body of `POST /v1/instances/refresh`: the Controller's full fleet snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub ids: Vec<u64>,
    pub instances: Vec<RefreshInstance>,
}

pub struct ClusterNodes {
    instances: DashMap<u64, ClusterInstance>,
    tasks: DashMap<u64, Vec<String>>,
    flex: RwLock<Option<FlexSplit>>,
}

impl Default for ClusterNodes {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterNodes {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            tasks: DashMap::new(),
            flex: RwLock::new(None),
        }
    }

    pub fn add_instance(&self, id: u64, ip: impl Into<String>, port: impl Into<String>, role: InstanceRole, model_name: impl Into<String>) {
        self.instances.insert(id, ClusterInstance::new(id, ip, port, role, model_name));
    }

    pub fn set_group_id(&self, id: u64, group_id: u64) {
        if let Some(mut instance) = self.instances.get_mut(&id) {
            instance.group_id = group_id;
        }
    }

    pub fn get_instance(&self, id: u64) -> Option<ClusterInstance> {
        self.instances.get(&id).map(|e| e.clone())
    }

    /// Ids available for scheduling: matching `role` and not closed by
    /// `/v1/instances/offline`.
    pub fn instance_ids_by_role(&self, role: InstanceRole) -> Vec<u64> {
        self.instances
            .iter()
            .filter(|e| e.role == role && e.active)
            .map(|e| e.id)
            .collect()
    }

    /// Whether at least one active PREFILL and one active DECODE instance is
    /// registered, the minimum fleet shape the scheduler needs to serve a request.
    pub fn is_schedulable(&self) -> bool {
        !self.instance_ids_by_role(InstanceRole::Prefill).is_empty()
            && !self.instance_ids_by_role(InstanceRole::Decode).is_empty()
    }

    /// Whether an active instance serving `model_name` is currently registered.
    pub fn has_active_model(&self, model_name: &str) -> bool {
        self.instances.iter().any(|e| e.active && e.model_name == model_name)
    }

    pub fn add_task(&self, instance_id: u64, req_id: impl Into<String>) {
        self.tasks.entry(instance_id).or_default().push(req_id.into());
    }

    pub fn remove_task(&self, instance_id: u64, req_id: &str) {
        if let Some(mut tasks) = self.tasks.get_mut(&instance_id) {
            tasks.retain(|id| id != req_id);
        }
    }

    pub fn task_count(&self, instance_id: u64) -> i64 {
        if !self.instances.contains_key(&instance_id) {
            return -1;
        }
        self.get_instance_task_num_under_flex_situation(instance_id) as i64
    }

    /// Replaces the fleet mirror wholesale with a freshly pushed Controller
    /// snapshot, materializing any FLEX worker into its scheduler-visible split.
    /// Rejected with `INVALID_INPUT` if a real id collides with the masked id space
    /// a FLEX split would produce.
    pub fn refresh(&self, req: RefreshRequest) -> Result<()> {
        let mut ids = req.ids.clone();
        let mut instances: Vec<ClusterInstance> =
            req.instances.iter().map(ClusterInstance::from_refresh).collect();

        if let Some(flex) = req
            .instances
            .iter()
            .find(|i| i.static_info.role == InstanceRole::Flex)
        {
            let decode_virtual_id = flex.id | DECODE_SPLIT_MASK;
            if ids.contains(&decode_virtual_id) && decode_virtual_id != flex.id {
                return Err(ControlPlaneError::InvalidInput(format!(
                    "flex split id {decode_virtual_id} collides with a real instance id"
                )));
            }
            self.update_cluster_flex_instance_info(flex.id, flex.static_info.p_percentage);
        } else {
            self.clear_cluster_flex_instance_info();
        }

        self.process_flex_instance(&mut ids, &mut instances);

        let previous_active: std::collections::HashMap<u64, bool> = self
            .instances
            .iter()
            .map(|e| (e.id, e.active))
            .collect();
        self.instances.clear();
        for mut instance in instances {
            if let Some(&active) = previous_active.get(&instance.id) {
                instance.active = active;
            }
            self.instances.insert(instance.id, instance);
        }
        Ok(())
    }

    /// Marks instances closed (excluded from scheduling) without removing them from
    /// the fleet mirror.
    pub fn close_instances(&self, ids: &[u64]) {
        for id in ids {
            if let Some(mut instance) = self.instances.get_mut(id) {
                instance.active = false;
            }
        }
    }

    pub fn activate_instances(&self, ids: &[u64]) {
        for id in ids {
            if let Some(mut instance) = self.instances.get_mut(id) {
                instance.active = true;
            }
        }
    }

    /// `/v1/instances/query_tasks` cross-check (§4.11): the role change on `target`
    /// (whichever of `p_id`/`d_id` is changing) is safe to let proceed once that
    /// side has no local tasks left and its partner isn't still routing a live task
    /// through this pair.
    pub fn query_tasks_is_end(&self, p_id: u64, d_id: u64, changing_prefill: bool) -> bool {
        let target = if changing_prefill { p_id } else { d_id };
        let partner = if changing_prefill { d_id } else { p_id };
        let target_tasks = self.tasks.get(&target).map(|t| t.len()).unwrap_or(0);
        let partner_tasks = self.tasks.get(&partner).map(|t| t.len()).unwrap_or(0);
        target_tasks == 0 && partner_tasks == 0
    }

    pub fn update_cluster_flex_instance_info(&self, flex_id: u64, p_percentage: u64) {
        *self.flex.write() = Some(FlexSplit { flex_id, p_percentage });
    }

    pub fn clear_cluster_flex_instance_info(&self) {
        *self.flex.write() = None;
    }

    pub fn is_flex_splited_into_two_instance(&self) -> bool {
        (*self.flex.read()).as_ref().map(|f| f.is_split_into_two()).unwrap_or(false)
    }

    pub fn get_ins_num_max(&self) -> u64 {
        let base = DECODE_SPLIT_MASK;
        if self.is_flex_splited_into_two_instance() { base + 1 } else { base }
    }

    pub fn is_instance_from_flex(&self, id: u64) -> bool {
        match *self.flex.read() {
            Some(f) => id == f.flex_id || id == f.decode_virtual_id(),
            None => false,
        }
    }

    pub fn is_both_p_and_d_from_flex(&self, p_id: u64, d_id: u64) -> bool {
        match *self.flex.read() {
            Some(f) => p_id == f.flex_id && d_id == f.decode_virtual_id(),
            None => false,
        }
    }

    pub fn is_vec_contains_flex(&self, ids: &[u64]) -> bool {
        match *self.flex.read() {
            Some(f) => ids.contains(&f.flex_id),
            None => false,
        }
    }

    /// Remaps a request's requested-D-side instance id to the FLEX worker's virtual
    /// DECODE id, when the requested id names the FLEX worker itself.
    pub fn proc_task_query_d_instance_id_under_flex_situation(&self, id: &mut u64) {
        if let Some(f) = *self.flex.read() {
            if *id == f.flex_id {
                *id = f.decode_virtual_id();
            }
        }
    }

    /// Expands or collapses `ids` to reflect the FLEX worker's current split:
    /// - split in two: the virtual DECODE id is appended alongside the real id.
    /// - pure DECODE (0%): the real id is replaced by the virtual DECODE id.
    /// - pure PREFILL (100%): `ids` is left unchanged.
    pub fn proc_instance_ids_under_flex_situation(&self, ids: &mut Vec<u64>) {
        let Some(f) = *self.flex.read() else { return };
        let Some(pos) = ids.iter().position(|&id| id == f.flex_id) else { return };
        if f.is_split_into_two() {
            ids.push(f.decode_virtual_id());
        } else if f.p_percentage == 0 {
            ids[pos] = f.decode_virtual_id();
        }
    }

    /// Merges the FLEX worker's scheduling figures back onto a single canonical
    /// entry, the way the scheduler wants to see one allocation target regardless
    /// of whether the worker is materialized as one or two instances.
    pub fn proc_scheduler_info_under_flex_situation(&self, infos: &mut Vec<InstanceScheduleInfo>) {
        let Some(f) = *self.flex.read() else { return };
        let virtual_id = f.decode_virtual_id();
        if f.is_split_into_two() {
            if let Some(vpos) = infos.iter().position(|i| i.id == virtual_id) {
                let v = infos.remove(vpos);
                if let Some(p) = infos.iter_mut().find(|i| i.id == f.flex_id) {
                    p.allocated_slots += v.allocated_slots;
                    p.allocated_blocks += v.allocated_blocks;
                }
            }
        } else if let Some(entry) = infos.iter_mut().find(|i| i.id == virtual_id) {
            entry.id = f.flex_id;
        }
    }

    pub fn get_instance_task_num_under_flex_situation(&self, id: u64) -> usize {
        let own = self.tasks.get(&id).map(|t| t.len()).unwrap_or(0);
        match *self.flex.read() {
            Some(f) if id == f.flex_id => {
                let virtual_count = self.tasks.get(&f.decode_virtual_id()).map(|t| t.len()).unwrap_or(0);
                own + virtual_count
            }
            _ => own,
        }
    }

    /// Materializes a registered FLEX worker into one or two `ClusterInstance`
    /// entries with capacity scaled by its PREFILL share, and partitions the fleet's
    /// PREFILL/DECODE peer lists accordingly. No-op when no FLEX worker is present.
    pub fn process_flex_instance(&self, ids: &mut Vec<u64>, instances: &mut Vec<ClusterInstance>) {
        let Some(flex_pos) = instances.iter().position(|i| i.role == InstanceRole::Flex) else {
            return;
        };
        let flex = instances[flex_pos].clone();
        let p_percentage = (*self.flex.read())
            .as_ref()
            .filter(|f| f.flex_id == flex.id)
            .map(|f| f.p_percentage)
            .unwrap_or(FLEX_INSTANCE_P_PERCENTAGE_MAX);
        let ratio = p_percentage as f64 / FLEX_INSTANCE_P_PERCENTAGE_MAX as f64;

        // The DECODE share is always the complement of the PREFILL share computed
        // from the same total, so the two halves sum back to exactly the original
        // capacity regardless of how the ratio multiplication rounds.
        let scale = |v: u64, r: f64| (v as f64 * r) as u64;
        let mut prefill_part = flex.clone();
        prefill_part.role = InstanceRole::Prefill;
        prefill_part.total_slots = scale(flex.total_slots, ratio);
        prefill_part.total_blocks = scale(flex.total_blocks, ratio);
        prefill_part.avail_slots = scale(flex.avail_slots, ratio);
        prefill_part.avail_blocks = scale(flex.avail_blocks, ratio);

        let mut decode_part = flex.clone();
        decode_part.id = flex.id | DECODE_SPLIT_MASK;
        decode_part.role = InstanceRole::Decode;
        decode_part.total_slots = flex.total_slots - prefill_part.total_slots;
        decode_part.total_blocks = flex.total_blocks - prefill_part.total_blocks;
        decode_part.avail_slots = flex.avail_slots - prefill_part.avail_slots;
        decode_part.avail_blocks = flex.avail_blocks - prefill_part.avail_blocks;

        instances.remove(flex_pos);
        ids.retain(|&id| id != flex.id);

        if p_percentage == FLEX_INSTANCE_P_PERCENTAGE_MAX {
            ids.push(flex.id);
            instances.push(prefill_part);
        } else if p_percentage == 0 {
            ids.push(decode_part.id);
            instances.push(decode_part);
        } else {
            ids.push(flex.id);
            ids.push(decode_part.id);
            instances.push(prefill_part);
            instances.push(decode_part);
        }

        let prefill_ids: Vec<u64> = instances
            .iter()
            .filter(|i| i.role == InstanceRole::Prefill)
            .map(|i| i.id)
            .collect();
        let decode_ids: Vec<u64> = instances
            .iter()
            .filter(|i| i.role == InstanceRole::Decode)
            .map(|i| i.id)
            .collect();
        for instance in instances.iter_mut() {
            match instance.role {
                InstanceRole::Prefill => instance.peers = decode_ids.clone(),
                InstanceRole::Decode => instance.peers = prefill_ids.clone(),
                InstanceRole::Flex => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refresh_instance(id: u64, role: InstanceRole, slots: u64, blocks: u64) -> RefreshInstance {
        RefreshInstance {
            id,
            ip: "127.0.0.1".into(),
            port: "1025".into(),
            metric_port: String::new(),
            inter_comm_port: String::new(),
            model_name: "llama".into(),
            static_info: RefreshStaticInfo {
                group_id: 1,
                role,
                p_percentage: 0,
                max_seq_len: 4096,
                max_output_len: 1024,
                total_slots_num: slots,
                total_block_num: blocks,
                block_size: 16,
                label: None,
                virtual_id: id,
            },
            dynamic_info: RefreshDynamicInfo {
                avail_slots_num: slots,
                avail_block_num: blocks,
                peers: Vec::new(),
                prefix_hash: Vec::new(),
            },
        }
    }

    #[test]
    fn refresh_populates_instances_from_controller_snapshot() {
        let nodes = ClusterNodes::new();
        let req = RefreshRequest {
            ids: vec![1, 2],
            instances: vec![
                refresh_instance(1, InstanceRole::Prefill, 100, 200),
                refresh_instance(2, InstanceRole::Decode, 50, 80),
            ],
        };
        nodes.refresh(req).unwrap();
        assert_eq!(nodes.instance_ids_by_role(InstanceRole::Prefill), vec![1]);
        assert_eq!(nodes.instance_ids_by_role(InstanceRole::Decode), vec![2]);
        assert_eq!(nodes.get_instance(1).unwrap().total_slots, 100);
    }

    #[test]
    fn refresh_rejects_id_colliding_with_flex_split_mask() {
        let nodes = ClusterNodes::new();
        let mut flex = refresh_instance(5, InstanceRole::Flex, 200, 1024);
        flex.static_info.p_percentage = 40;
        let req = RefreshRequest {
            ids: vec![5, 5 | DECODE_SPLIT_MASK],
            instances: vec![flex, refresh_instance(5 | DECODE_SPLIT_MASK, InstanceRole::Decode, 10, 10)],
        };
        assert!(nodes.refresh(req).is_err());
    }

    #[test]
    fn offline_excludes_instance_from_scheduling_without_forgetting_it() {
        let nodes = ClusterNodes::new();
        nodes.add_instance(1, "127.0.0.1", "1000", InstanceRole::Prefill, "m");
        nodes.close_instances(&[1]);
        assert!(nodes.instance_ids_by_role(InstanceRole::Prefill).is_empty());
        assert!(nodes.get_instance(1).is_some());
        nodes.activate_instances(&[1]);
        assert_eq!(nodes.instance_ids_by_role(InstanceRole::Prefill), vec![1]);
    }

    #[test]
    fn query_tasks_is_end_true_only_when_both_sides_are_idle() {
        let nodes = ClusterNodes::new();
        nodes.add_task(1, "r1");
        assert!(!nodes.query_tasks_is_end(1, 2, true));
        nodes.remove_task(1, "r1");
        assert!(nodes.query_tasks_is_end(1, 2, true));
    }

    fn sample_flex(id: u64) -> ClusterInstance {
        let mut i = ClusterInstance::new(id, "127.0.0.1", "1025", InstanceRole::Flex, "llama");
        i.total_slots = 200;
        i.total_blocks = 1024;
        i.avail_slots = 200;
        i.avail_blocks = 1024;
        i
    }

    proptest::proptest! {
        /// For any split ratio in (0, 100) and any total capacity, the prefill and
        /// decode halves produced by a flex split always sum back to the original
        /// capacity, regardless of how the ratio multiplication rounds.
        #[test]
        fn flex_split_halves_always_sum_to_the_original_capacity(
            p_percentage in 1u64..FLEX_INSTANCE_P_PERCENTAGE_MAX,
            total_blocks in 0u64..1_000_000,
        ) {
            let nodes = ClusterNodes::new();
            nodes.update_cluster_flex_instance_info(5, p_percentage);
            let mut flex = sample_flex(5);
            flex.total_blocks = total_blocks;
            flex.avail_blocks = total_blocks;
            let mut ids = vec![5];
            let mut instances = vec![flex];
            nodes.process_flex_instance(&mut ids, &mut instances);

            let p = instances.iter().find(|i| i.id == 5).unwrap();
            let d = instances.iter().find(|i| i.id == (5 | DECODE_SPLIT_MASK)).unwrap();
            proptest::prop_assert_eq!(p.total_blocks + d.total_blocks, total_blocks);
        }
    }

    #[test]
    fn process_flex_instance_splits_capacity_by_ratio() {
        let nodes = ClusterNodes::new();
        nodes.update_cluster_flex_instance_info(5, 40);
        let mut ids = vec![5];
        let mut instances = vec![sample_flex(5)];
        nodes.process_flex_instance(&mut ids, &mut instances);
        assert_eq!(instances.len(), 2);
        let p = instances.iter().find(|i| i.id == 5).unwrap();
        let d = instances.iter().find(|i| i.id == (5 | DECODE_SPLIT_MASK)).unwrap();
        assert_eq!(p.total_slots, 80);
        assert_eq!(d.total_slots, 120);
    }

    #[test]
    fn process_flex_instance_decode_share_complements_prefill_under_rounding() {
        // ratio 30% of total_block_num=1024: 1024*0.3 = 307.2 truncates to 307 on
        // the prefill side; the decode side must be 1024-307=717, not a second
        // independent truncation of 1024*0.7=716.8 (which would drop a block).
        let nodes = ClusterNodes::new();
        nodes.update_cluster_flex_instance_info(5, 30);
        let mut flex = sample_flex(5);
        flex.total_blocks = 1024;
        flex.avail_blocks = 1024;
        let mut ids = vec![5];
        let mut instances = vec![flex];
        nodes.process_flex_instance(&mut ids, &mut instances);
        let p = instances.iter().find(|i| i.id == 5).unwrap();
        let d = instances.iter().find(|i| i.id == (5 | DECODE_SPLIT_MASK)).unwrap();
        assert_eq!(p.total_blocks, 307);
        assert_eq!(d.total_blocks, 717);
        assert_eq!(p.total_blocks + d.total_blocks, 1024);
    }

    #[test]
    fn process_flex_instance_pure_prefill_keeps_single_id() {
        let nodes = ClusterNodes::new();
        nodes.update_cluster_flex_instance_info(5, 100);
        let mut ids = vec![5];
        let mut instances = vec![sample_flex(5)];
        nodes.process_flex_instance(&mut ids, &mut instances);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, 5);
        assert_eq!(instances[0].role, InstanceRole::Prefill);
    }

    #[test]
    fn process_flex_instance_pure_decode_remaps_id() {
        let nodes = ClusterNodes::new();
        nodes.update_cluster_flex_instance_info(5, 0);
        let mut ids = vec![5];
        let mut instances = vec![sample_flex(5)];
        nodes.process_flex_instance(&mut ids, &mut instances);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, 5 | DECODE_SPLIT_MASK);
        assert_eq!(instances[0].role, InstanceRole::Decode);
        assert!(!ids.contains(&5));
    }

    #[test]
    fn scheduler_info_merges_split_entries() {
        let nodes = ClusterNodes::new();
        nodes.update_cluster_flex_instance_info(2333, 50);
        let mut infos = vec![
            InstanceScheduleInfo { id: 2333, allocated_slots: 200, allocated_blocks: 200 },
            InstanceScheduleInfo { id: 2333 | DECODE_SPLIT_MASK, allocated_slots: 100, allocated_blocks: 100 },
            InstanceScheduleInfo { id: 2, allocated_slots: 200, allocated_blocks: 30 },
        ];
        nodes.proc_scheduler_info_under_flex_situation(&mut infos);
        assert_eq!(infos.len(), 2);
        let merged = infos.iter().find(|i| i.id == 2333).unwrap();
        assert_eq!(merged.allocated_slots, 300);
        assert_eq!(merged.allocated_blocks, 300);
    }

    #[test]
    fn instance_task_num_sums_across_split() {
        let nodes = ClusterNodes::new();
        let flex_id = 2333;
        let d_id = flex_id | DECODE_SPLIT_MASK;
        nodes.add_instance(flex_id, "127.0.0.1", "1025", InstanceRole::Prefill, "llama");
        nodes.add_instance(d_id, "127.0.0.1", "1025", InstanceRole::Decode, "llama");
        for i in 0..5 {
            nodes.add_task(flex_id, format!("r{i}"));
        }
        for i in 0..7 {
            nodes.add_task(d_id, format!("r{i}"));
        }
        nodes.update_cluster_flex_instance_info(flex_id, 50);
        assert_eq!(nodes.get_instance_task_num_under_flex_situation(flex_id), 12);
    }
}
