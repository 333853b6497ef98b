// src/coordinator/scheduler.rs

//! Chooses a (PREFILL, DECODE) instance pair for each admitted request. Runs as a
//! single background task reached through a bounded mpsc channel, with each caller
//! supplied a oneshot for its own reply -- the shape an mpsc-request/oneshot-reply
//! scheduler takes, grounded on a KV-router scheduler's `SchedulingRequest`/
//! `SchedulingResponse` split. `scheduleTimeout` is enforced by the caller racing
//! the oneshot against `tokio::time::sleep`, not inside this task, so a timed-out
//! caller never blocks the scheduler loop.

use crate::core::errors::{ControlPlaneError, Result};
use crate::core::metrics;
use crate::coordinator::cluster_nodes::{ClusterNodes, InstanceRole};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulePolicy {
    LoadBalance,
    CacheAffinity,
    RoundRobin,
}

pub struct ScheduleRequest {
    pub policy: SchedulePolicy,
    pub prefix_hash: Option<u64>,
    pub resp_tx: oneshot::Sender<Result<(u64, u64)>>,
}

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<ScheduleRequest>,
}

impl SchedulerHandle {
    /// Submits a scheduling request and awaits its reply. The caller is expected to
    /// race this future against a timer for `scheduleTimeout` enforcement; this
    /// method itself never times out.
    pub async fn schedule(&self, policy: SchedulePolicy, prefix_hash: Option<u64>) -> Result<(u64, u64)> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(ScheduleRequest { policy, prefix_hash, resp_tx })
            .await
            .map_err(|_| ControlPlaneError::Internal("scheduler task is not running".to_string()))?;
        resp_rx
            .await
            .map_err(|_| ControlPlaneError::Internal("scheduler dropped the response channel".to_string()))?
    }
}

struct RoundRobinCursor {
    prefill: AtomicU64,
    decode: AtomicU64,
}

pub struct Scheduler {
    cluster_nodes: Arc<ClusterNodes>,
    rx: mpsc::Receiver<ScheduleRequest>,
    cursor: RoundRobinCursor,
    /// Live load figures the scheduler updates as it allocates, keyed by instance id.
    load: HashMap<u64, (u64, u64)>,
}

impl Scheduler {
    pub fn new(cluster_nodes: Arc<ClusterNodes>, channel_capacity: usize) -> (SchedulerHandle, Self) {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let handle = SchedulerHandle { tx };
        let scheduler = Self {
            cluster_nodes,
            rx,
            cursor: RoundRobinCursor { prefill: AtomicU64::new(0), decode: AtomicU64::new(0) },
            load: HashMap::new(),
        };
        (handle, scheduler)
    }

    pub async fn run(mut self) {
        while let Some(req) = self.rx.recv().await {
            let result = self.pick_pair(req.policy, req.prefix_hash);
            if req.resp_tx.send(result).is_err() {
                warn!("scheduler: caller already gave up waiting for a response");
            }
        }
    }

    fn instances_by_role(&self, role: InstanceRole) -> Vec<u64> {
        self.cluster_nodes.instance_ids_by_role(role)
    }

    fn group_id_of(&self, id: u64) -> u64 {
        self.cluster_nodes.get_instance(id).map(|i| i.group_id).unwrap_or(0)
    }

    /// Restricts `decode_ids` to the P/D Group the chosen PREFILL instance belongs
    /// to; a PREFILL and DECODE instance from different groups are never paired.
    fn same_group<'a>(&self, decode_ids: &'a [u64], group: u64) -> Vec<u64> {
        decode_ids
            .iter()
            .copied()
            .filter(|&id| self.group_id_of(id) == group)
            .collect()
    }

    fn pick_pair(&mut self, policy: SchedulePolicy, prefix_hash: Option<u64>) -> Result<(u64, u64)> {
        let prefill_ids = self.instances_by_role(InstanceRole::Prefill);
        let decode_ids = self.instances_by_role(InstanceRole::Decode);
        if prefill_ids.is_empty() || decode_ids.is_empty() {
            return Err(ControlPlaneError::ResourceExhausted(
                "no available (PREFILL, DECODE) pair to schedule".to_string(),
            ));
        }

        let p = match policy {
            SchedulePolicy::LoadBalance => self.least_loaded(&prefill_ids),
            SchedulePolicy::CacheAffinity => prefix_hash
                .and_then(|hash| {
                    prefill_ids
                        .iter()
                        .copied()
                        .filter(|id| {
                            self.cluster_nodes.get_instance(*id).and_then(|i| i.prefix_hash) == Some(hash)
                        })
                        .min()
                })
                .unwrap_or_else(|| self.least_loaded(&prefill_ids)),
            SchedulePolicy::RoundRobin => round_robin_pick(&self.cursor.prefill, &prefill_ids),
        };

        let group = self.group_id_of(p);
        let group_decode_ids = self.same_group(&decode_ids, group);
        if group_decode_ids.is_empty() {
            return Err(ControlPlaneError::ResourceExhausted(format!(
                "no DECODE instance in group {group} to pair with prefill {p}"
            )));
        }

        let d = match policy {
            SchedulePolicy::LoadBalance | SchedulePolicy::CacheAffinity => {
                self.least_loaded(&group_decode_ids)
            }
            SchedulePolicy::RoundRobin => round_robin_pick(&self.cursor.decode, &group_decode_ids),
        };

        let p_load = self.load.entry(p).or_insert((0, 0));
        p_load.0 += 1;
        let d_load = self.load.entry(d).or_insert((0, 0));
        d_load.1 += 1;

        metrics::SCHEDULE_DECISIONS_TOTAL
            .with_label_values(&[policy_label(policy), "ok"])
            .inc();
        Ok((p, d))
    }

    /// Ranks by remaining capacity (`avail_slots`/`avail_blocks` minus this tick's
    /// own running allocation count), ties broken on the lowest instance id for a
    /// deterministic, reproducible pick.
    fn least_loaded(&self, ids: &[u64]) -> u64 {
        *ids.iter()
            .min_by_key(|&&id| {
                let (avail_slots, avail_blocks) = self
                    .cluster_nodes
                    .get_instance(id)
                    .map(|i| (i.avail_slots, i.avail_blocks))
                    .unwrap_or((0, 0));
                let (p_alloc, d_alloc) = self.load.get(&id).copied().unwrap_or((0, 0));
                let allocated = (p_alloc + d_alloc) as i64;
                let remaining = (avail_slots as i64 - allocated).min(avail_blocks as i64 - allocated);
                (std::cmp::Reverse(remaining), id)
            })
            .expect("ids is non-empty")
    }
}

fn round_robin_pick(cursor: &AtomicU64, ids: &[u64]) -> u64 {
    let i = cursor.fetch_add(1, Ordering::Relaxed) as usize % ids.len();
    ids[i]
}

fn policy_label(policy: SchedulePolicy) -> &'static str {
    match policy {
        SchedulePolicy::LoadBalance => "load_balance",
        SchedulePolicy::CacheAffinity => "cache_affinity",
        SchedulePolicy::RoundRobin => "round_robin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(n_prefill: u64, n_decode: u64) -> (Arc<ClusterNodes>, Vec<u64>) {
        let nodes = Arc::new(ClusterNodes::new());
        let mut ids = Vec::new();
        for i in 0..n_prefill {
            nodes.add_instance(i, "127.0.0.1", "1000", InstanceRole::Prefill, "m");
            ids.push(i);
        }
        for i in 0..n_decode {
            nodes.add_instance(100 + i, "127.0.0.1", "2000", InstanceRole::Decode, "m");
            ids.push(100 + i);
        }
        (nodes, ids)
    }

    #[tokio::test]
    async fn round_robin_cycles_through_all_instances() {
        let (nodes, _ids) = setup(3, 3);
        let (handle, scheduler) = Scheduler::new(nodes, 16);
        let run = tokio::spawn(scheduler.run());

        let mut seen_prefill = std::collections::HashSet::new();
        for _ in 0..9 {
            let (p, _d) = handle.schedule(SchedulePolicy::RoundRobin, None).await.unwrap();
            seen_prefill.insert(p);
        }
        assert_eq!(seen_prefill.len(), 3);
        drop(handle);
        let _ = run.await;
    }

    #[tokio::test]
    async fn pairs_only_within_the_same_group() {
        let nodes = Arc::new(ClusterNodes::new());
        nodes.add_instance(1, "127.0.0.1", "1000", InstanceRole::Prefill, "m");
        nodes.set_group_id(1, 10);
        nodes.add_instance(2, "127.0.0.1", "2000", InstanceRole::Decode, "m");
        nodes.set_group_id(2, 20);
        nodes.add_instance(3, "127.0.0.1", "2001", InstanceRole::Decode, "m");
        nodes.set_group_id(3, 10);

        let (handle, scheduler) = Scheduler::new(nodes, 16);
        let run = tokio::spawn(scheduler.run());

        let (p, d) = handle.schedule(SchedulePolicy::LoadBalance, None).await.unwrap();
        assert_eq!(p, 1);
        assert_eq!(d, 3, "decode instance 2 is in a different group and must never be paired with prefill 1");
        drop(handle);
        let _ = run.await;
    }

    #[tokio::test]
    async fn schedule_fails_when_no_decode_instance_shares_the_prefills_group() {
        let nodes = Arc::new(ClusterNodes::new());
        nodes.add_instance(1, "127.0.0.1", "1000", InstanceRole::Prefill, "m");
        nodes.set_group_id(1, 10);
        nodes.add_instance(2, "127.0.0.1", "2000", InstanceRole::Decode, "m");
        nodes.set_group_id(2, 20);

        let (handle, scheduler) = Scheduler::new(nodes, 16);
        let run = tokio::spawn(scheduler.run());

        let err = handle.schedule(SchedulePolicy::LoadBalance, None).await;
        assert!(err.is_err());
        drop(handle);
        let _ = run.await;
    }

    #[tokio::test]
    async fn load_balance_prefers_least_loaded_instance() {
        let (nodes, _ids) = setup(2, 1);
        let (handle, scheduler) = Scheduler::new(nodes, 16);
        let run = tokio::spawn(scheduler.run());

        let (first, _) = handle.schedule(SchedulePolicy::LoadBalance, None).await.unwrap();
        let (second, _) = handle.schedule(SchedulePolicy::LoadBalance, None).await.unwrap();
        assert_ne!(first, second, "second pick should favor the still-idle instance");
        drop(handle);
        let _ = run.await;
    }
}
