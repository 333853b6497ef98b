// src/core/leader.rs

//! Leader election for a single logical role (Controller or Coordinator), built on a
//! pluggable [`DistributedLockPolicy`] and exposing promote/demote callbacks through
//! the [`RoleHandler`] trait.
//!
//! The state machine mirrors the management service's own `LeaderAgent`: a campaign
//! either wins the lock immediately (promote) or loses it (stay/become follower), and
//! the lock policy's callback drives any subsequent promotion or demotion as the lock
//! is lost or regained out from under us (session expiry, network partition, etc).

use crate::core::errors::{ControlPlaneError, Result};
use crate::core::metrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// A pluggable distributed mutex with a watchable locked/unlocked callback, and a
/// small compare-and-swap key/value store used to publish leader-only data (the node
/// inventory snapshot, the cluster-wide fault switch) to followers.
#[async_trait]
pub trait DistributedLockPolicy: Send + Sync {
    /// Attempts to acquire the lock once. Returns `true` if acquired.
    async fn try_lock(&self) -> Result<bool>;

    /// Releases the lock if held by this process.
    async fn unlock(&self) -> Result<()>;

    /// Registers a callback invoked whenever the observed lock state changes
    /// (including involuntary loss, e.g. lease expiry).
    fn register_callback(&self, callback: Box<dyn Fn(bool) + Send + Sync>);

    /// Writes `value` under `key`, regardless of current lock ownership (used for
    /// leader-authored data that followers read).
    async fn safe_put(&self, key: &str, value: &str) -> Result<()>;

    /// Reads the current value of `key`, if any.
    async fn get_with_revision(&self, key: &str) -> Result<Option<String>>;
}

/// Hooks invoked when a [`LeaderAgent`] changes role. `on_promote`'s `first_time` flag
/// distinguishes ordinary startup promotion from a later re-promotion, which the
/// management service treats as a reportable event rather than routine startup.
#[async_trait]
pub trait RoleHandler: Send + Sync {
    async fn on_promote(&self, first_time: bool);
    async fn on_demote(&self);
}

const NODE_DATA_KEY: &str = "/controller/node-data";
const SWITCH_FAULTS_KEY: &str = "/controller/switch-faults";

/// Drives promotion/demotion for a single role, backed by a [`DistributedLockPolicy`].
pub struct LeaderAgent {
    lock: Arc<dyn DistributedLockPolicy>,
    handler: Arc<dyn RoleHandler>,
    is_leader: Arc<AtomicBool>,
    has_been_leader_before: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl LeaderAgent {
    pub fn new(lock: Arc<dyn DistributedLockPolicy>, handler: Arc<dyn RoleHandler>) -> Self {
        Self {
            lock,
            handler,
            is_leader: Arc::new(AtomicBool::new(false)),
            has_been_leader_before: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Registers the lock-state callback and runs the initial campaign. The callback
    /// drives any subsequent promotion/demotion for the lifetime of this agent.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<bool>();
        self.lock.register_callback(Box::new(move |locked| {
            let _ = tx.send(locked);
        }));

        let agent = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(locked) = rx.recv().await {
                agent.handle_lock_change(locked).await;
            }
        });

        self.campaign().await
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if self.is_leader.load(Ordering::SeqCst) {
            if let Err(e) = self.lock.unlock().await {
                warn!(error = %e, "failed to release leader lock on stop");
            }
        }
        self.is_leader.store(false, Ordering::SeqCst);
    }

    async fn campaign(&self) -> Result<()> {
        if self.is_leader.load(Ordering::SeqCst) {
            warn!("campaign called while already leader");
            return Ok(());
        }
        if self.lock.try_lock().await? {
            self.promote_to_leader().await;
        } else {
            self.demote_to_follower().await;
        }
        Ok(())
    }

    async fn handle_lock_change(&self, locked: bool) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if locked && !self.is_leader.load(Ordering::SeqCst) {
            self.promote_to_leader().await;
        } else if !locked && self.is_leader.load(Ordering::SeqCst) {
            self.demote_to_follower().await;
        }
    }

    async fn promote_to_leader(&self) {
        if self.is_leader.swap(true, Ordering::SeqCst) {
            return;
        }
        // `first_time` is true only for this process's very first role assignment
        // ever (ordinary startup); any later promotion is a re-promotion worth
        // reporting as an event to the handler.
        let first_time = !self.has_been_leader_before.load(Ordering::SeqCst);
        self.handler.on_promote(first_time).await;
        self.has_been_leader_before.store(true, Ordering::SeqCst);
        metrics::IS_LEADER.set(1.0);
        metrics::LEADER_PROMOTIONS_TOTAL.inc();
        info!("promoted to leader");
    }

    async fn demote_to_follower(&self) {
        self.has_been_leader_before.store(true, Ordering::SeqCst);
        if !self.is_leader.swap(false, Ordering::SeqCst) {
            return;
        }
        self.handler.on_demote().await;
        metrics::IS_LEADER.set(0.0);
        metrics::LEADER_DEMOTIONS_TOTAL.inc();
        info!("demoted to follower");
    }

    /// Publishes the leader-authored node inventory snapshot.
    pub async fn write_nodes(&self, value: &str) -> Result<()> {
        self.lock.safe_put(NODE_DATA_KEY, value).await
    }

    pub async fn read_nodes(&self) -> Result<Option<String>> {
        self.lock.get_with_revision(NODE_DATA_KEY).await
    }

    pub async fn write_faults_value(&self, value: &str) -> Result<()> {
        self.lock.safe_put(SWITCH_FAULTS_KEY, value).await
    }

    pub async fn read_faults_value(&self) -> Result<Option<String>> {
        self.lock.get_with_revision(SWITCH_FAULTS_KEY).await
    }
}

/// An etcd-backed [`DistributedLockPolicy`]: a lease-scoped key acquired via a
/// compare-and-swap transaction, kept alive on a background task, and watched so that
/// an involuntary loss (lease expiry, etcd-side deletion) is observed promptly.
pub struct EtcdLockPolicy {
    client: Mutex<etcd_client::Client>,
    lock_key: String,
    client_id: String,
    lease_ttl_secs: i64,
    watch_gap: Duration,
    callback: Mutex<Option<Box<dyn Fn(bool) + Send + Sync>>>,
    is_locked: Arc<AtomicBool>,
}

impl EtcdLockPolicy {
    pub async fn connect(
        endpoints: &[String],
        lock_key: impl Into<String>,
        client_id: impl Into<String>,
        lease_ttl_secs: i64,
    ) -> Result<Self> {
        let client = etcd_client::Client::connect(endpoints, None)
            .await
            .map_err(|e| ControlPlaneError::Leader(format!("etcd connect failed: {e}")))?;
        Ok(Self {
            client: Mutex::new(client),
            lock_key: lock_key.into(),
            client_id: client_id.into(),
            lease_ttl_secs,
            watch_gap: Duration::from_secs(5),
            callback: Mutex::new(None),
            is_locked: Arc::new(AtomicBool::new(false)),
        })
    }

    fn notify(&self, locked: bool) {
        self.is_locked.store(locked, Ordering::SeqCst);
        if let Some(cb) = self.callback.lock().as_ref() {
            cb(locked);
        }
    }

    async fn acquire_once(&self) -> Result<bool> {
        let mut client = self.client.lock_owned_or_clone();
        let lease = client
            .lease_grant(self.lease_ttl_secs, None)
            .await
            .map_err(|e| ControlPlaneError::Leader(format!("lease_grant failed: {e}")))?;
        let lease_id = lease.id();

        let txn = etcd_client::Txn::new()
            .when(vec![etcd_client::Compare::create_revision(
                self.lock_key.as_str(),
                etcd_client::CompareOp::Equal,
                0,
            )])
            .and_then(vec![etcd_client::TxnOp::put(
                self.lock_key.as_str(),
                self.client_id.as_str(),
                Some(etcd_client::PutOptions::new().with_lease(lease_id)),
            )])
            .or_else(vec![etcd_client::TxnOp::get(self.lock_key.as_str(), None)]);

        let resp = client
            .txn(txn)
            .await
            .map_err(|e| ControlPlaneError::Leader(format!("lock txn failed: {e}")))?;

        if resp.succeeded() {
            self.spawn_keepalive(lease_id);
            self.spawn_watch();
            Ok(true)
        } else {
            let _ = client.lease_revoke(lease_id).await;
            Ok(false)
        }
    }

    fn spawn_keepalive(&self, lease_id: i64) {
        let mut client = self.client.lock_owned_or_clone();
        let ttl = self.lease_ttl_secs.max(1) as u64;
        let is_locked = Arc::clone(&self.is_locked);
        tokio::spawn(async move {
            let Ok((mut keeper, mut stream)) = client.lease_keep_alive(lease_id).await else {
                is_locked.store(false, Ordering::SeqCst);
                return;
            };
            let mut interval = tokio::time::interval(Duration::from_secs(ttl / 2));
            loop {
                interval.tick().await;
                if keeper.keep_alive().await.is_err() {
                    warn!(lease_id, "lease keepalive send failed, giving up leadership");
                    is_locked.store(false, Ordering::SeqCst);
                    return;
                }
                match stream.message().await {
                    Ok(Some(_)) => {}
                    _ => {
                        warn!(lease_id, "lease keepalive lost, giving up leadership");
                        is_locked.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }
        });
    }

    fn spawn_watch(&self) {
        let mut client = self.client.lock_owned_or_clone();
        let key = self.lock_key.clone();
        let watch_gap = self.watch_gap;
        let is_locked = Arc::clone(&self.is_locked);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(watch_gap).await;
                if !is_locked.load(Ordering::SeqCst) {
                    return;
                }
                match client.get(key.as_str(), None).await {
                    Ok(resp) if resp.kvs().is_empty() => {
                        warn!("lock key disappeared out from under us");
                        is_locked.store(false, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "lock watch poll failed");
                    }
                    _ => {}
                }
            }
        });
    }
}

#[async_trait]
impl DistributedLockPolicy for EtcdLockPolicy {
    async fn try_lock(&self) -> Result<bool> {
        let locked = self.acquire_once().await?;
        self.notify(locked);
        Ok(locked)
    }

    async fn unlock(&self) -> Result<()> {
        let mut client = self.client.lock_owned_or_clone();
        let _ = client.delete(self.lock_key.as_str(), None).await;
        self.notify(false);
        Ok(())
    }

    fn register_callback(&self, callback: Box<dyn Fn(bool) + Send + Sync>) {
        *self.callback.lock() = Some(callback);
    }

    async fn safe_put(&self, key: &str, value: &str) -> Result<()> {
        let mut client = self.client.lock_owned_or_clone();
        client
            .put(key, value, None)
            .await
            .map_err(|e| ControlPlaneError::Leader(format!("put({key}) failed: {e}")))?;
        Ok(())
    }

    async fn get_with_revision(&self, key: &str) -> Result<Option<String>> {
        let mut client = self.client.lock_owned_or_clone();
        let resp = client
            .get(key, None)
            .await
            .map_err(|e| ControlPlaneError::Leader(format!("get({key}) failed: {e}")))?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| String::from_utf8_lossy(kv.value()).to_string()))
    }
}

/// Extension used only to keep the `etcd_client::Client` (which is cheaply `Clone`,
/// internally holding a channel handle) reachable from behind a `parking_lot::Mutex`
/// without awaiting while holding the guard.
trait CloneLocked {
    fn lock_owned_or_clone(&self) -> etcd_client::Client;
}

impl CloneLocked for Mutex<etcd_client::Client> {
    fn lock_owned_or_clone(&self) -> etcd_client::Client {
        self.lock().clone()
    }
}

/// An in-memory lock policy for single-process testing and local development, backed
/// by a `HashMap` guarded by a `parking_lot::Mutex` instead of etcd.
#[derive(Default)]
pub struct MockLockPolicy {
    store: Mutex<HashMap<String, String>>,
    locked: AtomicBool,
    callback: Mutex<Option<Box<dyn Fn(bool) + Send + Sync>>>,
}

impl MockLockPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: forces the observed lock state to `locked`, invoking the registered
    /// callback as etcd's watch would on an involuntary change.
    pub fn force_lock_state(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
        if let Some(cb) = self.callback.lock().as_ref() {
            cb(locked);
        }
    }
}

#[async_trait]
impl DistributedLockPolicy for MockLockPolicy {
    async fn try_lock(&self) -> Result<bool> {
        let acquired = !self.locked.swap(true, Ordering::SeqCst);
        Ok(acquired)
    }

    async fn unlock(&self) -> Result<()> {
        self.locked.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn register_callback(&self, callback: Box<dyn Fn(bool) + Send + Sync>) {
        *self.callback.lock() = Some(callback);
    }

    async fn safe_put(&self, key: &str, value: &str) -> Result<()> {
        self.store.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_with_revision(&self, key: &str) -> Result<Option<String>> {
        Ok(self.store.lock().get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingHandler {
        promotions: Arc<AtomicU32>,
        demotions: Arc<AtomicU32>,
    }

    #[async_trait]
    impl RoleHandler for CountingHandler {
        async fn on_promote(&self, _first_time: bool) {
            self.promotions.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_demote(&self) {
            self.demotions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn campaign_promotes_when_lock_acquired() {
        let lock = Arc::new(MockLockPolicy::new());
        let promotions = Arc::new(AtomicU32::new(0));
        let demotions = Arc::new(AtomicU32::new(0));
        let handler = Arc::new(CountingHandler {
            promotions: promotions.clone(),
            demotions: demotions.clone(),
        });
        let agent = Arc::new(LeaderAgent::new(lock, handler));
        agent.start().await.unwrap();
        assert!(agent.is_leader());
        assert_eq!(promotions.load(Ordering::SeqCst), 1);
        assert_eq!(demotions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn promote_is_idempotent() {
        let lock = Arc::new(MockLockPolicy::new());
        let promotions = Arc::new(AtomicU32::new(0));
        let demotions = Arc::new(AtomicU32::new(0));
        let handler = Arc::new(CountingHandler {
            promotions: promotions.clone(),
            demotions: demotions.clone(),
        });
        let agent = Arc::new(LeaderAgent::new(lock, handler));
        agent.start().await.unwrap();
        agent.promote_to_leader().await;
        assert_eq!(promotions.load(Ordering::SeqCst), 1);
    }

    /// At most one of N agents sharing a lock key may ever observe LEADER, even
    /// when every agent campaigns for the same key at once.
    #[tokio::test]
    async fn at_most_one_leader_across_agents_sharing_a_lock() {
        let lock: Arc<MockLockPolicy> = Arc::new(MockLockPolicy::new());
        let mut agents = Vec::new();
        for _ in 0..5 {
            let handler = Arc::new(CountingHandler {
                promotions: Arc::new(AtomicU32::new(0)),
                demotions: Arc::new(AtomicU32::new(0)),
            });
            agents.push(Arc::new(LeaderAgent::new(lock.clone(), handler)));
        }
        for agent in &agents {
            agent.start().await.unwrap();
        }
        let leaders = agents.iter().filter(|a| a.is_leader()).count();
        assert_eq!(leaders, 1);
    }
}
