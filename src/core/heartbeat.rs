// src/core/heartbeat.rs

//! Periodically writes a heartbeat payload into an overwrite-mode shared-memory ring
//! so that a co-located liveness watcher can observe this process's last-seen sequence
//! number and timestamp.

use crate::core::errors::Result;
use crate::core::metrics;
use crate::core::ring::{Ring, WriteMode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

#[derive(Serialize)]
struct HeartbeatMessage {
    seq: u64,
    timestamp: i64,
}

/// Writes an incrementing heartbeat into a shared-memory ring on a fixed interval.
pub struct HeartbeatProducer {
    ring: Arc<Ring>,
    interval: Duration,
}

impl HeartbeatProducer {
    pub fn new(shm_name: &str, sem_name: &str, interval: Duration) -> Result<Self> {
        let ring = Ring::open(shm_name, sem_name, WriteMode::Overwrite)?;
        Ok(Self {
            ring: Arc::new(ring),
            interval,
        })
    }

    /// Runs the heartbeat loop until the process is torn down. Intended to be spawned
    /// as a background task under a `JoinSet`; it never returns `Err` on a single
    /// failed write, only logs and continues on the next tick.
    pub async fn run(self) {
        let mut seq: u64 = 0;
        let mut ticker = time::interval(self.interval);
        loop {
            ticker.tick().await;
            seq += 1;
            let timestamp = chrono::Utc::now().timestamp_millis();
            let message = HeartbeatMessage { seq, timestamp };
            let Ok(payload) = serde_json::to_vec(&message) else {
                warn!("failed to serialize heartbeat message seq={seq}");
                continue;
            };
            match self.ring.write(&payload) {
                Ok(true) => {
                    metrics::HEARTBEATS_PRODUCED_TOTAL.inc();
                    debug!(seq, "heartbeat written");
                }
                Ok(false) => warn!(seq, "heartbeat ring rejected write"),
                Err(e) => warn!(seq, error = %e, "heartbeat ring write failed"),
            }
        }
    }
}
