// src/core/alarm_pipeline.rs

//! Buffers inbound alarms and drains them into a shared-memory ring so that a
//! co-located watchdog process can pick them up without blocking the HTTP handler
//! that received them. Grounded on the original `AlarmManager`'s deque-plus-condvar
//! shape, translated into a bounded queue woken by a `Notify`.

use crate::core::alarm::AlarmPayload;
use crate::core::ring::Ring;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::warn;

const MAX_QUEUED_ALARMS: usize = 1000;

pub struct AlarmPipeline {
    queue: Mutex<VecDeque<AlarmPayload>>,
    notify: Notify,
    ring: Arc<Ring>,
}

impl AlarmPipeline {
    pub fn new(ring: Arc<Ring>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            ring,
        }
    }

    /// Enqueues an alarm for delivery. Drops the oldest queued alarm when the
    /// backlog exceeds `MAX_QUEUED_ALARMS` rather than applying backpressure to the
    /// HTTP handler that is calling this.
    pub fn enqueue(&self, alarm: AlarmPayload) {
        let mut queue = self.queue.lock();
        if queue.len() >= MAX_QUEUED_ALARMS {
            queue.pop_front();
            warn!("alarm pipeline backlog full, dropping oldest alarm");
        }
        queue.push_back(alarm);
        drop(queue);
        self.notify.notify_one();
    }

    /// Drains the queue into the ring until shutdown. Intended to run as a single
    /// background task for the lifetime of the process.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) {
        loop {
            let next = {
                let mut queue = self.queue.lock();
                queue.pop_front()
            };
            let Some(alarm) = next else {
                tokio::select! {
                    _ = self.notify.notified() => continue,
                    _ = shutdown_rx.recv() => return,
                }
            };
            match serde_json::to_vec(&alarm) {
                Ok(bytes) => {
                    if let Err(e) = self.ring.write(&bytes) {
                        warn!(error = %e, "failed to write alarm to ring");
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize alarm"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alarm::{AlarmSeverity, AlarmSource};
    use crate::core::ring::WriteMode;

    fn sample_alarm(code: &str) -> AlarmPayload {
        AlarmPayload {
            source: AlarmSource::Controller,
            severity: AlarmSeverity::Info,
            code: code.to_string(),
            node_id: "node-1".to_string(),
            message: "test".to_string(),
            timestamp_ms: 0,
            recovered: false,
        }
    }

    /// Posting 1001 alarms faster than the drain rate drops the oldest (code "0")
    /// and keeps the rest in order, mirroring the backlog-overflow scenario.
    #[test]
    fn overflow_drops_oldest_and_keeps_the_rest_in_order() {
        let ring = Arc::new(
            Ring::open_with_size(
                "/inferctl_test_alarm_overflow_shm",
                "/inferctl_test_alarm_overflow_sem",
                4096,
                WriteMode::Retain,
            )
            .expect("open ring"),
        );
        let pipeline = AlarmPipeline::new(ring);
        for i in 0..1001 {
            pipeline.enqueue(sample_alarm(&i.to_string()));
        }
        let queue = pipeline.queue.lock();
        assert_eq!(queue.len(), MAX_QUEUED_ALARMS);
        assert_eq!(queue.front().unwrap().code, "1");
        assert_eq!(queue.back().unwrap().code, "1000");
    }

    #[tokio::test]
    async fn drains_queued_alarms_into_ring() {
        let tmp = std::process::id();
        let shm = format!("/inferctl_test_alarm_pipeline_shm_{tmp}");
        let sem = format!("/inferctl_test_alarm_pipeline_sem_{tmp}");
        let ring = Arc::new(
            Ring::open_with_size(&shm, &sem, 4096, WriteMode::Retain).expect("open ring"),
        );
        let pipeline = Arc::new(AlarmPipeline::new(ring.clone()));
        pipeline.enqueue(sample_alarm("A"));
        pipeline.enqueue(sample_alarm("B"));

        let (_tx, rx) = tokio::sync::broadcast::channel(1);
        let drain = tokio::spawn(pipeline.clone().run(rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drain.abort();

        let first = ring.read().unwrap().expect("first alarm present");
        let payload: AlarmPayload = serde_json::from_slice(&first).unwrap();
        assert_eq!(payload.code, "A");
    }
}
