// src/coordinator/request_repeater.rs

//! Drives the retry of a single request: reclassifies the failure, asks
//! `ReqManager` whether budget remains, and re-submits to the scheduler with a
//! fresh schedule-timer deadline only when the prior attempt never reached
//! `SentToP`. One `RequestRepeater::retry` call corresponds to one failed attempt.

use crate::core::errors::{ControlPlaneError, ErrorKind, Result};
use crate::coordinator::req_manager::{ReqManager, retry_restarts_schedule_timer};
use crate::coordinator::scheduler::{SchedulePolicy, SchedulerHandle};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct RequestRepeater {
    req_manager: Arc<ReqManager>,
    scheduler: SchedulerHandle,
    schedule_timeout: Duration,
    policy: SchedulePolicy,
}

impl RequestRepeater {
    pub fn new(
        req_manager: Arc<ReqManager>,
        scheduler: SchedulerHandle,
        schedule_timeout: Duration,
        policy: SchedulePolicy,
    ) -> Self {
        Self { req_manager, scheduler, schedule_timeout, policy }
    }

    /// Attempts to retry `req_id` after it failed with `kind`. Returns the new
    /// (PREFILL, DECODE) pair on success, or the terminal error if the request has
    /// exhausted its retry budget or the failure is not retryable.
    pub async fn retry(&self, req_id: &str, kind: ErrorKind) -> Result<(u64, u64)> {
        let Some(request) = self.req_manager.get(req_id) else {
            return Err(ControlPlaneError::NotFound(format!("unknown request {req_id}")));
        };
        if !self.req_manager.try_retry(req_id, kind) {
            warn!(req_id, %kind, "request exhausted retry budget or error is terminal");
            return Err(ControlPlaneError::OperationRepeat(format!(
                "request {req_id} cannot be retried for {kind}"
            )));
        }

        let restart_timer = retry_restarts_schedule_timer(kind, &request);
        let schedule = self.scheduler.schedule(self.policy, None);
        let pair = if restart_timer {
            match tokio::time::timeout(self.schedule_timeout, schedule).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ControlPlaneError::ScheduleTimeout(self.schedule_timeout));
                }
            }
        } else {
            schedule.await?
        };

        self.req_manager.mark_sent_to_p(req_id, pair.0, pair.1);
        info!(req_id, prefill = pair.0, decode = pair.1, "retried request onto new pair");
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::cluster_nodes::{ClusterNodes, InstanceRole};
    use crate::coordinator::req_manager::{ClientProtocol, Request};
    use crate::coordinator::scheduler::Scheduler;

    #[tokio::test]
    async fn retry_reschedules_onto_a_fresh_pair() {
        let nodes = Arc::new(ClusterNodes::new());
        nodes.add_instance(1, "127.0.0.1", "1000", InstanceRole::Prefill, "m");
        nodes.add_instance(2, "127.0.0.1", "2000", InstanceRole::Decode, "m");
        let (handle, scheduler) = Scheduler::new(nodes, 16);
        tokio::spawn(scheduler.run());

        let req_manager = Arc::new(ReqManager::new(1000, 500));
        let req = Request::new(ClientProtocol::OpenAi, false, 10, "hello".to_string());
        let id = req_manager.admit(req);

        let repeater = RequestRepeater::new(
            req_manager.clone(),
            handle,
            Duration::from_millis(500),
            SchedulePolicy::LoadBalance,
        );
        let (p, d) = repeater.retry(&id, ErrorKind::ConnPErr).await.unwrap();
        assert_eq!((p, d), (1, 2));
        assert_eq!(req_manager.get(&id).unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn retry_fails_fast_on_terminal_error() {
        let nodes = Arc::new(ClusterNodes::new());
        let (handle, scheduler) = Scheduler::new(nodes, 16);
        tokio::spawn(scheduler.run());
        let req_manager = Arc::new(ReqManager::new(1000, 500));
        let id = req_manager.admit(Request::new(ClientProtocol::OpenAi, false, 10, "hello".to_string()));
        let repeater = RequestRepeater::new(req_manager, handle, Duration::from_millis(500), SchedulePolicy::LoadBalance);
        let result = repeater.retry(&id, ErrorKind::UserDisConn).await;
        assert!(result.is_err());
    }
}
