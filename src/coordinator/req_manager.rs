// src/coordinator/req_manager.rs

//! Owns every in-flight `Request` and its state machine:
//! PENDING -> SENT_TO_P -> STREAMING_FROM_D -> FINISHED, with EXCEPTION/TIMEOUT
//! branches. Grounded on the original coordinator's request table plus
//! `CCAERequestHandler`'s retry classification.

use crate::core::errors::ErrorKind;
use crate::core::metrics;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ClientProtocol {
    Triton,
    Tgi,
    OpenAi,
    MindIe,
    Tokenizer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Pending,
    SentToP,
    StreamingFromD,
    Finished,
    Exception,
    Timeout,
}

pub const DEFAULT_MAX_RETRY: u32 = 3;

#[derive(Debug, Clone)]
pub struct Request {
    pub req_id: String,
    pub created_at_ms: i64,
    pub protocol: ClientProtocol,
    pub stream: bool,
    pub prefill_id: Option<u64>,
    pub decode_id: Option<u64>,
    pub state: RequestState,
    pub retry_count: u32,
    pub max_retry: u32,
    pub input_length: u64,
    pub output_length: u64,
    /// Set the first time this attempt reaches `SentToP`; a retry only restarts the
    /// schedule timer when this was true for the attempt it is replacing.
    pub reached_sent_to_p: bool,
    /// The original prompt text, kept so a retry can re-dispatch without asking the
    /// client to resend anything.
    pub prompt: String,
}

impl Request {
    pub fn new(protocol: ClientProtocol, stream: bool, input_length: u64, prompt: String) -> Self {
        Self {
            req_id: Uuid::new_v4().to_string(),
            created_at_ms: now_ms(),
            protocol,
            stream,
            prefill_id: None,
            decode_id: None,
            state: RequestState::Pending,
            retry_count: 0,
            max_retry: DEFAULT_MAX_RETRY,
            input_length,
            output_length: 0,
            reached_sent_to_p: false,
            prompt,
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Tracks every retryable error kind and whether it warrants restarting the
/// schedule timer, per the rule that a retry only gets a fresh `scheduleTimeout`
/// when the prior attempt never reached `SentToP` (i.e. scheduling itself failed,
/// not dispatch or inference).
pub fn retry_restarts_schedule_timer(kind: ErrorKind, request: &Request) -> bool {
    kind.is_retryable() && !request.reached_sent_to_p
}

pub struct ReqManager {
    requests: DashMap<String, Request>,
    congestion_alarm_threshold: u64,
    congestion_clear_threshold: u64,
    congested: std::sync::atomic::AtomicBool,
    in_flight_counter: AtomicU32,
}

impl ReqManager {
    pub fn new(congestion_alarm_threshold: u64, congestion_clear_threshold: u64) -> Self {
        Self {
            requests: DashMap::new(),
            congestion_alarm_threshold,
            congestion_clear_threshold,
            congested: std::sync::atomic::AtomicBool::new(false),
            in_flight_counter: AtomicU32::new(0),
        }
    }

    pub fn admit(&self, request: Request) -> String {
        let req_id = request.req_id.clone();
        self.requests.insert(req_id.clone(), request);
        let in_flight = self.in_flight_counter.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::REQUESTS_IN_FLIGHT.with_label_values(&["pending"]).inc();
        metrics::REQUESTS_ADMITTED_TOTAL.inc();
        self.update_congestion(in_flight as u64);
        req_id
    }

    pub fn is_congested(&self) -> bool {
        self.congested.load(Ordering::Relaxed)
    }

    fn update_congestion(&self, in_flight: u64) {
        if in_flight >= self.congestion_alarm_threshold {
            self.congested.store(true, Ordering::Relaxed);
        } else if in_flight <= self.congestion_clear_threshold {
            self.congested.store(false, Ordering::Relaxed);
        }
    }

    pub fn get(&self, req_id: &str) -> Option<Request> {
        self.requests.get(req_id).map(|r| r.clone())
    }

    /// Transitions a request to `SentToP`, assigning the chosen pair. At most one
    /// (PREFILL, DECODE) pair is ever associated with a request at a time.
    pub fn mark_sent_to_p(&self, req_id: &str, prefill_id: u64, decode_id: u64) {
        if let Some(mut r) = self.requests.get_mut(req_id) {
            r.prefill_id = Some(prefill_id);
            r.decode_id = Some(decode_id);
            r.state = RequestState::SentToP;
            r.reached_sent_to_p = true;
            metrics::REQUESTS_IN_FLIGHT.with_label_values(&["sent_to_p"]).inc();
        }
    }

    pub fn mark_streaming(&self, req_id: &str) {
        if let Some(mut r) = self.requests.get_mut(req_id) {
            r.state = RequestState::StreamingFromD;
        }
    }

    /// Finalizes a request with a terminal state and removes it from the table,
    /// decrementing the in-flight counter and recording the outcome.
    pub fn finish(&self, req_id: &str, state: RequestState) {
        if let Some((_, request)) = self.requests.remove(req_id) {
            let outcome = match state {
                RequestState::Finished => "success",
                RequestState::Exception => "exception",
                RequestState::Timeout => "timeout",
                _ => "unknown",
            };
            metrics::REQUESTS_COMPLETED_TOTAL.with_label_values(&[outcome]).inc();
            let elapsed = (now_ms() - request.created_at_ms).max(0) as f64 / 1000.0;
            metrics::REQUEST_LATENCY_SECONDS.observe(elapsed);
            let in_flight = self.in_flight_counter.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            self.update_congestion(in_flight as u64);
        }
    }

    /// Returns `true` if the request has retry budget remaining and records the
    /// attempt; the caller is responsible for actually re-submitting to the
    /// scheduler and deciding the new schedule-timer deadline via
    /// `retry_restarts_schedule_timer`.
    pub fn try_retry(&self, req_id: &str, kind: ErrorKind) -> bool {
        let Some(mut r) = self.requests.get_mut(req_id) else {
            return false;
        };
        if !kind.is_retryable() || r.retry_count >= r.max_retry {
            return false;
        }
        r.retry_count += 1;
        r.state = RequestState::Pending;
        r.prefill_id = None;
        r.decode_id = None;
        metrics::REQUEST_RETRIES_TOTAL.with_label_values(&[&kind.to_string()]).inc();
        true
    }

    pub fn count(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_are_monotonic_until_retry() {
        let mgr = ReqManager::new(1000, 500);
        let req = Request::new(ClientProtocol::OpenAi, false, 10, "hello".to_string());
        let id = mgr.admit(req);
        assert_eq!(mgr.get(&id).unwrap().state, RequestState::Pending);
        mgr.mark_sent_to_p(&id, 1, 2);
        assert_eq!(mgr.get(&id).unwrap().state, RequestState::SentToP);
        mgr.mark_streaming(&id);
        assert_eq!(mgr.get(&id).unwrap().state, RequestState::StreamingFromD);
        mgr.finish(&id, RequestState::Finished);
        assert!(mgr.get(&id).is_none());
    }

    #[test]
    fn retry_is_bounded_by_max_retry() {
        let mgr = ReqManager::new(1000, 500);
        let mut req = Request::new(ClientProtocol::OpenAi, false, 10, "hello".to_string());
        req.max_retry = 2;
        let id = mgr.admit(req);
        assert!(mgr.try_retry(&id, ErrorKind::ConnPErr));
        assert!(mgr.try_retry(&id, ErrorKind::ConnPErr));
        assert!(!mgr.try_retry(&id, ErrorKind::ConnPErr));
    }

    #[test]
    fn retry_only_restarts_timer_before_sent_to_p() {
        let mut req = Request::new(ClientProtocol::OpenAi, false, 10, "hello".to_string());
        assert!(retry_restarts_schedule_timer(ErrorKind::Retry, &req));
        req.reached_sent_to_p = true;
        assert!(!retry_restarts_schedule_timer(ErrorKind::SendPErr, &req));
    }

    #[test]
    fn congestion_alarm_and_clear_thresholds_hysteresis() {
        let mgr = ReqManager::new(2, 0);
        let id_a = mgr.admit(Request::new(ClientProtocol::OpenAi, false, 1, "hello".to_string()));
        assert!(!mgr.is_congested());
        let id_b = mgr.admit(Request::new(ClientProtocol::OpenAi, false, 1, "hello".to_string()));
        assert!(mgr.is_congested());
        mgr.finish(&id_a, RequestState::Finished);
        assert!(mgr.is_congested(), "still above clear threshold");
        mgr.finish(&id_b, RequestState::Finished);
        assert!(!mgr.is_congested());
    }
}
