// src/core/metrics.rs

//! Defines and registers Prometheus metrics for control-plane monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramVec, TextEncoder, register_counter,
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
    register_histogram_vec,
};

lazy_static! {
    // --- Leader election ---
    /// 1 if this process currently holds the leader role, 0 otherwise.
    pub static ref IS_LEADER: Gauge =
        register_gauge!("inferctl_is_leader", "Whether this process currently holds the leader role.").unwrap();
    /// Total number of times this process has been promoted to leader.
    pub static ref LEADER_PROMOTIONS_TOTAL: Counter =
        register_counter!("inferctl_leader_promotions_total", "Total number of promotions to leader.").unwrap();
    /// Total number of times this process has been demoted from leader.
    pub static ref LEADER_DEMOTIONS_TOTAL: Counter =
        register_counter!("inferctl_leader_demotions_total", "Total number of demotions from leader.").unwrap();

    // --- Node inventory (Controller) ---
    /// Number of nodes currently tracked, labeled by role.
    pub static ref NODES_TRACKED: GaugeVec =
        register_gauge_vec!("inferctl_nodes_tracked", "Number of nodes currently tracked, labeled by role.", &["role"]).unwrap();
    /// Number of nodes currently marked faulty.
    pub static ref NODES_FAULTY: Gauge =
        register_gauge!("inferctl_nodes_faulty", "Number of nodes currently marked faulty.").unwrap();
    /// Total number of node-change events detected by DetectNodeChanges.
    pub static ref NODE_CHANGES_TOTAL: CounterVec =
        register_counter_vec!("inferctl_node_changes_total", "Total node changes detected, labeled by change kind.", &["kind"]).unwrap();

    // --- Ring / heartbeat ---
    /// Total number of shared-memory ring write failures, labeled by ring name.
    pub static ref RING_WRITE_ERRORS_TOTAL: CounterVec =
        register_counter_vec!("inferctl_ring_write_errors_total", "Total ring write failures, labeled by ring name.", &["ring"]).unwrap();
    /// Total number of heartbeats produced.
    pub static ref HEARTBEATS_PRODUCED_TOTAL: Counter =
        register_counter!("inferctl_heartbeats_produced_total", "Total number of heartbeats written to the ring.").unwrap();

    // --- Request lifecycle (Coordinator) ---
    /// Number of requests currently in flight, labeled by state.
    pub static ref REQUESTS_IN_FLIGHT: GaugeVec =
        register_gauge_vec!("inferctl_requests_in_flight", "Requests currently in flight, labeled by state.", &["state"]).unwrap();
    /// Total number of requests admitted.
    pub static ref REQUESTS_ADMITTED_TOTAL: Counter =
        register_counter!("inferctl_requests_admitted_total", "Total number of requests admitted.").unwrap();
    /// Total number of requests completed, labeled by outcome (finished/exception/timeout).
    pub static ref REQUESTS_COMPLETED_TOTAL: CounterVec =
        register_counter_vec!("inferctl_requests_completed_total", "Total number of requests completed, labeled by outcome.", &["outcome"]).unwrap();
    /// Total number of retries issued, labeled by the error kind that triggered them.
    pub static ref REQUEST_RETRIES_TOTAL: CounterVec =
        register_counter_vec!("inferctl_request_retries_total", "Total number of request retries, labeled by error kind.", &["error_kind"]).unwrap();
    /// End-to-end request latency from admission to completion, in seconds.
    pub static ref REQUEST_LATENCY_SECONDS: Histogram =
        register_histogram!("inferctl_request_latency_seconds", "End-to-end request latency in seconds.").unwrap();
    /// Time to first token, in seconds.
    pub static ref FIRST_TOKEN_LATENCY_SECONDS: Histogram =
        register_histogram!("inferctl_first_token_latency_seconds", "Time to first token in seconds.").unwrap();

    // --- Scheduler ---
    /// Scheduling decision latency, labeled by policy.
    pub static ref SCHEDULE_LATENCY_SECONDS: HistogramVec =
        register_histogram_vec!("inferctl_schedule_latency_seconds", "Scheduling decision latency in seconds, labeled by policy.", &["policy"]).unwrap();
    /// Total number of scheduling decisions, labeled by policy and outcome.
    pub static ref SCHEDULE_DECISIONS_TOTAL: CounterVec =
        register_counter_vec!("inferctl_schedule_decisions_total", "Total scheduling decisions, labeled by policy and outcome.", &["policy", "outcome"]).unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
