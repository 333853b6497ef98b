// src/core/alarm.rs

//! The alarm payload schema shared by the Controller's alarm-ingest HTTP endpoint and
//! the background pipeline that forwards it into the node's shared-memory alarm ring.
//!
//! `AlarmRecord` is the wire schema a Coordinator posts to `/v1/alarm/coordinator`:
//! an array of int-coded telecom-alarm records, validated record-by-record and
//! converted into the simpler internal `AlarmPayload` the ring actually carries.
//! Grounded on `IsCoordinatorAlarmValid`/`CoordinatorAlarmHandler`.

use crate::core::errors::{ControlPlaneError, Result};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use strum_macros::{Display, EnumString};

/// The severity a reporting component assigns to an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AlarmSeverity {
    Critical,
    Major,
    Minor,
    Info,
}

/// Who raised the alarm: a Coordinator process, a worker's inference engine, or the
/// Controller itself (e.g. a synthetic alarm raised from `StatusUpdater`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlarmSource {
    Coordinator,
    LlmEngine,
    Controller,
}

/// A single alarm event as written into the shared-memory alarm ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmPayload {
    pub source: AlarmSource,
    pub severity: AlarmSeverity,
    /// Stable identifier for the condition, e.g. `"COORDINATOR_UNREACHABLE"`.
    pub code: String,
    pub node_id: String,
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// `true` when this alarm reports that a previously-alarmed condition has cleared.
    #[serde(default)]
    pub recovered: bool,
}

impl AlarmPayload {
    /// Builds a `SERVER_NO_REPLY`/`SERVER_RESPONSE_ERROR`-style synthetic alarm, the
    /// way `ServerRequestHandler::AddServerEventToAlarmMgr` raises one on a worker
    /// poll failure.
    pub fn server_exception(node_id: impl Into<String>, code: &str, message: impl Into<String>, timestamp_ms: i64) -> Self {
        AlarmPayload {
            source: AlarmSource::Controller,
            severity: AlarmSeverity::Major,
            code: code.to_string(),
            node_id: node_id.into(),
            message: message.into(),
            timestamp_ms,
            recovered: false,
        }
    }

    fn from_record(record: &AlarmRecord, source: AlarmSource) -> Self {
        let severity = match record.severity {
            s if s == ALARM_SEVERITY_CRITICAL => AlarmSeverity::Critical,
            s if s == ALARM_SEVERITY_MAJOR => AlarmSeverity::Major,
            s if s == ALARM_SEVERITY_MINOR => AlarmSeverity::Minor,
            _ => AlarmSeverity::Info,
        };
        AlarmPayload {
            source,
            severity,
            code: record.alarm_id.clone(),
            node_id: record.origin_system.clone(),
            message: record.additional_information.clone(),
            timestamp_ms: record.occur_time,
            recovered: record.cleared == ALARM_CLEARED_YES,
        }
    }
}

const ALARM_CATEGORY_RANGE: RangeInclusive<i64> = 0..=1;
const ALARM_CLEARED_NO: i64 = 0;
const ALARM_CLEARED_YES: i64 = 1;
const ALARM_CLEARED_RANGE: RangeInclusive<i64> = ALARM_CLEARED_NO..=ALARM_CLEARED_YES;
const ALARM_CLEAR_CATEGORY_RANGE: RangeInclusive<i64> = 0..=1;
/// Upper bound approximates the original's `EventType` enum, which runs from
/// `COMMUNICATION` through a trailing `HEARTBEAT` entry; the exact intermediate
/// variants aren't named in this port, so any value in range is accepted.
const EVENT_TYPE_RANGE: RangeInclusive<i64> = 0..=9;
const ALARM_SEVERITY_CRITICAL: i64 = 1;
const ALARM_SEVERITY_MAJOR: i64 = 2;
const ALARM_SEVERITY_MINOR: i64 = 3;
const ALARM_SEVERITY_WARNING: i64 = 4;
const ALARM_SEVERITY_RANGE: RangeInclusive<i64> = ALARM_SEVERITY_CRITICAL..=ALARM_SEVERITY_WARNING;
const SERVICE_AFFECTED_TYPE_RANGE: RangeInclusive<i64> = 0..=1;

/// One telecom-alarm record as posted to `/v1/alarm/coordinator`. Every int field is
/// range-checked and every string field must be present; a record that fails either
/// check, or doesn't even deserialize, is dropped rather than failing the whole batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmRecord {
    pub category: i64,
    pub cleared: i64,
    pub clear_category: i64,
    pub occur_utc: i64,
    pub occur_time: i64,
    pub event_type: i64,
    pub severity: i64,
    pub service_affected_type: i64,
    pub reason_id: i64,
    pub origin_system: String,
    pub origin_system_name: String,
    pub origin_system_type: String,
    pub probable_cause: String,
    pub location: String,
    pub moi: String,
    pub alarm_id: String,
    pub alarm_name: String,
    pub additional_information: String,
}

impl AlarmRecord {
    fn validate(&self) -> bool {
        ALARM_CATEGORY_RANGE.contains(&self.category)
            && ALARM_CLEARED_RANGE.contains(&self.cleared)
            && ALARM_CLEAR_CATEGORY_RANGE.contains(&self.clear_category)
            && EVENT_TYPE_RANGE.contains(&self.event_type)
            && ALARM_SEVERITY_RANGE.contains(&self.severity)
            && SERVICE_AFFECTED_TYPE_RANGE.contains(&self.service_affected_type)
    }
}

/// Debounces the very first `COORDINATOR_EXCEPTION` fault and the very first recovery
/// reported after startup, matching `UpdateCoordinatorStatus`'s one-shot filter so a
/// restart-time alarm replay doesn't immediately flip coordinator-service-ready state.
pub struct CoordinatorStatusFilter {
    first_fault_filtered: AtomicBool,
    first_recover_filtered: AtomicBool,
}

const COORDINATOR_EXCEPTION_ALARM_ID: &str = "COORDINATOR_EXCEPTION";

impl Default for CoordinatorStatusFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinatorStatusFilter {
    pub fn new() -> Self {
        Self {
            first_fault_filtered: AtomicBool::new(false),
            first_recover_filtered: AtomicBool::new(false),
        }
    }

    /// Returns `true` if the surviving batch should actually be enqueued. Only the
    /// first record is consulted, mirroring the original reading `alarmJson[0]`.
    pub fn admits(&self, records: &[AlarmRecord]) -> bool {
        let Some(first) = records.first() else {
            return false;
        };
        if first.alarm_id != COORDINATOR_EXCEPTION_ALARM_ID {
            return true;
        }
        match first.cleared {
            ALARM_CLEARED_NO => !self.first_fault_filtered.swap(true, Ordering::Relaxed),
            ALARM_CLEARED_YES => !self.first_recover_filtered.swap(true, Ordering::Relaxed),
            _ => true,
        }
    }
}

/// Parses and validates a coordinator alarm batch. Returns the surviving records plus
/// whether any record was dropped; a body that isn't a JSON array is a hard error, but
/// an individual bad record inside an array is just dropped, never a whole-batch error.
pub fn parse_coordinator_alarm_batch(body: &[u8]) -> Result<(Vec<AlarmRecord>, bool)> {
    let raw: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ControlPlaneError::InvalidInput(format!("malformed alarm body: {e}")))?;
    let Some(array) = raw.as_array() else {
        return Err(ControlPlaneError::InvalidInput(
            "coordinator alarm body must be a JSON array".to_string(),
        ));
    };

    let mut valid = Vec::with_capacity(array.len());
    let mut any_dropped = false;
    for entry in array {
        match serde_json::from_value::<AlarmRecord>(entry.clone()) {
            Ok(record) if record.validate() => valid.push(record),
            _ => any_dropped = true,
        }
    }
    Ok((valid, any_dropped))
}

/// Converts a validated coordinator alarm batch into internal payloads for enqueueing.
pub fn records_to_payloads(records: &[AlarmRecord]) -> Vec<AlarmPayload> {
    records
        .iter()
        .map(|r| AlarmPayload::from_record(r, AlarmSource::Coordinator))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(alarm_id: &str, cleared: i64) -> serde_json::Value {
        serde_json::json!({
            "category": 0,
            "cleared": cleared,
            "clearCategory": 0,
            "occurUtc": 0,
            "occurTime": 123,
            "eventType": 0,
            "severity": 1,
            "serviceAffectedType": 0,
            "reasonId": 0,
            "originSystem": "node-1",
            "originSystemName": "node-1",
            "originSystemType": "worker",
            "probableCause": "oom",
            "location": "rack-1",
            "moi": "moi-1",
            "alarmId": alarm_id,
            "alarmName": "OOM",
            "additionalInformation": "out of memory",
        })
    }

    #[test]
    fn parse_batch_accepts_well_formed_array() {
        let body = serde_json::to_vec(&vec![sample_record("OOM", 0)]).unwrap();
        let (valid, dropped) = parse_coordinator_alarm_batch(&body).unwrap();
        assert_eq!(valid.len(), 1);
        assert!(!dropped);
    }

    #[test]
    fn parse_batch_rejects_non_array_body() {
        let body = serde_json::to_vec(&sample_record("OOM", 0)).unwrap();
        assert!(parse_coordinator_alarm_batch(&body).is_err());
    }

    #[test]
    fn parse_batch_drops_only_invalid_records() {
        let mut bad = sample_record("OOM", 0);
        bad["severity"] = serde_json::json!(99);
        let body = serde_json::to_vec(&vec![sample_record("OOM", 0), bad]).unwrap();
        let (valid, dropped) = parse_coordinator_alarm_batch(&body).unwrap();
        assert_eq!(valid.len(), 1);
        assert!(dropped);
    }

    #[test]
    fn coordinator_status_filter_drops_only_the_first_fault_and_first_recovery() {
        let filter = CoordinatorStatusFilter::new();
        let fault = AlarmRecord {
            category: 0,
            cleared: 0,
            clear_category: 0,
            occur_utc: 0,
            occur_time: 0,
            event_type: 0,
            severity: 1,
            service_affected_type: 0,
            reason_id: 0,
            origin_system: "coord".into(),
            origin_system_name: "coord".into(),
            origin_system_type: "coordinator".into(),
            probable_cause: "x".into(),
            location: "x".into(),
            moi: "x".into(),
            alarm_id: COORDINATOR_EXCEPTION_ALARM_ID.into(),
            alarm_name: "x".into(),
            additional_information: "x".into(),
        };
        assert!(!filter.admits(std::slice::from_ref(&fault)));
        assert!(filter.admits(std::slice::from_ref(&fault)));

        let mut recovered = fault.clone();
        recovered.cleared = 1;
        assert!(!filter.admits(std::slice::from_ref(&recovered)));
        assert!(filter.admits(std::slice::from_ref(&recovered)));
    }

    #[test]
    fn coordinator_status_filter_never_drops_unrelated_alarms() {
        let filter = CoordinatorStatusFilter::new();
        let record = AlarmRecord {
            alarm_id: "SOMETHING_ELSE".into(),
            ..AlarmRecord {
                category: 0,
                cleared: 0,
                clear_category: 0,
                occur_utc: 0,
                occur_time: 0,
                event_type: 0,
                severity: 1,
                service_affected_type: 0,
                reason_id: 0,
                origin_system: "x".into(),
                origin_system_name: "x".into(),
                origin_system_type: "x".into(),
                probable_cause: "x".into(),
                location: "x".into(),
                moi: "x".into(),
                alarm_id: String::new(),
                alarm_name: "x".into(),
                additional_information: "x".into(),
            }
        };
        assert!(filter.admits(std::slice::from_ref(&record)));
        assert!(filter.admits(std::slice::from_ref(&record)));
    }
}
