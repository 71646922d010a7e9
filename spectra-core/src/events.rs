//! Typed events pushed from the daemon to subscribers.
//!
//! Each event is one NDJSON line: an [`EventEnvelope`] whose `type` field
//! names the [`SweepEvent`] variant.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Severity};
use crate::types::{Detection, Frequency, ServerState, SweepConfiguration, SweepPhase};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SweepEvent {
    SweepData(SweepData),
    StatusChange(StatusChange),
    CycleConfig(CycleConfig),
    Error(ErrorEvent),
    CyclingError(ErrorEvent),
    FrequencyError(FrequencyError),
    GracefulStop(GracefulStop),
    EmergencyStop(EmergencyStop),
    ServerReset(ServerReset),
    StateSync(ServerState),
    Heartbeat(Heartbeat),
}

impl SweepEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SweepEvent::SweepData(_) => "sweep_data",
            SweepEvent::StatusChange(_) => "status_change",
            SweepEvent::CycleConfig(_) => "cycle_config",
            SweepEvent::Error(_) => "error",
            SweepEvent::CyclingError(_) => "cycling_error",
            SweepEvent::FrequencyError(_) => "frequency_error",
            SweepEvent::GracefulStop(_) => "graceful_stop",
            SweepEvent::EmergencyStop(_) => "emergency_stop",
            SweepEvent::ServerReset(_) => "server_reset",
            SweepEvent::StateSync(_) => "state_sync",
            SweepEvent::Heartbeat(_) => "heartbeat",
        }
    }
}

/// Wire wrapper adding a per-daemon sequence number and send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub sent_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SweepEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepData {
    #[serde(flatten)]
    pub detection: Detection,
    pub strength_label: String,
}

impl From<Detection> for SweepData {
    fn from(detection: Detection) -> Self {
        let strength_label = detection.strength.label().to_string();
        Self {
            detection,
            strength_label,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub phase: SweepPhase,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub frequency: Option<Frequency>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub next_frequency: Option<Frequency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleConfig {
    pub frequencies: Vec<Frequency>,
    #[serde(default)]
    pub blacklisted: Vec<Frequency>,
    pub cycle_time_ms: u64,
    pub switching_time_ms: u64,
    pub is_cycling: bool,
}

impl CycleConfig {
    pub fn new(config: &SweepConfiguration, active: &[Frequency], blacklisted: &[Frequency]) -> Self {
        Self {
            frequencies: active.to_vec(),
            blacklisted: blacklisted.to_vec(),
            cycle_time_ms: config.cycle_time_ms,
            switching_time_ms: config.switching_time_ms,
            is_cycling: active.len() > 1,
        }
    }

    /// Rebuild the configuration event from a snapshot; `None` when idle.
    pub fn from_state(state: &ServerState) -> Option<Self> {
        if !state.is_running {
            return None;
        }
        Some(Self {
            frequencies: state.frequencies.clone(),
            blacklisted: state.blacklisted.clone(),
            cycle_time_ms: state.cycle_time_ms.unwrap_or_default(),
            switching_time_ms: state.switching_time_ms.unwrap_or_default(),
            is_cycling: state.is_cycling,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub retryable: bool,
    pub message: String,
    pub hint: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub frequency: Option<Frequency>,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            retryable: !matches!(kind, ErrorKind::SessionFatal),
            message: message.into(),
            hint: kind.hint().to_string(),
            frequency: None,
        }
    }

    pub fn for_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = Some(frequency);
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyError {
    #[serde(flatten)]
    pub error: ErrorEvent,
    pub consecutive_errors: u32,
    pub threshold: u32,
    pub blacklisted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GracefulStop {
    pub reason: String,
    /// Failures per frequency, keyed by display label.
    pub error_tally: BTreeMap<String, u32>,
    pub blacklisted: Vec<Frequency>,
    pub total_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyStop {
    pub reason: String,
    pub killed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerReset {
    pub reason: String,
    pub reaped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub version: u64,
    pub subscribers: usize,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_type_tag() {
        let envelope = EventEnvelope {
            seq: 7,
            sent_at: Utc::now(),
            event: SweepEvent::Heartbeat(Heartbeat {
                version: 3,
                subscribers: 1,
                uptime_secs: 12,
            }),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["version"], 3);

        let back: EventEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.event.name(), "heartbeat");
    }

    #[test]
    fn sweep_data_flattens_detection_and_label() {
        let detection = Detection::new(915e6, -45.0, Utc::now());
        let json = serde_json::to_value(SweepEvent::SweepData(detection.into())).unwrap();
        assert_eq!(json["type"], "sweep_data");
        assert_eq!(json["strength_label"], "very strong");
        assert_eq!(json["frequency_hz"], 915e6);
    }

    #[test]
    fn session_fatal_errors_are_not_retryable() {
        let event = ErrorEvent::new(ErrorKind::SessionFatal, Severity::Critical, "too many failures");
        assert!(!event.retryable);
        assert_eq!(event.hint, ErrorKind::SessionFatal.hint());
    }
}
