//! Domain types for sweeps, detections, and the authoritative server state.
//!
//! Frequencies travel as `{value, unit}` pairs on the wire and are normalised
//! to Hz (`f64`) for arithmetic. Durations are carried as milliseconds.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub const MIN_FREQUENCY_HZ: f64 = 1_000_000.0;
pub const MAX_FREQUENCY_HZ: f64 = 6_000_000_000.0;

/// Nominal cycle recorded for single-frequency sweeps; no timer is armed.
pub const SINGLE_FREQUENCY_CYCLE_MS: u64 = 10_000;

// ---------------------------------------------------------------------------
// Frequencies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FrequencyUnit {
    #[serde(rename = "Hz", alias = "hz", alias = "HZ")]
    Hz,
    #[serde(rename = "kHz", alias = "khz", alias = "KHZ", alias = "KHz")]
    KHz,
    #[default]
    #[serde(rename = "MHz", alias = "mhz", alias = "MHZ")]
    MHz,
    #[serde(rename = "GHz", alias = "ghz", alias = "GHZ")]
    GHz,
}

impl FrequencyUnit {
    pub fn multiplier(self) -> f64 {
        match self {
            FrequencyUnit::Hz => 1.0,
            FrequencyUnit::KHz => 1e3,
            FrequencyUnit::MHz => 1e6,
            FrequencyUnit::GHz => 1e9,
        }
    }
}

impl fmt::Display for FrequencyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrequencyUnit::Hz => write!(f, "Hz"),
            FrequencyUnit::KHz => write!(f, "kHz"),
            FrequencyUnit::MHz => write!(f, "MHz"),
            FrequencyUnit::GHz => write!(f, "GHz"),
        }
    }
}

impl FromStr for FrequencyUnit {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hz" => Ok(FrequencyUnit::Hz),
            "khz" => Ok(FrequencyUnit::KHz),
            "mhz" => Ok(FrequencyUnit::MHz),
            "ghz" => Ok(FrequencyUnit::GHz),
            other => Err(ValidationError::UnknownUnit(other.to_string())),
        }
    }
}

/// A target frequency as the operator entered it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Frequency {
    pub value: f64,
    #[serde(default)]
    pub unit: FrequencyUnit,
}

impl Frequency {
    pub fn new(value: f64, unit: FrequencyUnit) -> Self {
        Self { value, unit }
    }

    pub fn mhz(value: f64) -> Self {
        Self::new(value, FrequencyUnit::MHz)
    }

    pub fn hz(&self) -> f64 {
        self.value * self.unit.multiplier()
    }

    pub fn mhz_value(&self) -> f64 {
        self.hz() / 1e6
    }

    /// Integer Hz used as a stable map key for per-frequency bookkeeping.
    pub fn key(&self) -> u64 {
        self.hz().round().max(0.0) as u64
    }

    pub fn same_as(&self, other: &Frequency) -> bool {
        self.key() == other.key()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if !self.value.is_finite() {
            return Err(ValidationError::NotFinite { value: self.value });
        }
        let hz = self.hz();
        if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&hz) {
            return Err(ValidationError::OutOfRange {
                frequency: self.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3} MHz", self.mhz_value())
    }
}

// ---------------------------------------------------------------------------
// Sweep configuration
// ---------------------------------------------------------------------------

/// Bounds a sweep request is validated against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepLimits {
    pub max_frequencies: usize,
    pub min_cycle_time_ms: u64,
    pub max_cycle_time_ms: u64,
    /// Share of the cycle reserved for settling after a frequency change.
    pub switching_fraction: f64,
}

impl Default for SweepLimits {
    fn default() -> Self {
        Self {
            max_frequencies: 10,
            min_cycle_time_ms: 1_000,
            max_cycle_time_ms: 3_600_000,
            switching_fraction: 0.25,
        }
    }
}

/// One or more target frequencies plus cycle timing.
///
/// Built only through [`SweepConfiguration::new`], which enforces
/// `cycle_time > switching_time > 0` and the frequency count limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfiguration {
    pub frequencies: Vec<Frequency>,
    pub cycle_time_ms: u64,
    pub switching_time_ms: u64,
}

impl SweepConfiguration {
    pub fn new(
        frequencies: Vec<Frequency>,
        cycle_time: Duration,
        limits: &SweepLimits,
    ) -> Result<Self, ValidationError> {
        if frequencies.is_empty() {
            return Err(ValidationError::NoFrequencies);
        }
        if frequencies.len() > limits.max_frequencies {
            return Err(ValidationError::TooManyFrequencies {
                count: frequencies.len(),
                max: limits.max_frequencies,
            });
        }
        for frequency in &frequencies {
            frequency.validate()?;
        }

        let cycle_ms = cycle_time.as_millis() as u64;
        if !(limits.min_cycle_time_ms..=limits.max_cycle_time_ms).contains(&cycle_ms) {
            return Err(ValidationError::CycleTime {
                cycle_ms,
                min_ms: limits.min_cycle_time_ms,
                max_ms: limits.max_cycle_time_ms,
            });
        }

        let switching_ms = (cycle_ms as f64 * limits.switching_fraction).round() as u64;
        if switching_ms == 0 || switching_ms >= cycle_ms {
            return Err(ValidationError::SwitchingTime {
                switching_ms,
                cycle_ms,
            });
        }

        Ok(Self {
            frequencies,
            cycle_time_ms: cycle_ms,
            switching_time_ms: switching_ms,
        })
    }

    /// Backward-compatible single-frequency form.
    pub fn single(frequency: Frequency, limits: &SweepLimits) -> Result<Self, ValidationError> {
        let cycle_ms = SINGLE_FREQUENCY_CYCLE_MS
            .max(limits.min_cycle_time_ms)
            .min(limits.max_cycle_time_ms);
        Self::new(vec![frequency], Duration::from_millis(cycle_ms), limits)
    }

    pub fn is_cycling(&self) -> bool {
        self.frequencies.len() > 1
    }

    pub fn cycle_time(&self) -> Duration {
        Duration::from_millis(self.cycle_time_ms)
    }

    pub fn switching_time(&self) -> Duration {
        Duration::from_millis(self.switching_time_ms)
    }

    /// Time spent collecting on one frequency before switching begins.
    pub fn dwell_time(&self) -> Duration {
        self.cycle_time().saturating_sub(self.switching_time())
    }
}

// ---------------------------------------------------------------------------
// Detections
// ---------------------------------------------------------------------------

/// Fixed strength ladder for absolute power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStrength {
    NoSignal,
    VeryWeak,
    Weak,
    Moderate,
    Strong,
    VeryStrong,
}

impl SignalStrength {
    pub fn from_dbm(power_dbm: f64) -> Self {
        if power_dbm < -90.0 {
            SignalStrength::NoSignal
        } else if power_dbm < -80.0 {
            SignalStrength::VeryWeak
        } else if power_dbm < -70.0 {
            SignalStrength::Weak
        } else if power_dbm < -60.0 {
            SignalStrength::Moderate
        } else if power_dbm <= -50.0 {
            SignalStrength::Strong
        } else {
            SignalStrength::VeryStrong
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SignalStrength::NoSignal => "no signal",
            SignalStrength::VeryWeak => "very weak",
            SignalStrength::Weak => "weak",
            SignalStrength::Moderate => "moderate",
            SignalStrength::Strong => "strong",
            SignalStrength::VeryStrong => "very strong",
        }
    }
}

impl fmt::Display for SignalStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How close the detected peak landed to the requested frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetAccuracy {
    /// Within 50 kHz.
    Accurate,
    /// Within 100 kHz.
    Moderate,
    Inaccurate,
}

impl OffsetAccuracy {
    pub fn from_offset_hz(offset_hz: f64) -> Self {
        let khz = offset_hz.abs() / 1e3;
        if khz <= 50.0 {
            OffsetAccuracy::Accurate
        } else if khz <= 100.0 {
            OffsetAccuracy::Moderate
        } else {
            OffsetAccuracy::Inaccurate
        }
    }
}

/// One parsed observation: the peak bin of a sweep line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub frequency_hz: f64,
    pub power_dbm: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_hz: Option<f64>,
    /// Detected minus target, in MHz.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub offset_mhz: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub accuracy: Option<OffsetAccuracy>,
    pub strength: SignalStrength,
    #[serde(default)]
    pub bin_width_hz: f64,
}

impl Detection {
    pub fn new(frequency_hz: f64, power_dbm: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            frequency_hz,
            power_dbm,
            timestamp,
            target_hz: None,
            offset_mhz: None,
            accuracy: None,
            strength: SignalStrength::from_dbm(power_dbm),
            bin_width_hz: 0.0,
        }
    }

    pub fn with_target(mut self, target_hz: f64) -> Self {
        let offset_hz = self.frequency_hz - target_hz;
        self.target_hz = Some(target_hz);
        self.offset_mhz = Some(offset_hz / 1e6);
        self.accuracy = Some(OffsetAccuracy::from_offset_hz(offset_hz));
        self
    }
}

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SweepPhase {
    #[default]
    Idle,
    Starting,
    Active,
    Switching,
    Stopping,
    Error,
    EmergencyStop,
}

impl SweepPhase {
    pub fn is_running(self) -> bool {
        !matches!(self, SweepPhase::Idle | SweepPhase::EmergencyStop)
    }
}

impl fmt::Display for SweepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SweepPhase::Idle => "idle",
            SweepPhase::Starting => "starting",
            SweepPhase::Active => "active",
            SweepPhase::Switching => "switching",
            SweepPhase::Stopping => "stopping",
            SweepPhase::Error => "error",
            SweepPhase::EmergencyStop => "emergency_stop",
        };
        f.write_str(name)
    }
}

/// Versioned read-only projection of the sweep session.
///
/// `version` increases on every session mutation; clients compare it to
/// decide whether a snapshot is newer than what they display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerState {
    pub version: u64,
    pub is_running: bool,
    pub phase: SweepPhase,
    /// Active rotation; blacklisted frequencies are excluded.
    pub frequencies: Vec<Frequency>,
    #[serde(default)]
    pub blacklisted: Vec<Frequency>,
    pub current_index: Option<usize>,
    pub current_frequency: Option<Frequency>,
    pub cycle_time_ms: Option<u64>,
    pub switching_time_ms: Option<u64>,
    pub is_cycling: bool,
    pub session_started_at: Option<DateTime<Utc>>,
    /// Latest data as of this version. The snapshot only changes with a
    /// version bump; health diagnostics carry the live figure.
    pub last_data_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
}

impl ServerState {
    pub fn idle(version: u64) -> Self {
        Self {
            version,
            is_running: false,
            phase: SweepPhase::Idle,
            frequencies: Vec::new(),
            blacklisted: Vec::new(),
            current_index: None,
            current_frequency: None,
            cycle_time_ms: None,
            switching_time_ms: None,
            is_cycling: false,
            session_started_at: None,
            last_data_at: None,
            last_transition_at: Utc::now(),
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::idle(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_units_normalise_to_hz() {
        assert_eq!(Frequency::new(433.0, FrequencyUnit::MHz).hz(), 433e6);
        assert_eq!(Frequency::new(2.4, FrequencyUnit::GHz).key(), 2_400_000_000);
        assert_eq!(Frequency::new(500.0, FrequencyUnit::KHz).hz(), 500e3);
        assert_eq!("GHZ".parse::<FrequencyUnit>().unwrap(), FrequencyUnit::GHz);
        assert!("furlongs".parse::<FrequencyUnit>().is_err());
    }

    #[test]
    fn unit_deserialises_case_insensitively() {
        let f: Frequency = serde_json::from_str(r#"{"value": 915, "unit": "mhz"}"#).unwrap();
        assert_eq!(f.unit, FrequencyUnit::MHz);
        let f: Frequency = serde_json::from_str(r#"{"value": 915}"#).unwrap();
        assert_eq!(f.unit, FrequencyUnit::MHz, "unit defaults to MHz");
    }

    #[test]
    fn configuration_derives_switching_time() {
        let limits = SweepLimits::default();
        let cfg = SweepConfiguration::new(
            vec![Frequency::mhz(433.0), Frequency::mhz(915.0)],
            Duration::from_secs(10),
            &limits,
        )
        .unwrap();
        assert_eq!(cfg.switching_time_ms, 2_500);
        assert_eq!(cfg.dwell_time(), Duration::from_millis(7_500));
        assert!(cfg.is_cycling());
    }

    #[test]
    fn configuration_rejects_out_of_range_frequency() {
        let err = SweepConfiguration::new(
            vec![Frequency::mhz(0.5)],
            Duration::from_secs(10),
            &SweepLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { .. }), "got {err}");

        let err = SweepConfiguration::new(
            vec![Frequency::new(6.5, FrequencyUnit::GHz)],
            Duration::from_secs(10),
            &SweepLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { .. }));
    }

    #[test]
    fn configuration_rejects_too_many_frequencies() {
        let freqs = (0..11).map(|i| Frequency::mhz(100.0 + i as f64)).collect();
        let err = SweepConfiguration::new(freqs, Duration::from_secs(10), &SweepLimits::default())
            .unwrap_err();
        assert_eq!(err, ValidationError::TooManyFrequencies { count: 11, max: 10 });
    }

    #[test]
    fn single_frequency_configuration_is_not_cycling() {
        let cfg = SweepConfiguration::single(Frequency::mhz(100.0), &SweepLimits::default()).unwrap();
        assert!(!cfg.is_cycling());
        assert!(cfg.cycle_time_ms > cfg.switching_time_ms);
    }

    #[test]
    fn detection_with_target_computes_offset() {
        let d = Detection::new(433_030_000.0, -55.0, Utc::now()).with_target(433_000_000.0);
        assert!((d.offset_mhz.unwrap() - 0.03).abs() < 1e-9);
        assert_eq!(d.accuracy, Some(OffsetAccuracy::Accurate));
        assert_eq!(d.strength, SignalStrength::Strong);
    }

    #[test]
    fn phase_running_flag() {
        assert!(!SweepPhase::Idle.is_running());
        assert!(SweepPhase::Switching.is_running());
        assert!(!SweepPhase::EmergencyStop.is_running());
    }
}
