//! Aggregation profiles: named grid resolutions with auto-adjust bounds.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A named grid configuration. Exactly one is active in the aggregation
/// engine at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationProfile {
    pub name: String,
    /// Width of one frequency band in Hz.
    pub freq_resolution_hz: f64,
    /// Height of one power band in dB.
    pub power_resolution_db: f64,
    /// Buffering window before a flush, in milliseconds.
    pub time_window_ms: u64,
    /// Detections a group needs before a new cell is created.
    pub min_detections: u32,
    #[serde(default = "default_true")]
    pub allow_merge: bool,
    #[serde(default = "default_true")]
    pub allow_split: bool,
    #[serde(default)]
    pub bounds: ResolutionBounds,
}

/// Clamp range for auto-adjustment of a profile's resolutions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionBounds {
    pub min_freq_hz: f64,
    pub max_freq_hz: f64,
    pub min_power_db: f64,
    pub max_power_db: f64,
}

impl Default for ResolutionBounds {
    fn default() -> Self {
        Self {
            min_freq_hz: 1_000.0,
            max_freq_hz: 10_000_000.0,
            min_power_db: 0.5,
            max_power_db: 20.0,
        }
    }
}

fn default_true() -> bool {
    true
}

impl AggregationProfile {
    pub fn fine() -> Self {
        Self {
            name: "fine".to_string(),
            freq_resolution_hz: 10_000.0,
            power_resolution_db: 1.0,
            time_window_ms: 500,
            min_detections: 1,
            allow_merge: true,
            allow_split: true,
            bounds: ResolutionBounds {
                min_freq_hz: 1_000.0,
                max_freq_hz: 100_000.0,
                min_power_db: 0.5,
                max_power_db: 4.0,
            },
        }
    }

    pub fn standard() -> Self {
        Self {
            name: "standard".to_string(),
            freq_resolution_hz: 100_000.0,
            power_resolution_db: 5.0,
            time_window_ms: 1_000,
            min_detections: 2,
            allow_merge: true,
            allow_split: true,
            bounds: ResolutionBounds {
                min_freq_hz: 25_000.0,
                max_freq_hz: 1_000_000.0,
                min_power_db: 2.0,
                max_power_db: 10.0,
            },
        }
    }

    pub fn coarse() -> Self {
        Self {
            name: "coarse".to_string(),
            freq_resolution_hz: 1_000_000.0,
            power_resolution_db: 10.0,
            time_window_ms: 2_000,
            min_detections: 3,
            allow_merge: true,
            allow_split: false,
            bounds: ResolutionBounds {
                min_freq_hz: 250_000.0,
                max_freq_hz: 10_000_000.0,
                min_power_db: 5.0,
                max_power_db: 20.0,
            },
        }
    }

    /// Built-in profiles, finest first.
    pub fn builtin() -> Vec<Self> {
        vec![Self::fine(), Self::standard(), Self::coarse()]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            field: "aggregation.profiles",
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("profile name must not be empty".to_string()));
        }
        let finite = |v: f64| v.is_finite() && v > 0.0;
        if !(finite(self.freq_resolution_hz) && finite(self.power_resolution_db)) {
            return Err(invalid(format!(
                "profile '{}' needs positive resolutions",
                self.name
            )));
        }
        if self.time_window_ms == 0 {
            return Err(invalid(format!(
                "profile '{}' needs a non-zero time window",
                self.name
            )));
        }
        let b = &self.bounds;
        if ![b.min_freq_hz, b.max_freq_hz, b.min_power_db, b.max_power_db]
            .into_iter()
            .all(finite)
        {
            return Err(invalid(format!(
                "profile '{}' needs finite positive resolution bounds",
                self.name
            )));
        }
        if b.min_freq_hz > b.max_freq_hz || b.min_power_db > b.max_power_db {
            return Err(invalid(format!(
                "profile '{}' has inverted resolution bounds",
                self.name
            )));
        }
        Ok(())
    }
}
