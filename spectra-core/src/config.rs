//! Daemon configuration file.
//!
//! # Storage layout
//!
//! ```text
//! ~/.spectra/
//!   config.yaml     (optional; every field has a default)
//!   spectra.sock    (daemon socket, created at runtime)
//! ```
//!
//! As with the rest of the crate, every loader has a `_at(home)` form used by
//! tests and a home-derived convenience wrapper.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::profile::AggregationProfile;
use crate::types::SweepLimits;

pub const CONFIG_FILE: &str = "config.yaml";

/// Root of the daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SpectraConfig {
    pub capture: CaptureSettings,
    pub timing: TimingSettings,
    pub limits: SweepLimits,
    pub failures: FailureSettings,
    pub events: EventSettings,
    pub aggregation: AggregationSettings,
}

/// How the capture utility is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub program: String,
    /// Half-width of the swept range around each target, in MHz.
    pub span_mhz: f64,
    pub lna_gain: u32,
    pub vga_gain: u32,
    pub bin_width_hz: u32,
    pub extra_args: Vec<String>,
    /// Operator-only device reset command; never run automatically.
    pub reset_command: Option<Vec<String>>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            program: "hackrf_sweep".to_string(),
            span_mhz: 10.0,
            lna_gain: 32,
            vga_gain: 20,
            bin_width_hz: 20_000,
            extra_args: Vec::new(),
            reset_command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub startup_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub cooldown_ms: u64,
    pub health_interval_ms: u64,
    pub starting_health_interval_ms: u64,
    pub stuck_after_ms: u64,
    pub max_recovery_attempts: u32,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 2_500,
            stop_grace_ms: 1_000,
            cooldown_ms: 500,
            health_interval_ms: 5_000,
            starting_health_interval_ms: 1_000,
            stuck_after_ms: 45_000,
            max_recovery_attempts: 3,
        }
    }
}

impl TimingSettings {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn starting_health_interval(&self) -> Duration {
        Duration::from_millis(self.starting_health_interval_ms)
    }

    pub fn stuck_after(&self) -> Duration {
        Duration::from_millis(self.stuck_after_ms)
    }
}

/// Error isolation thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureSettings {
    /// Consecutive failures before a frequency is blacklisted.
    pub per_frequency_threshold: u32,
    /// Consecutive failures across the session before a graceful stop.
    pub session_threshold: u32,
    /// Failures tolerated inside one rolling minute.
    pub max_failures_per_minute: u32,
}

impl Default for FailureSettings {
    fn default() -> Self {
        Self {
            per_frequency_threshold: 3,
            session_threshold: 8,
            max_failures_per_minute: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    /// Bounded per-subscriber queue length.
    pub subscriber_queue: usize,
    pub heartbeat_interval_ms: u64,
    /// Minimum spacing between corrective state_sync broadcasts.
    pub reconcile_debounce_ms: u64,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            subscriber_queue: 256,
            heartbeat_interval_ms: 10_000,
            reconcile_debounce_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationSettings {
    pub active_profile: String,
    /// Buffered detections that force an early flush.
    pub buffer_cap: usize,
    /// Cells idle for this many profile windows are pruned.
    pub prune_after_windows: u32,
    /// Soft ceiling adaptive re-gridding steers the cell count toward.
    pub max_cells: usize,
    pub adaptive: bool,
    pub auto_adjust: bool,
    /// Extra profiles; names shadow the built-ins.
    pub profiles: Vec<AggregationProfile>,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            active_profile: "standard".to_string(),
            buffer_cap: 5_000,
            prune_after_windows: 60,
            max_cells: 20_000,
            adaptive: true,
            auto_adjust: true,
            profiles: Vec::new(),
        }
    }
}

impl AggregationSettings {
    /// Built-in profiles overlaid with configured ones, finest first.
    pub fn all_profiles(&self) -> Vec<AggregationProfile> {
        let mut profiles = AggregationProfile::builtin();
        for custom in &self.profiles {
            match profiles.iter_mut().find(|p| p.name == custom.name) {
                Some(existing) => *existing = custom.clone(),
                None => profiles.push(custom.clone()),
            }
        }
        profiles.sort_by(|a, b| a.freq_resolution_hz.total_cmp(&b.freq_resolution_hz));
        profiles
    }
}

impl SpectraConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.program.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "capture.program",
                reason: "must name the capture utility".to_string(),
            });
        }
        if !(self.capture.span_mhz > 0.0) {
            return Err(ConfigError::Invalid {
                field: "capture.span_mhz",
                reason: "must be positive".to_string(),
            });
        }
        let fraction = self.limits.switching_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ConfigError::Invalid {
                field: "limits.switching_fraction",
                reason: format!("{fraction} is not inside (0, 1)"),
            });
        }
        if self.limits.min_cycle_time_ms == 0
            || self.limits.min_cycle_time_ms > self.limits.max_cycle_time_ms
        {
            return Err(ConfigError::Invalid {
                field: "limits.min_cycle_time_ms",
                reason: "must be positive and not exceed max_cycle_time_ms".to_string(),
            });
        }
        if self.failures.per_frequency_threshold == 0
            || self.failures.session_threshold == 0
            || self.failures.max_failures_per_minute == 0
        {
            return Err(ConfigError::Invalid {
                field: "failures",
                reason: "thresholds must be at least 1".to_string(),
            });
        }
        if self.timing.startup_timeout_ms == 0 || self.timing.health_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "timing",
                reason: "startup timeout and health interval must be positive".to_string(),
            });
        }
        if self.events.subscriber_queue == 0 {
            return Err(ConfigError::Invalid {
                field: "events.subscriber_queue",
                reason: "must hold at least one event".to_string(),
            });
        }
        let profiles = self.aggregation.all_profiles();
        for profile in &profiles {
            profile.validate()?;
        }
        if !profiles
            .iter()
            .any(|p| p.name == self.aggregation.active_profile)
        {
            return Err(ConfigError::Invalid {
                field: "aggregation.active_profile",
                reason: format!("no profile named '{}'", self.aggregation.active_profile),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// `<home>/.spectra/`
pub fn spectra_root(home: &Path) -> PathBuf {
    home.join(".spectra")
}

/// `<home>/.spectra/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    spectra_root(home).join(CONFIG_FILE)
}

/// Load and validate the config, falling back to defaults when absent.
pub fn load_at(home: &Path) -> Result<SpectraConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(SpectraConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let config: SpectraConfig =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<SpectraConfig, ConfigError> {
    load_at(&home()?)
}

/// Atomically write the config: `.tmp` sibling then rename.
pub fn save_at(home: &Path, config: &SpectraConfig) -> Result<(), ConfigError> {
    let root = spectra_root(home);
    std::fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    let path = config_path_at(home);
    let tmp_path = path.with_file_name(format!("{CONFIG_FILE}.tmp"));
    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
    std::fs::rename(&tmp_path, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}
