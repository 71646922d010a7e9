//! Profile auto-adjustment from consumer-reported performance.
//!
//! Sustained low frame rate or high CPU coarsens the active profile by
//! [`ADJUST_FACTOR`]; sustained headroom refines it. Resolutions stay inside
//! the profile's bounds and no two adjustments land within [`COOLDOWN_MS`].

use serde::{Deserialize, Serialize};

use spectra_core::AggregationProfile;

pub const LOW_FPS: f64 = 30.0;
pub const HIGH_FPS: f64 = 55.0;
pub const HIGH_CPU: f64 = 80.0;
pub const LOW_CPU: f64 = 40.0;
/// Consecutive samples in one direction before acting.
pub const SUSTAIN: u32 = 3;
pub const COOLDOWN_MS: i64 = 10_000;
pub const ADJUST_FACTOR: f64 = 1.5;

/// One performance report from a consumer. Either signal may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub fps: Option<f64>,
    pub cpu_percent: Option<f64>,
}

impl PerformanceSample {
    fn degraded(&self) -> bool {
        self.fps.is_some_and(|f| f < LOW_FPS) || self.cpu_percent.is_some_and(|c| c > HIGH_CPU)
    }

    fn headroom(&self) -> bool {
        let fps_ok = self.fps.map_or(true, |f| f > HIGH_FPS);
        let cpu_ok = self.cpu_percent.map_or(true, |c| c < LOW_CPU);
        (self.fps.is_some() || self.cpu_percent.is_some()) && fps_ok && cpu_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Adjustment {
    Coarsen,
    Refine,
}

#[derive(Debug, Clone, Default)]
pub struct AutoAdjuster {
    degraded_streak: u32,
    headroom_streak: u32,
    last_adjust_ms: Option<i64>,
}

impl AutoAdjuster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample and decide whether to adjust now.
    pub fn observe(&mut self, sample: PerformanceSample, now_ms: i64) -> Option<Adjustment> {
        if sample.degraded() {
            self.degraded_streak += 1;
            self.headroom_streak = 0;
        } else if sample.headroom() {
            self.headroom_streak += 1;
            self.degraded_streak = 0;
        } else {
            self.degraded_streak = 0;
            self.headroom_streak = 0;
        }

        if let Some(last) = self.last_adjust_ms {
            if now_ms - last < COOLDOWN_MS {
                return None;
            }
        }
        let decision = if self.degraded_streak >= SUSTAIN {
            Adjustment::Coarsen
        } else if self.headroom_streak >= SUSTAIN {
            Adjustment::Refine
        } else {
            return None;
        };
        self.degraded_streak = 0;
        self.headroom_streak = 0;
        self.last_adjust_ms = Some(now_ms);
        Some(decision)
    }
}

/// Scale a profile's resolutions in place. Returns `false` when the bounds
/// leave nothing to change.
pub fn apply(profile: &mut AggregationProfile, adjustment: Adjustment) -> bool {
    let factor = match adjustment {
        Adjustment::Coarsen => ADJUST_FACTOR,
        Adjustment::Refine => 1.0 / ADJUST_FACTOR,
    };
    let bounds = &profile.bounds;
    let freq = (profile.freq_resolution_hz * factor).clamp(bounds.min_freq_hz, bounds.max_freq_hz);
    let power =
        (profile.power_resolution_db * factor).clamp(bounds.min_power_db, bounds.max_power_db);
    let changed = freq != profile.freq_resolution_hz || power != profile.power_resolution_db;
    profile.freq_resolution_hz = freq;
    profile.power_resolution_db = power;
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slow() -> PerformanceSample {
        PerformanceSample {
            fps: Some(12.0),
            cpu_percent: None,
        }
    }

    fn fast() -> PerformanceSample {
        PerformanceSample {
            fps: Some(60.0),
            cpu_percent: Some(20.0),
        }
    }

    #[test]
    fn needs_a_sustained_signal() {
        let mut tuner = AutoAdjuster::new();
        assert_eq!(tuner.observe(slow(), 0), None);
        assert_eq!(tuner.observe(slow(), 100), None);
        assert_eq!(tuner.observe(slow(), 200), Some(Adjustment::Coarsen));
    }

    #[test]
    fn cooldown_prevents_oscillation() {
        let mut tuner = AutoAdjuster::new();
        for t in 0..3 {
            tuner.observe(slow(), t);
        }
        for t in 3..6 {
            assert_eq!(tuner.observe(fast(), 1_000 + t), None);
        }
        assert_eq!(tuner.observe(fast(), COOLDOWN_MS + 10), Some(Adjustment::Refine));
    }

    #[test]
    fn mixed_signal_resets_streaks() {
        let mut tuner = AutoAdjuster::new();
        tuner.observe(slow(), 0);
        tuner.observe(slow(), 1);
        tuner.observe(PerformanceSample::default(), 2);
        assert_eq!(tuner.observe(slow(), 3), None);
    }

    #[test]
    fn apply_clamps_to_bounds() {
        let mut profile = AggregationProfile::coarse();
        assert!(apply(&mut profile, Adjustment::Coarsen));
        assert_eq!(profile.freq_resolution_hz, 1_500_000.0);
        for _ in 0..20 {
            apply(&mut profile, Adjustment::Coarsen);
        }
        assert_eq!(profile.freq_resolution_hz, profile.bounds.max_freq_hz);
        assert_eq!(profile.power_resolution_db, profile.bounds.max_power_db);
        assert!(!apply(&mut profile, Adjustment::Coarsen));
    }
}
