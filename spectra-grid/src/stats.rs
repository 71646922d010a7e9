//! Online statistics for grid cells.
//!
//! Mean and variance use Welford's update for single samples and Chan's
//! pairwise combination when two cells are merged during re-gridding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use spectra_core::{Detection, SignalStrength};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CellStats {
    pub count: u64,
    pub avg_power: f64,
    pub min_power: f64,
    pub max_power: f64,
    /// Population variance of power.
    pub variance: f64,
    #[serde(skip)]
    m2: f64,
    /// Mean detected frequency; used to re-key the cell when the grid changes.
    pub avg_frequency_hz: f64,
    /// Active time over observed time, in `[0, 1]`.
    pub occupancy: f64,
    pub active_time_ms: i64,
    pub classifications: BTreeMap<SignalStrength, u64>,
    pub confidence: f64,
}

impl CellStats {
    pub fn push(&mut self, detection: &Detection) {
        let x = detection.power_dbm;
        if self.count == 0 {
            self.min_power = x;
            self.max_power = x;
        } else {
            self.min_power = self.min_power.min(x);
            self.max_power = self.max_power.max(x);
        }
        self.count += 1;
        let n = self.count as f64;

        let delta = x - self.avg_power;
        self.avg_power += delta / n;
        self.m2 += delta * (x - self.avg_power);
        self.variance = self.m2 / n;

        self.avg_frequency_hz += (detection.frequency_hz - self.avg_frequency_hz) / n;
        *self.classifications.entry(detection.strength).or_insert(0) += 1;
    }

    /// Fold `other` into `self` as if every sample had been pushed here.
    pub fn merge(&mut self, other: &CellStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other.clone();
            return;
        }
        let (na, nb) = (self.count as f64, other.count as f64);
        let n = na + nb;
        let delta = other.avg_power - self.avg_power;

        self.avg_power += delta * nb / n;
        self.m2 += other.m2 + delta * delta * na * nb / n;
        self.avg_frequency_hz += (other.avg_frequency_hz - self.avg_frequency_hz) * nb / n;
        self.count += other.count;
        self.variance = self.m2 / n;
        self.min_power = self.min_power.min(other.min_power);
        self.max_power = self.max_power.max(other.max_power);
        self.active_time_ms += other.active_time_ms;
        for (label, tally) in &other.classifications {
            *self.classifications.entry(*label).or_insert(0) += tally;
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }

    /// Recompute occupancy and confidence after the counters moved.
    pub(crate) fn refresh(&mut self, observed_ms: i64) {
        let observed = observed_ms.max(1);
        self.active_time_ms = self.active_time_ms.min(observed);
        self.occupancy = (self.active_time_ms as f64 / observed as f64).clamp(0.0, 1.0);
        self.confidence = confidence(self);
    }
}

/// Blend of sample size, power stability, signal level, and occupancy.
pub fn confidence(stats: &CellStats) -> f64 {
    if stats.count == 0 {
        return 0.0;
    }
    let sample = (stats.count as f64 / 30.0).min(1.0);
    let stability = 1.0 / (1.0 + stats.std_dev() / 6.0);
    let power = ((stats.avg_power + 100.0) / 60.0).clamp(0.0, 1.0);
    let score = 0.4 * sample + 0.25 * stability + 0.15 * power + 0.2 * stats.occupancy;
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn detections(powers: &[f64]) -> Vec<Detection> {
        powers
            .iter()
            .map(|&p| Detection::new(100e6, p, Utc::now()))
            .collect()
    }

    #[test]
    fn welford_matches_two_pass() {
        let samples = [-70.0, -65.0, -80.0, -72.5, -60.0];
        let mut stats = CellStats::default();
        for d in detections(&samples) {
            stats.push(&d);
        }
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / samples.len() as f64;
        assert!((stats.avg_power - mean).abs() < 1e-9);
        assert!((stats.variance - var).abs() < 1e-9);
        assert_eq!(stats.min_power, -80.0);
        assert_eq!(stats.max_power, -60.0);
    }

    #[test]
    fn merge_equals_sequential_push() {
        let (left, right) = ([-70.0, -71.0, -90.0], [-40.0, -55.0]);
        let mut a = CellStats::default();
        let mut b = CellStats::default();
        let mut all = CellStats::default();
        for d in detections(&left) {
            a.push(&d);
            all.push(&d);
        }
        for d in detections(&right) {
            b.push(&d);
            all.push(&d);
        }
        a.merge(&b);
        assert_eq!(a.count, all.count);
        assert!((a.avg_power - all.avg_power).abs() < 1e-9);
        assert!((a.variance - all.variance).abs() < 1e-9);
        assert_eq!(a.classifications, all.classifications);
    }

    #[test]
    fn confidence_grows_with_samples() {
        let mut few = CellStats::default();
        let mut many = CellStats::default();
        for d in detections(&[-60.0; 2]) {
            few.push(&d);
        }
        for d in detections(&[-60.0; 40]) {
            many.push(&d);
        }
        few.refresh(1_000);
        many.refresh(1_000);
        assert!(many.confidence > few.confidence);
        assert!(many.confidence <= 1.0);
    }
}
