//! Grid keys and cells.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use spectra_core::AggregationProfile;

use crate::error::GridError;
use crate::stats::CellStats;

/// Deepest merge level: a level-`L` cell spans `2^L` base frequency bands.
pub const MAX_LEVEL: u8 = 3;

/// Frequency-band × power-band key. Ordered for deterministic export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    pub level: u8,
    pub freq_index: i64,
    pub power_index: i64,
}

impl CellKey {
    pub fn for_point(
        frequency_hz: f64,
        power_dbm: f64,
        level: u8,
        profile: &AggregationProfile,
    ) -> Self {
        Self {
            level,
            freq_index: (frequency_hz / band_width(profile, level)).floor() as i64,
            power_index: (power_dbm / profile.power_resolution_db).floor() as i64,
        }
    }

    /// Adaptive region this key belongs to (index at [`MAX_LEVEL`]).
    pub fn region(&self) -> i64 {
        self.freq_index >> (MAX_LEVEL - self.level.min(MAX_LEVEL))
    }

    pub fn bounds(&self, profile: &AggregationProfile) -> CellBounds {
        let width = band_width(profile, self.level);
        let height = profile.power_resolution_db;
        CellBounds {
            freq_low_hz: self.freq_index as f64 * width,
            freq_high_hz: (self.freq_index + 1) as f64 * width,
            power_low_db: self.power_index as f64 * height,
            power_high_db: (self.power_index + 1) as f64 * height,
        }
    }
}

/// Width in Hz of a frequency band at `level`.
pub fn band_width(profile: &AggregationProfile, level: u8) -> f64 {
    profile.freq_resolution_hz * f64::from(1u32 << level.min(MAX_LEVEL))
}

/// Region index for a raw frequency.
pub fn region_of(frequency_hz: f64, profile: &AggregationProfile) -> i64 {
    (frequency_hz / band_width(profile, MAX_LEVEL)).floor() as i64
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.level, self.freq_index, self.power_index)
    }
}

impl FromStr for CellKey {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || GridError::BadCellId(s.to_string());
        let mut parts = s.split(':');
        let (Some(level), Some(freq), Some(power), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };
        let level: u8 = level.parse().map_err(|_| bad())?;
        if level > MAX_LEVEL {
            return Err(bad());
        }
        Ok(Self {
            level,
            freq_index: freq.parse().map_err(|_| bad())?,
            power_index: power.parse().map_err(|_| bad())?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellBounds {
    pub freq_low_hz: f64,
    pub freq_high_hz: f64,
    pub power_low_db: f64,
    pub power_high_db: f64,
}

/// One aggregation unit. Copied out of the engine for distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridCell {
    pub id: String,
    pub level: u8,
    #[serde(flatten)]
    pub bounds: CellBounds,
    #[serde(flatten)]
    pub stats: CellStats,
    pub first_seen_ms: i64,
    pub last_updated_ms: i64,
}

impl GridCell {
    pub(crate) fn new(key: CellKey, profile: &AggregationProfile, window_start_ms: i64) -> Self {
        Self {
            id: key.to_string(),
            level: key.level,
            bounds: key.bounds(profile),
            stats: CellStats::default(),
            first_seen_ms: window_start_ms,
            last_updated_ms: window_start_ms,
        }
    }

    /// Re-home this cell under a new key, keeping its statistics.
    pub(crate) fn rekeyed(mut self, key: CellKey, profile: &AggregationProfile) -> Self {
        self.id = key.to_string();
        self.level = key.level;
        self.bounds = key.bounds(profile);
        self
    }

    pub(crate) fn absorb(&mut self, other: &GridCell) {
        self.stats.merge(&other.stats);
        self.first_seen_ms = self.first_seen_ms.min(other.first_seen_ms);
        self.last_updated_ms = self.last_updated_ms.max(other.last_updated_ms);
        let observed = self.last_updated_ms - self.first_seen_ms;
        self.stats.refresh(observed);
    }

    pub fn intersects(&self, viewport: &crate::viewport::Viewport) -> bool {
        let b = &self.bounds;
        b.freq_low_hz < viewport.max_freq_hz
            && b.freq_high_hz > viewport.min_freq_hz
            && b.power_low_db < viewport.max_power_db
            && b.power_high_db > viewport.min_power_db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_id() {
        let key = CellKey {
            level: 2,
            freq_index: 4_330,
            power_index: -15,
        };
        let parsed: CellKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
        assert!("9:1:1".parse::<CellKey>().is_err());
        assert!("1:2".parse::<CellKey>().is_err());
        assert!("1:2:3:4".parse::<CellKey>().is_err());
    }

    #[test]
    fn negative_power_floors_downward() {
        let profile = AggregationProfile::standard();
        let key = CellKey::for_point(433.05e6, -72.0, 0, &profile);
        assert_eq!(key.freq_index, 4_330);
        assert_eq!(key.power_index, -15);
        let b = key.bounds(&profile);
        assert_eq!(b.power_low_db, -75.0);
        assert_eq!(b.power_high_db, -70.0);
    }

    #[test]
    fn region_is_shared_across_levels() {
        let profile = AggregationProfile::standard();
        let base = CellKey::for_point(433.05e6, -72.0, 0, &profile);
        let coarse = CellKey::for_point(433.05e6, -72.0, MAX_LEVEL, &profile);
        assert_eq!(base.region(), coarse.region());
        assert_eq!(base.region(), region_of(433.05e6, &profile));
    }
}
