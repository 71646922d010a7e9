//! Caller-supplied query windows and level-of-detail profile selection.

use serde::{Deserialize, Serialize};

use spectra_core::types::{MAX_FREQUENCY_HZ, MIN_FREQUENCY_HZ};
use spectra_core::AggregationProfile;

use crate::error::GridError;

/// Frequency × power rectangle. Unset edges default to the full range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Viewport {
    pub min_freq_hz: f64,
    pub max_freq_hz: f64,
    pub min_power_db: f64,
    pub max_power_db: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            min_freq_hz: 0.0,
            max_freq_hz: MAX_FREQUENCY_HZ * 2.0,
            min_power_db: -200.0,
            max_power_db: 100.0,
        }
    }
}

impl Viewport {
    pub fn frequency(min_freq_hz: f64, max_freq_hz: f64) -> Self {
        Self {
            min_freq_hz,
            max_freq_hz,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), GridError> {
        let finite = [
            self.min_freq_hz,
            self.max_freq_hz,
            self.min_power_db,
            self.max_power_db,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite || self.min_freq_hz >= self.max_freq_hz || self.min_power_db >= self.max_power_db
        {
            return Err(GridError::InvalidViewport(format!(
                "[{}, {}] Hz x [{}, {}] dB",
                self.min_freq_hz, self.max_freq_hz, self.min_power_db, self.max_power_db
            )));
        }
        Ok(())
    }

    /// Number of cells a profile would need to tile this viewport.
    pub fn projected_cells(&self, profile: &AggregationProfile) -> f64 {
        let min_freq = self.min_freq_hz.max(MIN_FREQUENCY_HZ.min(self.max_freq_hz));
        let freq_span = (self.max_freq_hz.min(MAX_FREQUENCY_HZ) - min_freq).max(0.0);
        let power_span = (self.max_power_db - self.min_power_db).max(0.0);
        let columns = (freq_span / profile.freq_resolution_hz).ceil().max(1.0);
        let rows = (power_span / profile.power_resolution_db).ceil().max(1.0);
        columns * rows
    }
}

/// Finest profile whose projected cell count fits `budget`; the coarsest
/// profile when none fits. `profiles` is expected finest first.
pub fn suggest_profile<'a>(
    viewport: &Viewport,
    profiles: &'a [AggregationProfile],
    budget: usize,
) -> Option<&'a AggregationProfile> {
    profiles
        .iter()
        .find(|p| viewport.projected_cells(p) <= budget as f64)
        .or_else(|| profiles.last())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoomed_in_view_gets_fine_profile() {
        let profiles = AggregationProfile::builtin();
        let narrow = Viewport {
            min_freq_hz: 433.0e6,
            max_freq_hz: 434.0e6,
            min_power_db: -100.0,
            max_power_db: 0.0,
        };
        let pick = suggest_profile(&narrow, &profiles, 20_000).unwrap();
        assert_eq!(pick.name, "fine");
    }

    #[test]
    fn full_band_view_falls_back_to_coarse() {
        let profiles = AggregationProfile::builtin();
        let pick = suggest_profile(&Viewport::default(), &profiles, 20_000).unwrap();
        assert_eq!(pick.name, "coarse");
    }

    #[test]
    fn inverted_viewport_is_rejected() {
        assert!(Viewport::frequency(10.0, 5.0).validate().is_err());
        assert!(Viewport::default().validate().is_ok());
    }
}
