//! The cell map and its flush, prune, query, and re-grid operations.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use spectra_core::config::AggregationSettings;
use spectra_core::{AggregationProfile, Detection};

use crate::adaptive::{self, RegionState};
use crate::buffer::Batch;
use crate::cell::{CellKey, GridCell};
use crate::error::GridError;
use crate::viewport::Viewport;

/// Grid knobs that do not belong to a profile.
#[derive(Debug, Clone, PartialEq)]
pub struct GridSettings {
    pub prune_after_windows: u32,
    pub max_cells: usize,
    pub adaptive: bool,
}

impl From<&AggregationSettings> for GridSettings {
    fn from(settings: &AggregationSettings) -> Self {
        Self {
            prune_after_windows: settings.prune_after_windows.max(1),
            max_cells: settings.max_cells.max(1),
            adaptive: settings.adaptive,
        }
    }
}

/// Lifetime counters, included in exports and status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridTotals {
    pub flushes: u64,
    pub detections: u64,
    pub discarded: u64,
    pub cells_created: u64,
    pub cells_pruned: u64,
    pub regrids: u64,
}

/// What one flush did to the grid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub detections: usize,
    pub created: usize,
    pub updated: usize,
    /// Detections in groups below the profile's minimum with no cell to land in.
    pub discarded: usize,
    pub pruned: usize,
    pub split: usize,
    pub merged: usize,
}

#[derive(Debug, Clone)]
pub struct Grid {
    pub(crate) profile: AggregationProfile,
    pub(crate) cells: BTreeMap<CellKey, GridCell>,
    pub(crate) regions: HashMap<i64, RegionState>,
    pub(crate) settings: GridSettings,
    totals: GridTotals,
}

impl Grid {
    pub fn new(profile: AggregationProfile, settings: GridSettings) -> Self {
        Self {
            profile,
            cells: BTreeMap::new(),
            regions: HashMap::new(),
            settings,
            totals: GridTotals::default(),
        }
    }

    pub fn profile(&self) -> &AggregationProfile {
        &self.profile
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn totals(&self) -> &GridTotals {
        &self.totals
    }

    fn level_of(&self, region: i64) -> u8 {
        self.regions.get(&region).map(|r| r.level).unwrap_or(0)
    }

    /// Fold one drained batch into the grid.
    pub fn fold(&mut self, batch: Batch) -> FlushReport {
        let window_ms = batch.window_ms();
        let Batch {
            detections,
            window_start_ms,
            window_end_ms: now,
        } = batch;
        let mut report = FlushReport {
            detections: detections.len(),
            ..FlushReport::default()
        };
        if detections.is_empty() {
            return report;
        }

        let mut groups: BTreeMap<CellKey, Vec<Detection>> = BTreeMap::new();
        let mut density: HashMap<i64, usize> = HashMap::new();
        for detection in detections {
            let region = crate::cell::region_of(detection.frequency_hz, &self.profile);
            let level = self.level_of(region);
            let key = CellKey::for_point(
                detection.frequency_hz,
                detection.power_dbm,
                level,
                &self.profile,
            );
            *density.entry(region).or_insert(0) += 1;
            groups.entry(key).or_default().push(detection);
        }

        for (key, group) in groups {
            if self.cells.contains_key(&key) {
                report.updated += 1;
            } else if group.len() as u64 >= u64::from(self.profile.min_detections) {
                report.created += 1;
                self.totals.cells_created += 1;
                self.regions.entry(key.region()).or_default();
                self.cells
                    .insert(key, GridCell::new(key, &self.profile, window_start_ms));
            } else {
                report.discarded += group.len();
                continue;
            }
            let Some(cell) = self.cells.get_mut(&key) else {
                continue;
            };
            for detection in &group {
                cell.stats.push(detection);
            }
            cell.stats.active_time_ms += window_ms;
            cell.last_updated_ms = now;
            cell.stats.refresh(now - cell.first_seen_ms);
        }

        self.totals.flushes += 1;
        self.totals.detections += report.detections as u64;
        self.totals.discarded += report.discarded as u64;

        if self.settings.adaptive {
            let (split, merged) = adaptive::rebalance(self, &density);
            report.split = split;
            report.merged = merged;
        }
        report
    }

    /// Evict cells idle for longer than the prune horizon.
    pub fn prune(&mut self, now_ms: i64) -> usize {
        let horizon = self.prune_horizon_ms();
        let before = self.cells.len();
        self.cells
            .retain(|_, cell| now_ms - cell.last_updated_ms <= horizon);
        let pruned = before - self.cells.len();
        if pruned > 0 {
            let live: std::collections::HashSet<i64> =
                self.cells.keys().map(CellKey::region).collect();
            self.regions.retain(|region, _| live.contains(region));
            self.totals.cells_pruned += pruned as u64;
        }
        pruned
    }

    pub fn prune_horizon_ms(&self) -> i64 {
        (self.profile.time_window_ms as i64)
            .saturating_mul(i64::from(self.settings.prune_after_windows))
    }

    /// Copies of every cell intersecting `viewport`, in key order.
    pub fn snapshot(&self, viewport: &Viewport) -> Vec<GridCell> {
        self.cells
            .values()
            .filter(|cell| cell.intersects(viewport))
            .cloned()
            .collect()
    }

    pub fn cell(&self, id: &str) -> Result<GridCell, GridError> {
        let key: CellKey = id.parse()?;
        self.cells
            .get(&key)
            .cloned()
            .ok_or_else(|| GridError::UnknownCell(id.to_string()))
    }

    pub fn cells(&self) -> impl Iterator<Item = &GridCell> {
        self.cells.values()
    }

    /// Re-key every cell under `profile` at base level, merging statistics of
    /// cells that land on the same key.
    pub fn regrid(&mut self, profile: AggregationProfile) {
        let old = std::mem::take(&mut self.cells);
        self.profile = profile;
        self.regions.clear();
        for cell in old.into_values() {
            let key = CellKey::for_point(
                cell.stats.avg_frequency_hz,
                cell.stats.avg_power,
                0,
                &self.profile,
            );
            self.insert_merged(key, cell);
        }
        self.totals.regrids += 1;
        tracing::debug!(
            "regridded to profile '{}': {} cells",
            self.profile.name,
            self.cells.len()
        );
    }

    pub(crate) fn insert_merged(&mut self, key: CellKey, cell: GridCell) {
        let cell = cell.rekeyed(key, &self.profile);
        self.regions.entry(key.region()).or_default();
        match self.cells.get_mut(&key) {
            Some(existing) => existing.absorb(&cell),
            None => {
                self.cells.insert(key, cell);
            }
        }
    }
}
