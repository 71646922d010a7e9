//! Adaptive re-gridding.
//!
//! The frequency axis is divided into regions of `2^MAX_LEVEL` base bands.
//! Each region carries its own level: level 0 keys cells at the profile's
//! resolution, higher levels double the band width per step. Busy regions
//! split toward level 0, quiet ones merge toward [`MAX_LEVEL`], and when the
//! grid exceeds its cell ceiling the quietest regions are merged first.

use std::collections::HashMap;

use crate::cell::{CellKey, MAX_LEVEL};
use crate::grid::Grid;

/// Detections per region per flush at which a region splits.
pub const SPLIT_DENSITY: usize = 64;
/// Below this many detections per flush a region counts as quiet.
pub const MERGE_DENSITY: usize = 2;
/// Consecutive quiet flushes before a region merges.
pub const QUIET_FLUSHES: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionState {
    pub level: u8,
    pub quiet_flushes: u32,
    pub last_density: usize,
}

/// Apply split/merge decisions after a flush. Returns `(split, merged)`
/// region counts.
pub(crate) fn rebalance(grid: &mut Grid, density: &HashMap<i64, usize>) -> (usize, usize) {
    let allow_split = grid.profile.allow_split;
    let allow_merge = grid.profile.allow_merge;

    let mut to_split = Vec::new();
    let mut to_merge = Vec::new();
    for (region, state) in grid.regions.iter_mut() {
        let seen = density.get(region).copied().unwrap_or(0);
        state.last_density = seen;
        if seen >= SPLIT_DENSITY {
            state.quiet_flushes = 0;
            if allow_split && state.level > 0 {
                to_split.push(*region);
            }
        } else if seen < MERGE_DENSITY {
            state.quiet_flushes += 1;
            if allow_merge && state.level < MAX_LEVEL && state.quiet_flushes >= QUIET_FLUSHES {
                to_merge.push(*region);
            }
        } else {
            state.quiet_flushes = 0;
        }
    }

    for region in &to_split {
        relevel(grid, *region, -1);
    }
    for region in &to_merge {
        relevel(grid, *region, 1);
    }
    let forced = if allow_merge { enforce_ceiling(grid) } else { 0 };

    if !to_split.is_empty() || !to_merge.is_empty() || forced > 0 {
        tracing::debug!(
            "adaptive grid: {} split, {} merged, {} forced merges, {} cells",
            to_split.len(),
            to_merge.len(),
            forced,
            grid.cells.len()
        );
    }
    (to_split.len(), to_merge.len() + forced)
}

/// Merge the quietest mergeable regions until the cell count fits.
fn enforce_ceiling(grid: &mut Grid) -> usize {
    let mut forced = 0;
    while grid.cells.len() > grid.settings.max_cells {
        let candidate = grid
            .regions
            .iter()
            .filter(|(_, state)| state.level < MAX_LEVEL)
            .min_by_key(|(region, state)| (state.last_density, **region))
            .map(|(region, _)| *region);
        let Some(region) = candidate else {
            break;
        };
        relevel(grid, region, 1);
        forced += 1;
    }
    forced
}

/// Move one region a level up (`step = 1`, coarser) or down (`-1`, finer),
/// re-keying its cells by their mean frequency and power.
fn relevel(grid: &mut Grid, region: i64, step: i8) {
    let Some(state) = grid.regions.get_mut(&region) else {
        return;
    };
    let level = (state.level as i8 + step).clamp(0, MAX_LEVEL as i8) as u8;
    if level == state.level {
        return;
    }
    state.level = level;
    state.quiet_flushes = 0;

    let keys: Vec<CellKey> = grid
        .cells
        .keys()
        .filter(|key| key.region() == region)
        .copied()
        .collect();
    for key in keys {
        let Some(cell) = grid.cells.remove(&key) else {
            continue;
        };
        let rekey = CellKey::for_point(
            cell.stats.avg_frequency_hz,
            cell.stats.avg_power,
            level,
            &grid.profile,
        );
        grid.insert_merged(rekey, cell);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Batch;
    use crate::grid::GridSettings;
    use chrono::Utc;
    use spectra_core::{AggregationProfile, Detection};

    fn grid(max_cells: usize) -> Grid {
        Grid::new(
            AggregationProfile::fine(),
            GridSettings {
                prune_after_windows: 100,
                max_cells,
                adaptive: true,
            },
        )
    }

    fn batch(points: Vec<(f64, f64)>, start: i64) -> Batch {
        Batch {
            detections: points
                .into_iter()
                .map(|(f, p)| Detection::new(f, p, Utc::now()))
                .collect(),
            window_start_ms: start,
            window_end_ms: start + 500,
        }
    }

    #[test]
    fn quiet_region_merges_after_consecutive_quiet_flushes() {
        let mut g = grid(1_000);
        // Two cells 10 kHz apart in the same region.
        g.fold(batch(vec![(100.001e6, -60.5)], 0));
        g.fold(batch(vec![(100.011e6, -60.5)], 500));
        assert_eq!(g.len(), 2);
        // Third quiet flush for the region (one detection each time).
        g.fold(batch(vec![(100.001e6, -60.5)], 1_000));
        let state = g.regions.values().next().unwrap();
        assert_eq!(state.level, 1);
        assert_eq!(g.len(), 1);
        assert_eq!(g.cells().next().unwrap().stats.count, 3);
    }

    #[test]
    fn dense_region_splits_back_toward_base_level() {
        let mut g = grid(1_000);
        g.fold(batch(vec![(100.001e6, -60.5)], 0));
        let region = *g.regions.keys().next().unwrap();
        g.regions.get_mut(&region).unwrap().level = 2;
        let burst = (0..SPLIT_DENSITY).map(|_| (100.001e6, -60.5)).collect();
        let report = g.fold(batch(burst, 500));
        assert_eq!(report.split, 1);
        assert_eq!(g.regions[&region].level, 1);
    }

    #[test]
    fn ceiling_forces_merges() {
        let mut g = grid(2);
        // Four cells in one region at base level.
        let points = (0..4).map(|i| (100.001e6 + i as f64 * 10_000.0, -60.5)).collect();
        let report = g.fold(batch(points, 0));
        assert!(report.merged > 0);
        assert!(g.len() <= 2);
        let total: u64 = g.cells().map(|c| c.stats.count).sum();
        assert_eq!(total, 4);
    }
}
