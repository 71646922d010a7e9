//! The aggregation engine shared between the capture path and the flush timer.
//!
//! The detection buffer is the only structure written from the capture
//! path; it sits behind its own lock so `add_detection` never waits on a
//! flush. A flush drains the buffer, releases it, then folds under the grid
//! lock. Lock order is always buffer before grid and never both at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use spectra_core::config::AggregationSettings;
use spectra_core::{AggregationProfile, Detection};

use crate::buffer::{Backpressure, DetectionBuffer};
use crate::cell::GridCell;
use crate::error::GridError;
use crate::grid::{FlushReport, Grid, GridSettings, GridTotals};
use crate::tuning::{self, Adjustment, AutoAdjuster, PerformanceSample};
use crate::viewport::{self, Viewport};

/// Cells returned for a viewport query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub profile: String,
    pub viewport: Viewport,
    /// True when `profile` is not the active one and the cells are a
    /// re-gridded projection of the live grid.
    pub projected: bool,
    pub total_cells: usize,
    pub cells: Vec<GridCell>,
}

/// Full aggregated grid. Raw samples are never exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridExport {
    pub profile: AggregationProfile,
    pub generated_at: DateTime<Utc>,
    pub totals: GridTotals,
    pub cells: Vec<GridCell>,
}

impl GridExport {
    pub fn to_json(&self) -> Result<String, GridError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridStatus {
    pub profile: String,
    pub cells: usize,
    pub buffered: usize,
    pub auto_adjust: bool,
    pub totals: GridTotals,
}

pub struct Aggregator {
    buffer: Mutex<DetectionBuffer>,
    grid: Mutex<Grid>,
    profiles: Mutex<Vec<AggregationProfile>>,
    tuner: Mutex<AutoAdjuster>,
    window_ms: AtomicU64,
    auto_adjust: bool,
    cell_budget: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Aggregator {
    pub fn new(settings: &AggregationSettings) -> Result<Self, GridError> {
        let profiles = settings.all_profiles();
        let active = profiles
            .iter()
            .find(|p| p.name == settings.active_profile)
            .cloned()
            .ok_or_else(|| GridError::UnknownProfile(settings.active_profile.clone()))?;
        Ok(Self {
            buffer: Mutex::new(DetectionBuffer::new(settings.buffer_cap)),
            window_ms: AtomicU64::new(active.time_window_ms),
            grid: Mutex::new(Grid::new(active, GridSettings::from(settings))),
            profiles: Mutex::new(profiles),
            tuner: Mutex::new(AutoAdjuster::new()),
            auto_adjust: settings.auto_adjust,
            cell_budget: settings.max_cells.max(1),
        })
    }

    /// Buffer one detection. [`Backpressure::FlushNow`] asks the caller to
    /// flush before the window ends.
    pub fn add_detection(&self, detection: Detection, now_ms: i64) -> Backpressure {
        lock(&self.buffer).push(detection, now_ms)
    }

    pub fn buffered(&self) -> usize {
        lock(&self.buffer).len()
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms.load(Ordering::Relaxed)
    }

    /// Drain the buffer into the grid, then prune. `None` when nothing was
    /// buffered; an empty flush touches no cell.
    pub fn flush(&self, now_ms: i64) -> Option<FlushReport> {
        let batch = lock(&self.buffer).take(now_ms)?;
        let mut grid = lock(&self.grid);
        let mut report = grid.fold(batch);
        report.pruned = grid.prune(now_ms);
        tracing::debug!(
            "flush: {} detections, {} created, {} updated, {} discarded, {} pruned, {} split, {} merged",
            report.detections,
            report.created,
            report.updated,
            report.discarded,
            report.pruned,
            report.split,
            report.merged
        );
        Some(report)
    }

    pub fn flush_if_due(&self, now_ms: i64) -> Option<FlushReport> {
        let due = lock(&self.buffer).is_due(now_ms, self.window_ms());
        if due {
            self.flush(now_ms)
        } else {
            None
        }
    }

    pub fn prune(&self, now_ms: i64) -> usize {
        lock(&self.grid).prune(now_ms)
    }

    /// Cells intersecting `viewport`. A non-active `profile` yields a
    /// projected re-grid; the live grid is not touched.
    pub fn snapshot(
        &self,
        viewport: &Viewport,
        profile: Option<&str>,
    ) -> Result<GridSnapshot, GridError> {
        viewport.validate()?;
        let grid = lock(&self.grid);
        let active = grid.profile().name.clone();
        match profile {
            Some(name) if name != active => {
                let target = self.profile(name)?;
                let mut projected = grid.clone();
                drop(grid);
                projected.regrid(target);
                Ok(GridSnapshot {
                    profile: name.to_string(),
                    viewport: *viewport,
                    projected: true,
                    total_cells: projected.len(),
                    cells: projected.snapshot(viewport),
                })
            }
            _ => Ok(GridSnapshot {
                profile: active,
                viewport: *viewport,
                projected: false,
                total_cells: grid.len(),
                cells: grid.snapshot(viewport),
            }),
        }
    }

    pub fn cell(&self, id: &str) -> Result<GridCell, GridError> {
        lock(&self.grid).cell(id)
    }

    pub fn profiles(&self) -> Vec<AggregationProfile> {
        lock(&self.profiles).clone()
    }

    pub fn active_profile(&self) -> AggregationProfile {
        lock(&self.grid).profile().clone()
    }

    fn profile(&self, name: &str) -> Result<AggregationProfile, GridError> {
        lock(&self.profiles)
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| GridError::UnknownProfile(name.to_string()))
    }

    /// Switch the active profile and re-grid every cell under it.
    pub fn set_profile(&self, name: &str) -> Result<AggregationProfile, GridError> {
        let target = self.profile(name)?;
        let mut grid = lock(&self.grid);
        if grid.profile().name != target.name {
            grid.regrid(target.clone());
            self.window_ms.store(target.time_window_ms, Ordering::Relaxed);
            tracing::info!("aggregation profile set to '{}'", target.name);
        }
        Ok(grid.profile().clone())
    }

    /// Finest profile whose projected cell count for `viewport` fits the
    /// configured cell budget.
    pub fn suggest_profile(&self, viewport: &Viewport) -> Result<AggregationProfile, GridError> {
        viewport.validate()?;
        let profiles = lock(&self.profiles);
        viewport::suggest_profile(viewport, &profiles, self.cell_budget)
            .cloned()
            .ok_or_else(|| GridError::UnknownProfile("<none>".to_string()))
    }

    /// Feed a consumer performance sample to the auto-adjuster. On a
    /// decision the active profile's resolutions are scaled in place and the
    /// grid is re-keyed.
    pub fn report_performance(
        &self,
        sample: PerformanceSample,
        now_ms: i64,
    ) -> Option<Adjustment> {
        if !self.auto_adjust {
            return None;
        }
        let decision = lock(&self.tuner).observe(sample, now_ms)?;
        let mut grid = lock(&self.grid);
        let mut profile = grid.profile().clone();
        if !tuning::apply(&mut profile, decision) {
            return None;
        }
        tracing::info!(
            "auto-adjust {:?}: profile '{}' now {:.0} Hz x {:.2} dB",
            decision,
            profile.name,
            profile.freq_resolution_hz,
            profile.power_resolution_db
        );
        if let Some(stored) = lock(&self.profiles)
            .iter_mut()
            .find(|p| p.name == profile.name)
        {
            *stored = profile.clone();
        }
        grid.regrid(profile);
        Some(decision)
    }

    pub fn export(&self, generated_at: DateTime<Utc>) -> GridExport {
        let grid = lock(&self.grid);
        GridExport {
            profile: grid.profile().clone(),
            generated_at,
            totals: grid.totals().clone(),
            cells: grid.cells().cloned().collect(),
        }
    }

    pub fn status(&self) -> GridStatus {
        let buffered = self.buffered();
        let grid = lock(&self.grid);
        GridStatus {
            profile: grid.profile().name.clone(),
            cells: grid.len(),
            buffered,
            auto_adjust: self.auto_adjust,
            totals: grid.totals().clone(),
        }
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("window_ms", &self.window_ms())
            .field("auto_adjust", &self.auto_adjust)
            .finish_non_exhaustive()
    }
}
