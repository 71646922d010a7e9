//! Spectra grid: the signal aggregation engine.
//!
//! Detections are buffered per time window and folded into frequency-band ×
//! power-band cells with running statistics. The grid re-keys itself when
//! the profile changes, adapts its resolution per region, and can be
//! queried by viewport.
//!
//! - [`engine`]: [`Aggregator`], the thread-safe entry point
//! - [`grid`]: cell map, flush, prune, re-grid
//! - [`adaptive`]: split/merge by region density
//! - [`tuning`]: profile auto-adjustment from performance reports
//! - [`viewport`]: query windows and level-of-detail selection

pub mod adaptive;
pub mod buffer;
pub mod cell;
pub mod engine;
pub mod error;
pub mod grid;
pub mod stats;
pub mod tuning;
pub mod viewport;

pub use buffer::Backpressure;
pub use cell::{CellKey, GridCell};
pub use engine::{Aggregator, GridExport, GridSnapshot, GridStatus};
pub use error::GridError;
pub use grid::{FlushReport, GridTotals};
pub use stats::CellStats;
pub use tuning::{Adjustment, PerformanceSample};
pub use viewport::Viewport;
