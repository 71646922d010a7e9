//! Error types for spectra-grid.

use thiserror::Error;

/// All errors that can arise from aggregation queries and profile changes.
#[derive(Debug, Error)]
pub enum GridError {
    #[error("unknown aggregation profile '{0}'")]
    UnknownProfile(String),

    #[error("malformed cell id '{0}'; expected <level>:<freq_index>:<power_index>")]
    BadCellId(String),

    #[error("no cell with id '{0}'")]
    UnknownCell(String),

    #[error("invalid viewport {0}")]
    InvalidViewport(String),

    #[error("grid export JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
