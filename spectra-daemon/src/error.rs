use std::path::PathBuf;

use thiserror::Error;

use spectra_core::{ErrorKind, ValidationError};

/// Error surface for the daemon runtime, socket protocol, and client helpers.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] spectra_core::ConfigError),

    #[error("grid error: {0}")]
    Grid(#[from] spectra_grid::GridError),

    #[error("sweep error: {0}")]
    Sweep(#[from] SweepError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },

    /// A request the daemon answered with `ok: false`.
    #[error("{message}")]
    Rejected {
        kind: ErrorKind,
        message: String,
        hint: String,
    },
}

impl DaemonError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaemonError::Sweep(err) => err.kind(),
            DaemonError::Rejected { kind, .. } => *kind,
            DaemonError::Grid(_) => ErrorKind::InvalidRequest,
            DaemonError::Json(_) => ErrorKind::InvalidRequest,
            DaemonError::DaemonNotRunning { .. } => ErrorKind::Unavailable,
            _ => ErrorKind::Internal,
        }
    }

    pub fn hint(&self) -> String {
        match self {
            DaemonError::Rejected { hint, .. } => hint.clone(),
            DaemonError::DaemonNotRunning { .. } => {
                "start it with `spectra daemon start`".to_string()
            }
            other => other.kind().hint().to_string(),
        }
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

/// Failures of sweep control operations.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("a sweep is already running")]
    AlreadyRunning,

    #[error("invalid sweep configuration: {0}")]
    InvalidConfig(#[from] ValidationError),

    #[error("no sweep is running")]
    NotRunning,

    #[error("failed to launch {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{frequency} produced no output within {timeout_ms} ms")]
    StartupTimeout { frequency: String, timeout_ms: u64 },

    #[error("operation cancelled by a stop request")]
    Cancelled,

    #[error("{0}")]
    Unavailable(String),

    #[error("device reset failed: {0}")]
    ResetFailed(String),

    #[error("scheduler is not running")]
    SchedulerGone,
}

impl SweepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SweepError::AlreadyRunning => ErrorKind::AlreadyRunning,
            SweepError::InvalidConfig(_) => ErrorKind::InvalidRequest,
            SweepError::NotRunning => ErrorKind::NotRunning,
            SweepError::SpawnFailed { .. } | SweepError::StartupTimeout { .. } => {
                ErrorKind::Startup
            }
            SweepError::Cancelled => ErrorKind::NotRunning,
            SweepError::Unavailable(_) => ErrorKind::Unavailable,
            SweepError::ResetFailed(_) | SweepError::SchedulerGone => ErrorKind::Internal,
        }
    }
}
