//! Error types for spectra-core.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating `config.yaml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure, annotated with the file involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (write path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the file path.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A field holds a value the daemon cannot run with.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}

/// Rejections produced when an operator request cannot become a
/// [`SweepConfiguration`](crate::types::SweepConfiguration).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("at least one frequency is required")]
    NoFrequencies,

    #[error("{count} frequencies requested; at most {max} are supported")]
    TooManyFrequencies { count: usize, max: usize },

    #[error("frequency {frequency} is outside the supported range 1 MHz - 6 GHz")]
    OutOfRange { frequency: String },

    #[error("frequency value {value} is not a finite number")]
    NotFinite { value: f64 },

    #[error("cycle time {cycle_ms} ms must be between {min_ms} ms and {max_ms} ms")]
    CycleTime { cycle_ms: u64, min_ms: u64, max_ms: u64 },

    #[error("switching time {switching_ms} ms must be positive and shorter than cycle time {cycle_ms} ms")]
    SwitchingTime { switching_ms: u64, cycle_ms: u64 },

    #[error("unknown frequency unit '{0}'; expected Hz, kHz, MHz or GHz")]
    UnknownUnit(String),
}

/// A sweep output line that could not be turned into a detection.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("line has {found} fields; expected at least {expected}")]
    TooFewFields { found: usize, expected: usize },

    #[error("field `{field}` is not a number: '{value}'")]
    BadNumber { field: &'static str, value: String },

    #[error("timestamp '{0}' is not recognised")]
    BadTimestamp(String),

    #[error("line carries no power bins")]
    NoBins,

    #[error("line is not valid UTF-8")]
    NotUtf8,
}

/// Machine-checkable failure category carried by every user-facing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Capture utility never produced output in time.
    Startup,
    /// A single frequency stopped producing data or its process exited.
    FrequencyRuntime,
    /// Too many consecutive or too-frequent failures; session stopped.
    SessionFatal,
    /// Malformed capture output.
    Parse,
    /// Client view disagreed with the server snapshot.
    Divergence,
    /// A slow subscriber was dropped.
    DistributionOverflow,
    InvalidRequest,
    AlreadyRunning,
    NotRunning,
    Unavailable,
    Internal,
}

impl ErrorKind {
    /// One-line recovery hint shown alongside the error.
    pub fn hint(self) -> &'static str {
        match self {
            ErrorKind::Startup => {
                "check the device is connected and not held by another process, then start again"
            }
            ErrorKind::FrequencyRuntime => {
                "the frequency is retried automatically and removed from rotation after repeated failures"
            }
            ErrorKind::SessionFatal => {
                "inspect the error tally, run `spectra sweep cleanup`, then start a new sweep"
            }
            ErrorKind::Parse => "malformed lines are discarded; no action needed unless they persist",
            ErrorKind::Divergence => "the client view was replaced with the server snapshot",
            ErrorKind::DistributionOverflow => "reconnect; a state_sync is sent on subscribe",
            ErrorKind::InvalidRequest => "fix the request parameters and retry",
            ErrorKind::AlreadyRunning => "stop the active sweep before starting another",
            ErrorKind::NotRunning => "no sweep is active",
            ErrorKind::Unavailable => "the operation is not configured on this host",
            ErrorKind::Internal => "retry; if it persists restart the daemon",
        }
    }

    /// Only startup, per-frequency, and session-wide failures end a session.
    pub fn is_session_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::Startup | ErrorKind::FrequencyRuntime | ErrorKind::SessionFatal
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Startup => "startup",
            ErrorKind::FrequencyRuntime => "frequency_runtime",
            ErrorKind::SessionFatal => "session_fatal",
            ErrorKind::Parse => "parse",
            ErrorKind::Divergence => "divergence",
            ErrorKind::DistributionOverflow => "distribution_overflow",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::NotRunning => "not_running",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// How loudly a client should surface an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}
