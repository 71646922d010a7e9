//! Spectra core library: sweep domain types, events, configuration, parser.
//!
//! - [`types`]: frequencies, sweep configuration, detections, server state
//! - [`events`]: typed events pushed to subscribers
//! - [`profile`]: aggregation profiles
//! - [`config`]: `~/.spectra/config.yaml`
//! - [`parser`]: capture-utility output to detections
//! - [`error`]: [`ConfigError`], [`ValidationError`], [`ParseError`], [`ErrorKind`]

pub mod config;
pub mod error;
pub mod events;
pub mod parser;
pub mod profile;
pub mod types;

pub use config::SpectraConfig;
pub use error::{ConfigError, ErrorKind, ParseError, Severity, ValidationError};
pub use events::{EventEnvelope, SweepEvent};
pub use parser::{LineBuffer, ParseStats, SweepParser};
pub use profile::{AggregationProfile, ResolutionBounds};
pub use types::{
    Detection, Frequency, FrequencyUnit, OffsetAccuracy, ServerState, SignalStrength,
    SweepConfiguration, SweepLimits, SweepPhase,
};
