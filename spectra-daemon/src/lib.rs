//! Spectra daemon: sweep controller, event distribution, reconciliation,
//! and the unix-socket runtime that exposes them.

pub mod client;
mod error;
pub mod failures;
pub mod hub;
pub mod ops;
pub mod paths;
pub mod protocol;
pub mod reconcile;
mod runtime;
pub mod scheduler;
pub mod supervisor;

pub use client::{Applied, ClientMirror, MirrorPhase, UserAction};
pub use error::{DaemonError, SweepError};
pub use hub::{EventHub, Subscription};
pub use protocol::{
    request, request_health, request_shutdown, response_into_data, send_request, DaemonRequest,
    DaemonResponse, EventStream, FrequencyInput, StartRequest,
};
pub use reconcile::{ClientView, Divergence, ReconcileOutcome, Reconciler};
pub use runtime::{run, start_blocking};
pub use scheduler::{CleanupReport, Diagnostics, EmergencyReport, Scheduler, SchedulerHandle};
