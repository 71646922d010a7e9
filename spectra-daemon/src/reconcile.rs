//! Split-brain detection between a client's view and the authoritative
//! [`ServerState`].
//!
//! The server never negotiates: on divergence a `state_sync` carrying the
//! full snapshot is broadcast and clients overwrite their local view.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use spectra_core::{Frequency, ServerState, SweepEvent};

use crate::hub::EventHub;

/// What a client currently displays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientView {
    pub is_scanning: bool,
    pub current_frequency: Option<Frequency>,
    /// Last snapshot version the client applied.
    pub version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "divergence", rename_all = "snake_case")]
pub enum Divergence {
    Running { client: bool, server: bool },
    Frequency {
        client: Option<Frequency>,
        server: Option<Frequency>,
    },
}

/// Compare a client view with the snapshot. Only a running/idle mismatch,
/// or a different frequency while both agree the sweep runs, counts.
pub fn detect(view: &ClientView, state: &ServerState) -> Option<Divergence> {
    if view.is_scanning != state.is_running {
        return Some(Divergence::Running {
            client: view.is_scanning,
            server: state.is_running,
        });
    }
    if state.is_running {
        let same = match (&view.current_frequency, &state.current_frequency) {
            (Some(a), Some(b)) => a.same_as(b),
            (None, None) => true,
            _ => false,
        };
        if !same {
            return Some(Divergence::Frequency {
                client: view.current_frequency,
                server: state.current_frequency,
            });
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub in_sync: bool,
    pub divergence: Option<Divergence>,
    /// A corrective `state_sync` went out to all subscribers.
    pub broadcast: bool,
    pub state: ServerState,
}

pub struct Reconciler {
    hub: EventHub,
    debounce: Duration,
    last_broadcast: Mutex<Option<(u64, Instant)>>,
}

impl Reconciler {
    pub fn new(hub: EventHub, debounce: Duration) -> Self {
        Self {
            hub,
            debounce,
            last_broadcast: Mutex::new(None),
        }
    }

    /// Check `view` against `state`. A divergent view triggers at most one
    /// broadcast per snapshot version within the debounce window, so a
    /// client repeating the same stale view cannot flood subscribers.
    pub fn reconcile(&self, view: &ClientView, state: ServerState) -> ReconcileOutcome {
        let Some(divergence) = detect(view, &state) else {
            return ReconcileOutcome {
                in_sync: true,
                divergence: None,
                broadcast: false,
                state,
            };
        };

        let now = Instant::now();
        let broadcast = {
            let mut last = self
                .last_broadcast
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let recent = matches!(
                *last,
                Some((version, at)) if version == state.version && now.duration_since(at) < self.debounce
            );
            if !recent {
                *last = Some((state.version, now));
            }
            !recent
        };

        tracing::info!(
            version = state.version,
            divergence = ?divergence,
            broadcast,
            "client view diverged from server state"
        );
        if broadcast {
            self.hub.publish(SweepEvent::StateSync(state.clone()));
        }
        ReconcileOutcome {
            in_sync: false,
            divergence: Some(divergence),
            broadcast,
            state,
        }
    }
}
