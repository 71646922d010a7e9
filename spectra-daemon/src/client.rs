//! Client-side mirror of the server state.
//!
//! One explicit state machine replaces independent "syncing" / "restoring"
//! flags:
//!
//! ```text
//! Idle ──begin_sync──▶ Syncing ──offer──▶ Idle
//!   ▲                                      ▲
//!   └──────── reset (reconnect) ─▶ Restoring ┘
//! ```
//!
//! A non-idle phase older than the sync timeout is forced back to `Idle` by
//! [`ClientMirror::tick`]. Snapshots apply only when newer than the last one
//! applied. While a user action is in flight, snapshots are parked, except
//! during an active multi-frequency cycle where the scheduler's state always
//! wins.

use std::time::{Duration, Instant};

use spectra_core::{Frequency, ServerState, SweepPhase};

use crate::reconcile::ClientView;

pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorPhase {
    Idle,
    Syncing { since: Instant },
    Restoring { since: Instant },
}

/// An operator action awaiting its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Applied,
    /// Not newer than the last applied snapshot; ignored.
    Stale,
    /// Parked until the in-flight user action finishes.
    Deferred,
}

#[derive(Debug, Clone)]
pub struct ClientMirror {
    state: Option<ServerState>,
    phase: MirrorPhase,
    in_flight: Option<UserAction>,
    pending: Option<ServerState>,
    sync_timeout: Duration,
}

impl Default for ClientMirror {
    fn default() -> Self {
        Self::new(DEFAULT_SYNC_TIMEOUT)
    }
}

impl ClientMirror {
    pub fn new(sync_timeout: Duration) -> Self {
        Self {
            state: None,
            phase: MirrorPhase::Idle,
            in_flight: None,
            pending: None,
            sync_timeout,
        }
    }

    pub fn phase(&self) -> MirrorPhase {
        self.phase
    }

    pub fn state(&self) -> Option<&ServerState> {
        self.state.as_ref()
    }

    pub fn is_scanning(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.is_running)
    }

    pub fn current_frequency(&self) -> Option<Frequency> {
        self.state.as_ref().and_then(|s| s.current_frequency)
    }

    pub fn current_phase(&self) -> SweepPhase {
        self.state.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// What to send to the server's reconcile endpoint.
    pub fn view(&self) -> ClientView {
        ClientView {
            is_scanning: self.is_scanning(),
            current_frequency: self.current_frequency(),
            version: self.state.as_ref().map(|s| s.version),
        }
    }

    /// Enter `Syncing`. Refused unless idle, so two sync passes never
    /// overlap.
    pub fn begin_sync(&mut self, now: Instant) -> bool {
        if self.phase != MirrorPhase::Idle {
            return false;
        }
        self.phase = MirrorPhase::Syncing { since: now };
        true
    }

    /// Leave `Syncing` without a snapshot (e.g. the request failed).
    pub fn end_sync(&mut self) {
        if matches!(self.phase, MirrorPhase::Syncing { .. }) {
            self.phase = MirrorPhase::Idle;
        }
    }

    /// The connection was re-established. Version tracking restarts because
    /// the server may have been restarted with a fresh counter.
    pub fn reset(&mut self, now: Instant) {
        self.phase = MirrorPhase::Restoring { since: now };
        self.in_flight = None;
        self.pending = None;
        if let Some(state) = self.state.as_mut() {
            state.version = 0;
        }
    }

    /// Record a user action. A second action while one is in flight is
    /// rejected.
    pub fn begin_action(&mut self, action: UserAction) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        self.in_flight = Some(action);
        true
    }

    /// The in-flight action completed; any parked snapshot is applied.
    pub fn finish_action(&mut self) -> Applied {
        self.in_flight = None;
        match self.pending.take() {
            Some(state) => self.apply(state),
            None => Applied::Stale,
        }
    }

    /// Arbitration point for every incoming snapshot.
    pub fn offer(&mut self, state: ServerState) -> Applied {
        if !self.is_newer(&state) {
            return Applied::Stale;
        }
        if self.in_flight.is_some() && !state.is_cycling {
            let newer_than_pending = self
                .pending
                .as_ref()
                .map_or(true, |p| state.version > p.version);
            if newer_than_pending {
                self.pending = Some(state);
            }
            return Applied::Deferred;
        }
        self.apply(state)
    }

    /// Force a stuck non-idle phase back to `Idle`. Returns true when it
    /// fired.
    pub fn tick(&mut self, now: Instant) -> bool {
        let since = match self.phase {
            MirrorPhase::Idle => return false,
            MirrorPhase::Syncing { since } | MirrorPhase::Restoring { since } => since,
        };
        if now.saturating_duration_since(since) < self.sync_timeout {
            return false;
        }
        tracing::warn!(
            phase = ?self.phase,
            timeout_ms = self.sync_timeout.as_millis() as u64,
            "client sync phase timed out; forcing idle"
        );
        self.phase = MirrorPhase::Idle;
        true
    }

    fn is_newer(&self, state: &ServerState) -> bool {
        match (&self.state, self.phase) {
            (None, _) => true,
            // After a reconnect any snapshot is authoritative.
            (Some(current), MirrorPhase::Restoring { .. }) => {
                current.version == 0 || state.version > current.version
            }
            (Some(current), _) => state.version > current.version,
        }
    }

    fn apply(&mut self, state: ServerState) -> Applied {
        if self
            .pending
            .as_ref()
            .is_some_and(|p| p.version <= state.version)
        {
            self.pending = None;
        }
        self.state = Some(state);
        self.phase = MirrorPhase::Idle;
        Applied::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(version: u64, cycling: bool) -> ServerState {
        let mut state = ServerState::idle(version);
        state.is_running = true;
        state.phase = SweepPhase::Active;
        state.is_cycling = cycling;
        state.current_frequency = Some(Frequency::mhz(100.0));
        state
    }

    #[test]
    fn running_snapshot_applies_once_and_never_oscillates() {
        let mut mirror = ClientMirror::default();
        assert!(!mirror.is_scanning());

        assert_eq!(mirror.offer(running(5, false)), Applied::Applied);
        assert!(mirror.is_scanning());

        for _ in 0..3 {
            assert_eq!(mirror.offer(running(5, false)), Applied::Stale);
            assert!(mirror.is_scanning());
        }
    }

    #[test]
    fn older_snapshot_is_ignored() {
        let mut mirror = ClientMirror::default();
        mirror.offer(running(9, false));
        assert_eq!(mirror.offer(ServerState::idle(4)), Applied::Stale);
        assert!(mirror.is_scanning());
    }

    #[test]
    fn user_action_parks_snapshot_until_finished() {
        let mut mirror = ClientMirror::default();
        assert!(mirror.begin_action(UserAction::Start));
        assert!(!mirror.begin_action(UserAction::Stop));

        assert_eq!(mirror.offer(running(2, false)), Applied::Deferred);
        assert!(!mirror.is_scanning());

        assert_eq!(mirror.finish_action(), Applied::Applied);
        assert!(mirror.is_scanning());
    }

    #[test]
    fn scheduler_wins_during_active_cycle() {
        let mut mirror = ClientMirror::default();
        mirror.begin_action(UserAction::Stop);
        assert_eq!(mirror.offer(running(3, true)), Applied::Applied);
        assert!(mirror.is_scanning());
    }

    #[test]
    fn stuck_sync_phase_is_forced_idle() {
        let mut mirror = ClientMirror::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(mirror.begin_sync(t0));
        assert!(!mirror.begin_sync(t0), "overlapping sync refused");

        assert!(!mirror.tick(t0 + Duration::from_secs(1)));
        assert!(mirror.tick(t0 + Duration::from_secs(3)));
        assert_eq!(mirror.phase(), MirrorPhase::Idle);
        assert!(mirror.begin_sync(t0 + Duration::from_secs(3)));
    }

    #[test]
    fn reconnect_accepts_a_restarted_server_snapshot() {
        let mut mirror = ClientMirror::default();
        mirror.offer(running(40, false));

        mirror.reset(Instant::now());
        assert!(matches!(mirror.phase(), MirrorPhase::Restoring { .. }));
        assert_eq!(mirror.offer(running(1, false)), Applied::Applied);
        assert_eq!(mirror.phase(), MirrorPhase::Idle);
        assert_eq!(mirror.view().version, Some(1));
    }
}
