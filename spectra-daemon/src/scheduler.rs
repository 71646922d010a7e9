//! Frequency scheduler: the single task that owns the sweep session.
//!
//! Every transition happens on this task. Commands arrive over an mpsc
//! queue with oneshot responders, capture output arrives from the
//! supervisor's reader tasks, and time-driven transitions come from one
//! deadline slot plus the health tick, all on the tokio clock.
//!
//! ```text
//! Idle ─start─▶ Starting ─data─▶ Active ─cycle─▶ Switching ─settled─▶ Active ...
//!                  │                │                 │
//!                  └──── failure ───┴──── failure ────┴─▶ (retry | blacklist | Error ─▶ Idle)
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::time::Instant;

use spectra_core::config::{CaptureSettings, FailureSettings, TimingSettings};
use spectra_core::events::{
    CycleConfig, EmergencyStop, ErrorEvent, FrequencyError, GracefulStop, ServerReset,
    StatusChange,
};
use spectra_core::{
    Detection, ErrorKind, Frequency, ServerState, Severity, SpectraConfig, SweepConfiguration,
    SweepEvent, SweepParser, SweepPhase,
};
use spectra_grid::{Aggregator, Backpressure};

use crate::error::{DaemonError, SweepError};
use crate::failures::FailureTracker;
use crate::hub::EventHub;
use crate::ops::{OpKind, OpRecord, OpsLog};
use crate::supervisor::{CaptureEvent, StopOutcome, Supervisor, TerminalIntent};

const COMMAND_QUEUE: usize = 32;
const CAPTURE_QUEUE: usize = 1024;
const RESET_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Commands and replies
// ---------------------------------------------------------------------------

enum Command {
    Start {
        config: SweepConfiguration,
        respond_to: oneshot::Sender<Result<ServerState, SweepError>>,
    },
    Stop {
        respond_to: oneshot::Sender<Result<ServerState, SweepError>>,
    },
    EmergencyStop {
        reason: String,
        respond_to: oneshot::Sender<EmergencyReport>,
    },
    ForceCleanup {
        respond_to: oneshot::Sender<CleanupReport>,
    },
    DeviceReset {
        respond_to: oneshot::Sender<Result<String, SweepError>>,
    },
    Diagnostics {
        respond_to: oneshot::Sender<Diagnostics>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyReport {
    pub killed: bool,
    pub reaped: usize,
    pub state: ServerState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub killed: bool,
    pub reaped: usize,
    pub state: ServerState,
}

/// Process and device view used by the `health` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub pid: Option<u32>,
    pub phase: SweepPhase,
    pub seconds_since_data: Option<u64>,
    pub parse_errors: u64,
    pub last_parse_error: Option<String>,
    pub program: String,
    pub program_on_path: bool,
    pub device_busy_at: Option<DateTime<Utc>>,
    pub total_failures: u32,
    pub recent_ops: Vec<OpRecord>,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable front door to the scheduler task.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
    state: watch::Receiver<ServerState>,
    intent: Arc<watch::Sender<TerminalIntent>>,
}

impl SchedulerHandle {
    /// Latest published snapshot.
    pub fn state(&self) -> ServerState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ServerState> {
        self.state.clone()
    }

    pub async fn start(&self, config: SweepConfiguration) -> Result<ServerState, SweepError> {
        self.request(|respond_to| Command::Start { config, respond_to })
            .await?
    }

    /// Raises the stop intent first so a pending startup or cooldown wait
    /// ends without running to its own timeout.
    pub async fn stop(&self) -> Result<ServerState, SweepError> {
        self.raise(TerminalIntent::Stop);
        self.request(|respond_to| Command::Stop { respond_to }).await?
    }

    pub async fn emergency_stop(&self, reason: impl Into<String>) -> Result<EmergencyReport, SweepError> {
        self.intent.send_replace(TerminalIntent::Emergency);
        let reason = reason.into();
        self.request(|respond_to| Command::EmergencyStop { reason, respond_to })
            .await
    }

    pub async fn force_cleanup(&self) -> Result<CleanupReport, SweepError> {
        self.request(|respond_to| Command::ForceCleanup { respond_to })
            .await
    }

    pub async fn device_reset(&self) -> Result<String, SweepError> {
        self.request(|respond_to| Command::DeviceReset { respond_to })
            .await?
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics, SweepError> {
        self.request(|respond_to| Command::Diagnostics { respond_to })
            .await
    }

    /// Never downgrades an emergency to a plain stop.
    fn raise(&self, intent: TerminalIntent) {
        self.intent.send_if_modified(|current| {
            if *current == TerminalIntent::None {
                *current = intent;
                true
            } else {
                false
            }
        });
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SweepError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| SweepError::SchedulerGone)?;
        rx.await.map_err(|_| SweepError::SchedulerGone)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    /// First output expected from a freshly started process.
    Startup,
    /// Switching window: the new frequency settles before becoming active.
    Settle,
    /// Settling ended without output; last chance before a failure.
    Switching,
    /// Dwell on the current frequency is over.
    Cycle,
}

struct Session {
    config: SweepConfiguration,
    active: Vec<Frequency>,
    blacklisted: Vec<Frequency>,
    index: usize,
    phase: SweepPhase,
    failures: FailureTracker,
    generation: Option<u64>,
    parser: SweepParser,
    deadline: Option<(Deadline, Instant)>,
    /// Start of the current rotation slot; cycle timing is measured from it
    /// so startup latency does not accumulate.
    slot_anchor: Option<Instant>,
    spawned_at: Option<Instant>,
    confirmed: bool,
    ever_active: bool,
    recovery_attempts: u32,
    last_recovery: Option<Instant>,
    last_data: Option<Instant>,
    last_data_at: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
}

impl Session {
    fn new(config: SweepConfiguration, failures: FailureSettings) -> Self {
        Self {
            active: config.frequencies.clone(),
            config,
            blacklisted: Vec::new(),
            index: 0,
            phase: SweepPhase::Starting,
            failures: FailureTracker::new(failures),
            generation: None,
            parser: SweepParser::default(),
            deadline: None,
            slot_anchor: None,
            spawned_at: None,
            confirmed: false,
            ever_active: false,
            recovery_attempts: 0,
            last_recovery: None,
            last_data: None,
            last_data_at: None,
            started_at: Utc::now(),
        }
    }

    fn current(&self) -> Option<Frequency> {
        self.active.get(self.index).copied()
    }

    fn next_index(&self) -> usize {
        if self.active.is_empty() {
            0
        } else {
            (self.index + 1) % self.active.len()
        }
    }

    fn is_cycling(&self) -> bool {
        self.active.len() > 1
    }
}

// ---------------------------------------------------------------------------
// Scheduler task
// ---------------------------------------------------------------------------

pub struct Scheduler {
    core: Core,
    commands: mpsc::Receiver<Command>,
    capture: mpsc::Receiver<CaptureEvent>,
}

struct Core {
    timing: TimingSettings,
    failure_settings: FailureSettings,
    capture: CaptureSettings,
    supervisor: Supervisor,
    state_tx: watch::Sender<ServerState>,
    intent_tx: Arc<watch::Sender<TerminalIntent>>,
    intent_rx: watch::Receiver<TerminalIntent>,
    hub: EventHub,
    aggregator: Arc<Aggregator>,
    flush: Arc<Notify>,
    session: Option<Session>,
    ops: OpsLog,
    parse_errors: u64,
    last_parse_error: Option<String>,
    device_busy_at: Option<DateTime<Utc>>,
}

impl Scheduler {
    /// Build the scheduler and its handle. `flush` is notified when the
    /// aggregation buffer asks for an early flush.
    pub fn new(
        config: &SpectraConfig,
        hub: EventHub,
        aggregator: Arc<Aggregator>,
        flush: Arc<Notify>,
    ) -> (Self, SchedulerHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (capture_tx, capture) = mpsc::channel(CAPTURE_QUEUE);
        let (state_tx, state_rx) = watch::channel(ServerState::idle(0));
        let (intent_tx, intent_rx) = watch::channel(TerminalIntent::None);
        let intent_tx = Arc::new(intent_tx);

        let core = Core {
            timing: config.timing.clone(),
            failure_settings: config.failures.clone(),
            capture: config.capture.clone(),
            supervisor: Supervisor::new(config.capture.clone(), config.timing.clone(), capture_tx),
            state_tx,
            intent_tx: intent_tx.clone(),
            intent_rx,
            hub,
            aggregator,
            flush,
            session: None,
            ops: OpsLog::default(),
            parse_errors: 0,
            last_parse_error: None,
            device_busy_at: None,
        };
        let handle = SchedulerHandle {
            tx: command_tx,
            state: state_rx,
            intent: intent_tx,
        };
        (
            Self {
                core,
                commands,
                capture,
            },
            handle,
        )
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), DaemonError> {
        let Scheduler {
            mut core,
            mut commands,
            mut capture,
        } = self;
        let mut next_health = Instant::now() + core.health_period();

        loop {
            let deadline = core.deadline_at();
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    core.handle_command(command).await;
                }
                Some(event) = capture.recv() => core.on_capture(event).await,
                _ = sleep_until(deadline) => core.on_deadline().await,
                _ = tokio::time::sleep_until(next_health) => {
                    core.health_tick().await;
                    next_health = Instant::now() + core.health_period();
                }
            }
        }

        core.shutdown().await;
        Ok(())
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl Core {
    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { config, respond_to } => {
                let result = self.start(config).await;
                let _ = respond_to.send(result);
            }
            Command::Stop { respond_to } => {
                let result = self.stop().await;
                self.clear_intent(TerminalIntent::Stop);
                let _ = respond_to.send(result);
            }
            Command::EmergencyStop { reason, respond_to } => {
                let report = self.emergency_stop(reason).await;
                self.clear_intent(TerminalIntent::Emergency);
                let _ = respond_to.send(report);
            }
            Command::ForceCleanup { respond_to } => {
                let report = self.force_cleanup().await;
                let _ = respond_to.send(report);
            }
            Command::DeviceReset { respond_to } => {
                let result = self.device_reset().await;
                let _ = respond_to.send(result);
            }
            Command::Diagnostics { respond_to } => {
                let _ = respond_to.send(self.diagnostics().await);
            }
        }
    }

    fn clear_intent(&self, handled: TerminalIntent) {
        self.intent_tx.send_if_modified(|current| {
            if *current == handled {
                *current = TerminalIntent::None;
                true
            } else {
                false
            }
        });
    }

    fn intent_raised(&self) -> bool {
        *self.intent_rx.borrow() != TerminalIntent::None
    }

    fn deadline_at(&self) -> Option<Instant> {
        self.session
            .as_ref()
            .and_then(|s| s.deadline)
            .map(|(_, at)| at)
    }

    fn health_period(&self) -> Duration {
        match self.session.as_ref().map(|s| s.phase) {
            Some(SweepPhase::Starting) => self.timing.starting_health_interval(),
            _ => self.timing.health_interval(),
        }
    }

    // -- state publication --------------------------------------------------

    fn snapshot(&self, version: u64) -> ServerState {
        let mut state = ServerState::idle(version);
        if let Some(session) = &self.session {
            state.is_running = session.phase.is_running();
            state.phase = session.phase;
            state.frequencies = session.active.clone();
            state.blacklisted = session.blacklisted.clone();
            state.current_index = Some(session.index);
            state.current_frequency = session.current();
            state.cycle_time_ms = Some(session.config.cycle_time_ms);
            state.switching_time_ms = Some(session.config.switching_time_ms);
            state.is_cycling = session.is_cycling();
            state.session_started_at = Some(session.started_at);
            state.last_data_at = session.last_data_at;
        }
        state
    }

    /// Bump the version and replace the shared snapshot. Called before the
    /// matching events go out so a resubscribing client never sees an event
    /// newer than its `state_sync`.
    fn publish_state(&self) -> ServerState {
        let version = self.state_tx.borrow().version + 1;
        let state = self.snapshot(version);
        self.state_tx.send_replace(state.clone());
        state
    }

    /// Publish the snapshot and a `status_change` for its phase.
    fn announce(&self, next_frequency: Option<Frequency>) -> ServerState {
        let state = self.publish_state();
        self.hub.publish(SweepEvent::StatusChange(StatusChange {
            phase: state.phase,
            version: state.version,
            index: state.current_index,
            frequency: state.current_frequency,
            next_frequency,
        }));
        state
    }

    fn publish_cycle_config(&self) {
        if let Some(session) = &self.session {
            self.hub.publish(SweepEvent::CycleConfig(CycleConfig::new(
                &session.config,
                &session.active,
                &session.blacklisted,
            )));
        }
    }

    // -- process control ------------------------------------------------------

    /// Spawn the capture process for the current frequency and arm `kind`
    /// at `deadline`.
    async fn launch(&mut self, kind: Deadline, deadline: Instant) -> Result<(), SweepError> {
        let Some(target) = self.session.as_ref().and_then(Session::current) else {
            return Err(SweepError::NotRunning);
        };
        let generation = self.supervisor.start(&target, &self.intent_rx).await?;
        if let Some(session) = self.session.as_mut() {
            let retired = std::mem::replace(&mut session.parser, SweepParser::new(Some(target.hz())));
            self.parse_errors += retired.stats().errors;
            session.generation = Some(generation);
            session.spawned_at = Some(Instant::now());
            session.confirmed = false;
            session.deadline = Some((kind, deadline));
        }
        Ok(())
    }

    /// Stop the current process, detaching its output first so its exit is
    /// not mistaken for a failure.
    async fn halt_process(&mut self) -> StopOutcome {
        if let Some(session) = self.session.as_mut() {
            session.generation = None;
            session.deadline = None;
        }
        let outcome = self.supervisor.stop(&self.intent_rx).await;
        if outcome == StopOutcome::Killed {
            tracing::warn!("capture process needed SIGKILL during stop");
        }
        outcome
    }

    // -- commands -------------------------------------------------------------

    async fn start(&mut self, config: SweepConfiguration) -> Result<ServerState, SweepError> {
        if self.session.is_some() {
            return Err(SweepError::AlreadyRunning);
        }
        let frequencies = config
            .frequencies
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(
            frequencies = %frequencies,
            cycle_time_ms = config.cycle_time_ms,
            switching_time_ms = config.switching_time_ms,
            "starting sweep"
        );
        self.ops.record(OpKind::Start, frequencies);
        self.session = Some(Session::new(config, self.failure_settings.clone()));
        self.publish_state();
        self.publish_cycle_config();

        let deadline = Instant::now() + self.timing.startup_timeout();
        if let Err(err) = self.launch(Deadline::Startup, deadline).await {
            tracing::error!(error = %err, "capture process failed to launch");
            let frequency = self.session.as_ref().and_then(Session::current);
            self.session = None;
            self.announce(None);
            let mut event = ErrorEvent::new(ErrorKind::Startup, Severity::Error, err.to_string())
                .retryable(true);
            if let Some(frequency) = frequency {
                event = event.for_frequency(frequency);
            }
            self.hub.publish(SweepEvent::Error(event));
            return Err(err);
        }
        Ok(self.announce(None))
    }

    async fn stop(&mut self) -> Result<ServerState, SweepError> {
        let Some(session) = self.session.as_mut() else {
            return Err(SweepError::NotRunning);
        };
        session.phase = SweepPhase::Stopping;
        self.announce(None);

        let outcome = self.halt_process().await;
        tracing::info!(outcome = ?outcome, "sweep stopped");
        self.ops.record(OpKind::Stop, format!("{outcome:?}"));
        self.session = None;
        Ok(self.announce(None))
    }

    async fn emergency_stop(&mut self, reason: String) -> EmergencyReport {
        tracing::warn!(reason = %reason, "emergency stop");
        if let Some(session) = self.session.as_mut() {
            session.generation = None;
            session.deadline = None;
        }
        let killed = self.supervisor.kill_now().await;
        let reaped = self.supervisor.reap().await;
        self.ops.record(OpKind::EmergencyStop, reason.clone());

        if let Some(session) = self.session.as_mut() {
            session.phase = SweepPhase::EmergencyStop;
            self.announce(None);
        }
        self.hub
            .publish(SweepEvent::EmergencyStop(EmergencyStop { reason, killed }));
        self.session = None;
        let state = self.announce(None);
        EmergencyReport {
            killed,
            reaped,
            state,
        }
    }

    async fn force_cleanup(&mut self) -> CleanupReport {
        if let Some(session) = self.session.as_mut() {
            session.generation = None;
            session.deadline = None;
        }
        let killed = self.supervisor.kill_now().await;
        let reaped = self.supervisor.reap().await;
        tracing::info!(killed, reaped, "force cleanup");
        self.ops
            .record(OpKind::Cleanup, format!("killed={killed} reaped={reaped}"));
        let was_running = self.session.take().is_some();
        let state = if was_running {
            self.announce(None)
        } else {
            self.publish_state()
        };
        self.hub.publish(SweepEvent::ServerReset(ServerReset {
            reason: "force cleanup".to_string(),
            reaped,
        }));
        CleanupReport {
            killed,
            reaped,
            state,
        }
    }

    async fn device_reset(&mut self) -> Result<String, SweepError> {
        if self.session.is_some() {
            return Err(SweepError::AlreadyRunning);
        }
        let Some((program, args)) = self
            .capture
            .reset_command
            .as_ref()
            .and_then(|cmd| cmd.split_first())
        else {
            return Err(SweepError::Unavailable(
                "no capture.reset_command is configured".to_string(),
            ));
        };
        tracing::warn!(program = %program, "running operator device reset");

        let output = tokio::time::timeout(
            RESET_TIMEOUT,
            tokio::process::Command::new(program)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            SweepError::ResetFailed(format!("timed out after {}s", RESET_TIMEOUT.as_secs()))
        })?
        .map_err(|err| SweepError::ResetFailed(format!("{program}: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SweepError::ResetFailed(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        self.ops.record(OpKind::DeviceReset, program.clone());
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn diagnostics(&self) -> Diagnostics {
        let program_on_path = self.supervisor.program_available().await;
        let session = self.session.as_ref();
        let current_errors = session.map_or(0, |s| s.parser.stats().errors);
        let last_parse_error = session
            .and_then(|s| s.parser.stats().last_error.clone())
            .or_else(|| self.last_parse_error.clone());
        Diagnostics {
            pid: self.supervisor.pid(),
            phase: session.map(|s| s.phase).unwrap_or_default(),
            seconds_since_data: session
                .and_then(|s| s.last_data)
                .map(|at| at.elapsed().as_secs()),
            parse_errors: self.parse_errors + current_errors,
            last_parse_error,
            program: self.supervisor.program().to_string(),
            program_on_path,
            device_busy_at: self.device_busy_at,
            total_failures: session.map_or(0, |s| s.failures.total()),
            recent_ops: self.ops.entries(),
        }
    }

    async fn shutdown(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.generation = None;
        }
        if self.supervisor.kill_now().await {
            tracing::info!("killed capture process on shutdown");
        }
        if self.session.take().is_some() {
            self.publish_state();
        }
    }

    // -- capture output -------------------------------------------------------

    async fn on_capture(&mut self, event: CaptureEvent) {
        if let CaptureEvent::DeviceBusy { at, .. } = event {
            self.device_busy_at = Some(at);
            self.ops.record(OpKind::DeviceBusy, at.to_rfc3339());
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.generation != Some(event.generation()) {
            return;
        }
        match event {
            CaptureEvent::Line { line, .. } => self.on_line(&line),
            CaptureEvent::Closed { .. } => self.on_exit().await,
            CaptureEvent::DeviceBusy { .. } => {}
        }
    }

    fn on_line(&mut self, line: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let detection = match session.parser.parse_line(line) {
            Ok(Some(detection)) => detection,
            Ok(None) => return,
            Err(err) => {
                self.last_parse_error = Some(err.to_string());
                return;
            }
        };
        let now = Instant::now();
        session.last_data = Some(now);
        session.last_data_at = Some(detection.timestamp);

        match (session.phase, session.deadline.map(|(kind, _)| kind)) {
            (SweepPhase::Starting, _) | (SweepPhase::Switching, Some(Deadline::Switching)) => {
                self.go_active(now)
            }
            (SweepPhase::Switching, _) => session.confirmed = true,
            _ => {}
        }
        self.deliver(detection);
    }

    fn deliver(&self, detection: Detection) {
        self.hub
            .publish(SweepEvent::SweepData(detection.clone().into()));
        if self.aggregator.add_detection(detection, now_ms()) == Backpressure::FlushNow {
            self.flush.notify_one();
        }
    }

    fn go_active(&mut self, now: Instant) {
        let dwell = {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            session.phase = SweepPhase::Active;
            session.ever_active = true;
            session.confirmed = true;
            if let Some(frequency) = session.current() {
                session.failures.record_success(&frequency);
            }
            session.deadline = None;
            if !session.is_cycling() {
                session.slot_anchor = None;
                None
            } else {
                let dwell = session.config.dwell_time();
                let anchor = match session.slot_anchor {
                    Some(anchor) if anchor + dwell > now => anchor,
                    _ => now,
                };
                session.slot_anchor = Some(anchor);
                session.deadline = Some((Deadline::Cycle, anchor + dwell));
                Some(dwell)
            }
        };
        let next = self
            .session
            .as_ref()
            .filter(|s| s.is_cycling())
            .and_then(|s| s.active.get(s.next_index()).copied());
        let state = self.announce(next);
        tracing::info!(
            index = state.current_index,
            frequency = ?state.current_frequency.map(|f| f.to_string()),
            dwell_ms = dwell.map(|d| d.as_millis() as u64),
            "sweep active"
        );
    }

    async fn on_exit(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        match session.phase {
            SweepPhase::Starting if !session.ever_active => {
                self.startup_failed("capture process exited before producing output".to_string())
                    .await
            }
            SweepPhase::Starting | SweepPhase::Active | SweepPhase::Switching => {
                self.frequency_failed("capture process exited".to_string())
                    .await
            }
            _ => {}
        }
    }

    // -- timers ---------------------------------------------------------------

    async fn on_deadline(&mut self) {
        let Some((kind, _)) = self.session.as_ref().and_then(|s| s.deadline) else {
            return;
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.deadline = None;
        let timeout_ms = self.timing.startup_timeout_ms;
        match kind {
            Deadline::Startup if !session.ever_active => {
                let frequency = session.current().map(|f| f.to_string()).unwrap_or_default();
                let err = SweepError::StartupTimeout {
                    frequency,
                    timeout_ms,
                };
                self.startup_failed(err.to_string()).await;
            }
            Deadline::Startup => {
                self.frequency_failed(format!("no output within {timeout_ms} ms of relaunch"))
                    .await
            }
            Deadline::Settle if session.confirmed => self.go_active(Instant::now()),
            Deadline::Settle => {
                let limit = session
                    .spawned_at
                    .map(|at| at + self.timing.startup_timeout());
                match limit {
                    Some(limit) if limit > Instant::now() => {
                        session.deadline = Some((Deadline::Switching, limit));
                    }
                    _ => {
                        self.frequency_failed("no output after frequency switch".to_string())
                            .await
                    }
                }
            }
            Deadline::Switching => {
                self.frequency_failed("no output after frequency switch".to_string())
                    .await
            }
            Deadline::Cycle => self.advance().await,
        }
    }

    /// Dwell expired: move to the next frequency in the rotation.
    async fn advance(&mut self) {
        let (from, to, next_index, settle_at) = {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            if !session.is_cycling() {
                return;
            }
            let next_index = session.next_index();
            let now = Instant::now();
            let cycle = session.config.cycle_time();
            let anchor = session
                .slot_anchor
                .map(|a| a + cycle)
                .unwrap_or(now + session.config.switching_time());
            session.slot_anchor = Some(anchor);
            session.phase = SweepPhase::Switching;
            (
                session.current(),
                session.active.get(next_index).copied(),
                next_index,
                anchor,
            )
        };
        self.announce(to);
        self.ops.record(
            OpKind::Switch,
            format!(
                "{} -> {}",
                from.map(|f| f.to_string()).unwrap_or_default(),
                to.map(|f| f.to_string()).unwrap_or_default()
            ),
        );
        tracing::info!(from = ?from.map(|f| f.to_string()), to = ?to.map(|f| f.to_string()), "switching frequency");

        self.halt_process().await;
        if self.intent_raised() {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.index = next_index;
        }
        match self.launch(Deadline::Settle, settle_at).await {
            Ok(()) => {}
            Err(SweepError::Cancelled) => {}
            Err(err) => self.frequency_failed(err.to_string()).await,
        }
    }

    async fn health_tick(&mut self) {
        let reaped = self.supervisor.reap().await;
        if reaped > 0 {
            self.ops
                .record(OpKind::Cleanup, format!("reaped {reaped} orphan(s)"));
        }

        let stuck_after = self.timing.stuck_after();
        let max_attempts = self.timing.max_recovery_attempts;
        let now = Instant::now();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.phase != SweepPhase::Active {
            return;
        }
        let silent_for = session
            .last_data
            .map(|at| now.duration_since(at))
            .unwrap_or_default();
        if silent_for < stuck_after {
            if session
                .last_recovery
                .is_some_and(|at| now.duration_since(at) >= stuck_after * 2)
            {
                session.recovery_attempts = 0;
                session.last_recovery = None;
            }
            return;
        }

        if session.recovery_attempts >= max_attempts {
            let reason = format!(
                "no data for {}s after {max_attempts} recovery attempt(s)",
                silent_for.as_secs()
            );
            self.graceful_stop(reason).await;
            return;
        }
        session.recovery_attempts += 1;
        session.last_recovery = Some(now);
        session.last_data = Some(now);
        let attempt = session.recovery_attempts;
        tracing::warn!(
            attempt,
            max_attempts,
            silent_secs = silent_for.as_secs(),
            "sweep stuck; restarting capture process"
        );
        self.ops
            .record(OpKind::Recovery, format!("attempt {attempt}/{max_attempts}"));
        self.restart().await;
    }

    // -- failure handling -------------------------------------------------------

    /// The capture utility never produced output for a fresh session. The
    /// session ends; the operator may retry.
    async fn startup_failed(&mut self, reason: String) {
        tracing::error!(reason = %reason, "sweep startup failed");
        let frequency = self.session.as_ref().and_then(Session::current);
        self.halt_process().await;
        self.ops.record(OpKind::Failure, format!("startup: {reason}"));
        self.session = None;
        self.announce(None);

        let mut event = ErrorEvent::new(ErrorKind::Startup, Severity::Error, reason).retryable(true);
        if let Some(frequency) = frequency {
            event = event.for_frequency(frequency);
        }
        self.hub.publish(SweepEvent::Error(event));
    }

    /// A per-frequency runtime failure: count it, maybe blacklist, then
    /// either carry on with the rotation or stop the session.
    async fn frequency_failed(&mut self, reason: String) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(frequency) = session.current() else {
            return;
        };
        let was_switching = session.phase == SweepPhase::Switching;
        let verdict = session.failures.record_failure(&frequency, Instant::now());
        let threshold = session.failures.threshold();
        session.slot_anchor = None;
        tracing::warn!(
            frequency = %frequency,
            consecutive = verdict.consecutive,
            threshold,
            reason = %reason,
            "frequency failure"
        );
        self.ops
            .record(OpKind::Failure, format!("{frequency}: {reason}"));
        self.halt_process().await;

        let Some(session) = self.session.as_mut() else {
            return;
        };
        if verdict.blacklist {
            session.active.retain(|f| !f.same_as(&frequency));
            session.blacklisted.push(frequency);
            if session.index >= session.active.len() {
                session.index = 0;
            }
        } else if session.is_cycling() {
            session.index = session.next_index();
        }
        if verdict.blacklist {
            tracing::warn!(frequency = %frequency, "frequency blacklisted for this session");
            self.ops.record(OpKind::Blacklist, frequency.to_string());
        }
        self.publish_state();

        let error = ErrorEvent::new(ErrorKind::FrequencyRuntime, Severity::Warning, reason)
            .for_frequency(frequency)
            .retryable(!verdict.blacklist);
        self.hub
            .publish(SweepEvent::FrequencyError(FrequencyError {
                error: error.clone(),
                consecutive_errors: verdict.consecutive,
                threshold,
                blacklisted: verdict.blacklist,
            }));
        if was_switching {
            self.hub.publish(SweepEvent::CyclingError(error));
        }
        if verdict.blacklist {
            self.publish_cycle_config();
        }

        if let Some(reason) = verdict.session_fatal {
            self.graceful_stop(reason).await;
            return;
        }
        if self.session.as_ref().is_some_and(|s| s.active.is_empty()) {
            self.graceful_stop("every frequency was blacklisted".to_string())
                .await;
            return;
        }
        self.restart().await;
    }

    /// Relaunch the current frequency in `Starting` after a failure or a
    /// stuck detection.
    async fn restart(&mut self) {
        self.halt_process().await;
        if self.intent_raised() {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.phase = SweepPhase::Starting;
        session.slot_anchor = None;
        self.announce(None);

        let deadline = Instant::now() + self.timing.startup_timeout();
        match self.launch(Deadline::Startup, deadline).await {
            Ok(()) | Err(SweepError::Cancelled) => {}
            Err(err) => {
                tracing::error!(error = %err, "capture process failed to relaunch");
                // Expire the startup wait now; the failure is counted on the
                // next loop turn like any other silent restart.
                if let Some(session) = self.session.as_mut() {
                    session.deadline = Some((Deadline::Startup, Instant::now()));
                }
            }
        }
    }

    /// Session-wide failure: stop everything, report once, return to idle.
    async fn graceful_stop(&mut self, reason: String) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.phase = SweepPhase::Error;
        self.announce(None);
        self.halt_process().await;

        let Some(session) = self.session.take() else {
            return;
        };
        tracing::error!(
            reason = %reason,
            total_failures = session.failures.total(),
            blacklisted = session.blacklisted.len(),
            "sweep stopped after repeated failures"
        );
        self.ops.record(OpKind::GracefulStop, reason.clone());
        self.announce(None);
        self.hub.publish(SweepEvent::GracefulStop(GracefulStop {
            reason,
            error_tally: session.failures.tally().clone(),
            blacklisted: session.blacklisted.clone(),
            total_failures: session.failures.total(),
        }));
    }
}
