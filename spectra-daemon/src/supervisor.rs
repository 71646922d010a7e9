//! Process supervisor: owns at most one capture-utility process.
//!
//! The process runs in its own process group so the utility and anything it
//! forks are signalled together. Stdout is split into lines on a reader task
//! and forwarded to the scheduler tagged with a generation number; events
//! from a process that has since been replaced are ignored by the receiver.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use spectra_core::config::{CaptureSettings, TimingSettings};
use spectra_core::types::{MAX_FREQUENCY_HZ, MIN_FREQUENCY_HZ};
use spectra_core::{Frequency, LineBuffer};

use crate::error::SweepError;

/// Output of the running capture process, tagged with its generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Line { generation: u64, line: String },
    /// Stdout closed: the process exited or closed its output.
    Closed { generation: u64 },
    /// Stderr reported the device as busy.
    DeviceBusy { generation: u64, at: DateTime<Utc> },
}

impl CaptureEvent {
    pub fn generation(&self) -> u64 {
        match self {
            CaptureEvent::Line { generation, .. }
            | CaptureEvent::Closed { generation }
            | CaptureEvent::DeviceBusy { generation, .. } => *generation,
        }
    }
}

/// Raised by stop requests so in-flight waits end early. A plain stop
/// cancels cooldown and startup waits; an emergency stop also cuts short
/// the SIGTERM grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminalIntent {
    #[default]
    None,
    Stop,
    Emergency,
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Force-killed after the grace period.
    Killed,
    /// Force-killed early because an emergency stop was raised.
    Aborted,
}

struct Running {
    generation: u64,
    pid: u32,
    child: Child,
    target: Frequency,
}

pub struct Supervisor {
    capture: CaptureSettings,
    timing: TimingSettings,
    events: mpsc::Sender<CaptureEvent>,
    current: Option<Running>,
    generation: u64,
    free_at: Option<Instant>,
}

/// Capture arguments for one target:
/// `-f <low>:<high>` in whole MHz, gains, bin width, then extras.
pub fn build_args(target: &Frequency, capture: &CaptureSettings) -> Vec<String> {
    let min_mhz = MIN_FREQUENCY_HZ / 1e6;
    let max_mhz = MAX_FREQUENCY_HZ / 1e6;
    let center = target.mhz_value();
    let low = (center - capture.span_mhz).floor().clamp(min_mhz, max_mhz - 1.0);
    let high = (center + capture.span_mhz).ceil().clamp(low + 1.0, max_mhz);

    let mut args = vec![
        "-f".to_string(),
        format!("{}:{}", low as u64, high as u64),
        "-g".to_string(),
        capture.vga_gain.to_string(),
        "-l".to_string(),
        capture.lna_gain.to_string(),
        "-w".to_string(),
        capture.bin_width_hz.to_string(),
    ];
    args.extend(capture.extra_args.iter().cloned());
    args
}

/// Whether `program` resolves to an existing file, directly or via `PATH`.
pub fn program_on_path(program: &str) -> bool {
    if program.contains('/') {
        return Path::new(program).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

impl Supervisor {
    pub fn new(
        capture: CaptureSettings,
        timing: TimingSettings,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Self {
        Self {
            capture,
            timing,
            events,
            current: None,
            generation: 0,
            free_at: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.current.as_ref().map(|r| r.pid)
    }

    pub fn generation(&self) -> Option<u64> {
        self.current.as_ref().map(|r| r.generation)
    }

    pub fn target(&self) -> Option<Frequency> {
        self.current.as_ref().map(|r| r.target)
    }

    pub fn program(&self) -> &str {
        &self.capture.program
    }

    /// Launch the utility for `target`. Orphans are reaped first and the
    /// post-stop cooldown is honoured; any terminal intent cancels the
    /// cooldown wait.
    pub async fn start(
        &mut self,
        target: &Frequency,
        terminal: &watch::Receiver<TerminalIntent>,
    ) -> Result<u64, SweepError> {
        if self.current.is_some() {
            self.stop(terminal).await;
        }
        let reaped = self.reap().await;
        if reaped > 0 {
            tracing::warn!(reaped, "reaped orphaned capture processes before start");
        }
        if let Some(free_at) = self.free_at.take() {
            let mut intent = terminal.clone();
            tokio::select! {
                _ = tokio::time::sleep_until(free_at) => {}
                Ok(_) = intent.wait_for(|i| *i != TerminalIntent::None) => {
                    self.free_at = Some(free_at);
                    return Err(SweepError::Cancelled);
                }
            }
        }

        let args = build_args(target, &self.capture);
        let mut cmd = Command::new(&self.capture.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SweepError::SpawnFailed {
            program: self.capture.program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        self.generation += 1;
        let generation = self.generation;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_stdout(stdout, generation, self.events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_stderr(stderr, generation, self.events.clone()));
        }

        tracing::info!(
            pid,
            generation,
            frequency = %target,
            args = %args.join(" "),
            "capture process started"
        );
        self.current = Some(Running {
            generation,
            pid,
            child,
            target: *target,
        });
        Ok(generation)
    }

    /// SIGTERM the process group, wait up to the grace period, then SIGKILL.
    /// An emergency intent skips the rest of the grace period.
    pub async fn stop(&mut self, terminal: &watch::Receiver<TerminalIntent>) -> StopOutcome {
        let Some(mut running) = self.current.take() else {
            return StopOutcome::NotRunning;
        };
        signal_group(running.pid, Signal::Term);

        let mut intent = terminal.clone();
        let outcome = tokio::select! {
            status = running.child.wait() => {
                tracing::debug!(pid = running.pid, status = ?status.ok(), "capture process exited");
                StopOutcome::Graceful
            }
            _ = tokio::time::sleep(self.timing.stop_grace()) => StopOutcome::Killed,
            Ok(_) = intent.wait_for(|i| *i == TerminalIntent::Emergency) => StopOutcome::Aborted,
        };
        if outcome != StopOutcome::Graceful {
            force_kill(&mut running).await;
            if outcome == StopOutcome::Killed {
                tracing::warn!(
                    pid = running.pid,
                    grace_ms = self.timing.stop_grace_ms,
                    "capture process ignored SIGTERM; killed"
                );
            }
        }
        self.free_at = Some(Instant::now() + self.timing.cooldown());
        outcome
    }

    /// Immediate SIGKILL with no grace period. Returns whether a process was
    /// running.
    pub async fn kill_now(&mut self) -> bool {
        let Some(mut running) = self.current.take() else {
            return false;
        };
        force_kill(&mut running).await;
        self.free_at = Some(Instant::now() + self.timing.cooldown());
        true
    }

    /// Kill stray capture processes not owned by this supervisor. Returns
    /// how many were signalled.
    pub async fn reap(&self) -> usize {
        let own = self.pid();
        let program = self.capture.program.clone();
        let found = match tokio::task::spawn_blocking(move || find_orphans(&program)).await {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(error = %err, "orphan scan task failed");
                return 0;
            }
        };
        let mut reaped = 0;
        for pid in found {
            if Some(pid) == own || pid == std::process::id() {
                continue;
            }
            tracing::warn!(pid, program = %self.capture.program, "killing orphaned capture process");
            signal_group(pid, Signal::Kill);
            reaped += 1;
        }
        reaped
    }

    /// [`program_on_path`] off the async worker threads.
    pub async fn program_available(&self) -> bool {
        let program = self.capture.program.clone();
        tokio::task::spawn_blocking(move || program_on_path(&program))
            .await
            .unwrap_or(false)
    }
}

async fn force_kill(running: &mut Running) {
    signal_group(running.pid, Signal::Kill);
    let _ = running.child.start_kill();
    if tokio::time::timeout(Duration::from_secs(2), running.child.wait())
        .await
        .is_err()
    {
        tracing::warn!(pid = running.pid, "capture process did not exit after SIGKILL");
    }
}

async fn read_stdout(
    mut stdout: tokio::process::ChildStdout,
    generation: u64,
    events: mpsc::Sender<CaptureEvent>,
) {
    let mut lines = LineBuffer::new();
    let mut chunk = vec![0u8; 8 * 1024];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for line in lines.feed(&chunk[..n]) {
                    if events
                        .send(CaptureEvent::Line { generation, line })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Err(err) => {
                tracing::warn!(generation, error = %err, "capture stdout read failed");
                break;
            }
        }
    }
    if let Some(line) = lines.finish() {
        let _ = events.send(CaptureEvent::Line { generation, line }).await;
    }
    if lines.overflowed() > 0 {
        tracing::warn!(
            generation,
            dropped = lines.overflowed(),
            "dropped oversized partial capture lines"
        );
    }
    let _ = events.send(CaptureEvent::Closed { generation }).await;
}

async fn read_stderr(
    stderr: tokio::process::ChildStderr,
    generation: u64,
    events: mpsc::Sender<CaptureEvent>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::warn!(generation, stderr = %line, "capture utility stderr");
        if line.to_ascii_lowercase().contains("busy") {
            let _ = events
                .send(CaptureEvent::DeviceBusy {
                    generation,
                    at: Utc::now(),
                })
                .await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    if pid == 0 {
        return;
    }
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child leads its own group, so pgid == pid.
    let result = unsafe { libc::killpg(pid as libc::pid_t, sig) };
    if result != 0 {
        // Not a group leader (e.g. a reaped orphan): signal the pid alone.
        let _ = unsafe { libc::kill(pid as libc::pid_t, sig) };
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}

/// Pids whose command line names `program`. A program given as a path
/// must match exactly; a bare name matches any argv[0]/argv[1] basename,
/// which also covers interpreters running a script.
#[cfg(target_os = "linux")]
fn find_orphans(program: &str) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
            let raw = std::fs::read(entry.path().join("cmdline")).ok()?;
            cmdline_matches(&raw, program).then_some(pid)
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn find_orphans(_program: &str) -> Vec<u32> {
    Vec::new()
}

fn cmdline_matches(raw: &[u8], program: &str) -> bool {
    let basename = |s: &str| s.rsplit('/').next().unwrap_or(s).to_string();
    let is_path = program.contains('/');
    let want = basename(program);
    raw.split(|b| *b == 0)
        .take(2)
        .filter_map(|arg| std::str::from_utf8(arg).ok())
        .any(|arg| {
            if is_path {
                arg == program
            } else {
                !arg.is_empty() && basename(arg) == want
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_centre_the_span_on_target() {
        let capture = CaptureSettings::default();
        let args = build_args(&Frequency::mhz(433.92), &capture);
        assert_eq!(
            args,
            vec!["-f", "423:444", "-g", "20", "-l", "32", "-w", "20000"]
        );
    }

    #[test]
    fn args_clamp_to_hardware_range() {
        let capture = CaptureSettings::default();
        let low = build_args(&Frequency::mhz(2.0), &capture);
        assert_eq!(low[1], "1:12");
        let high = build_args(&Frequency::mhz(5_999.0), &capture);
        assert_eq!(high[1], "5989:6000");
    }

    #[test]
    fn extra_args_are_appended() {
        let capture = CaptureSettings {
            extra_args: vec!["-1".to_string()],
            ..CaptureSettings::default()
        };
        let args = build_args(&Frequency::mhz(100.0), &capture);
        assert_eq!(args.last().map(String::as_str), Some("-1"));
    }

    #[test]
    fn cmdline_matching() {
        assert!(cmdline_matches(b"hackrf_sweep\0-f\x0090:110\0", "hackrf_sweep"));
        assert!(cmdline_matches(b"/usr/bin/hackrf_sweep\0-f\0", "hackrf_sweep"));
        assert!(cmdline_matches(b"/bin/sh\0/tmp/x/fake\0-f\0", "/tmp/x/fake"));
        assert!(!cmdline_matches(b"/bin/sh\0/tmp/y/fake\0", "/tmp/x/fake"));
        assert!(!cmdline_matches(b"vim\0hackrf_sweep.c\0", "hackrf_sweep"));
    }

    #[test]
    fn missing_program_is_not_on_path() {
        assert!(!program_on_path("definitely-not-a-real-capture-tool"));
        assert!(program_on_path("/bin/sh"));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let (tx, _rx) = mpsc::channel(8);
        let (_intent_tx, intent) = watch::channel(TerminalIntent::None);
        let mut sup = Supervisor::new(
            CaptureSettings {
                program: "/nonexistent/capture-tool".to_string(),
                ..CaptureSettings::default()
            },
            TimingSettings::default(),
            tx,
        );
        let err = sup.start(&Frequency::mhz(100.0), &intent).await.unwrap_err();
        assert!(matches!(err, SweepError::SpawnFailed { .. }));
        assert!(sup.pid().is_none());
    }
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn reap_kills_stray_capture_processes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let program = dir.path().join("stray-capture");
        std::fs::write(&program, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
        let mut stray = std::process::Command::new(&program).spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (tx, _rx) = mpsc::channel(8);
        let sup = Supervisor::new(
            CaptureSettings {
                program: program.display().to_string(),
                ..CaptureSettings::default()
            },
            TimingSettings::default(),
            tx,
        );
        assert!(sup.program_available().await);
        assert_eq!(sup.reap().await, 1);

        let status = stray.wait().unwrap();
        assert!(!status.success());
        assert_eq!(sup.reap().await, 0);
    }
}
