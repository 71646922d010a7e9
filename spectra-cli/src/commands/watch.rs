//! `spectra watch`: live event stream with automatic reconnect.
//!
//! The local [`ClientMirror`] is what gets sent back on resubscribe, so the
//! daemon can log any divergence and the first `state_sync` restores us.

use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use spectra_core::{EventEnvelope, SweepEvent};
use spectra_daemon::{Applied, ClientMirror, DaemonError, EventStream};

use super::sweep::phase_indicator;
use super::{home_dir, with_hint};

const POLL: Duration = Duration::from_millis(500);

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Print each event envelope as one JSON line.
    #[arg(long)]
    pub json: bool,

    /// Exit after this many events.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Suppress per-detection lines.
    #[arg(long)]
    pub no_data: bool,

    /// Seconds between reconnect attempts.
    #[arg(long, default_value_t = 1.0)]
    pub retry_secs: f64,

    /// Give up after this many consecutive failed connection attempts.
    #[arg(long)]
    pub max_retries: Option<u32>,
}

impl WatchArgs {
    pub fn run(self) -> Result<()> {
        if !(self.retry_secs.is_finite() && self.retry_secs > 0.0) {
            bail!("--retry-secs must be a positive number of seconds");
        }
        let home = home_dir()?;
        let retry = Duration::from_secs_f64(self.retry_secs);
        let mut mirror = ClientMirror::default();
        let mut seen = 0usize;
        let mut reconnecting = false;
        let mut failed_attempts = 0u32;

        loop {
            let view = reconnecting.then(|| mirror.view());
            let mut stream = match EventStream::connect(&home, view) {
                Ok(stream) => stream,
                Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                    failed_attempts += 1;
                    if self.max_retries.is_some_and(|max| failed_attempts > max) {
                        return Err(with_hint(err));
                    }
                    if failed_attempts == 1 {
                        eprintln!("{} waiting for daemon...", "■".bright_black().bold());
                    }
                    sleep(retry);
                    continue;
                }
                Err(err) => return Err(with_hint(err)),
            };
            failed_attempts = 0;
            if !reconnecting {
                mirror.begin_sync(Instant::now());
            }
            eprintln!(
                "{} subscribed (id {}, version {})",
                "■".green().bold(),
                stream.ack["subscriber"],
                stream.ack["version"]
            );

            loop {
                match stream.next_event(POLL) {
                    Ok(Some(envelope)) => {
                        self.handle(&mut mirror, envelope)?;
                        seen += 1;
                        if self.limit.is_some_and(|limit| seen >= limit) {
                            return Ok(());
                        }
                    }
                    Ok(None) => {
                        if mirror.tick(Instant::now()) {
                            eprintln!("{} no snapshot received; showing last known state", "■".yellow().bold());
                        }
                    }
                    Err(DaemonError::ChannelClosed(_)) | Err(DaemonError::Io { .. }) => break,
                    Err(err) => return Err(with_hint(err)),
                }
            }

            eprintln!("{} connection lost; reconnecting", "■".yellow().bold());
            mirror.reset(Instant::now());
            reconnecting = true;
            sleep(retry);
        }
    }

    fn handle(&self, mirror: &mut ClientMirror, envelope: EventEnvelope) -> Result<()> {
        if let SweepEvent::StateSync(state) = &envelope.event {
            if mirror.offer(state.clone()) == Applied::Stale {
                return Ok(());
            }
        }

        if self.json {
            println!(
                "{}",
                serde_json::to_string(&envelope).context("failed to render event JSON")?
            );
            return Ok(());
        }
        if self.no_data && matches!(envelope.event, SweepEvent::SweepData(_)) {
            return Ok(());
        }
        println!(
            "{} {}",
            envelope.sent_at.format("%H:%M:%S%.3f").to_string().bright_black(),
            describe(&envelope.event)
        );
        Ok(())
    }
}

fn describe(event: &SweepEvent) -> String {
    match event {
        SweepEvent::SweepData(data) => {
            let d = &data.detection;
            format!(
                "{:>12.3} MHz {:>7.1} dBm  {}{}",
                d.frequency_hz / 1e6,
                d.power_dbm,
                data.strength_label,
                d.offset_mhz
                    .map(|o| format!("  offset {o:+.3} MHz"))
                    .unwrap_or_default()
            )
        }
        SweepEvent::StatusChange(change) => {
            let mut line = format!(
                "{} {}",
                phase_indicator(change.phase),
                change.phase.to_string().to_uppercase().bold()
            );
            if let Some(frequency) = change.frequency {
                line.push_str(&format!(" {frequency}"));
            }
            if let Some(next) = change.next_frequency {
                line.push_str(&format!(" -> {next}"));
            }
            line
        }
        SweepEvent::CycleConfig(config) => format!(
            "cycle: {} frequencies, {} ms per slot, {} blacklisted",
            config.frequencies.len(),
            config.cycle_time_ms,
            config.blacklisted.len()
        ),
        SweepEvent::Error(err) | SweepEvent::CyclingError(err) => format!(
            "{} [{}] {} (hint: {})",
            "ERROR".red().bold(),
            err.kind,
            err.message,
            err.hint
        ),
        SweepEvent::FrequencyError(err) => format!(
            "{} {} failed {}/{}{}: {}",
            "FREQUENCY".yellow().bold(),
            err.error
                .frequency
                .map(|f| f.to_string())
                .unwrap_or_default(),
            err.consecutive_errors,
            err.threshold,
            if err.blacklisted { ", blacklisted" } else { "" },
            err.error.message
        ),
        SweepEvent::GracefulStop(stop) => format!(
            "{} {} ({} failures)",
            "STOPPED".red().bold(),
            stop.reason,
            stop.total_failures
        ),
        SweepEvent::EmergencyStop(stop) => format!(
            "{} {} (killed: {})",
            "EMERGENCY STOP".red().bold(),
            stop.reason,
            stop.killed
        ),
        SweepEvent::ServerReset(reset) => {
            format!("server reset: {} ({} reaped)", reset.reason, reset.reaped)
        }
        SweepEvent::StateSync(state) => format!(
            "state v{}: {}{}",
            state.version,
            state.phase,
            state
                .current_frequency
                .map(|f| format!(" on {f}"))
                .unwrap_or_default()
        ),
        SweepEvent::Heartbeat(beat) => format!(
            "heartbeat v{} ({} subscribers)",
            beat.version, beat.subscribers
        )
        .bright_black()
        .to_string(),
    }
}
