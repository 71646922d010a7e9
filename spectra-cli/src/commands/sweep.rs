//! `spectra sweep`: session control.

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use spectra_core::{Frequency, FrequencyUnit, ServerState, SweepPhase};
use spectra_daemon::{CleanupReport, DaemonRequest, EmergencyReport, FrequencyInput, StartRequest};

use super::{call, decode, print_json};

#[derive(Subcommand, Debug)]
pub enum SweepCommand {
    /// Start sweeping one frequency, or cycle through several.
    Start(StartArgs),
    /// Stop the session after the capture process exits.
    Stop(OutputArgs),
    /// Kill the capture process immediately. Always accepted.
    EmergencyStop(EmergencyArgs),
    /// Kill every capture process and reset to idle.
    Cleanup(OutputArgs),
    /// Show the current session snapshot.
    Status(OutputArgs),
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Target frequency; repeat for a cycling sweep.
    #[arg(long = "freq", required = true, num_args = 1..)]
    pub freq: Vec<f64>,

    /// Unit for every --freq value (hz, khz, mhz, ghz).
    #[arg(long, default_value = "mhz")]
    pub unit: FrequencyUnit,

    /// Seconds spent per frequency, including the switching window.
    #[arg(long)]
    pub cycle_time: Option<f64>,

    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct OutputArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct EmergencyArgs {
    #[arg(long)]
    pub reason: Option<String>,

    #[arg(long)]
    pub json: bool,
}

pub fn run(command: SweepCommand) -> Result<()> {
    match command {
        SweepCommand::Start(args) => args.run(),
        SweepCommand::Stop(out) => {
            let state: ServerState = decode(call(&DaemonRequest::Stop)?, "state")?;
            render_state(&state, out.json)
        }
        SweepCommand::EmergencyStop(args) => {
            let report: EmergencyReport = decode(
                call(&DaemonRequest::EmergencyStop {
                    reason: args.reason,
                })?,
                "emergency stop",
            )?;
            if args.json {
                return print_json(&report);
            }
            println!(
                "{} capture process {}, {} orphan(s) reaped",
                "EMERGENCY STOP".red().bold(),
                if report.killed { "killed" } else { "was not running" },
                report.reaped
            );
            Ok(())
        }
        SweepCommand::Cleanup(out) => {
            let report: CleanupReport = decode(call(&DaemonRequest::ForceCleanup)?, "cleanup")?;
            if out.json {
                return print_json(&report);
            }
            println!(
                "cleanup done: killed={} reaped={} phase={}",
                report.killed, report.reaped, report.state.phase
            );
            Ok(())
        }
        SweepCommand::Status(out) => {
            let state: ServerState = decode(call(&DaemonRequest::CycleStatus)?, "state")?;
            render_state(&state, out.json)
        }
    }
}

impl StartArgs {
    pub fn run(self) -> Result<()> {
        let cycle_time_ms = match self.cycle_time {
            Some(secs) if !(secs.is_finite() && secs > 0.0) => {
                bail!("--cycle-time must be a positive number of seconds")
            }
            Some(secs) => Some((secs * 1000.0).round() as u64),
            None => None,
        };
        let request = StartRequest {
            frequencies: self.freq.into_iter().map(FrequencyInput::Value).collect(),
            frequency: None,
            unit: self.unit,
            cycle_time_ms,
        };
        let state: ServerState = decode(call(&DaemonRequest::Start(request))?, "state")?;
        render_state(&state, self.json)
    }
}

#[derive(Tabled)]
struct FieldRow {
    #[tabled(rename = "field")]
    field: &'static str,
    #[tabled(rename = "value")]
    value: String,
}

pub(crate) fn render_state(state: &ServerState, json: bool) -> Result<()> {
    if json {
        return print_json(state);
    }

    println!(
        "{} {} | version {}",
        phase_indicator(state.phase),
        state.phase.to_string().to_uppercase().bold(),
        state.version
    );
    let rows = vec![
        FieldRow {
            field: "frequency",
            value: state
                .current_frequency
                .map(|f| f.to_string())
                .unwrap_or_else(|| "-".to_string()),
        },
        FieldRow {
            field: "rotation",
            value: join_frequencies(&state.frequencies),
        },
        FieldRow {
            field: "blacklisted",
            value: join_frequencies(&state.blacklisted),
        },
        FieldRow {
            field: "cycle",
            value: match (state.cycle_time_ms, state.switching_time_ms) {
                (Some(cycle), Some(switching)) if state.is_cycling => {
                    format!("{cycle} ms (switching {switching} ms)")
                }
                _ => "single frequency".to_string(),
            },
        },
        FieldRow {
            field: "last data",
            value: state
                .last_data_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "never".to_string()),
        },
    ];
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn join_frequencies(frequencies: &[Frequency]) -> String {
    if frequencies.is_empty() {
        return "-".to_string();
    }
    frequencies
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn phase_indicator(phase: SweepPhase) -> String {
    match phase {
        SweepPhase::Idle => "■".bright_black().bold().to_string(),
        SweepPhase::Starting | SweepPhase::Switching => "■".yellow().bold().to_string(),
        SweepPhase::Active => "■".green().bold().to_string(),
        SweepPhase::Stopping => "■".blue().bold().to_string(),
        SweepPhase::Error | SweepPhase::EmergencyStop => "■".red().bold().to_string(),
    }
}
