//! `spectra grid`: aggregated signal grid queries.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use spectra_core::AggregationProfile;
use spectra_daemon::DaemonRequest;
use spectra_grid::{GridCell, GridExport, GridSnapshot, PerformanceSample, Viewport};

use super::{call, decode, print_json};

#[derive(Subcommand, Debug)]
pub enum GridCommand {
    /// Cells inside a viewport, optionally projected onto another profile.
    Snapshot(SnapshotArgs),
    /// List, select or suggest aggregation profiles.
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    /// Full statistics of one cell.
    Cell(CellArgs),
    /// Write every cell (no raw samples) as one JSON document.
    Export(ExportArgs),
    /// Report rendering performance so the profile can auto-adjust.
    Perf(PerfArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ViewportArgs {
    /// Lower frequency bound in MHz.
    #[arg(long)]
    pub min_freq: Option<f64>,
    /// Upper frequency bound in MHz.
    #[arg(long)]
    pub max_freq: Option<f64>,
    /// Lower power bound in dB.
    #[arg(long)]
    pub min_power: Option<f64>,
    /// Upper power bound in dB.
    #[arg(long)]
    pub max_power: Option<f64>,
}

impl ViewportArgs {
    fn viewport(&self) -> Viewport {
        let full = Viewport::default();
        Viewport {
            min_freq_hz: self.min_freq.map_or(full.min_freq_hz, |mhz| mhz * 1e6),
            max_freq_hz: self.max_freq.map_or(full.max_freq_hz, |mhz| mhz * 1e6),
            min_power_db: self.min_power.unwrap_or(full.min_power_db),
            max_power_db: self.max_power.unwrap_or(full.max_power_db),
        }
    }
}

#[derive(Args, Debug)]
pub struct SnapshotArgs {
    #[command(flatten)]
    pub viewport: ViewportArgs,

    /// Project onto this profile without changing the active grid.
    #[arg(long)]
    pub profile: Option<String>,

    /// Show at most this many cells, strongest first.
    #[arg(long, default_value_t = 25)]
    pub top: usize,

    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum ProfileCommand {
    List {
        #[arg(long)]
        json: bool,
    },
    Set {
        name: String,
    },
    /// Finest profile whose cell count fits the viewport budget.
    Suggest {
        #[command(flatten)]
        viewport: ViewportArgs,
    },
}

#[derive(Args, Debug)]
pub struct CellArgs {
    pub id: String,

    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Destination file; stdout when omitted.
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct PerfArgs {
    /// Frames per second the renderer achieved.
    #[arg(long)]
    pub fps: Option<f64>,

    /// Renderer CPU usage in percent.
    #[arg(long)]
    pub cpu: Option<f64>,
}

#[derive(Tabled)]
struct CellRow {
    #[tabled(rename = "cell")]
    id: String,
    #[tabled(rename = "MHz")]
    band: String,
    #[tabled(rename = "dB")]
    power: String,
    #[tabled(rename = "count")]
    count: u64,
    #[tabled(rename = "avg")]
    avg: String,
    #[tabled(rename = "peak")]
    peak: String,
    #[tabled(rename = "occupancy")]
    occupancy: String,
}

impl From<&GridCell> for CellRow {
    fn from(cell: &GridCell) -> Self {
        Self {
            id: cell.id.clone(),
            band: format!(
                "{:.3}-{:.3}",
                cell.bounds.freq_low_hz / 1e6,
                cell.bounds.freq_high_hz / 1e6
            ),
            power: format!(
                "{:.0}..{:.0}",
                cell.bounds.power_low_db, cell.bounds.power_high_db
            ),
            count: cell.stats.count,
            avg: format!("{:.1}", cell.stats.avg_power),
            peak: format!("{:.1}", cell.stats.max_power),
            occupancy: format!("{:.0}%", cell.stats.occupancy * 100.0),
        }
    }
}

#[derive(Tabled)]
struct ProfileRow {
    #[tabled(rename = "")]
    active: String,
    #[tabled(rename = "profile")]
    name: String,
    #[tabled(rename = "freq res")]
    freq: String,
    #[tabled(rename = "power res")]
    power: String,
    #[tabled(rename = "window")]
    window: String,
    #[tabled(rename = "min det")]
    min_detections: u32,
}

pub fn run(command: GridCommand) -> Result<()> {
    match command {
        GridCommand::Snapshot(args) => snapshot(args),
        GridCommand::Profile { command } => profile(command),
        GridCommand::Cell(args) => {
            let cell: GridCell = decode(
                call(&DaemonRequest::GridCell { id: args.id })?,
                "cell",
            )?;
            if args.json {
                return print_json(&cell);
            }
            let mut table = Table::new([CellRow::from(&cell)]);
            table.with(Style::rounded());
            println!("{table}");
            for (strength, count) in &cell.stats.classifications {
                println!("  {:<10} {count}", strength.label());
            }
            Ok(())
        }
        GridCommand::Export(args) => {
            let export: GridExport = decode(call(&DaemonRequest::GridExport)?, "export")?;
            let text = export.to_json().context("failed to render grid export")?;
            match args.out {
                Some(path) => {
                    fs::write(&path, text)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!(
                        "exported {} cells ({}) to {}",
                        export.cells.len(),
                        export.profile.name,
                        path.display()
                    );
                }
                None => println!("{text}"),
            }
            Ok(())
        }
        GridCommand::Perf(args) => {
            if args.fps.is_none() && args.cpu.is_none() {
                bail!("pass --fps and/or --cpu");
            }
            let result = call(&DaemonRequest::ReportPerformance(PerformanceSample {
                fps: args.fps,
                cpu_percent: args.cpu,
            }))?;
            let profile: AggregationProfile =
                decode(result.get("profile").cloned().unwrap_or(Value::Null), "profile")?;
            match result.get("adjustment").and_then(Value::as_str) {
                Some(adjustment) => println!(
                    "profile adjusted ({adjustment}): {} at {:.0} Hz x {:.1} dB",
                    profile.name, profile.freq_resolution_hz, profile.power_resolution_db
                ),
                None => println!("no adjustment; profile {} unchanged", profile.name),
            }
            Ok(())
        }
    }
}

fn snapshot(args: SnapshotArgs) -> Result<()> {
    let snapshot: GridSnapshot = decode(
        call(&DaemonRequest::GridSnapshot {
            viewport: Some(args.viewport.viewport()),
            profile: args.profile,
        })?,
        "snapshot",
    )?;
    if args.json {
        return print_json(&snapshot);
    }

    println!(
        "profile {}{} | {} of {} cells in view",
        snapshot.profile.bold(),
        if snapshot.projected { " (projected)" } else { "" },
        snapshot.cells.len().min(args.top),
        snapshot.total_cells
    );
    if snapshot.cells.is_empty() {
        println!("No cells in this viewport.");
        return Ok(());
    }
    let mut cells = snapshot.cells;
    cells.sort_by(|a, b| b.stats.max_power.total_cmp(&a.stats.max_power));
    let rows: Vec<CellRow> = cells.iter().take(args.top).map(CellRow::from).collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn profile(command: ProfileCommand) -> Result<()> {
    match command {
        ProfileCommand::List { json } => {
            let listing = call(&DaemonRequest::ListProfiles)?;
            if json {
                return print_json(&listing);
            }
            let active = listing
                .get("active")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let profiles: Vec<AggregationProfile> = decode(
                listing.get("profiles").cloned().unwrap_or(Value::Null),
                "profiles",
            )?;
            let rows: Vec<ProfileRow> = profiles
                .into_iter()
                .map(|p| ProfileRow {
                    active: if p.name == active {
                        "■".green().bold().to_string()
                    } else {
                        String::new()
                    },
                    freq: format!("{:.0} Hz", p.freq_resolution_hz),
                    power: format!("{:.1} dB", p.power_resolution_db),
                    window: format!("{} ms", p.time_window_ms),
                    min_detections: p.min_detections,
                    name: p.name,
                })
                .collect();
            let mut table = Table::new(rows);
            table.with(Style::rounded());
            println!("{table}");
            Ok(())
        }
        ProfileCommand::Set { name } => {
            let profile: AggregationProfile =
                decode(call(&DaemonRequest::SetProfile { name })?, "profile")?;
            println!("active profile: {}", profile.name.bold());
            Ok(())
        }
        ProfileCommand::Suggest { viewport } => {
            let profile: AggregationProfile = decode(
                call(&DaemonRequest::SuggestProfile {
                    viewport: viewport.viewport(),
                })?,
                "profile",
            )?;
            println!("suggested profile: {}", profile.name.bold());
            Ok(())
        }
    }
}
