//! Spectra: RF sweep daemon control CLI.
//!
//! # Usage
//!
//! ```text
//! spectra daemon start|stop
//! spectra sweep start --freq <v>... [--unit mhz] [--cycle-time <secs>]
//! spectra sweep stop | emergency-stop | cleanup | status
//! spectra health [--json]
//! spectra watch [--json]
//! spectra grid snapshot|profile|cell|export|perf
//! spectra device reset
//! spectra config [--json]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    config::ConfigArgs, daemon::DaemonCommand, device::DeviceCommand, grid::GridCommand,
    health::HealthArgs, sweep::SweepCommand, watch::WatchArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "spectra",
    version,
    about = "Drive an RF sweep daemon: frequency cycling, live events, signal grid",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run or stop the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Start, stop and inspect the sweep session.
    Sweep {
        #[command(subcommand)]
        command: SweepCommand,
    },

    /// Show process, device and grid diagnostics.
    Health(HealthArgs),

    /// Stream live events, reconnecting when the daemon goes away.
    Watch(WatchArgs),

    /// Query the aggregated signal grid.
    Grid {
        #[command(subcommand)]
        command: GridCommand,
    },

    /// Operator-only device actions.
    Device {
        #[command(subcommand)]
        command: DeviceCommand,
    },

    /// Print the effective daemon configuration.
    Config(ConfigArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Sweep { command } => commands::sweep::run(command),
        Commands::Health(args) => args.run(),
        Commands::Watch(args) => args.run(),
        Commands::Grid { command } => commands::grid::run(command),
        Commands::Device { command } => commands::device::run(command),
        Commands::Config(args) => args.run(),
    }
}
