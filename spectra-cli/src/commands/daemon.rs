//! `spectra daemon`: foreground runtime and graceful shutdown.

use anyhow::{Context, Result};
use clap::Subcommand;

use spectra_daemon::{request_shutdown, start_blocking, DaemonError};

use super::{home_dir, with_hint};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run daemon in foreground (scheduler + socket server).
    Start,
    /// Request graceful daemon shutdown over the Unix socket.
    Stop,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = home_dir()?;

    match command {
        DaemonCommand::Start => {
            start_blocking(&home).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_shutdown(&home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(with_hint(err)).context("failed to stop daemon"),
        },
    }

    Ok(())
}
