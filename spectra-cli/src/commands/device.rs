//! `spectra device`: operator-only hardware actions.

use anyhow::Result;
use clap::Subcommand;

use spectra_daemon::DaemonRequest;

use super::call;

#[derive(Subcommand, Debug)]
pub enum DeviceCommand {
    /// Run the configured device reset command. Refused during a session.
    Reset,
}

pub fn run(command: DeviceCommand) -> Result<()> {
    match command {
        DeviceCommand::Reset => {
            let result = call(&DaemonRequest::DeviceReset)?;
            let output = result
                .get("output")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .trim();
            if output.is_empty() {
                println!("device reset completed");
            } else {
                println!("device reset completed:\n{output}");
            }
            Ok(())
        }
    }
}
