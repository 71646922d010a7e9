//! `spectra config`: effective configuration as the daemon would load it.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use spectra_core::config::{config_path_at, load_at};

use super::{home_dir, print_json};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl ConfigArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let path = config_path_at(&home);
        let config = load_at(&home)
            .with_context(|| format!("failed to load {}", path.display()))?;

        if self.json {
            return print_json(&config);
        }

        let source = if path.exists() {
            path.display().to_string()
        } else {
            format!("{} (missing, using defaults)", path.display())
        };
        println!("{} {}", "config:".bold(), source);
        println!(
            "capture program {} | span ±{} MHz | lna {} vga {}",
            config.capture.program,
            config.capture.span_mhz,
            config.capture.lna_gain,
            config.capture.vga_gain
        );
        println!(
            "cycle time {}-{} ms | up to {} frequencies",
            config.limits.min_cycle_time_ms,
            config.limits.max_cycle_time_ms,
            config.limits.max_frequencies
        );
        println!(
            "blacklist after {} failures | session stop after {} | max {}/min",
            config.failures.per_frequency_threshold,
            config.failures.session_threshold,
            config.failures.max_failures_per_minute
        );
        println!(
            "aggregation profile {} | {} profiles available",
            config.aggregation.active_profile,
            config.aggregation.all_profiles().len()
        );
        Ok(())
    }
}
