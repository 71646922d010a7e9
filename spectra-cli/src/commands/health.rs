//! `spectra health`: daemon diagnostics.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use serde_json::{json, Value};
use tabled::{settings::Style, Table, Tabled};

use spectra_daemon::ops::OpRecord;
use spectra_daemon::paths::socket_path;
use spectra_daemon::{request_health, DaemonError};

use super::{home_dir, print_json, with_hint};

#[derive(Args, Debug)]
pub struct HealthArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct SectionRow {
    #[tabled(rename = "section")]
    section: String,
    #[tabled(rename = "key")]
    key: String,
    #[tabled(rename = "value")]
    value: String,
}

#[derive(Tabled)]
struct OpRow {
    #[tabled(rename = "at")]
    at: String,
    #[tabled(rename = "op")]
    op: String,
    #[tabled(rename = "detail")]
    detail: String,
}

impl HealthArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let health = match request_health(&home) {
            Ok(health) => health,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                if self.json {
                    return print_json(&json!({
                        "running": false,
                        "socket": socket_path(&home).display().to_string(),
                    }));
                }
                println!("{} daemon is not running", "■".bright_black().bold());
                return Ok(());
            }
            Err(err) => return Err(with_hint(err)),
        };

        if self.json {
            return print_json(&health);
        }
        print_health(&health);
        Ok(())
    }
}

fn print_health(health: &Value) {
    println!("{} daemon is running", "■".green().bold());

    let mut rows = Vec::new();
    for section in ["service", "process", "device", "grid"] {
        let Some(fields) = health.get(section).and_then(Value::as_object) else {
            continue;
        };
        for (key, value) in fields {
            rows.push(SectionRow {
                section: section.to_string(),
                key: key.clone(),
                value: display_value(value),
            });
        }
    }
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    let ops: Vec<OpRecord> = health
        .get("recent_ops")
        .cloned()
        .and_then(|ops| serde_json::from_value(ops).ok())
        .unwrap_or_default();
    if ops.is_empty() {
        println!("No recent operations.");
        return;
    }
    let rows: Vec<OpRow> = ops
        .into_iter()
        .rev()
        .take(10)
        .map(|record| OpRow {
            at: record.at.format("%H:%M:%S").to_string(),
            op: serde_json::to_value(record.op)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            detail: record.detail,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
