pub mod config;
pub mod daemon;
pub mod device;
pub mod grid;
pub mod health;
pub mod sweep;
pub mod watch;

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value;

use spectra_daemon::{DaemonError, DaemonRequest};

pub(crate) fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Send one request; daemon-side failures surface with their recovery hint.
pub(crate) fn call(request: &DaemonRequest) -> Result<Value> {
    let home = home_dir()?;
    spectra_daemon::request(&home, request).map_err(with_hint)
}

pub(crate) fn with_hint(err: DaemonError) -> anyhow::Error {
    anyhow!("{err} [{}]\nhint: {}", err.kind(), err.hint())
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render JSON")?
    );
    Ok(())
}

/// Decode a response payload into its typed form.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value).with_context(|| format!("unexpected {what} payload from daemon"))
}
