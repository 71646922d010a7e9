use std::path::{Path, PathBuf};

pub use spectra_core::config::{config_path_at, spectra_root};

pub const DAEMON_SOCKET: &str = "spectra.sock";

pub fn socket_path(home: &Path) -> PathBuf {
    spectra_root(home).join(DAEMON_SOCKET)
}
