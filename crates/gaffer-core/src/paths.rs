//! Socket and config path derivation.

use std::path::{Path, PathBuf};

/// Default directory for the control and log sockets.
pub const DEFAULT_SOCKET_DIR: &str = "/tmp";

/// Path of the orchestrator control socket.
pub fn control_socket(socket_dir: &Path) -> PathBuf {
    socket_dir.join("gaffer.sock")
}

/// Path of one worker's log-stream socket, derived from its name.
pub fn log_socket(socket_dir: &Path, worker_name: &str) -> PathBuf {
    socket_dir.join(format!("gaffer-{worker_name}.sock"))
}

/// Remove a leftover socket file from a previous run, if any.
pub fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Default worker-table path: `./workers.toml`, falling back to
/// `~/.config/gaffer/workers.toml`.
pub fn default_workers_config() -> PathBuf {
    let local = PathBuf::from("workers.toml");
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map_or(local, |dir| dir.join("gaffer").join("workers.toml"))
}
