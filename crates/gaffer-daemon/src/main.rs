//! `Gaffer` Daemon
//!
//! Long-running orchestrator accepting run/stop/status requests over a local
//! socket, supervising declared workers as subprocesses and streaming their
//! output on per-worker log sockets.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use gaffer_core::config::{KindManifest, WorkersConfig};
use gaffer_core::paths;
use gaffer_daemon::orchestrator::Orchestrator;
use gaffer_daemon::registry::{KindRegistry, resolve_workers};
use gaffer_daemon::supervisor::RetryPolicy;

#[derive(Parser, Debug)]
#[command(name = "gafferd")]
#[command(version, about = "Gaffer daemon - local worker orchestrator")]
struct Args {
    /// Directory for the control and per-worker log sockets
    #[arg(long, default_value = paths::DEFAULT_SOCKET_DIR, env = "GAFFER_SOCKET_DIR")]
    socket_dir: PathBuf,

    /// Worker table path (defaults to ./workers.toml, then
    /// ~/.config/gaffer/workers.toml)
    #[arg(long, env = "GAFFER_WORKERS")]
    workers: Option<PathBuf>,

    /// Optional worker-kind manifest path
    #[arg(long, env = "GAFFER_KINDS")]
    kinds: Option<PathBuf>,

    /// Dependency re-check interval in milliseconds
    #[arg(long, default_value_t = 500, env = "GAFFER_TICK_MS")]
    tick_ms: u64,

    /// Maximum reload attempts per run for crashing workers
    #[arg(long, default_value_t = 5, env = "GAFFER_RELOAD_MAX_ATTEMPTS")]
    reload_max_attempts: u32,

    /// Base reload backoff in milliseconds (attempt n waits n times this)
    #[arg(long, default_value_t = 500, env = "GAFFER_RELOAD_BACKOFF_MS")]
    reload_backoff_ms: u64,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "GAFFER_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "GAFFER_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("gaffer_daemon={}", args.log_level);
    gaffer_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let workers_path = args
        .workers
        .unwrap_or_else(paths::default_workers_config);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = %workers_path.display(),
        socket_dir = %args.socket_dir.display(),
        "Starting gafferd"
    );

    let workers_config = WorkersConfig::load(&workers_path)?;

    let mut registry = KindRegistry::builtin();
    if let Some(kinds_path) = &args.kinds {
        info!(path = %kinds_path.display(), "Loading kind manifest");
        let manifest = KindManifest::load(kinds_path)?;
        registry.register_manifest(&manifest)?;
    }
    let resolved = resolve_workers(&workers_config, &registry)?;
    info!(workers = resolved.len(), "Worker table resolved");

    let retry = RetryPolicy {
        max_attempts: args.reload_max_attempts,
        backoff: Duration::from_millis(args.reload_backoff_ms),
    };
    let orchestrator = Orchestrator::new(
        resolved,
        args.socket_dir.clone(),
        retry,
        Duration::from_millis(args.tick_ms),
    );
    let control_socket = orchestrator.control_socket();

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready to serve (unix only). The
    // `true` parameter unsets $NOTIFY_SOCKET so worker subprocesses don't
    // accidentally notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let server = Arc::clone(&orchestrator);
    tokio::select! {
        result = server.listen() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    orchestrator.shutdown().await;
    paths::remove_stale_socket(&control_socket)?;
    info!("Daemon stopped");
    Ok(())
}
