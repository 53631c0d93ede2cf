//! Gaffer CLI
//!
//! Control client for the gaffer orchestrator: issue run/stop/status
//! requests over the control socket and tail per-worker log streams.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use gaffer_core::config::WorkersConfig;
use gaffer_core::paths;
use gaffer_core::protocol::Action;

mod client;

#[derive(Parser, Debug)]
#[command(name = "gaffer")]
#[command(version, about = "Control client for the gaffer orchestrator", long_about = None)]
struct Cli {
    /// Directory holding the orchestrator's sockets
    #[arg(long, default_value = paths::DEFAULT_SOCKET_DIR, env = "GAFFER_SOCKET_DIR")]
    socket_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one declared worker
    Run {
        /// Worker name
        name: String,
    },
    /// Run every worker declared in the worker table
    RunAll {
        /// Worker table path (defaults to ./workers.toml, then
        /// ~/.config/gaffer/workers.toml)
        #[arg(long, env = "GAFFER_WORKERS")]
        workers: Option<PathBuf>,
    },
    /// Stop a running worker
    Stop {
        /// Worker name
        name: String,
    },
    /// Show worker status (all workers when no name is given)
    Status {
        /// Worker name
        name: Option<String>,
    },
    /// Stream a worker's log history and live tail
    Logs {
        /// Worker name
        name: String,
    },
}

#[tokio::main]
#[allow(clippy::print_stdout)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    gaffer_core::tracing_init::init_tracing("gaffer=warn", false);

    match cli.command {
        Command::Run { name } => {
            if client::is_active(&cli.socket_dir, &name).await? {
                println!("worker {name} already active");
            }
            client::send_request(&cli.socket_dir, Action::Run, &name).await?;
        }
        Command::RunAll { workers } => {
            let path = workers.unwrap_or_else(paths::default_workers_config);
            let config = WorkersConfig::load(&path)?;
            client::run_all(&cli.socket_dir, &config).await?;
        }
        Command::Stop { name } => {
            client::send_request(&cli.socket_dir, Action::Stop, &name).await?;
        }
        Command::Status { name } => {
            let response =
                client::fetch_status(&cli.socket_dir, name.as_deref().unwrap_or_default()).await?;
            let mut states: Vec<_> = response.worker_status.values().collect();
            states.sort_by(|a, b| a.name.cmp(&b.name));
            for state in states {
                client::print_state(state);
            }
        }
        Command::Logs { name } => {
            client::tail_logs(&cli.socket_dir, &name).await?;
        }
    }
    Ok(())
}
