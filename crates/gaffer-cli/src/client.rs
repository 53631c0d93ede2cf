//! Connection helpers for talking to the orchestrator.

use std::path::Path;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use gaffer_core::config::WorkersConfig;
use gaffer_core::paths;
use gaffer_core::protocol::{self, Action, Request, StatusResponse, WorkerState};

/// Connect to the orchestrator's control socket.
async fn connect(socket_dir: &Path) -> anyhow::Result<UnixStream> {
    let socket = paths::control_socket(socket_dir);
    UnixStream::connect(&socket)
        .await
        .with_context(|| format!("failed to connect to orchestrator at {}", socket.display()))
}

/// Send one request; the daemon replies only to status queries, so the
/// connection is simply closed afterwards.
pub async fn send_request(socket_dir: &Path, action: Action, name: &str) -> anyhow::Result<()> {
    let mut conn = connect(socket_dir).await?;
    protocol::write_message(&mut conn, &Request::new(action, name)).await?;
    conn.shutdown().await?;
    Ok(())
}

/// Fetch the status snapshot for one worker, or for all when `name` is empty.
pub async fn fetch_status(socket_dir: &Path, name: &str) -> anyhow::Result<StatusResponse> {
    let mut conn = connect(socket_dir).await?;
    protocol::write_message(&mut conn, &Request::new(Action::Status, name)).await?;
    conn.shutdown().await?;
    let response: StatusResponse = protocol::read_message(&mut conn).await?;
    if !response.error.is_empty() {
        anyhow::bail!("{}", response.error);
    }
    Ok(response)
}

/// Issue one run request per declared worker. An already-active worker gets
/// a warning, but the request still goes out: the daemon is the one that
/// decides whether a second run is accepted.
#[allow(clippy::print_stdout)]
pub async fn run_all(socket_dir: &Path, config: &WorkersConfig) -> anyhow::Result<()> {
    for worker in &config.workers {
        if is_active(socket_dir, &worker.name).await? {
            println!("worker {} already active", worker.name);
        }
        send_request(socket_dir, Action::Run, &worker.name).await?;
    }
    Ok(())
}

/// Whether a worker is currently active; used to warn before re-running.
pub async fn is_active(socket_dir: &Path, name: &str) -> anyhow::Result<bool> {
    let response = fetch_status(socket_dir, name).await?;
    Ok(response
        .worker_status
        .get(name)
        .is_some_and(|state| state.active))
}

/// Print one worker's status line.
#[allow(clippy::print_stdout)]
pub fn print_state(state: &WorkerState) {
    let update = state.update_time.map_or_else(
        || "-".to_string(),
        |t| {
            t.duration_since(std::time::SystemTime::UNIX_EPOCH)
                .map_or_else(|_| "-".to_string(), |d| format!("{}s", d.as_secs()))
        },
    );
    println!(
        "Name: {} | Active: {} | Done: {} | Updated: {update}",
        state.name, state.active, state.done
    );
}

/// Subscribe to a worker's log socket and print the replayed history plus the
/// live tail until the stream closes.
#[allow(clippy::print_stdout)]
pub async fn tail_logs(socket_dir: &Path, name: &str) -> anyhow::Result<()> {
    let socket = paths::log_socket(socket_dir, name);
    let conn = UnixStream::connect(&socket).await.with_context(|| {
        format!(
            "failed to connect to log socket at {} (is the worker running?)",
            socket.display()
        )
    })?;

    let mut lines = BufReader::new(conn).lines();
    while let Some(line) = lines.next_line().await? {
        println!("{line}");
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use tokio::net::UnixListener;
    use tokio::sync::Mutex;

    use gaffer_core::config::WorkerDefinition;

    /// Control-socket stub: every status query reports the worker active,
    /// every run request is recorded.
    fn spawn_stub_daemon(socket_dir: &Path) -> Arc<Mutex<Vec<String>>> {
        let control = paths::control_socket(socket_dir);
        let listener = UnixListener::bind(&control).unwrap();
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let runs = Arc::clone(&recorded);
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    break;
                };
                let runs = Arc::clone(&runs);
                tokio::spawn(async move {
                    let decoded: gaffer_core::Result<Request> =
                        protocol::read_message(&mut conn).await;
                    let Ok(request) = decoded else { return };
                    match request.action.as_str() {
                        "status" => {
                            let mut state = WorkerState::new(request.name.clone());
                            state.active = true;
                            let _ =
                                protocol::write_message(&mut conn, &StatusResponse::single(state))
                                    .await;
                        }
                        "run" => runs.lock().await.push(request.name),
                        _ => {}
                    }
                });
            }
        });
        recorded
    }

    fn worker(name: &str) -> WorkerDefinition {
        WorkerDefinition {
            name: name.to_string(),
            kind: "cmd".to_string(),
            reload: false,
            args: vec!["true".to_string()],
            after: Vec::new(),
        }
    }

    #[tokio::test]
    async fn run_all_requests_every_worker_even_when_active() {
        let dir = tempfile::tempdir().unwrap();
        let runs = spawn_stub_daemon(dir.path());

        let config = WorkersConfig {
            workers: vec![worker("build"), worker("deploy")],
        };
        run_all(dir.path(), &config).await.unwrap();

        // The stub reports every worker active; the warning is advisory and
        // the run request still goes out for each one.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let mut seen = runs.lock().await.clone();
            if seen.len() == 2 {
                seen.sort();
                assert_eq!(seen, vec!["build", "deploy"]);
                break;
            }
            assert!(Instant::now() < deadline, "run requests not observed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
