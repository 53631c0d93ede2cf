//! Worker process supervision.
//!
//! Spawns a worker's resolved command, wires its stdout/stderr into a fresh
//! [`LogStreamer`], tracks the running handle and waits for exit in a
//! background task. Graceful exit fires the done hook; abnormal exit with the
//! `reload` flag respawns under a bounded retry policy.
//!
//! A run's broadcaster outlives its process: the log socket keeps serving the
//! replay history after exit, and is retired only when the worker runs again
//! (a fresh broadcaster takes over the socket path) or at daemon shutdown.
//!
//! At most one running handle exists per worker name. Every handle carries a
//! monotonic generation; a background waiter only touches the table while its
//! generation is still the registered one, so a handle removed by `stop` (or
//! replaced by a later run) cannot be mutated by a stale waiter.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use gaffer_core::error::{Error, Result};

use crate::registry::{ResolvedWorker, WorkerTable};
use crate::streamer::LogStreamer;

/// Hook invoked exactly once when a run completes gracefully.
pub type DoneHook = Arc<dyn Fn() + Send + Sync>;

/// Bounded reload-on-crash policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum respawn attempts per run before giving up.
    pub max_attempts: u32,
    /// Base delay; attempt `n` waits `n * backoff`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

struct RunningProcess {
    generation: u64,
    pid: i32,
}

/// Process supervisor over the live worker table.
#[derive(Clone)]
pub struct Supervisor {
    workers: WorkerTable,
    running: Arc<RwLock<HashMap<String, RunningProcess>>>,
    /// Current broadcaster per worker name, live or finished. A finished
    /// run's entry keeps its log socket serving history until the next run.
    streamers: Arc<RwLock<HashMap<String, Arc<LogStreamer>>>>,
    generation: Arc<AtomicU64>,
    retry: RetryPolicy,
    socket_dir: PathBuf,
}

impl Supervisor {
    pub fn new(workers: WorkerTable, socket_dir: PathBuf, retry: RetryPolicy) -> Self {
        Self {
            workers,
            running: Arc::new(RwLock::new(HashMap::new())),
            streamers: Arc::new(RwLock::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            retry,
            socket_dir,
        }
    }

    /// Launch a worker and return once the process is started and its handle
    /// registered; waiting, completion and reload happen in the background.
    pub async fn run(&self, name: &str, on_done: DoneHook) -> Result<()> {
        let worker = self
            .workers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                name: name.to_string(),
            })?;

        // Hold the write lock across spawn so concurrent runs for the same
        // name serialize on the at-most-one-handle check.
        let mut running = self.running.write().await;
        if running.contains_key(name) {
            return Err(Error::AlreadyRunning {
                name: name.to_string(),
            });
        }
        // The previous run's broadcaster is retired first so the fresh one
        // can bind the same socket path.
        self.retire_streamer(name).await;
        let (child, pid, streamer) = self.spawn_worker(&worker).await?;
        let generation = self.next_generation();
        self.register_streamer(name, streamer).await;
        running.insert(name.to_string(), RunningProcess { generation, pid });
        drop(running);

        info!(worker = name, pid, "worker started");

        let supervisor = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            supervisor
                .supervise(name, worker, child, generation, on_done)
                .await;
        });
        Ok(())
    }

    /// Send SIGTERM to a worker's process and drop its handle. Best-effort:
    /// does not wait for process death.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let (generation, pid) = {
            let running = self.running.read().await;
            let process = running.get(name).ok_or_else(|| Error::NotFound {
                name: name.to_string(),
            })?;
            (process.generation, process.pid)
        };

        signal_terminate(pid).map_err(|reason| Error::Signal {
            name: name.to_string(),
            reason,
        })?;

        let mut running = self.running.write().await;
        if let Some(process) = running.get(name)
            && process.generation == generation
        {
            running.remove(name);
        }
        info!(worker = name, pid, "worker signalled to stop");
        Ok(())
    }

    /// Whether a running handle exists for this worker name.
    pub async fn is_running(&self, name: &str) -> bool {
        self.running.read().await.contains_key(name)
    }

    /// Number of live handles.
    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    /// Close every worker's log broadcaster. Called at daemon shutdown; a
    /// finished worker's broadcaster otherwise stays up serving history.
    pub async fn close_streamers(&self) {
        let mut streamers = self.streamers.write().await;
        for (_, streamer) in streamers.drain() {
            streamer.close();
        }
    }

    async fn retire_streamer(&self, name: &str) {
        if let Some(previous) = self.streamers.write().await.remove(name) {
            previous.close();
        }
    }

    async fn register_streamer(&self, name: &str, streamer: Arc<LogStreamer>) {
        self.streamers
            .write()
            .await
            .insert(name.to_string(), streamer);
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Spawn the worker's command with captured output wired into a fresh
    /// broadcaster serving the worker's log socket.
    async fn spawn_worker(
        &self,
        worker: &ResolvedWorker,
    ) -> Result<(Child, i32, Arc<LogStreamer>)> {
        let name = &worker.definition.name;
        let spawn_err = |reason: String| Error::Spawn {
            name: name.clone(),
            reason,
        };

        let mut cmd = worker
            .kind
            .launch(&worker.definition.args)
            .map_err(|e| spawn_err(e.to_string()))?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| spawn_err(e.to_string()))?;
        #[allow(clippy::cast_possible_wrap)]
        let pid = child
            .id()
            .ok_or_else(|| spawn_err("process exited before a pid was observed".to_string()))?
            as i32;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_err("failed to capture stderr".to_string()))?;

        let streamer = Arc::new(LogStreamer::new(name, &self.socket_dir));
        if let Err(e) = streamer.serve() {
            child.start_kill().ok();
            return Err(spawn_err(format!("log socket setup failed: {e}")));
        }

        let out_streamer = Arc::clone(&streamer);
        tokio::spawn(async move { out_streamer.read_text(stdout).await });
        let err_streamer = Arc::clone(&streamer);
        tokio::spawn(async move { err_streamer.read_text(stderr).await });

        Ok((child, pid, streamer))
    }

    /// Background waiter: one iteration per process lifetime, looping only
    /// for reload respawns.
    async fn supervise(
        &self,
        name: String,
        mut worker: ResolvedWorker,
        mut child: Child,
        mut generation: u64,
        on_done: DoneHook,
    ) {
        let mut attempt: u32 = 0;
        loop {
            let exit = child.wait().await;

            // Only the registered generation may mutate the handle table; a
            // stale waiter (stopped or superseded run) backs off entirely.
            let owned = {
                let mut running = self.running.write().await;
                match running.get(&name) {
                    Some(process) if process.generation == generation => {
                        running.remove(&name);
                        true
                    }
                    _ => false,
                }
            };

            match exit {
                Ok(status) if status.success() => {
                    if owned {
                        info!(worker = %name, "worker finished");
                        on_done();
                    } else {
                        debug!(worker = %name, "stale waiter, completion ignored");
                    }
                    return;
                }
                Ok(status) => {
                    warn!(worker = %name, %status, "worker exited abnormally");
                }
                Err(e) => {
                    warn!(worker = %name, error = %e, "wait for worker failed");
                }
            }

            if !owned {
                debug!(worker = %name, "stale waiter, reload skipped");
                return;
            }
            if !worker.definition.reload {
                return;
            }

            attempt += 1;
            if attempt > self.retry.max_attempts {
                error!(
                    worker = %name,
                    attempts = self.retry.max_attempts,
                    "reload attempts exhausted, giving up"
                );
                return;
            }
            tokio::time::sleep(self.retry.delay(attempt)).await;

            // The table is live; the definition may have changed or vanished
            // while we slept.
            let Some(current) = self.workers.read().await.get(&name).cloned() else {
                warn!(worker = %name, "worker no longer declared, reload abandoned");
                return;
            };

            let mut running = self.running.write().await;
            if running.contains_key(&name) {
                debug!(worker = %name, "worker restarted by a new request, reload skipped");
                return;
            }
            self.retire_streamer(&name).await;
            match self.spawn_worker(&current).await {
                Ok((new_child, pid, new_streamer)) => {
                    generation = self.next_generation();
                    self.register_streamer(&name, new_streamer).await;
                    running.insert(name.clone(), RunningProcess { generation, pid });
                    drop(running);
                    info!(worker = %name, pid, attempt, "worker reloaded");
                    worker = current;
                    child = new_child;
                }
                Err(e) => {
                    error!(worker = %name, error = %e, "reload spawn failed");
                    return;
                }
            }
        }
    }
}

/// Deliver SIGTERM to a process we spawned.
#[cfg(unix)]
fn signal_terminate(pid: i32) -> std::result::Result<(), String> {
    // SAFETY: pid was obtained from our own Child handle; kill(2) with
    // SIGTERM is safe to call on an owned subprocess.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().to_string())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Instant;

    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixStream;

    use gaffer_core::config::WorkerDefinition;
    use gaffer_core::paths;

    use crate::registry::{KindRegistry, resolve_workers};

    fn shell_worker(name: &str, script: &str, reload: bool) -> WorkerDefinition {
        WorkerDefinition {
            name: name.to_string(),
            kind: "cmd".to_string(),
            reload,
            args: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            after: Vec::new(),
        }
    }

    fn supervisor_for(
        definitions: Vec<WorkerDefinition>,
        socket_dir: &std::path::Path,
        retry: RetryPolicy,
    ) -> Supervisor {
        let config = gaffer_core::config::WorkersConfig {
            workers: definitions,
        };
        let resolved = resolve_workers(&config, &KindRegistry::builtin()).unwrap();
        let workers: WorkerTable = Arc::new(RwLock::new(resolved));
        Supervisor::new(workers, socket_dir.to_path_buf(), retry)
    }

    fn noop_hook() -> DoneHook {
        Arc::new(|| {})
    }

    async fn wait_until<F>(mut condition: F, timeout: Duration)
    where
        F: AsyncFnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        while !condition().await {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn run_unknown_worker_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_for(vec![], dir.path(), RetryPolicy::default());
        let err = sup.run("ghost", noop_hook()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { name } if name == "ghost"));
    }

    #[tokio::test]
    async fn graceful_exit_fires_done_hook_and_clears_handle() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_for(
            vec![shell_worker("build", "echo done", false)],
            dir.path(),
            RetryPolicy::default(),
        );

        let done = Arc::new(AtomicU64::new(0));
        let hook: DoneHook = {
            let done = Arc::clone(&done);
            Arc::new(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
        };

        sup.run("build", hook).await.unwrap();
        assert!(sup.is_running("build").await);

        let sup2 = sup.clone();
        wait_until(
            async || !sup2.is_running("build").await,
            Duration::from_secs(5),
        )
        .await;
        let done2 = Arc::clone(&done);
        wait_until(
            async || done2.load(Ordering::SeqCst) == 1,
            Duration::from_secs(5),
        )
        .await;
    }

    #[tokio::test]
    async fn second_run_while_running_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_for(
            vec![shell_worker("build", "sleep 5", false)],
            dir.path(),
            RetryPolicy::default(),
        );

        sup.run("build", noop_hook()).await.unwrap();
        let err = sup.run("build", noop_hook()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning { name } if name == "build"));
        assert_eq!(sup.running_count().await, 1);

        sup.stop("build").await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_runs_keep_at_most_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_for(
            vec![shell_worker("build", "sleep 5", false)],
            dir.path(),
            RetryPolicy::default(),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sup = sup.clone();
            handles.push(tokio::spawn(
                async move { sup.run("build", noop_hook()).await },
            ));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(sup.running_count().await, 1);

        sup.stop("build").await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_handle_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_for(
            vec![shell_worker("build", "echo hi", false)],
            dir.path(),
            RetryPolicy::default(),
        );
        let err = sup.stop("build").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { name } if name == "build"));
    }

    #[tokio::test]
    async fn stopped_worker_does_not_fire_done_hook() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_for(
            vec![shell_worker("build", "sleep 5", false)],
            dir.path(),
            RetryPolicy::default(),
        );

        let done = Arc::new(AtomicU64::new(0));
        let hook: DoneHook = {
            let done = Arc::clone(&done);
            Arc::new(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
        };

        sup.run("build", hook).await.unwrap();
        sup.stop("build").await.unwrap();
        assert!(!sup.is_running("build").await);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(done.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn crashing_reload_worker_respawns_at_least_twice() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawns");
        let script = format!("echo x >> {} && exit 1", marker.display());
        let sup = supervisor_for(
            vec![shell_worker("flaky", &script, true)],
            dir.path(),
            RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(20),
            },
        );

        sup.run("flaky", noop_hook()).await.unwrap();

        wait_until(
            async || {
                std::fs::read_to_string(&marker)
                    .map(|s| s.lines().count() >= 2)
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
        )
        .await;
    }

    #[tokio::test]
    async fn reload_gives_up_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawns");
        let script = format!("echo x >> {} && exit 1", marker.display());
        let sup = supervisor_for(
            vec![shell_worker("flaky", &script, true)],
            dir.path(),
            RetryPolicy {
                max_attempts: 2,
                backoff: Duration::from_millis(10),
            },
        );

        sup.run("flaky", noop_hook()).await.unwrap();

        let sup2 = sup.clone();
        wait_until(
            async || !sup2.is_running("flaky").await,
            Duration::from_secs(5),
        )
        .await;
        // Initial spawn + at most two reloads, then the supervisor stops.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let spawns = std::fs::read_to_string(&marker).unwrap().lines().count();
        assert!((1..=3).contains(&spawns), "spawns: {spawns}");
        assert!(!sup.is_running("flaky").await);
    }

    #[tokio::test]
    async fn non_reload_crash_is_not_respawned() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawns");
        let script = format!("echo x >> {} && exit 1", marker.display());
        let sup = supervisor_for(
            vec![shell_worker("oneshot", &script, false)],
            dir.path(),
            RetryPolicy::default(),
        );

        sup.run("oneshot", noop_hook()).await.unwrap();
        let sup2 = sup.clone();
        wait_until(
            async || !sup2.is_running("oneshot").await,
            Duration::from_secs(5),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let spawns = std::fs::read_to_string(&marker).unwrap().lines().count();
        assert_eq!(spawns, 1);
    }

    async fn read_replay(socket: &std::path::Path, count: usize) -> Vec<String> {
        let conn = UnixStream::connect(socket).await.unwrap();
        let mut lines = BufReader::new(conn).lines();
        let mut collected = Vec::with_capacity(count);
        for _ in 0..count {
            let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
                .await
                .expect("timed out reading replay")
                .unwrap()
                .expect("stream closed early");
            collected.push(line);
        }
        collected
    }

    #[tokio::test]
    async fn finished_worker_still_serves_its_log_history() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_for(
            vec![shell_worker("chatty", "echo one; echo two", false)],
            dir.path(),
            RetryPolicy::default(),
        );

        sup.run("chatty", noop_hook()).await.unwrap();
        let sup2 = sup.clone();
        wait_until(
            async || !sup2.is_running("chatty").await,
            Duration::from_secs(5),
        )
        .await;

        // The broadcaster outlives the process: the socket stays bound and
        // replays the run's history to a late subscriber.
        let socket = paths::log_socket(dir.path(), "chatty");
        assert!(socket.exists(), "log socket removed after worker exit");
        assert_eq!(read_replay(&socket, 2).await, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn rerun_replaces_the_previous_history() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_for(
            vec![shell_worker("chatty", "echo once", false)],
            dir.path(),
            RetryPolicy::default(),
        );

        for _ in 0..2 {
            sup.run("chatty", noop_hook()).await.unwrap();
            let sup2 = sup.clone();
            wait_until(
                async || !sup2.is_running("chatty").await,
                Duration::from_secs(5),
            )
            .await;
        }

        // The second run starts a fresh broadcaster: one line of history,
        // not the accumulated output of both runs.
        let socket = paths::log_socket(dir.path(), "chatty");
        let conn = UnixStream::connect(&socket).await.unwrap();
        let mut lines = BufReader::new(conn).lines();
        let first = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("timed out reading replay")
            .unwrap()
            .expect("stream closed early");
        assert_eq!(first, "once");
        let second = tokio::time::timeout(Duration::from_millis(300), lines.next_line()).await;
        assert!(second.is_err(), "history carried over from the previous run");
    }

    #[tokio::test]
    async fn close_streamers_shuts_down_finished_log_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_for(
            vec![shell_worker("chatty", "echo bye", false)],
            dir.path(),
            RetryPolicy::default(),
        );

        sup.run("chatty", noop_hook()).await.unwrap();
        let sup2 = sup.clone();
        wait_until(
            async || !sup2.is_running("chatty").await,
            Duration::from_secs(5),
        )
        .await;

        sup.close_streamers().await;
        let socket = paths::log_socket(dir.path(), "chatty");
        assert!(!socket.exists());
    }
}
