//! Control-channel dispatch.
//!
//! The orchestrator owns the accept loop on the control socket. Each
//! connection carries one JSON request; the client half-closes its write side
//! after the document. Requests naming a worker with unmet prerequisites are
//! parked in the [`DependencyScheduler`]; everything else goes straight to
//! the supervisor or the status table. Per-request errors are logged and the
//! connection dropped; they never take the daemon down.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use gaffer_core::error::Result;
use gaffer_core::paths;
use gaffer_core::protocol::{self, Action, Request, StatusResponse};

use crate::registry::{ResolvedWorker, WorkerTable};
use crate::scheduler::{DependencyScheduler, PendingRequest};
use crate::status::StatusTable;
use crate::supervisor::{DoneHook, RetryPolicy, Supervisor};

/// The orchestrator daemon core.
pub struct Orchestrator {
    workers: WorkerTable,
    status: Arc<StatusTable>,
    supervisor: Supervisor,
    scheduler: Arc<DependencyScheduler>,
    socket_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(
        resolved: HashMap<String, ResolvedWorker>,
        socket_dir: PathBuf,
        retry: RetryPolicy,
        tick: Duration,
    ) -> Arc<Self> {
        let workers: WorkerTable = Arc::new(RwLock::new(resolved));
        let supervisor = Supervisor::new(Arc::clone(&workers), socket_dir.clone(), retry);
        Arc::new(Self {
            workers,
            status: Arc::new(StatusTable::new()),
            supervisor,
            scheduler: Arc::new(DependencyScheduler::new(tick)),
            socket_dir,
        })
    }

    pub fn status(&self) -> &Arc<StatusTable> {
        &self.status
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Path of the control socket this orchestrator serves.
    pub fn control_socket(&self) -> PathBuf {
        paths::control_socket(&self.socket_dir)
    }

    /// Close every per-worker log socket. Finished workers keep their
    /// broadcaster serving history until this is called at daemon shutdown.
    pub async fn shutdown(&self) {
        self.supervisor.close_streamers().await;
    }

    /// Serve the control socket until the task is dropped.
    pub async fn listen(self: Arc<Self>) -> Result<()> {
        {
            let workers = self.workers.read().await;
            self.status.init(workers.keys().cloned());
        }

        let socket_path = self.control_socket();
        paths::remove_stale_socket(&socket_path)?;
        let listener = UnixListener::bind(&socket_path)?;
        info!(socket = %socket_path.display(), "orchestrator online");

        // Deferred requests re-enter the normal handling path through this
        // channel once their prerequisites are satisfied.
        let (release_tx, mut release_rx) = mpsc::channel::<PendingRequest>(32);
        let _tick = self.scheduler.spawn(Arc::clone(&self.status), release_tx);
        {
            let orchestrator = Arc::clone(&self);
            tokio::spawn(async move {
                while let Some(released) = release_rx.recv().await {
                    let orchestrator = Arc::clone(&orchestrator);
                    tokio::spawn(async move {
                        let worker = released.request.name.clone();
                        if let Err(e) = orchestrator
                            .handle_request(released.writer, released.request)
                            .await
                        {
                            warn!(worker = %worker, error = %e, "deferred request failed");
                        }
                    });
                }
            });
        }

        loop {
            let conn = match listener.accept().await {
                Ok((conn, _)) => conn,
                Err(e) => {
                    warn!(error = %e, "control socket accept failed");
                    continue;
                }
            };
            let orchestrator = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = orchestrator.handle_connection(conn).await {
                    warn!(error = %e, "connection handling failed");
                }
            });
        }
    }

    /// Decode one request and either park it or dispatch it.
    async fn handle_connection(&self, conn: UnixStream) -> Result<()> {
        let (mut reader, writer) = conn.into_split();
        let request: Request = protocol::read_message(&mut reader).await?;

        if request.parsed_action()? == Action::Run {
            let after = self
                .workers
                .read()
                .await
                .get(&request.name)
                .map(|w| w.definition.after.clone());
            if let Some(after) = after
                && !after.is_empty()
            {
                self.scheduler
                    .park(PendingRequest {
                        writer,
                        request,
                        after,
                    })
                    .await;
                return Ok(());
            }
        }

        self.handle_request(writer, request).await
    }

    /// The single dispatch point shared by fresh and deferred requests.
    pub async fn handle_request(&self, mut writer: OwnedWriteHalf, request: Request) -> Result<()> {
        match request.parsed_action()? {
            Action::Run => {
                let hook = self.done_hook(&request.name);
                self.supervisor.run(&request.name, hook).await?;
                self.status.set_running(&request.name)?;
            }
            Action::Stop => {
                self.supervisor.stop(&request.name).await?;
                self.status.set_stopped(&request.name)?;
            }
            Action::Status => {
                let response = if request.name.is_empty() {
                    StatusResponse {
                        worker_status: self.status.snapshot(),
                        error: String::new(),
                    }
                } else {
                    match self.status.get(&request.name) {
                        Ok(state) => StatusResponse::single(state),
                        Err(e) => StatusResponse::error(e.to_string()),
                    }
                };
                protocol::write_message(&mut writer, &response).await?;
            }
        }
        debug!(action = %request.action, worker = %request.name, "request handled");
        Ok(())
    }

    /// Completion hook marking the status table done; this is how workers
    /// waiting on an `after` list eventually become unblocked.
    fn done_hook(&self, name: &str) -> DoneHook {
        let status = Arc::clone(&self.status);
        let name = name.to_string();
        Arc::new(move || {
            if let Err(e) = status.set_done(&name) {
                warn!(worker = %name, error = %e, "failed to mark worker done");
            }
        })
    }
}
