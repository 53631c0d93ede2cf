//! Dependency deferral for workers with an `after` list.
//!
//! A run request whose target declares prerequisites is parked here. A
//! background tick re-checks the status table and releases a request only
//! when every prerequisite reports done; released requests are handed back to
//! the dispatcher's normal handling path. Held requests never expire.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use gaffer_core::protocol::Request;

use crate::status::StatusTable;

/// Default re-check interval.
pub const DEFAULT_TICK: Duration = Duration::from_millis(500);

/// A parked run request awaiting its prerequisites.
pub struct PendingRequest {
    /// Write side of the originating connection, kept for the eventual reply
    /// path.
    pub writer: OwnedWriteHalf,
    pub request: Request,
    /// Prerequisite worker names that must all report done.
    pub after: Vec<String>,
}

/// Holds deferred requests and releases them once satisfied.
pub struct DependencyScheduler {
    held: Mutex<HashMap<u64, PendingRequest>>,
    next_key: AtomicU64,
    tick: Duration,
}

impl DependencyScheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(0),
            tick,
        }
    }

    /// Park a request until all of its prerequisites are done.
    pub async fn park(&self, pending: PendingRequest) {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        debug!(
            worker = %pending.request.name,
            after = ?pending.after,
            "request parked on unmet prerequisites"
        );
        self.held.lock().await.insert(key, pending);
    }

    /// Number of currently held requests.
    pub async fn held_count(&self) -> usize {
        self.held.lock().await.len()
    }

    /// Start the background tick loop. Released requests are sent to
    /// `release_tx` for normal dispatch.
    pub fn spawn(
        self: &Arc<Self>,
        status: Arc<StatusTable>,
        release_tx: mpsc::Sender<PendingRequest>,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(scheduler.tick).await;
                scheduler.release_ready(&status, &release_tx).await;
            }
        })
    }

    /// One tick: release every held request whose prerequisites are all done.
    pub async fn release_ready(
        &self,
        status: &StatusTable,
        release_tx: &mpsc::Sender<PendingRequest>,
    ) {
        let snapshot = status.snapshot();
        let mut held = self.held.lock().await;

        let ready: Vec<u64> = held
            .iter()
            .filter(|(_, pending)| {
                pending.after.iter().all(|dep| match snapshot.get(dep) {
                    Some(state) => state.done,
                    None => {
                        warn!(
                            worker = %pending.request.name,
                            prerequisite = %dep,
                            "prerequisite not declared, treated as not done"
                        );
                        false
                    }
                })
            })
            .map(|(key, _)| *key)
            .collect();

        for key in ready {
            if let Some(pending) = held.remove(&key) {
                debug!(worker = %pending.request.name, "prerequisites satisfied, releasing request");
                if release_tx.send(pending).await.is_err() {
                    warn!("release channel closed, dropping deferred request");
                    return;
                }
            }
        }
    }
}
