//! Per-worker log broadcasting.
//!
//! One worker's combined stdout/stderr lines go to (a) a capped replay
//! history and (b) every live subscriber on the worker's log socket. A new
//! subscriber is registered on the broadcast channel and the history snapshot
//! taken under one lock, so each line is delivered exactly once: replayed if
//! it was produced before the subscription, live otherwise. Per-source order
//! is preserved; interleaving between stdout and stderr is not.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use gaffer_core::error::Result;
use gaffer_core::paths;

/// Replay history capacity, in lines.
pub const MAX_HISTORY_LINES: usize = 300;

/// Broadcast buffer per subscriber; a subscriber lagging past this many lines
/// loses the overwritten ones and is told how many were skipped.
const SUBSCRIBER_BUFFER_LINES: usize = 1024;

struct Shared {
    history: VecDeque<String>,
    line_tx: broadcast::Sender<String>,
}

/// Log broadcaster for one worker run.
pub struct LogStreamer {
    name: String,
    socket_path: PathBuf,
    shared: Mutex<Shared>,
    shutdown_tx: watch::Sender<bool>,
}

impl LogStreamer {
    pub fn new(worker_name: &str, socket_dir: &Path) -> Self {
        let (line_tx, _) = broadcast::channel(SUBSCRIBER_BUFFER_LINES);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name: worker_name.to_string(),
            socket_path: paths::log_socket(socket_dir, worker_name),
            shared: Mutex::new(Shared {
                history: VecDeque::with_capacity(MAX_HISTORY_LINES),
                line_tx,
            }),
            shutdown_tx,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Consume a line-oriented source until it closes or the broadcaster is
    /// shut down. stdout and stderr each get their own call against the same
    /// broadcaster; both interleave into one history/stream.
    pub async fn read_text<R>(&self, source: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(source).lines();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.append(line),
                    Ok(None) => break,
                    Err(e) => {
                        debug!(worker = %self.name, error = %e, "log source read failed");
                        break;
                    }
                }
            }
        }
    }

    /// Append one line to history (evicting the oldest past capacity) and
    /// fan it out to every current subscriber.
    pub fn append(&self, line: String) {
        let mut shared = self.lock();
        if shared.history.len() == MAX_HISTORY_LINES {
            shared.history.pop_front();
        }
        shared.history.push_back(line.clone());
        // No receivers is fine; history still records the line.
        let _ = shared.line_tx.send(line);
    }

    /// Bind the worker's log socket and serve subscribers until shutdown.
    pub fn serve(self: &Arc<Self>) -> Result<()> {
        paths::remove_stale_socket(&self.socket_path)?;
        let listener = UnixListener::bind(&self.socket_path)?;

        let streamer = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((conn, _)) => {
                            let streamer = Arc::clone(&streamer);
                            tokio::spawn(async move {
                                if let Err(e) = streamer.forward(conn).await {
                                    debug!(worker = %streamer.name, error = %e, "subscriber disconnected");
                                }
                            });
                        }
                        Err(e) => warn!(worker = %streamer.name, error = %e, "log socket accept failed"),
                    }
                }
            }
        });
        Ok(())
    }

    /// Replay history to one subscriber, then forward live lines until it
    /// disconnects or the broadcaster shuts down.
    async fn forward(&self, mut conn: UnixStream) -> std::io::Result<()> {
        let (replay, mut line_rx) = {
            let shared = self.lock();
            let replay: Vec<String> = shared.history.iter().cloned().collect();
            (replay, shared.line_tx.subscribe())
        };

        for line in replay {
            conn.write_all(line.as_bytes()).await?;
            conn.write_all(b"\n").await?;
        }
        conn.flush().await?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                received = line_rx.recv() => match received {
                    Ok(line) => {
                        conn.write_all(line.as_bytes()).await?;
                        conn.write_all(b"\n").await?;
                        conn.flush().await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(worker = %self.name, skipped, "subscriber lagged, lines skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        Ok(())
    }

    /// Signal shutdown: the accept loop, subscriber forwards and source
    /// readers all unblock, and the socket file is removed.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = paths::remove_stale_socket(&self.socket_path) {
            warn!(worker = %self.name, error = %e, "failed to remove log socket");
        }
    }

    /// Current history snapshot, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.lock().history.iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
