//! Per-worker lifecycle status table.
//!
//! One entry per declared worker, created at daemon start and never removed.
//! Mutations come from the dispatcher (running/stopped) and the supervisor's
//! completion hook (done); reads hand out copies so callers never observe a
//! partially-updated entry.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;

use gaffer_core::error::{Error, Result};
use gaffer_core::protocol::WorkerState;

/// Concurrency-safe status table.
#[derive(Debug, Default)]
pub struct StatusTable {
    entries: RwLock<HashMap<String, WorkerState>>,
}

impl StatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate one zero-value entry per declared worker name. Called once
    /// before serving requests.
    pub fn init(&self, names: impl IntoIterator<Item = String>) {
        let mut entries = self.write();
        for name in names {
            let state = WorkerState::new(name.clone());
            entries.insert(name, state);
        }
    }

    /// Mark a worker active and refresh its timestamp.
    pub fn set_running(&self, name: &str) -> Result<()> {
        self.update(name, |state| {
            state.active = true;
            state.done = false;
            state.update_time = Some(SystemTime::now());
        })
    }

    /// Mark a worker inactive; `done` is left unchanged.
    pub fn set_stopped(&self, name: &str) -> Result<()> {
        self.update(name, |state| {
            state.active = false;
            state.update_time = None;
        })
    }

    /// Mark a worker done. Invoked by the supervisor's completion hook.
    pub fn set_done(&self, name: &str) -> Result<()> {
        self.update(name, |state| {
            state.active = false;
            state.done = true;
            state.update_time = None;
        })
    }

    /// Snapshot of the whole table.
    pub fn snapshot(&self) -> HashMap<String, WorkerState> {
        self.read().clone()
    }

    /// Snapshot of one worker's entry.
    pub fn get(&self, name: &str) -> Result<WorkerState> {
        self.read().get(name).cloned().ok_or_else(|| Error::NotFound {
            name: name.to_string(),
        })
    }

    fn update(&self, name: &str, apply: impl FnOnce(&mut WorkerState)) -> Result<()> {
        let mut entries = self.write();
        let state = entries.get_mut(name).ok_or_else(|| Error::NotFound {
            name: name.to_string(),
        })?;
        apply(state);
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, WorkerState>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, WorkerState>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
