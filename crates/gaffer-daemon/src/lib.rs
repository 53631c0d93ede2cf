//! Gaffer Daemon Library
//!
//! Core functionality for the gaffer orchestrator:
//! - Worker-kind registry resolving declared types to launch commands
//! - Per-worker status table
//! - Log broadcasting to replay history and live subscribers
//! - Process supervision with reload-on-crash
//! - Dependency deferral for workers with an `after` list
//! - Control-channel dispatch

pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod status;
pub mod streamer;
pub mod supervisor;
