//! `Gaffer` Core Library
//!
//! Shared functionality for `Gaffer` components:
//! - Worker table and kind-manifest parsing and validation
//! - Control-channel wire protocol types and framing
//! - Socket path derivation
//! - Common error types

pub mod config;
pub mod error;
pub mod paths;
pub mod protocol;
pub mod tracing_init;

pub use config::{KindManifest, WorkerDefinition, WorkersConfig};
pub use error::{Error, Result};
pub use protocol::{Action, Request, StatusResponse, WorkerState};
