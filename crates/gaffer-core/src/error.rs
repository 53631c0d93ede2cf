//! Error types for `Gaffer` core library.

use thiserror::Error;

/// Result type alias using `Gaffer` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Gaffer` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown worker name in a table lookup.
    #[error("worker <{name}> not found")]
    NotFound { name: String },

    /// A second run was issued while a handle for the worker is live.
    #[error("worker <{name}> is already running")]
    AlreadyRunning { name: String },

    /// Worker-kind type collision during registry assembly.
    #[error("worker kind <{kind}> is already registered")]
    DuplicateKind { kind: String },

    /// Unrecognized request action.
    #[error("undefined action <{action}>")]
    UnknownAction { action: String },

    /// Malformed wire payload.
    #[error("failed to decode request: {0}")]
    Decode(String),

    /// Process launch failure.
    #[error("failed to spawn worker <{name}>: {reason}")]
    Spawn { name: String, reason: String },

    /// Termination signal delivery failure.
    #[error("failed to signal worker <{name}>: {reason}")]
    Signal { name: String, reason: String },

    /// Configuration error (setup-time, fatal to daemon startup).
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
