//! Control-channel wire protocol.
//!
//! One JSON document per request/response over a local stream socket. The
//! sender half-closes its write side after the document; the receiver reads
//! to EOF and parses, so no extra framing is needed.

use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Recognized control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Run,
    Stop,
    Status,
}

/// A control request as it appears on the wire.
///
/// `action` is kept as a raw string so an unrecognized value surfaces as
/// [`Error::UnknownAction`] rather than a decode failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub action: String,
    /// Target worker name. Empty only for `status`, meaning "all workers".
    #[serde(default)]
    pub name: String,
}

impl Request {
    pub fn new(action: Action, name: impl Into<String>) -> Self {
        let action = match action {
            Action::Run => "run",
            Action::Stop => "stop",
            Action::Status => "status",
        };
        Self {
            action: action.to_string(),
            name: name.into(),
        }
    }

    /// Parse the raw action string.
    pub fn parsed_action(&self) -> Result<Action> {
        match self.action.as_str() {
            "run" => Ok(Action::Run),
            "stop" => Ok(Action::Stop),
            "status" => Ok(Action::Status),
            other => Err(Error::UnknownAction {
                action: other.to_string(),
            }),
        }
    }
}

/// One worker's lifecycle snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerState {
    pub name: String,
    pub active: bool,
    pub update_time: Option<SystemTime>,
    pub done: bool,
}

impl WorkerState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Reply to a `status` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(default)]
    pub worker_status: HashMap<String, WorkerState>,
    #[serde(default)]
    pub error: String,
}

impl StatusResponse {
    pub fn single(state: WorkerState) -> Self {
        let mut worker_status = HashMap::new();
        worker_status.insert(state.name.clone(), state);
        Self {
            worker_status,
            error: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            worker_status: HashMap::new(),
            error: message.into(),
        }
    }
}

/// Serialize `value` as one JSON document onto the stream.
pub async fn write_message<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value)?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the peer's document until its write side closes, then parse it.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut payload = Vec::new();
    reader.read_to_end(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(|e| Error::Decode(e.to_string()))
}
