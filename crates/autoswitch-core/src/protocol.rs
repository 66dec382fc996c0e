//! Wire protocol between supervisor and worker
//!
//! Newline-delimited JSON records tagged by `code`. Unknown fields are
//! ignored; a line with an unknown `code` decodes to `None` so that older
//! peers skip newer messages instead of dropping the link.

use crate::error::ProtocolError;
use crate::types::WorkerId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Payload written to the host manager's control endpoint
pub const RECYCLE_COMMAND: &[u8] = b"recycle";

/// Messages sent from worker to supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// First line on a bridge connection
    Hello {
        /// Id the supervisor assigned at spawn
        worker_id: WorkerId,
        /// Session token from the environment
        token: String,
    },
    /// The workload is accepting traffic
    Listening,
    /// Drift observed; this worker asks to be replaced
    Disconnect,
    /// The workload failed and cannot continue
    RunnerFailed {
        /// Error description
        err: String,
    },
}

impl WorkerMessage {
    /// Short name used in logs
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Listening => "listening",
            Self::Disconnect => "disconnect",
            Self::RunnerFailed { .. } => "runner-failed",
        }
    }
}

/// Messages sent from supervisor to worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "kebab-case")]
pub enum SupervisorCommand {
    /// Stop accepting work and exit after the drain window
    Shutdown,
}

/// A record type carried on the bridge
pub trait WireMessage: DeserializeOwned {
    /// Every `code` this build can decode
    const CODES: &'static [&'static str];
}

impl WireMessage for WorkerMessage {
    const CODES: &'static [&'static str] = &["hello", "listening", "disconnect", "runner-failed"];
}

impl WireMessage for SupervisorCommand {
    const CODES: &'static [&'static str] = &["shutdown"];
}

/// Encode one message as a JSON line (including the trailing newline)
///
/// # Errors
/// Returns `ProtocolError::Malformed` if serialization fails.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one JSON line
///
/// Returns `Ok(None)` for blank lines and for well-formed records whose
/// `code` this build does not know.
///
/// # Errors
/// Returns `ProtocolError::Malformed` if the line is not a JSON object with
/// a string `code`.
pub fn decode_line<T: WireMessage>(line: &str) -> Result<Option<T>, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_str(line)?;
    let Some(code) = value.get("code").and_then(serde_json::Value::as_str) else {
        return Err(ProtocolError::Malformed(serde::de::Error::custom(
            "missing string field `code`",
        )));
    };
    if !T::CODES.contains(&code) {
        tracing::debug!(code, "skipping message with unknown code");
        return Ok(None);
    }

    Ok(Some(serde_json::from_value::<T>(value)?))
}
