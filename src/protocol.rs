//! Wire messages exchanged over a session's websocket connections.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Inbound client messages, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Full replacement of the shared buffer.
    Edit { code: String },
    /// Switch the execution language; unvalidated until a run.
    Language { language: String },
    Run,
    End,
}

/// Outbound server messages, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Init {
        language: String,
        code: String,
    },
    Edit {
        code: String,
    },
    Language {
        language: String,
    },
    RunResult {
        stdout: String,
        stderr: String,
        language: String,
    },
    Error {
        message: String,
    },
    Ended {
        reason: String,
    },
}

impl ServerMessage {
    /// Serialized JSON payload. Serialization of these variants cannot
    /// fail; an empty string is returned rather than panicking.
    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A rejected inbound message. The display text is sent back verbatim in
/// an `error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid message")]
    Malformed,
    #[error("Unknown message type")]
    UnknownType,
}

/// Decode one inbound frame. A payload that is not a JSON object with a
/// recognizable envelope is `Malformed`; a well-formed envelope whose
/// discriminant is not part of the protocol is `UnknownType`.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::Malformed)?;
    match value.get("type").and_then(Value::as_str) {
        Some("edit" | "language" | "run" | "end") => {}
        Some(_) => return Err(ProtocolError::UnknownType),
        None => return Err(ProtocolError::Malformed),
    }
    serde_json::from_value(value).map_err(|_| ProtocolError::Malformed)
}
