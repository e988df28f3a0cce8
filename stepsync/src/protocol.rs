//! Wire protocol: JSON text frames tagged by `type`.
//!
//! ```text
//! client ──► server   {"type":"update","version":3,"clientID":"A","steps":[…]}
//!
//! server ──► session  {"type":"init","version":3,"content":{…}}
//!                     {"type":"update","version":5,"steps":[{step,version,clientID}…]}
//!                     {"type":"error","kind":"busy","message":"…","retryable":true}
//!
//! server ──► all      {"type":"update",…}            after every commit
//!                     {"type":"presenceCount","count":4}
//! ```
//!
//! Steps and content are opaque JSON values.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::StepRecord;

/// Messages a session sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Update(UpdateRequest),
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// A proposed batch of steps against `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Base version the steps were authored against
    pub version: u64,
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub steps: Vec<Value>,
}

impl UpdateRequest {
    pub fn new(version: u64, client_id: impl Into<String>, steps: Vec<Value>) -> Self {
        Self {
            version,
            client_id: client_id.into(),
            steps,
        }
    }

    /// Shape checks done before the request reaches the engine.
    pub fn validate(&self, max_steps: usize) -> Result<(), ProtocolError> {
        if self.client_id.is_empty() {
            return Err(ProtocolError::Invalid("empty clientID".into()));
        }
        if self.steps.is_empty() {
            return Err(ProtocolError::Invalid("update carries no steps".into()));
        }
        if self.steps.len() > max_steps {
            return Err(ProtocolError::Invalid(format!(
                "update carries {} steps, limit is {max_steps}",
                self.steps.len()
            )));
        }
        Ok(())
    }
}

/// Error categories reported to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Busy,
    StepRejected,
    Storage,
    Invalid,
    Internal,
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Full snapshot on connect (or after a conflict whose history was evicted)
    Init { version: u64, content: Value },
    /// Steps after some version, ending at `version`
    Update {
        version: u64,
        steps: Vec<StepRecord>,
    },
    PresenceCount { count: usize },
    Error {
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self::Error {
            kind,
            message: message.into(),
            retryable,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("invalid message: {0}")]
    Invalid(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ProtocolError::Transport(e.to_string())
    }
}
