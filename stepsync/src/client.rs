//! WebSocket client for the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - `update` submission tagged with this client's id
//! - Decoded server frames as a stream of [`SyncEvent`]s
//!
//! Rebasing pending local steps after a conflict is left to the caller;
//! the client only reports what the server sent.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::document::StepRecord;
use crate::protocol::{ClientMessage, ErrorKind, ProtocolError, ServerMessage, UpdateRequest};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Full document snapshot
    Init { version: u64, content: Value },
    /// Steps ending at `version`
    Update { version: u64, steps: Vec<StepRecord> },
    /// Number of connected sessions
    PresenceCount(usize),
    /// Submission rejected
    Error {
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },
    /// Connection lost
    Disconnected,
}

impl From<ServerMessage> for SyncEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::Init { version, content } => SyncEvent::Init { version, content },
            ServerMessage::Update { version, steps } => SyncEvent::Update { version, steps },
            ServerMessage::PresenceCount { count } => SyncEvent::PresenceCount(count),
            ServerMessage::Error {
                kind,
                message,
                retryable,
            } => SyncEvent::Error {
                kind,
                message,
                retryable,
            },
        }
    }
}

/// The sync client.
pub struct SyncClient {
    client_id: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Frames for the writer task
    outgoing_tx: mpsc::Sender<String>,
    events: mpsc::Receiver<SyncEvent>,
}

impl SyncClient {
    /// Connect with a fresh random client id.
    pub async fn connect(url: &str) -> Result<Self, ProtocolError> {
        Self::connect_as(url, Uuid::new_v4().to_string()).await
    }

    /// Connect with an explicit client id.
    ///
    /// Spawns background tasks for reading and writing frames.
    pub async fn connect_as(url: &str, client_id: impl Into<String>) -> Result<Self, ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(256);
        let (event_tx, events) = mpsc::channel(1024);

        // Writer task: forward outgoing frames to the socket
        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode server frames into events
        let reader_state = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(msg) => {
                            if event_tx.send(msg.into()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *reader_state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(Self {
            client_id: client_id.into(),
            state,
            outgoing_tx,
            events,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Submit `steps` authored against `version`.
    pub async fn send_update(&self, version: u64, steps: Vec<Value>) -> Result<(), ProtocolError> {
        let msg = ClientMessage::Update(UpdateRequest::new(version, self.client_id.clone(), steps));
        self.send_raw(msg.encode()?).await
    }

    /// Send a raw text frame.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.outgoing_tx
            .send(text.into())
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Next event, or `None` once the connection is gone and drained.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Close the connection. Pending events can still be read.
    pub fn close(self) -> mpsc::Receiver<SyncEvent> {
        self.events
    }
}
