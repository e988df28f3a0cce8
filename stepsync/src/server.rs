//! WebSocket connection manager.
//!
//! Architecture:
//! ```text
//! Session A ──┐                        ┌── SubmissionQueue ── SyncEngine ── SyncStore ── Backend
//!             ├── handle_connection ───┤                          │
//! Session B ──┘        │               │                   on_commit (serialized)
//!                      │               │                          │
//!                      │               └── PresenceTracker ───────┤
//!                      │                                          ▼
//!                      └──────────── subscribe ◄────────── BroadcastGroup
//! ```
//!
//! Per session:
//! - subscribe to the broadcast group, then send `init` with the current
//!   document; a commit landing between the two is already in the snapshot,
//!   so its buffered `update` (version at or below the init) is dropped
//! - register with the presence tracker (everyone gets `presenceCount`)
//! - route each inbound `update` through the submission queue and answer
//!   conflicts and errors to the submitter only
//! - on close, unregister (everyone gets the lower `presenceCount`)
//!
//! Committed updates are broadcast by the engine's commit listener before
//! the next commit can start, so every session sees them in version order.
//! A session that lags past the broadcast buffer is sent a fresh `init`.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats, Frame};
use crate::config::{ConfigError, SyncConfig};
use crate::document::{DocumentModel, StepRecord};
use crate::engine::{CommitListener, SubmitOutcome, SyncEngine};
use crate::guard::Guard;
use crate::presence::PresenceTracker;
use crate::protocol::{ClientMessage, ErrorKind, ProtocolError, ServerMessage};
use crate::queue::SubmissionQueue;
use crate::storage::{RocksBackend, StoreError, SyncStore};

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub commits: u64,
    pub conflicts: u64,
    /// Busy, step-rejected, storage and internal outcomes
    pub rejections: u64,
    /// Frames that failed to decode or validate
    pub invalid_messages: u64,
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for ServerError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ServerError::Protocol(e.into())
    }
}

/// Broadcasts every commit as an `update` frame.
struct BroadcastOnCommit {
    broadcast: Arc<BroadcastGroup>,
}

impl CommitListener for BroadcastOnCommit {
    fn on_commit(&self, new_version: u64, steps: &[StepRecord]) {
        let msg = ServerMessage::Update {
            version: new_version,
            steps: steps.to_vec(),
        };
        match self.broadcast.broadcast(&msg) {
            Ok(receivers) => {
                log::trace!("Version {new_version} broadcast to {receivers} sessions")
            }
            Err(e) => log::error!("Failed to broadcast version {new_version}: {e}"),
        }
    }
}

/// What a session does with one broadcast receive.
#[derive(Debug, PartialEq, Eq)]
enum Relay {
    Send(String),
    Skip,
    Close,
}

struct Shared {
    engine: Arc<SyncEngine>,
    queue: SubmissionQueue,
    broadcast: Arc<BroadcastGroup>,
    presence: PresenceTracker,
    stats: RwLock<ServerStats>,
    max_steps_per_update: usize,
}

/// The sync server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncServer {
    config: SyncConfig,
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Open storage (recovering any persisted state) and wire the engine.
    pub fn new(config: SyncConfig, model: Arc<dyn DocumentModel>) -> Result<Self, ServerError> {
        config.validate()?;

        let retention = config.engine.max_stored_steps;
        let store = match config.storage.rocks_config() {
            Some(rocks) => {
                let backend = RocksBackend::open(rocks)?;
                SyncStore::open(Box::new(backend), model.seed(), retention)?
            }
            None => SyncStore::in_memory(model.seed(), retention),
        };

        let broadcast = Arc::new(BroadcastGroup::new(config.server.broadcast_capacity));
        let listener = Arc::new(BroadcastOnCommit {
            broadcast: broadcast.clone(),
        });
        let engine = Arc::new(
            SyncEngine::new(
                Arc::new(store),
                model,
                Guard::new(config.engine.lease_timeout()),
            )
            .with_listener(listener),
        );
        let queue = SubmissionQueue::new(
            engine.clone(),
            config.server.busy_policy,
            config.server.queue_capacity,
        )?;

        let shared = Arc::new(Shared {
            engine,
            queue,
            presence: PresenceTracker::new(broadcast.clone()),
            broadcast,
            stats: RwLock::new(ServerStats::default()),
            max_steps_per_update: config.server.max_steps_per_update,
        });

        Ok(Self { config, shared })
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let listener = TcpListener::bind(&self.config.server.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind, then serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Bind and serve on a background task; returns the bound address.
    pub async fn spawn(&self) -> Result<SocketAddr, ServerError> {
        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                log::error!("Sync server stopped: {e}");
            }
        });
        Ok(addr)
    }

    /// Accept loop.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<Shared>,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let session_id = Uuid::new_v4();
        log::info!("Session {session_id} established from {addr}");

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::run_session(&shared, session_id, ws_stream).await;

        shared.presence.on_leave(session_id);
        shared.stats.write().await.active_connections -= 1;
        log::info!("Session {session_id} from {addr} closed");
        result
    }

    async fn run_session(
        shared: &Shared,
        session_id: Uuid,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let mut broadcast_rx = shared.broadcast.subscribe();
        // Highest version this session's client is known to hold
        let mut synced = 0;
        let init = Self::init_frame(shared, &mut synced)?;
        ws_sender.send(Message::text(init)).await?;
        shared.presence.on_join(session_id);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            shared.stats.write().await.total_messages += 1;
                            if let Some(reply) = Self::handle_text(shared, session_id, text.as_str()).await {
                                if let ServerMessage::Init { version, .. }
                                | ServerMessage::Update { version, .. } = &reply
                                {
                                    synced = synced.max(*version);
                                }
                                ws_sender.send(Message::text(reply.encode()?)).await?;
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            shared.stats.write().await.invalid_messages += 1;
                            let reply = ServerMessage::error(
                                ErrorKind::Invalid,
                                "binary frames are not supported",
                                false,
                            );
                            ws_sender.send(Message::text(reply.encode()?)).await?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::warn!("WebSocket error in session {session_id}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                received = broadcast_rx.recv() => {
                    match Self::relay(shared, session_id, &mut synced, received)? {
                        Relay::Send(text) => ws_sender.send(Message::text(text)).await?,
                        Relay::Skip => {}
                        Relay::Close => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Encoded `init` for the current document; moves `synced` to its version.
    fn init_frame(shared: &Shared, synced: &mut u64) -> Result<String, ServerError> {
        let document = shared.engine.document();
        *synced = document.version;
        let init = ServerMessage::Init {
            version: document.version,
            content: document.content,
        };
        Ok(init.encode()?)
    }

    /// Decide what to forward for one broadcast receive.
    ///
    /// Updates the client already holds are dropped. A session that lagged
    /// lost frames for good, so it is resynced with a full `init` instead.
    fn relay(
        shared: &Shared,
        session_id: Uuid,
        synced: &mut u64,
        received: Result<Frame, RecvError>,
    ) -> Result<Relay, ServerError> {
        match received {
            Ok(frame) => match frame.update_version() {
                Some(version) if version <= *synced => {
                    log::trace!("Session {session_id} already at {synced}, dropping update {version}");
                    Ok(Relay::Skip)
                }
                Some(version) => {
                    *synced = version;
                    Ok(Relay::Send(frame.as_str().to_owned()))
                }
                None => Ok(Relay::Send(frame.as_str().to_owned())),
            },
            Err(RecvError::Lagged(n)) => {
                log::warn!("Session {session_id} lagged by {n} frames, resyncing with init");
                Ok(Relay::Send(Self::init_frame(shared, synced)?))
            }
            Err(RecvError::Closed) => Ok(Relay::Close),
        }
    }

    /// Decode, validate and submit one inbound frame. Returns the reply for
    /// the submitter, if any; commits reach everyone through the broadcast.
    async fn handle_text(shared: &Shared, session_id: Uuid, text: &str) -> Option<ServerMessage> {
        let request = match ClientMessage::decode(text) {
            Ok(ClientMessage::Update(request)) => request,
            Err(e) => {
                log::warn!("Malformed frame from session {session_id}: {e}");
                shared.stats.write().await.invalid_messages += 1;
                return Some(ServerMessage::error(ErrorKind::Invalid, e.to_string(), false));
            }
        };
        if let Err(e) = request.validate(shared.max_steps_per_update) {
            log::warn!("Invalid update from session {session_id}: {e}");
            shared.stats.write().await.invalid_messages += 1;
            return Some(ServerMessage::error(ErrorKind::Invalid, e.to_string(), false));
        }

        let outcome = shared.queue.submit(request.into()).await;
        let mut stats = shared.stats.write().await;
        match outcome {
            SubmitOutcome::Committed { .. } => {
                stats.commits += 1;
                None
            }
            SubmitOutcome::VersionConflict {
                current_version,
                steps,
                history_complete,
                ..
            } => {
                stats.conflicts += 1;
                if history_complete {
                    Some(ServerMessage::Update {
                        version: current_version,
                        steps,
                    })
                } else {
                    // Needed steps were evicted; resync from a full snapshot
                    let document = shared.engine.document();
                    Some(ServerMessage::Init {
                        version: document.version,
                        content: document.content,
                    })
                }
            }
            SubmitOutcome::Busy => {
                stats.rejections += 1;
                Some(ServerMessage::error(
                    ErrorKind::Busy,
                    "another update is being applied, retry",
                    true,
                ))
            }
            SubmitOutcome::StepApplicationFailure { index, reason } => {
                stats.rejections += 1;
                Some(ServerMessage::error(
                    ErrorKind::StepRejected,
                    format!("step {index}: {reason}"),
                    false,
                ))
            }
            SubmitOutcome::StorageFailure { reason } => {
                stats.rejections += 1;
                Some(ServerMessage::error(ErrorKind::Storage, reason, true))
            }
            SubmitOutcome::Invalid { reason } => {
                stats.invalid_messages += 1;
                Some(ServerMessage::error(ErrorKind::Invalid, reason, false))
            }
            SubmitOutcome::Internal { reason } => {
                stats.rejections += 1;
                Some(ServerMessage::error(ErrorKind::Internal, reason, false))
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.shared.broadcast.stats()
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.shared.engine
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.shared.presence
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}
