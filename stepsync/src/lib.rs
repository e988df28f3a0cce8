//! # stepsync: versioned step synchronization server
//!
//! Keeps one authoritative document in sync across many WebSocket
//! sessions. Clients submit batches of opaque steps against the version
//! they last saw; the server applies them only if that version is still
//! current, then fans the new steps out to everyone.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄────────────────► │  SyncServer  │
//! │ (per user)  │    JSON frames     │  (sessions)  │
//! └─────────────┘                    └──────┬───────┘
//!                                           │ SubmissionQueue
//!                                           ▼
//!                                    ┌──────────────┐   Guard lease
//!                                    │  SyncEngine  │ ◄──────────────
//!                                    │ (1 writer)   │   DocumentModel::apply
//!                                    └──────┬───────┘
//!                           CommitRecord    │        on_commit
//!                     ┌─────────────────────┴─────────────┐
//!                     ▼                                   ▼
//!              ┌─────────────┐                     ┌───────────────┐
//!              │  SyncStore  │                     │ BroadcastGroup│
//!              │ doc + steps │                     │ (fan-out)     │
//!              └──────┬──────┘                     └───────────────┘
//!                     ▼
//!          MemoryBackend | RocksBackend
//! ```
//!
//! ## Modules
//!
//! - [`document`]: snapshot, step records, the `DocumentModel` seam
//! - [`model`]: reference plain-text model
//! - [`guard`]: transaction lease with expiry
//! - [`storage`]: step log, commit records, store, backends
//! - [`engine`]: the guarded synchronization transaction
//! - [`queue`]: busy policy and FIFO submission queue
//! - [`presence`]: connected-session count
//! - [`broadcast`]: fan-out with backpressure
//! - [`protocol`]: JSON wire protocol
//! - [`server`] / [`client`]: WebSocket endpoints
//! - [`config`]: TOML configuration

pub mod broadcast;
pub mod client;
pub mod config;
pub mod document;
pub mod engine;
pub mod guard;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use config::{BusyPolicy, ConfigError, SyncConfig};
pub use document::{Document, DocumentModel, StepRecord, StepRejected};
pub use engine::{CommitListener, SubmitOutcome, SyncEngine};
pub use guard::{Guard, GuardLease};
pub use model::TextModel;
pub use presence::PresenceTracker;
pub use protocol::{ClientMessage, ErrorKind, ProtocolError, ServerMessage, UpdateRequest};
pub use queue::{SubmissionQueue, SubmitRequest};
pub use server::{ServerError, ServerStats, SyncServer};
pub use storage::{
    Backend, CatchUp, CommitRecord, MemoryBackend, RocksBackend, RocksConfig, StepLog,
    StoreError, SyncStore,
};
