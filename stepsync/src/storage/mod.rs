//! Persistent storage for the document snapshot and the step log.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   CommitRecord    ┌──────────────┐
//! │ SyncEngine  │ ────────────────► │  SyncStore   │  in-memory {Document, StepLog}
//! │ (guarded)   │                   │              │  swapped under one lock
//! └─────────────┘                   └──────┬───────┘
//!                                          │ one atomic write per commit
//!                                          ▼
//!                                   ┌──────────────┐
//!                                   │   Backend    │
//!                                   ├──────────────┤
//!                                   │ MemoryBackend│  nothing durable
//!                                   │ RocksBackend │  CF "document" - LZ4 snapshot
//!                                   │              │  CF "steps"    - retained steps
//!                                   │              │  CF "commits"  - latest commit record
//!                                   └──────────────┘
//! ```
//!
//! A commit is one [`CommitRecord`]: the new snapshot plus the appended
//! steps. Backends persist it as a single unit, so a crash never leaves the
//! snapshot and the log disagreeing.

pub mod commit;
pub mod rocks;
pub mod step_log;
pub mod store;

pub use commit::{CommitRecord, StoredStep};
pub use rocks::{RocksBackend, RocksConfig};
pub use step_log::{StepLog, DEFAULT_MAX_STORED_STEPS};
pub use store::{CatchUp, SyncStore};

use crate::document::{Document, StepRecord};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("database error: {0}")]
    Database(String),
    /// Column family missing from an opened database
    #[error("column family '{0}' not found")]
    MissingColumnFamily(&'static str),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    /// Commit record failed checksum verification
    #[error("checksum mismatch in commit record for version {version}")]
    ChecksumMismatch { version: u64 },
    /// Appended step does not follow the log's latest version
    #[error("non-contiguous step version: expected {expected}, found {found}")]
    NonContiguous { expected: u64, found: u64 },
    /// Commit was built against a version that is no longer current
    #[error("version mismatch: commit based on {expected}, store is at {actual}")]
    VersionMismatch { expected: u64, actual: u64 },
    /// Injected or backend-specific I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// State recovered from a durable backend at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovered {
    pub document: Document,
    /// Retained steps, ascending by version
    pub steps: Vec<StepRecord>,
}

/// Durable side of the store.
///
/// `write_commit` must be atomic: either the whole record (snapshot, new
/// steps, eviction of steps below `retain_from`) is persisted or none of it.
pub trait Backend: Send + Sync {
    /// Load the last committed state, or `None` for a fresh store.
    fn load(&self) -> Result<Option<Recovered>, StoreError>;

    /// Persist one commit. Steps with version `< retain_from` are evicted.
    fn write_commit(&self, record: &CommitRecord, retain_from: u64) -> Result<(), StoreError>;

    /// Short name for logging.
    fn name(&self) -> &'static str;
}

/// Backend that keeps nothing; state lives only in [`SyncStore`] memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBackend;

impl Backend for MemoryBackend {
    fn load(&self) -> Result<Option<Recovered>, StoreError> {
        Ok(None)
    }

    fn write_commit(&self, _record: &CommitRecord, _retain_from: u64) -> Result<(), StoreError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
