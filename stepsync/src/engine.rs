//! Synchronization engine: the single guarded transaction.
//!
//! ```text
//!  submit_update(base, client, steps)
//!        │
//!        ├─ steps empty? ───────────────────────────► Invalid
//!        ├─ try_acquire lease ──── none ────────────► Busy
//!        │
//!        │   ┌──────────────── lease held ────────────────┐
//!        ├─ │ base != version ─────────────────────────► VersionConflict (no mutation)
//!        ├─ │ apply each step ── rejected ─────────────► StepApplicationFailure
//!        ├─ │ one CommitRecord ── store error ─────────► StorageFailure
//!        │   └────────────────────────────────────────────┘
//!        ▼                       lease dropped on every path
//!    Committed { new_version, steps since base }
//! ```
//!
//! The engine is synchronous. Async callers run it on a blocking thread
//! (see [`crate::queue`]). Outcomes are values, never `Err`; a panic inside
//! the transaction (for example in an injected model) becomes
//! [`SubmitOutcome::Internal`].

use serde_json::Value;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::document::{Document, DocumentModel, StepRecord};
use crate::guard::{Guard, GuardLease};
use crate::storage::{CatchUp, CommitRecord, StoreError, SyncStore};

/// Result of one submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Steps applied and persisted
    Committed {
        new_version: u64,
        /// Retained records after the submitted base version
        steps: Vec<StepRecord>,
    },
    /// Base version is stale; nothing was mutated
    VersionConflict {
        base_version: u64,
        current_version: u64,
        /// Retained records after `base_version`
        steps: Vec<StepRecord>,
        /// False when records the client needs were already evicted
        history_complete: bool,
    },
    /// Another transaction holds the guard
    Busy,
    /// The document model refused step `index`; nothing was persisted
    StepApplicationFailure { index: usize, reason: String },
    /// Persisting the commit failed; nothing was mutated
    StorageFailure { reason: String },
    /// The submission is malformed
    Invalid { reason: String },
    /// The transaction panicked; nothing was mutated
    Internal { reason: String },
}

impl SubmitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    /// Whether resubmitting the same request unchanged may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy | Self::StorageFailure { .. })
    }

    /// Short label for logs and stats.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Committed { .. } => "committed",
            Self::VersionConflict { .. } => "conflict",
            Self::Busy => "busy",
            Self::StepApplicationFailure { .. } => "step-rejected",
            Self::StorageFailure { .. } => "storage-failure",
            Self::Invalid { .. } => "invalid",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Observer of successful commits.
///
/// Called before the next commit can start, so calls arrive in version
/// order even when a lease expired mid-transaction. Must not block.
pub trait CommitListener: Send + Sync {
    fn on_commit(&self, new_version: u64, steps: &[StepRecord]);
}

/// The engine. Share it behind an `Arc`.
pub struct SyncEngine {
    store: Arc<SyncStore>,
    model: Arc<dyn DocumentModel>,
    guard: Guard,
    listener: Option<Arc<dyn CommitListener>>,
}

impl SyncEngine {
    pub fn new(store: Arc<SyncStore>, model: Arc<dyn DocumentModel>, guard: Guard) -> Self {
        Self {
            store,
            model,
            guard,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn CommitListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Engine over a fresh in-memory store seeded from `model`.
    pub fn in_memory(model: Arc<dyn DocumentModel>, retention: usize) -> Self {
        let store = Arc::new(SyncStore::in_memory(model.seed(), retention));
        Self::new(store, model, Guard::default())
    }

    /// Run one synchronization transaction.
    pub fn submit_update(
        &self,
        base_version: u64,
        client_id: &str,
        steps: Vec<Value>,
    ) -> SubmitOutcome {
        if steps.is_empty() {
            return SubmitOutcome::Invalid {
                reason: "update carries no steps".into(),
            };
        }

        let Some(lease) = self.guard.try_acquire() else {
            log::debug!("Submission from {client_id} at base {base_version} found engine busy");
            return SubmitOutcome::Busy;
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.transact(&lease, base_version, client_id, steps)
        }));
        lease.release();

        match result {
            Ok(outcome) => {
                log::debug!(
                    "Submission from {client_id} at base {base_version}: {}",
                    outcome.label()
                );
                outcome
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                log::error!("Transaction from {client_id} panicked: {reason}");
                SubmitOutcome::Internal { reason }
            }
        }
    }

    fn transact(
        &self,
        lease: &GuardLease,
        base_version: u64,
        client_id: &str,
        steps: Vec<Value>,
    ) -> SubmitOutcome {
        let current = self.store.get();
        if base_version != current.version {
            return conflict(base_version, self.store.catch_up(base_version));
        }

        let mut content = current.content;
        for (index, step) in steps.iter().enumerate() {
            match self.model.apply(&content, step) {
                Ok(next) => content = next,
                Err(rejected) => {
                    log::warn!(
                        "Step {index} from {client_id} rejected at version {base_version}: {}",
                        rejected.reason
                    );
                    return SubmitOutcome::StepApplicationFailure {
                        index,
                        reason: rejected.reason,
                    };
                }
            }
        }

        let records: Vec<StepRecord> = steps
            .into_iter()
            .zip(base_version + 1..)
            .map(|(step, version)| StepRecord::new(step, version, client_id))
            .collect();

        let record = match CommitRecord::new(base_version, client_id, &content, &records) {
            Ok(record) => record,
            Err(e) => {
                log::error!("Failed to build commit record: {e}");
                return SubmitOutcome::StorageFailure {
                    reason: e.to_string(),
                };
            }
        };

        if !lease.is_current() {
            log::warn!(
                "Lease {} expired before commit of version {}",
                lease.generation(),
                record.new_version
            );
        }

        // The listener runs under the store's commit lock, so a holder whose
        // lease expired cannot have its notification overtaken by the next commit
        let committed = self.store.commit_then(&record, || {
            let steps = self.store.get_since(base_version);
            if let Some(listener) = &self.listener {
                listener.on_commit(record.new_version, &steps);
            }
            steps
        });

        match committed {
            Ok(steps) => {
                SubmitOutcome::Committed {
                    new_version: record.new_version,
                    steps,
                }
            }
            // Someone committed after our lease expired
            Err(StoreError::VersionMismatch { .. }) => {
                conflict(base_version, self.store.catch_up(base_version))
            }
            Err(e) => {
                log::error!("Commit of version {} failed: {e}", record.new_version);
                SubmitOutcome::StorageFailure {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Current committed snapshot.
    pub fn document(&self) -> Document {
        self.store.get()
    }

    pub fn version(&self) -> u64 {
        self.store.version()
    }

    /// Retained records after `version`.
    pub fn steps_since(&self, version: u64) -> Vec<StepRecord> {
        self.store.get_since(version)
    }

    pub fn catch_up(&self, version: u64) -> CatchUp {
        self.store.catch_up(version)
    }

    /// Whether a transaction currently holds the guard.
    pub fn is_busy(&self) -> bool {
        self.guard.is_held()
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }
}

fn conflict(base_version: u64, catch_up: CatchUp) -> SubmitOutcome {
    SubmitOutcome::VersionConflict {
        base_version,
        current_version: catch_up.document.version,
        steps: catch_up.steps,
        history_complete: catch_up.complete,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "transaction panicked".to_string()
    }
}
