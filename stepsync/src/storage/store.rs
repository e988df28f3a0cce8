//! In-memory committed state in front of a durable backend.
//!
//! Readers take a shared lock and see `{Document, StepLog}` as one value, so
//! a read never observes a new snapshot with an old log (or the reverse).
//! Commits are serialized by a separate commit lock; the backend write runs
//! before the in-memory swap, so memory never runs ahead of durable state.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use super::{Backend, CommitRecord, MemoryBackend, StepLog, StoreError};
use crate::document::{Document, StepRecord};

#[derive(Debug)]
struct Committed {
    document: Document,
    log: StepLog,
}

/// What a client at some version needs to reach the current one.
#[derive(Debug, Clone, PartialEq)]
pub struct CatchUp {
    pub document: Document,
    /// Retained steps after the requested version
    pub steps: Vec<StepRecord>,
    /// False when some needed steps were already evicted
    pub complete: bool,
}

pub struct SyncStore {
    state: RwLock<Committed>,
    /// Serializes writers; the guard lease may expire, this lock cannot
    commit_lock: Mutex<()>,
    backend: Box<dyn Backend>,
}

impl SyncStore {
    /// Open over `backend`, recovering its state or seeding version 0.
    pub fn open(
        backend: Box<dyn Backend>,
        seed: Value,
        retention: usize,
    ) -> Result<Self, StoreError> {
        let committed = match backend.load()? {
            Some(recovered) => {
                let log = StepLog::from_records(retention, recovered.steps)?;
                log::info!(
                    "Opened {} store at version {} ({} steps retained)",
                    backend.name(),
                    recovered.document.version,
                    log.len()
                );
                Committed {
                    document: recovered.document,
                    log,
                }
            }
            None => {
                log::info!("Opened {} store with seed document", backend.name());
                Committed {
                    document: Document::seed(seed),
                    log: StepLog::new(retention),
                }
            }
        };

        Ok(Self {
            state: RwLock::new(committed),
            commit_lock: Mutex::new(()),
            backend,
        })
    }

    /// Store with nothing durable behind it.
    pub fn in_memory(seed: Value, retention: usize) -> Self {
        Self {
            state: RwLock::new(Committed {
                document: Document::seed(seed),
                log: StepLog::new(retention),
            }),
            commit_lock: Mutex::new(()),
            backend: Box::new(MemoryBackend),
        }
    }

    /// Current snapshot.
    pub fn get(&self) -> Document {
        self.state.read().document.clone()
    }

    /// Current snapshot together with retained steps after `version`,
    /// read atomically.
    pub fn catch_up(&self, version: u64) -> CatchUp {
        let state = self.state.read();
        let current = state.document.version;
        let complete =
            version >= current || (!state.log.is_empty() && state.log.covers(version));
        CatchUp {
            document: state.document.clone(),
            steps: state.log.get_since(version),
            complete,
        }
    }

    /// Retained steps with version greater than `version`.
    pub fn get_since(&self, version: u64) -> Vec<StepRecord> {
        self.state.read().log.get_since(version)
    }

    pub fn version(&self) -> u64 {
        self.state.read().document.version
    }

    pub fn step_count(&self) -> usize {
        self.state.read().log.len()
    }

    pub fn retention(&self) -> usize {
        self.state.read().log.retention()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Commit `record` atomically.
    ///
    /// Fails with [`StoreError::VersionMismatch`] if the store moved past
    /// `record.base_version` since the record was built. On any error the
    /// in-memory state is unchanged.
    pub fn commit(&self, record: &CommitRecord) -> Result<(), StoreError> {
        self.commit_then(record, || ())
    }

    /// Commit `record`, then run `after` before the next commit may start.
    ///
    /// Work done in `after` is ordered exactly like the commits themselves.
    /// `after` runs only when the commit succeeded.
    pub fn commit_then<R>(
        &self,
        record: &CommitRecord,
        after: impl FnOnce() -> R,
    ) -> Result<R, StoreError> {
        let _writer = self.commit_lock.lock();

        let (document, steps, retain_from) = {
            let state = self.state.read();
            let current = state.document.version;
            if record.base_version != current {
                return Err(StoreError::VersionMismatch {
                    expected: record.base_version,
                    actual: current,
                });
            }

            let steps = record.step_records()?;
            state.log.check_append(&steps)?;
            if let Some(first) = steps.first() {
                if first.version != current + 1 {
                    return Err(StoreError::NonContiguous {
                        expected: current + 1,
                        found: first.version,
                    });
                }
            }

            let retention = state.log.retention() as u64;
            let retain_from = (record.new_version + 1).saturating_sub(retention);
            (record.document()?, steps, retain_from)
        };

        self.backend.write_commit(record, retain_from)?;

        {
            let mut state = self.state.write();
            state.document = document;
            let evicted = state.log.append(steps)?;
            if evicted > 0 {
                log::trace!("Evicted {evicted} steps below version {retain_from}");
            }
        }
        Ok(after())
    }
}

impl std::fmt::Debug for SyncStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStore")
            .field("backend", &self.backend.name())
            .field("version", &self.version())
            .field("steps", &self.step_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TextModel;
    use crate::storage::Recovered;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn record_on(store: &SyncStore, client: &str, texts: &[&str]) -> CommitRecord {
        let base = store.version();
        let mut text = TextModel::text_of(&store.get().content).unwrap().to_string();
        let steps: Vec<StepRecord> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                text.push_str(t);
                StepRecord::new(TextModel::insert(0, t), base + 1 + i as u64, client)
            })
            .collect();
        CommitRecord::new(base, client, &TextModel::content(&text), &steps).unwrap()
    }

    /// Backend that fails on demand.
    #[derive(Default)]
    struct FlakyBackend {
        fail: Arc<AtomicBool>,
    }

    impl Backend for FlakyBackend {
        fn load(&self) -> Result<Option<Recovered>, StoreError> {
            Ok(None)
        }

        fn write_commit(&self, _: &CommitRecord, _: u64) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(StoreError::Io("disk full".into()))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[test]
    fn test_seeded_store() {
        let store = SyncStore::in_memory(TextModel::content("seed"), 10);
        assert_eq!(store.version(), 0);
        assert_eq!(store.step_count(), 0);
        assert_eq!(TextModel::text_of(&store.get().content), Some("seed"));
        assert_eq!(store.backend_name(), "memory");
    }

    #[test]
    fn test_commit_advances_version_and_log() {
        let store = SyncStore::in_memory(TextModel::content(""), 10);
        store.commit(&record_on(&store, "A", &["a", "b"])).unwrap();
        store.commit(&record_on(&store, "B", &["c"])).unwrap();

        assert_eq!(store.version(), 3);
        assert_eq!(TextModel::text_of(&store.get().content), Some("abc"));

        let since = store.get_since(1);
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].version, 2);
        assert_eq!(since[1].client_id, "B");
    }

    #[test]
    fn test_stale_base_rejected() {
        let store = SyncStore::in_memory(TextModel::content(""), 10);
        let stale = record_on(&store, "A", &["a"]);
        store.commit(&record_on(&store, "B", &["b"])).unwrap();

        let err = store.commit(&stale).unwrap_err();
        assert_eq!(err, StoreError::VersionMismatch { expected: 0, actual: 1 });
        assert_eq!(store.version(), 1);
        assert_eq!(TextModel::text_of(&store.get().content), Some("b"));
    }

    #[test]
    fn test_retention_applied_on_commit() {
        let store = SyncStore::in_memory(TextModel::content(""), 3);
        for _ in 0..5 {
            store.commit(&record_on(&store, "A", &["x"])).unwrap();
        }
        assert_eq!(store.step_count(), 3);
        let versions: Vec<u64> = store.get_since(0).iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![3, 4, 5]);
    }

    #[test]
    fn test_backend_failure_leaves_state_unchanged() {
        let fail = Arc::new(AtomicBool::new(false));
        let backend = FlakyBackend { fail: fail.clone() };
        let store = SyncStore::open(Box::new(backend), TextModel::content(""), 10).unwrap();

        store.commit(&record_on(&store, "A", &["a"])).unwrap();
        fail.store(true, Ordering::SeqCst);

        let err = store.commit(&record_on(&store, "A", &["b"])).unwrap_err();
        assert_eq!(err, StoreError::Io("disk full".into()));
        assert_eq!(store.version(), 1);
        assert_eq!(store.step_count(), 1);
        assert_eq!(TextModel::text_of(&store.get().content), Some("a"));

        fail.store(false, Ordering::SeqCst);
        store.commit(&record_on(&store, "A", &["b"])).unwrap();
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn test_catch_up() {
        let store = SyncStore::in_memory(TextModel::content(""), 3);
        assert!(store.catch_up(0).complete);

        store.commit(&record_on(&store, "A", &["a", "b"])).unwrap();
        let catch_up = store.catch_up(0);
        assert_eq!(catch_up.document.version, 2);
        assert_eq!(catch_up.steps.len(), 2);
        assert!(catch_up.complete);

        store.commit(&record_on(&store, "A", &["c", "d"])).unwrap();
        // Retained: 2, 3, 4
        assert!(!store.catch_up(0).complete);
        assert!(store.catch_up(1).complete);
        assert!(store.catch_up(4).complete);
        assert!(store.catch_up(4).steps.is_empty());
    }

    #[test]
    fn test_open_recovers_backend_state() {
        struct Fixed;
        impl Backend for Fixed {
            fn load(&self) -> Result<Option<Recovered>, StoreError> {
                let steps = (1..=5)
                    .map(|v| StepRecord::new(TextModel::insert(0, "x"), v, "A"))
                    .collect();
                Ok(Some(Recovered {
                    document: Document {
                        version: 5,
                        content: TextModel::content("xxxxx"),
                    },
                    steps,
                }))
            }
            fn write_commit(&self, _: &CommitRecord, _: u64) -> Result<(), StoreError> {
                Ok(())
            }
            fn name(&self) -> &'static str {
                "fixed"
            }
        }

        let store = SyncStore::open(Box::new(Fixed), TextModel::content("ignored"), 2).unwrap();
        assert_eq!(store.version(), 5);
        assert_eq!(store.step_count(), 2);
        assert_eq!(TextModel::text_of(&store.get().content), Some("xxxxx"));
    }

    #[test]
    fn test_next_commit_waits_for_after_hook() {
        use std::sync::mpsc;

        let store = Arc::new(SyncStore::in_memory(TextModel::content(""), 10));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let first = {
            let (store, seen) = (store.clone(), seen.clone());
            let record = record_on(&store, "A", &["a"]);
            std::thread::spawn(move || {
                store
                    .commit_then(&record, || {
                        entered_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        seen.lock().push(1);
                    })
                    .unwrap();
            })
        };
        entered_rx.recv().unwrap();
        // Version 1 is visible to readers while its hook still runs
        assert_eq!(store.version(), 1);

        let second = {
            let (store, seen) = (store.clone(), seen.clone());
            let record = record_on(&store, "B", &["b"]);
            std::thread::spawn(move || {
                store.commit_then(&record, || seen.lock().push(2)).unwrap();
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(seen.lock().is_empty());
        assert_eq!(store.version(), 1);

        release_tx.send(()).unwrap();
        first.join().unwrap();
        second.join().unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn test_after_hook_skipped_on_conflict() {
        let store = SyncStore::in_memory(TextModel::content(""), 10);
        let stale = record_on(&store, "A", &["a"]);
        store.commit(&record_on(&store, "B", &["b"])).unwrap();

        let mut ran = false;
        let err = store.commit_then(&stale, || ran = true).unwrap_err();
        assert!(matches!(err, StoreError::VersionMismatch { .. }));
        assert!(!ran);
    }

    #[test]
    fn test_concurrent_commits_serialize() {
        let store = Arc::new(SyncStore::in_memory(TextModel::content(""), 100));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let client = format!("c{t}");
                    let mut committed = 0;
                    while committed < 10 {
                        let record = record_on(&store, &client, &["x"]);
                        if store.commit(&record).is_ok() {
                            committed += 1;
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.version(), 40);
        let versions: Vec<u64> = store.get_since(0).iter().map(|s| s.version).collect();
        assert_eq!(versions, (1..=40).collect::<Vec<_>>());
    }
}
