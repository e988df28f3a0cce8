//! Async front door to the synchronous engine.
//!
//! ```text
//!  BusyPolicy::Reject                      BusyPolicy::Queue
//!
//!  submit ─► spawn_blocking ─► engine      submit ─► try_send ─► [ job | job | … ] ─► worker ─► engine
//!               Busy ─► caller                          full ─► Busy         (one thread, FIFO)
//! ```
//!
//! Under `Reject` every submission races for the guard and losers get
//! [`SubmitOutcome::Busy`]. Under `Queue` one worker thread drains a bounded
//! channel, so submissions run strictly in arrival order and `Busy` only
//! means the queue is full.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::config::BusyPolicy;
use crate::engine::{SubmitOutcome, SyncEngine};
use crate::protocol::UpdateRequest;

/// One submission as the engine sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub base_version: u64,
    pub client_id: String,
    pub steps: Vec<Value>,
}

impl From<UpdateRequest> for SubmitRequest {
    fn from(req: UpdateRequest) -> Self {
        Self {
            base_version: req.version,
            client_id: req.client_id,
            steps: req.steps,
        }
    }
}

struct Job {
    request: SubmitRequest,
    reply: oneshot::Sender<SubmitOutcome>,
}

enum Mode {
    Reject,
    Queue { jobs: mpsc::Sender<Job>, capacity: usize },
}

pub struct SubmissionQueue {
    engine: Arc<SyncEngine>,
    mode: Mode,
}

impl SubmissionQueue {
    /// Build the queue; under `Queue` this starts the worker thread.
    pub fn new(
        engine: Arc<SyncEngine>,
        policy: BusyPolicy,
        capacity: usize,
    ) -> std::io::Result<Self> {
        let mode = match policy {
            BusyPolicy::Reject => Mode::Reject,
            BusyPolicy::Queue => {
                let capacity = capacity.max(1);
                let (jobs, rx) = mpsc::channel(capacity);
                let worker_engine = engine.clone();
                std::thread::Builder::new()
                    .name("stepsync-commit".into())
                    .spawn(move || run_worker(worker_engine, rx))?;
                Mode::Queue { jobs, capacity }
            }
        };
        Ok(Self { engine, mode })
    }

    pub fn policy(&self) -> BusyPolicy {
        match self.mode {
            Mode::Reject => BusyPolicy::Reject,
            Mode::Queue { .. } => BusyPolicy::Queue,
        }
    }

    /// Submissions waiting for the worker (always 0 under `Reject`).
    pub fn pending(&self) -> usize {
        match &self.mode {
            Mode::Reject => 0,
            Mode::Queue { jobs, capacity } => capacity - jobs.capacity(),
        }
    }

    /// Run `request` and wait for its outcome.
    pub async fn submit(&self, request: SubmitRequest) -> SubmitOutcome {
        match &self.mode {
            Mode::Reject => {
                let engine = self.engine.clone();
                let result = tokio::task::spawn_blocking(move || {
                    engine.submit_update(request.base_version, &request.client_id, request.steps)
                })
                .await;
                result.unwrap_or_else(|e| SubmitOutcome::Internal {
                    reason: e.to_string(),
                })
            }
            Mode::Queue { .. } => match self.try_enqueue(request) {
                Ok(reply) => reply.await.unwrap_or_else(|_| SubmitOutcome::Internal {
                    reason: "commit worker stopped".into(),
                }),
                Err(outcome) => outcome,
            },
        }
    }

    /// Place `request` at the back of the queue without waiting.
    ///
    /// Fails with `Busy` when the queue is full. Under `Reject` there is
    /// no queue and this fails with `Invalid`.
    pub fn try_enqueue(
        &self,
        request: SubmitRequest,
    ) -> Result<oneshot::Receiver<SubmitOutcome>, SubmitOutcome> {
        let Mode::Queue { jobs, .. } = &self.mode else {
            return Err(SubmitOutcome::Invalid {
                reason: "busy policy is reject; nothing to enqueue".into(),
            });
        };

        let (reply, rx) = oneshot::channel();
        match jobs.try_send(Job { request, reply }) {
            Ok(()) => Ok(rx),
            Err(mpsc::error::TrySendError::Full(job)) => {
                log::warn!(
                    "Submission queue full, rejecting update from {}",
                    job.request.client_id
                );
                Err(SubmitOutcome::Busy)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitOutcome::Internal {
                reason: "commit worker stopped".into(),
            }),
        }
    }
}

fn run_worker(engine: Arc<SyncEngine>, mut jobs: mpsc::Receiver<Job>) {
    log::debug!("Commit worker started");
    while let Some(Job { request, reply }) = jobs.blocking_recv() {
        wait_for_guard(&engine);
        let outcome =
            engine.submit_update(request.base_version, &request.client_id, request.steps);
        if reply.send(outcome).is_err() {
            log::debug!("Submitter of {} went away before its outcome", request.client_id);
        }
    }
    log::debug!("Commit worker stopped");
}

/// Direct engine callers can still hold the guard; wait them out, but no
/// longer than one lease.
fn wait_for_guard(engine: &SyncEngine) {
    let guard = engine.guard();
    if !guard.wait_free(guard.lease_timeout()) {
        log::debug!("Guard still held after {:?}, submitting anyway", guard.lease_timeout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentModel, StepRejected};
    use crate::model::TextModel;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::mpsc as std_mpsc;

    struct GateModel {
        inner: TextModel,
        entered: Mutex<std_mpsc::Sender<()>>,
        release: Mutex<std_mpsc::Receiver<()>>,
    }

    impl DocumentModel for GateModel {
        fn seed(&self) -> Value {
            self.inner.seed()
        }

        fn apply(&self, content: &Value, step: &Value) -> Result<Value, StepRejected> {
            if step.get("hold") == Some(&json!(true)) {
                let _ = self.entered.lock().send(());
                let _ = self.release.lock().recv();
            }
            self.inner.apply(content, step)
        }
    }

    fn gated_engine() -> (Arc<SyncEngine>, std_mpsc::Receiver<()>, std_mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        let model = GateModel {
            inner: TextModel::with_seed(""),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        let engine = Arc::new(SyncEngine::in_memory(Arc::new(model), 100));
        (engine, entered_rx, release_tx)
    }

    fn request(base: u64, client: &str, text: &str, hold: bool) -> SubmitRequest {
        let mut step = TextModel::insert(base as usize, text);
        if hold {
            step["hold"] = json!(true);
        }
        SubmitRequest {
            base_version: base,
            client_id: client.into(),
            steps: vec![step],
        }
    }

    #[tokio::test]
    async fn test_reject_policy_commits() {
        let engine = Arc::new(SyncEngine::in_memory(Arc::new(TextModel::with_seed("")), 10));
        let queue = SubmissionQueue::new(engine.clone(), BusyPolicy::Reject, 0).unwrap();
        assert_eq!(queue.policy(), BusyPolicy::Reject);

        let outcome = queue.submit(request(0, "A", "a", false)).await;
        assert!(outcome.is_committed());
        assert_eq!(engine.version(), 1);
        assert_eq!(queue.pending(), 0);
        assert!(queue.try_enqueue(request(1, "A", "b", false)).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reject_policy_reports_busy() {
        let (engine, entered, release) = gated_engine();
        let queue = Arc::new(SubmissionQueue::new(engine.clone(), BusyPolicy::Reject, 0).unwrap());

        let first = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.submit(request(0, "A", "a", true)).await })
        };
        tokio::task::spawn_blocking(move || entered.recv().unwrap())
            .await
            .unwrap();

        assert_eq!(queue.submit(request(0, "B", "b", false)).await, SubmitOutcome::Busy);

        release.send(()).unwrap();
        assert!(first.await.unwrap().is_committed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queue_runs_in_arrival_order() {
        let (engine, entered, release) = gated_engine();
        let queue = SubmissionQueue::new(engine.clone(), BusyPolicy::Queue, 8).unwrap();
        assert_eq!(queue.policy(), BusyPolicy::Queue);

        let first = queue.try_enqueue(request(0, "A", "a", true)).unwrap();
        tokio::task::spawn_blocking(move || entered.recv().unwrap())
            .await
            .unwrap();

        // Each later request builds on the one before it
        let second = queue.try_enqueue(request(1, "B", "b", false)).unwrap();
        let third = queue.try_enqueue(request(2, "C", "c", false)).unwrap();
        assert_eq!(queue.pending(), 2);

        release.send(()).unwrap();
        assert!(matches!(first.await.unwrap(), SubmitOutcome::Committed { new_version: 1, .. }));
        assert!(matches!(second.await.unwrap(), SubmitOutcome::Committed { new_version: 2, .. }));
        assert!(matches!(third.await.unwrap(), SubmitOutcome::Committed { new_version: 3, .. }));

        let text = TextModel::text_of(&engine.document().content).unwrap().to_string();
        assert_eq!(text, "abc");
        let clients: Vec<String> = engine.steps_since(0).into_iter().map(|s| s.client_id).collect();
        assert_eq!(clients, vec!["A", "B", "C"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_is_busy() {
        let (engine, entered, release) = gated_engine();
        let queue = SubmissionQueue::new(engine, BusyPolicy::Queue, 2).unwrap();

        let held = queue.try_enqueue(request(0, "A", "a", true)).unwrap();
        tokio::task::spawn_blocking(move || entered.recv().unwrap())
            .await
            .unwrap();

        let _b = queue.try_enqueue(request(1, "B", "b", false)).unwrap();
        let _c = queue.try_enqueue(request(2, "C", "c", false)).unwrap();
        assert_eq!(
            queue.try_enqueue(request(3, "D", "d", false)).unwrap_err(),
            SubmitOutcome::Busy
        );
        assert_eq!(queue.submit(request(3, "D", "d", false)).await, SubmitOutcome::Busy);

        release.send(()).unwrap();
        assert!(held.await.unwrap().is_committed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_waits_for_direct_holder() {
        let engine = Arc::new(SyncEngine::in_memory(Arc::new(TextModel::with_seed("")), 10));
        let queue = SubmissionQueue::new(engine.clone(), BusyPolicy::Queue, 4).unwrap();

        let lease = engine.guard().try_acquire().unwrap();
        let reply = queue.try_enqueue(request(0, "A", "a", false)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(engine.version(), 0);

        // The worker wakes on release instead of reporting Busy
        lease.release();
        assert!(matches!(reply.await.unwrap(), SubmitOutcome::Committed { new_version: 1, .. }));
    }

    #[test]
    fn test_from_update_request() {
        let req = UpdateRequest::new(4, "A", vec![json!(1)]);
        let submit = SubmitRequest::from(req);
        assert_eq!(submit.base_version, 4);
        assert_eq!(submit.client_id, "A");
        assert_eq!(submit.steps, vec![json!(1)]);
    }
}
