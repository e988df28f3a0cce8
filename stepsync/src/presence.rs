//! Connected-session tracking and `presenceCount` fan-out.
//!
//! ```text
//! connect ──► on_join(id) ──┐
//!                           ├── lock ── update set ── broadcast {count} ── unlock
//! close   ──► on_leave(id) ─┘
//! ```
//!
//! The count is broadcast while the session set is still locked, so the
//! frames enter the channel in the same order as the joins and leaves that
//! produced them. Every session therefore observes a monotone sequence
//! (1, 2, 3, 4 then 4, 3) instead of an interleaving.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::protocol::ServerMessage;

#[derive(Debug, Clone)]
struct Session {
    connected_at: Instant,
}

pub struct PresenceTracker {
    sessions: Mutex<HashMap<Uuid, Session>>,
    broadcast: Arc<BroadcastGroup>,
}

impl PresenceTracker {
    pub fn new(broadcast: Arc<BroadcastGroup>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            broadcast,
        }
    }

    /// Register a session and broadcast the new count.
    ///
    /// Joining twice with the same id counts once.
    pub fn on_join(&self, session_id: Uuid) -> usize {
        let mut sessions = self.sessions.lock();
        sessions.entry(session_id).or_insert_with(|| Session {
            connected_at: Instant::now(),
        });
        let count = sessions.len();
        self.announce(count);
        log::info!("Session {session_id} joined ({count} connected)");
        count
    }

    /// Unregister a session and broadcast the new count.
    ///
    /// Unknown ids are ignored and nothing is broadcast.
    pub fn on_leave(&self, session_id: Uuid) -> usize {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.remove(&session_id) else {
            return sessions.len();
        };
        let count = sessions.len();
        self.announce(count);
        log::info!(
            "Session {session_id} left after {:?} ({count} connected)",
            session.connected_at.elapsed()
        );
        count
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn contains(&self, session_id: &Uuid) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    /// How long `session_id` has been connected.
    pub fn connected_for(&self, session_id: &Uuid) -> Option<Duration> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|s| s.connected_at.elapsed())
    }

    fn announce(&self, count: usize) {
        if let Err(e) = self.broadcast.broadcast(&ServerMessage::PresenceCount { count }) {
            log::error!("Failed to broadcast presence count: {e}");
        }
    }
}
