//! Fan-out of server frames to every connected session.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Frames
//! are encoded once and share one `Arc<String>`, so N sessions cost one
//! serialization. Each receiver buffers up to `capacity` frames; a session
//! that falls further behind gets `Lagged` and must resync, it never blocks
//! the others.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::{ProtocolError, ServerMessage};

/// A pre-encoded text frame.
#[derive(Debug, Clone)]
pub struct Frame {
    text: Arc<String>,
    /// Set for `update` frames: the version a receiver reaches by applying it
    version: Option<u64>,
}

impl Frame {
    /// Frame with no version attached.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Arc::new(text.into()),
            version: None,
        }
    }

    pub fn encode(msg: &ServerMessage) -> Result<Self, ProtocolError> {
        let version = match msg {
            ServerMessage::Update { version, .. } => Some(*version),
            _ => None,
        };
        Ok(Self {
            text: Arc::new(msg.encode()?),
            version,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn update_version(&self) -> Option<u64> {
        self.version
    }

    /// True if both frames came from the same send.
    pub fn shares_text(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.text, &other.text)
    }
}

impl Deref for Frame {
    type Target = str;

    fn deref(&self) -> &str {
        &self.text
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Sends that found no subscriber
    pub messages_unheard: u64,
    pub receivers: usize,
}

/// Atomic stats, so the send path never takes a lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_unheard: AtomicU64,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }

    /// Encode once and send to every subscriber.
    ///
    /// Returns the number of receivers the frame reached.
    pub fn broadcast(&self, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(Frame::encode(msg)?))
    }

    /// Send an already-encoded frame.
    pub fn broadcast_raw(&self, frame: Frame) -> usize {
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(frame) {
            Ok(count) => count,
            Err(_) => {
                self.stats.messages_unheard.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_unheard: self.stats.messages_unheard.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
