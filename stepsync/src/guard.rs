//! Process-wide transaction guard with lease expiry.
//!
//! At most one synchronization transaction holds the guard at a time.
//! Acquisition never blocks: callers get a [`GuardLease`] or nothing.
//!
//! ```text
//!   try_acquire ──► free?      ──yes──► lease(gen N)
//!                    │ no
//!                    ▼
//!               lease older than timeout? ──yes──► reclaim, lease(gen N+1)
//!                    │ no
//!                    ▼
//!                  None (Busy)
//! ```
//!
//! The lease is released when dropped, so every exit path of the critical
//! section (early return, error, panic unwind) frees it. A holder that hangs
//! past `lease_timeout` loses the lease to the next caller; its generation
//! goes stale and its eventual release is a no-op.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default lease timeout.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Holder {
    generation: u64,
    acquired_at: Instant,
}

#[derive(Debug, Default)]
struct GuardState {
    holder: Option<Holder>,
    next_generation: u64,
    reclaimed: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<GuardState>,
    /// Signalled whenever the current holder lets go
    released: Condvar,
}

/// The guard. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct Guard {
    shared: Arc<Shared>,
    lease_timeout: Duration,
}

impl Guard {
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            lease_timeout,
        }
    }

    /// Non-blocking exclusive acquisition.
    pub fn try_acquire(&self) -> Option<GuardLease> {
        let mut state = self.shared.state.lock();

        if let Some(holder) = &state.holder {
            let held_for = holder.acquired_at.elapsed();
            if held_for < self.lease_timeout {
                return None;
            }
            log::warn!(
                "Guard lease {} expired after {:?}, reclaiming",
                holder.generation,
                held_for
            );
            state.reclaimed += 1;
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        state.holder = Some(Holder {
            generation,
            acquired_at: Instant::now(),
        });

        Some(GuardLease {
            shared: self.shared.clone(),
            generation,
            released: false,
        })
    }

    /// Whether some lease is currently outstanding (expired or not).
    pub fn is_held(&self) -> bool {
        self.shared.state.lock().holder.is_some()
    }

    /// Block until no lease is outstanding or `max_wait` elapses.
    ///
    /// Returns true if the guard was observed free. An expired lease still
    /// counts as outstanding here; `try_acquire` is what reclaims it.
    pub fn wait_free(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        let mut state = self.shared.state.lock();
        while state.holder.is_some() {
            if self
                .shared
                .released
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.holder.is_none();
            }
        }
        true
    }

    /// Number of leases reclaimed after expiry.
    pub fn reclaimed_count(&self) -> u64 {
        self.shared.state.lock().reclaimed
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }
}

impl Default for Guard {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE_TIMEOUT)
    }
}

/// Proof of guard ownership. Released on drop.
#[derive(Debug)]
pub struct GuardLease {
    shared: Arc<Shared>,
    generation: u64,
    released: bool,
}

impl GuardLease {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// False once the lease has expired and been reclaimed by someone else.
    pub fn is_current(&self) -> bool {
        matches!(&self.shared.state.lock().holder, Some(h) if h.generation == self.generation)
    }

    /// Release explicitly. Equivalent to dropping the lease.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut state = self.shared.state.lock();
        let owns = matches!(&state.holder, Some(h) if h.generation == self.generation);
        if owns {
            state.holder = None;
            self.shared.released.notify_all();
        } else {
            log::debug!("Stale guard lease {} released (no-op)", self.generation);
        }
    }
}

impl Drop for GuardLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}
