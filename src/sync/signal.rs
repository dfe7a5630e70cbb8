//! Coalescing single-slot wakeup signal.
//!
//! This module provides `Signal`, a capacity-one wakeup slot shared between
//! any number of producers and one waiting consumer. Posting while a wakeup
//! is already pending is a no-op, so a burst of notifications from fast
//! producers collapses into a single wakeup instead of queueing behind a
//! slow consumer.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A coalescing wakeup slot: at most one notification is ever pending.
#[derive(Debug)]
pub struct Signal {
    pending: Mutex<bool>,
    wakeup: Condvar,
}

impl Default for Signal {
    fn default() -> Self {
        Signal::new()
    }
}

impl Signal {
    /// Creates a signal with no wakeup pending.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    /// Posts a wakeup. Never blocks; posting onto an already-pending signal
    /// leaves exactly one wakeup pending.
    pub fn notify(&self) {
        let mut pending = self.pending.lock().unwrap();
        if !*pending {
            *pending = true;
            self.wakeup.notify_one();
        }
    }

    /// Blocks until a wakeup is pending, then consumes it.
    pub fn wait(&self) {
        let mut pending = self.pending.lock().unwrap();
        while !*pending {
            pending = self.wakeup.wait(pending).unwrap();
        }
        *pending = false;
    }

    /// Blocks until a wakeup is pending or `timeout` has elapsed, whichever
    /// comes first. Returns true when a wakeup was consumed, false when the
    /// deadline passed with nothing pending.
    ///
    /// The underlying timed wait is re-armed in place on spurious wakeups,
    /// so a caller looping on this method performs no per-iteration
    /// allocation.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock().unwrap();
        loop {
            if *pending {
                *pending = false;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.wakeup.wait_timeout(pending, deadline - now).unwrap();
            pending = guard;
        }
    }
}
