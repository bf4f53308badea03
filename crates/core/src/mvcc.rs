//! Per-tablet MVCC state: tracks in-flight write operations and computes
//! the current "safe time" read point.
//!
//! Every write reserves a hybrid time before it starts replicating
//! ([`MvccState::add_pending`]) and releases it once applied to the
//! committed store ([`MvccState::mark_applied`]). Safe time is the largest
//! hybrid time at which a read is guaranteed to see every write that could
//! possibly have completed by then: it can never exceed the smallest
//! still-pending write's hybrid time, since that write might still land at
//! an earlier time than a naive "now" would suggest.

use crate::hybrid_time::HybridTime;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error raised by [`MvccState::safe_time`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SafeTimeError {
    /// The requested `min_allowed` bound was not reached before the
    /// deadline elapsed.
    #[error("timed out waiting for safe time to reach the requested bound")]
    TimedOut,
}

struct Inner {
    pending: BTreeSet<HybridTime>,
    propagated: HybridTime,
    last_safe_time: HybridTime,
}

/// Tracks pending writes for one tablet and serves safe-time queries.
pub struct MvccState {
    inner: Mutex<Inner>,
    condvar: Condvar,
}

impl Default for MvccState {
    fn default() -> Self {
        MvccState::new()
    }
}

impl MvccState {
    /// An empty MVCC state with no writes pending.
    pub fn new() -> Self {
        MvccState {
            inner: Mutex::new(Inner {
                pending: BTreeSet::new(),
                propagated: HybridTime::MIN,
                last_safe_time: HybridTime::MIN,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Reserve `ht` as a pending write's hybrid time. `ht` must be strictly
    /// greater than the safe time already returned to some reader, or the
    /// monotonicity guarantee of safe time would be violated.
    pub fn add_pending(&self, ht: HybridTime) -> Result<(), SafeTimeError> {
        let mut inner = self.inner.lock();
        if ht <= inner.last_safe_time {
            // A caller trying to add a pending write behind an
            // already-published safe time has a clock bug upstream; treat
            // it as an immediate (non-blocking) timeout rather than
            // silently corrupting the safe-time invariant.
            return Err(SafeTimeError::TimedOut);
        }
        inner.pending.insert(ht);
        Ok(())
    }

    /// Release a pending write once it has been applied to the committed
    /// store, advancing the propagated floor and waking any blocked
    /// `safe_time` callers.
    pub fn mark_applied(&self, ht: HybridTime) {
        let mut inner = self.inner.lock();
        inner.pending.remove(&ht);
        if ht > inner.propagated {
            inner.propagated = ht;
        }
        self.condvar.notify_all();
    }

    fn compute_locked(inner: &mut Inner) -> HybridTime {
        let candidate = match inner.pending.iter().next() {
            Some(earliest_pending) => {
                let bound = earliest_pending.raw().saturating_sub(1);
                HybridTime::from_raw(bound).min(inner.propagated)
            }
            None => inner.propagated,
        };
        if candidate > inner.last_safe_time {
            inner.last_safe_time = candidate;
        }
        inner.last_safe_time
    }

    /// The current safe time, without blocking.
    pub fn current_safe_time(&self) -> HybridTime {
        let mut inner = self.inner.lock();
        Self::compute_locked(&mut inner)
    }

    /// Advance the propagated floor directly, e.g. from a periodic
    /// heartbeat of the tablet's [`crate::hybrid_time::HybridClock`] when
    /// there are no pending writes to otherwise advance it.
    pub fn advance_propagated(&self, ht: HybridTime) {
        let mut inner = self.inner.lock();
        if ht > inner.propagated {
            inner.propagated = ht;
        }
        self.condvar.notify_all();
    }

    /// Block until the safe time reaches at least `min_allowed`, or
    /// `deadline` elapses.
    pub fn safe_time(&self, min_allowed: HybridTime, deadline: Duration) -> Result<HybridTime, SafeTimeError> {
        let start = Instant::now();
        let mut inner = self.inner.lock();
        loop {
            let current = Self::compute_locked(&mut inner);
            if current >= min_allowed {
                return Ok(current);
            }
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return Err(SafeTimeError::TimedOut);
            }
            let remaining = deadline - elapsed;
            let timed_out = self.condvar.wait_for(&mut inner, remaining).timed_out();
            if timed_out && Self::compute_locked(&mut inner) < min_allowed {
                return Err(SafeTimeError::TimedOut);
            }
        }
    }

    /// Number of writes currently pending (for diagnostics and tests).
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
