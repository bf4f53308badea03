//! The tablet's row-level lock manager.
//!
//! All row-level locking for conflict resolution lives here, and nowhere
//! else: the conflict resolver acquires locks on a batch's doc paths before
//! it ever scans the intent store. Locks are acquired in ascending byte
//! order of the path so that any two batches requesting overlapping paths
//! converge on the same acquisition order and cannot deadlock.

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tablet_core::{TabletError, TabletResult};

/// Whether a path is locked for a read (shared with other reads) or a write
/// (exclusive of everything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared among any number of readers; excludes writers.
    Shared,
    /// Exclusive of all other readers and writers.
    Exclusive,
}

struct LockState {
    readers: u32,
    writer: bool,
}

struct PathLock {
    state: Mutex<LockState>,
    condvar: Condvar,
}

impl PathLock {
    fn new() -> Self {
        PathLock {
            state: Mutex::new(LockState { readers: 0, writer: false }),
            condvar: Condvar::new(),
        }
    }

    fn acquire(&self, mode: LockMode, deadline: Instant) -> TabletResult<()> {
        let mut state = self.state.lock();
        loop {
            let can_acquire = match mode {
                LockMode::Shared => !state.writer,
                LockMode::Exclusive => !state.writer && state.readers == 0,
            };
            if can_acquire {
                match mode {
                    LockMode::Shared => state.readers += 1,
                    LockMode::Exclusive => state.writer = true,
                }
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TabletError::TimedOut("lock manager: acquire_batch deadline exceeded".into()));
            }
            let timed_out = self.condvar.wait_for(&mut state, deadline - now).timed_out();
            if timed_out {
                return Err(TabletError::TimedOut("lock manager: acquire_batch deadline exceeded".into()));
            }
        }
    }

    fn release(&self, mode: LockMode) {
        let mut state = self.state.lock();
        match mode {
            LockMode::Shared => state.readers = state.readers.saturating_sub(1),
            LockMode::Exclusive => state.writer = false,
        }
        self.condvar.notify_all();
    }
}

/// The tablet-scoped lock manager: a map from doc path to its current
/// shared/exclusive lock state. Entries are created lazily and never
/// removed — a long-lived per-path entry avoids churning through
/// create/destroy on every batch (row hotness means the same paths are
/// re-locked constantly).
#[derive(Default)]
pub struct LockManager {
    paths: parking_lot::RwLock<BTreeMap<Vec<u8>, Arc<PathLock>>>,
}

impl LockManager {
    /// A fresh, empty lock manager.
    pub fn new() -> Self {
        LockManager::default()
    }

    fn entry(&self, path: &[u8]) -> Arc<PathLock> {
        if let Some(lock) = self.paths.read().get(path) {
            return Arc::clone(lock);
        }
        let mut write_guard = self.paths.write();
        Arc::clone(write_guard.entry(path.to_vec()).or_insert_with(|| Arc::new(PathLock::new())))
    }

    /// Acquire locks on every path in `requests`, in ascending byte order,
    /// blocking up to `deadline` for each. If a later path in the batch
    /// cannot be acquired before the deadline, every lock already acquired
    /// by this call is released before returning the error.
    pub fn acquire_batch(&self, requests: &[(Vec<u8>, LockMode)], deadline: Instant) -> TabletResult<LockGuard> {
        let mut sorted: Vec<(Vec<u8>, LockMode)> = requests.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        // If the same path appears twice (e.g. as both a read and a write
        // path), a write subsumes a read: acquire the stronger mode once.
        sorted.dedup_by(|a, b| {
            if a.0 == b.0 {
                if a.1 == LockMode::Exclusive {
                    b.1 = LockMode::Exclusive;
                }
                true
            } else {
                false
            }
        });

        let mut held: Vec<(Vec<u8>, LockMode, Arc<PathLock>)> = Vec::with_capacity(sorted.len());
        for (path, mode) in sorted {
            let lock = self.entry(&path);
            match lock.acquire(mode, deadline) {
                Ok(()) => held.push((path, mode, lock)),
                Err(err) => {
                    for (_, held_mode, held_lock) in held.into_iter().rev() {
                        held_lock.release(held_mode);
                    }
                    return Err(err);
                }
            }
        }
        Ok(LockGuard { held })
    }

    /// Convenience wrapper taking a relative timeout instead of an absolute
    /// deadline.
    pub fn acquire_batch_timeout(&self, requests: &[(Vec<u8>, LockMode)], timeout: Duration) -> TabletResult<LockGuard> {
        self.acquire_batch(requests, Instant::now() + timeout)
    }
}

/// RAII guard releasing every lock acquired by one [`LockManager::acquire_batch`]
/// call when dropped. Holds `Arc`s to the path locks rather than borrowing
/// the [`LockManager`] directly, so a guard can outlive a short-lived
/// reference to its manager (e.g. when threaded through a callback).
pub struct LockGuard {
    held: Vec<(Vec<u8>, LockMode, Arc<PathLock>)>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        for (_, mode, lock) in self.held.drain(..) {
            lock.release(mode);
        }
    }
}
