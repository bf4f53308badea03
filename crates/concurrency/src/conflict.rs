//! The conflict resolver.
//!
//! Sits between the write pipeline (`tablet-engine`) and the storage
//! layer: given a prepared batch of doc operations, it acquires row-level
//! locks via [`crate::lock_manager::LockManager`] and then checks every
//! write path against the intent store for a conflicting, not-yet-resolved
//! intent owned by another transaction.

use crate::lock_manager::{LockGuard, LockManager, LockMode};
use crate::oracle::{TxnStatusKind, TxnStatusOracle};
use std::time::Instant;
use tablet_core::{DocKey, TabletError, TabletResult, TransactionId};
use tablet_storage::{IntentStore, KvStore};

/// The isolation level requested by the operation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Reads observe a single, fixed snapshot; writers fail fast on any
    /// conflicting live intent rather than blocking.
    Snapshot,
    /// Reads are additionally protected by read-intents so a later writer
    /// can detect and react to them.
    Serializable,
}

/// One doc path touched by the batch being resolved.
#[derive(Debug, Clone)]
pub struct PreparedOp {
    /// The row this operation touches.
    pub doc_key: DocKey,
    /// Whether this is a write (exclusive lock, checked against intents) or
    /// a read (shared lock; for serializable batches, also written as a
    /// read-intent so later writers detect it).
    pub is_write: bool,
}

/// The reason a [`TabletError::TryAgain`] was raised by the conflict
/// resolver, kept structured for logging and metrics even though the
/// wire-level error only carries a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// A conflicting transaction has already committed at or before our
    /// candidate hybrid time.
    CommittedAhead,
    /// A conflicting transaction is still pending; we cannot safely
    /// proceed without knowing its outcome.
    PendingConflict,
}

impl ConflictReason {
    fn message(self) -> &'static str {
        match self {
            ConflictReason::CommittedAhead => "conflicting transaction already committed ahead of our candidate time",
            ConflictReason::PendingConflict => "conflicting transaction is still pending",
        }
    }
}

/// The result of successfully resolving conflicts for a batch: the caller
/// now holds every lock the batch needs and knows whether it must read a
/// fresh snapshot (serializable batches always do, to capture read-set
/// values for their read-intents).
pub struct ConflictResolution {
    /// Whether the caller must read the current snapshot to populate
    /// read-intents (true for serializable isolation).
    pub need_read_snapshot: bool,
    /// The lock guard; dropping it releases every lock acquired for this
    /// batch.
    pub locks: LockGuard,
}

/// Resolves conflicts for one tablet by combining its [`LockManager`] with
/// its intent store and a [`TxnStatusOracle`] for commit-status lookups.
pub struct ConflictResolver<'a, S: KvStore> {
    locks: &'a LockManager,
    intents: &'a IntentStore<S>,
    oracle: &'a dyn TxnStatusOracle,
}

impl<'a, S: KvStore> ConflictResolver<'a, S> {
    /// Wrap a lock manager, intent store, and status oracle for one
    /// resolution call (or a sequence of them sharing the same tablet
    /// state).
    pub fn new(locks: &'a LockManager, intents: &'a IntentStore<S>, oracle: &'a dyn TxnStatusOracle) -> Self {
        ConflictResolver { locks, intents, oracle }
    }

    /// Resolve conflicts for `ops` under `isolation`, acquiring locks and
    /// checking each write path against the intent store. `self_txn` is the
    /// id of the transaction issuing this batch, if any (a non-transactional
    /// write passes `None`); intents it already owns on a path are never
    /// conflicts.
    pub fn resolve(
        &self,
        ops: &[PreparedOp],
        isolation: IsolationLevel,
        deadline: Instant,
        self_txn: Option<TransactionId>,
    ) -> TabletResult<ConflictResolution> {
        let lock_requests: Vec<(Vec<u8>, LockMode)> = ops
            .iter()
            .map(|op| {
                let mode = if op.is_write { LockMode::Exclusive } else { LockMode::Shared };
                (op.doc_key.as_bytes().to_vec(), mode)
            })
            .collect();
        let locks = self.locks.acquire_batch(&lock_requests, deadline)?;

        for op in ops.iter().filter(|op| op.is_write) {
            self.check_write_path(&op.doc_key, isolation, self_txn)?;
        }

        Ok(ConflictResolution {
            need_read_snapshot: matches!(isolation, IsolationLevel::Serializable),
            locks,
        })
    }

    fn check_write_path(&self, doc_key: &DocKey, isolation: IsolationLevel, self_txn: Option<TransactionId>) -> TabletResult<()> {
        let Some((holder, _intent)) = self.intents.find_intent_on_row(doc_key)? else {
            return Ok(());
        };
        if Some(holder) == self_txn {
            // Re-writing a path our own transaction already holds an
            // intent on is not a conflict; the write pipeline overwrites
            // its own prior intent for this batch.
            return Ok(());
        }
        let (status, _commit_ht) = self.oracle.status(holder)?;
        match status {
            TxnStatusKind::Aborted => Ok(()),
            TxnStatusKind::Committed => Err(conflict_error(ConflictReason::CommittedAhead)),
            TxnStatusKind::Pending => {
                // Snapshot-isolation writers fail fast rather than block on
                // an in-flight transaction's outcome; serializable batches
                // that hold a read on this path would themselves be the
                // ones a later committer aborts, but a batch that is about
                // to *write* a path someone else is mid-write on cannot
                // proceed safely under either isolation level without
                // waiting for a resolution we do not have yet.
                let _ = isolation;
                Err(conflict_error(ConflictReason::PendingConflict))
            }
        }
    }
}

fn conflict_error(reason: ConflictReason) -> TabletError {
    TabletError::try_again(reason.message())
}
