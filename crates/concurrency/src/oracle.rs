//! The transaction-status oracle contract shared by the intent-aware
//! iterator and the conflict resolver.
//!
//! Both need the same question answered — "as of now, is this transaction
//! committed, and if so at what hybrid time" — but get the answer from
//! different places depending on whether the transaction touched this
//! tablet: a local lookup in the participant's cache
//! ([`crate::participant::TransactionParticipant`]), or an RPC to the
//! status tablet (implemented in `tablet-txn`, which depends on this crate
//! and therefore cannot be depended on back). Defining the trait here,
//! rather than in `tablet-txn`, keeps the dependency graph acyclic.

use tablet_core::{HybridTime, TabletResult, TransactionId};

/// A transaction's status as observed by a participant or the status
/// tablet itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnStatusKind {
    /// Still running; no commit decision has been made.
    Pending,
    /// Committed at the paired hybrid time.
    Committed,
    /// Aborted; any intents it left behind are garbage.
    Aborted,
}

/// Resolves a transaction id to its current status and, if committed, its
/// commit hybrid time.
///
/// Contract: the cache behind this trait may return a stale `Pending` for
/// a transaction that has since committed or aborted, but it must never
/// return a stale `Committed` — once this returns `Committed` with some
/// `commit_ht`, that fact is permanent and that hybrid time is final.
pub trait TxnStatusOracle: Send + Sync {
    /// Look up `txn_id`'s current status.
    fn status(&self, txn_id: TransactionId) -> TabletResult<(TxnStatusKind, HybridTime)>;

    /// The commit hybrid time to use when resolving an intent owned by
    /// `txn_id`: the real commit time if committed, or
    /// [`HybridTime::MIN`] otherwise (uncommitted and aborted are both
    /// "invisible", and [`HybridTime::MIN`] sorts behind every real read
    /// point so the intent-aware iterator naturally treats it as
    /// invisible without a separate branch).
    fn commit_time(&self, txn_id: TransactionId) -> TabletResult<HybridTime> {
        match self.status(txn_id)? {
            (TxnStatusKind::Committed, ht) => Ok(ht),
            _ => Ok(HybridTime::MIN),
        }
    }
}

/// A fixed-answer oracle for tests: every transaction id not explicitly
/// registered resolves to `Pending`.
pub struct FakeOracle {
    answers: parking_lot::RwLock<std::collections::HashMap<TransactionId, (TxnStatusKind, HybridTime)>>,
}

impl Default for FakeOracle {
    fn default() -> Self {
        FakeOracle {
            answers: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }
}

impl FakeOracle {
    /// A fresh oracle with no registered transactions (all resolve as
    /// `Pending`).
    pub fn new() -> Self {
        FakeOracle::default()
    }

    /// Register a transaction's status and (if committed) commit time.
    pub fn set(&self, txn_id: TransactionId, status: TxnStatusKind, ht: HybridTime) {
        self.answers.write().insert(txn_id, (status, ht));
    }
}

impl TxnStatusOracle for FakeOracle {
    fn status(&self, txn_id: TransactionId) -> TabletResult<(TxnStatusKind, HybridTime)> {
        Ok(self.answers.read().get(&txn_id).copied().unwrap_or((TxnStatusKind::Pending, HybridTime::MIN)))
    }
}
