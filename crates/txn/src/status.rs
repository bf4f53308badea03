//! The status-tablet coordinator: the authoritative per-transaction state
//! machine, hosted on one tablet and consulted by every participant that
//! does not already have a final answer cached locally.
//!
//! ```text
//! CREATED ── heartbeat ──► PENDING ── commit() ──► COMMITTED ── mark_applied() ──► APPLIED
//!                 │                                    │
//!                 └── abort() / expire_stale() ──► ABORTED ◄┘ (abort() only from Created/Pending)
//! ```
//!
//! Terminal states `Committed` and `Aborted` are stable once persisted;
//! `Applied` is strictly an optimization that lets the record be garbage
//! collected once every involved tablet has acknowledged the apply.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tablet_concurrency::{StatusTabletClient, TxnStatusKind};
use tablet_core::{HybridClock, HybridTime, RuntimeConfig, TabletError, TabletResult, TabletId, TransactionId};

/// The coordinator's view of one transaction's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnState {
    /// Minted but not yet heartbeated; a brief window before the client's
    /// first heartbeat lands.
    Created,
    /// Heartbeating normally; no commit decision has been made.
    Pending,
    /// Committed at a fixed hybrid time; applies to involved tablets are
    /// in flight or complete.
    Committed,
    /// Aborted, by explicit request or heartbeat expiry.
    Aborted,
    /// Committed and every involved tablet has acknowledged the apply;
    /// the record is eligible for garbage collection.
    Applied,
}

impl TxnState {
    fn can_transition_to(self, next: TxnState) -> bool {
        use TxnState::*;
        matches!(
            (self, next),
            (Created, Pending) | (Created, Aborted) | (Pending, Committed) | (Pending, Aborted) | (Committed, Applied)
        )
    }
}

struct StatusRecord {
    state: TxnState,
    involved_tablets: HashSet<TabletId>,
    commit_ht: Option<HybridTime>,
    last_heartbeat: Instant,
}

impl StatusRecord {
    fn new() -> Self {
        StatusRecord {
            state: TxnState::Created,
            involved_tablets: HashSet::new(),
            commit_ht: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn transition(&mut self, next: TxnState) -> TabletResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(TabletError::IllegalState(format!("transaction status: illegal transition {:?} -> {:?}", self.state, next)));
        }
        self.state = next;
        Ok(())
    }
}

/// Hosts the authoritative state of every transaction assigned to this
/// status tablet.
pub struct StatusTabletCoordinator {
    clock: Arc<HybridClock>,
    config: Arc<RuntimeConfig>,
    records: DashMap<TransactionId, Mutex<StatusRecord>>,
}

impl StatusTabletCoordinator {
    /// Build a coordinator driven by `clock` for commit timestamps and
    /// `config` for the heartbeat-expiry window.
    pub fn new(clock: Arc<HybridClock>, config: Arc<RuntimeConfig>) -> Self {
        StatusTabletCoordinator {
            clock,
            config,
            records: DashMap::new(),
        }
    }

    /// Record a heartbeat for `txn_id`, creating its record on first
    /// contact and promoting `Created` to `Pending`.
    pub fn heartbeat(&self, txn_id: TransactionId) -> TabletResult<()> {
        let entry = self.records.entry(txn_id).or_insert_with(|| Mutex::new(StatusRecord::new()));
        let mut record = entry.lock();
        if record.state == TxnState::Created {
            record.transition(TxnState::Pending)?;
        }
        record.last_heartbeat = Instant::now();
        Ok(())
    }

    /// Commit `txn_id` against the given set of involved tablets, assigning
    /// `commit_ht = clock.now()`. Fails if the transaction is not
    /// `Pending` (already decided, or never heartbeated).
    pub fn commit(&self, txn_id: TransactionId, involved_tablets: &[TabletId]) -> TabletResult<HybridTime> {
        let entry = self
            .records
            .get(&txn_id)
            .ok_or_else(|| TabletError::NotFound(format!("transaction {txn_id}")))?;
        let mut record = entry.lock();
        record.transition(TxnState::Committed)?;
        record.involved_tablets = involved_tablets.iter().copied().collect();
        let commit_ht = self.clock.now();
        record.commit_ht = Some(commit_ht);
        Ok(commit_ht)
    }

    /// Abort `txn_id` by explicit client request.
    pub fn abort(&self, txn_id: TransactionId) -> TabletResult<()> {
        let entry = self.records.entry(txn_id).or_insert_with(|| Mutex::new(StatusRecord::new()));
        let mut record = entry.lock();
        record.transition(TxnState::Aborted)
    }

    /// Sweep every `Created`/`Pending` transaction whose last heartbeat is
    /// older than `max_clock_skew + transaction_timeout`, aborting it.
    /// Returns the ids newly aborted by this sweep.
    pub fn expire_stale(&self) -> Vec<TransactionId> {
        let cfg = self.config.current();
        let expiry: Duration = cfg.max_clock_skew + cfg.transaction_timeout;
        let now = Instant::now();
        let mut expired = Vec::new();
        for entry in self.records.iter() {
            let mut record = entry.value().lock();
            if matches!(record.state, TxnState::Created | TxnState::Pending) && now.duration_since(record.last_heartbeat) >= expiry {
                record.state = TxnState::Aborted;
                expired.push(*entry.key());
            }
        }
        expired
    }

    /// Mark `txn_id` as fully applied, once every involved tablet has
    /// acknowledged. The record remains queryable (as `Applied`, which
    /// [`StatusTabletClient::fetch_status`] still reports as committed)
    /// until a separate retention sweep (out of scope here) drops it.
    pub fn mark_applied(&self, txn_id: TransactionId) -> TabletResult<()> {
        let entry = self
            .records
            .get(&txn_id)
            .ok_or_else(|| TabletError::NotFound(format!("transaction {txn_id}")))?;
        entry.lock().transition(TxnState::Applied)
    }

    /// The tablets a committed transaction touched, for apply dispatch.
    pub fn involved_tablets(&self, txn_id: TransactionId) -> TabletResult<Vec<TabletId>> {
        let entry = self
            .records
            .get(&txn_id)
            .ok_or_else(|| TabletError::NotFound(format!("transaction {txn_id}")))?;
        Ok(entry.lock().involved_tablets.iter().copied().collect())
    }
}

impl StatusTabletClient for StatusTabletCoordinator {
    fn fetch_status(&self, txn_id: TransactionId) -> TabletResult<(TxnStatusKind, HybridTime)> {
        let Some(entry) = self.records.get(&txn_id) else {
            return Ok((TxnStatusKind::Pending, HybridTime::MIN));
        };
        let record = entry.lock();
        match record.state {
            TxnState::Created | TxnState::Pending => Ok((TxnStatusKind::Pending, HybridTime::MIN)),
            TxnState::Committed | TxnState::Applied => Ok((TxnStatusKind::Committed, record.commit_ht.unwrap_or(HybridTime::MIN))),
            TxnState::Aborted => Ok((TxnStatusKind::Aborted, HybridTime::MIN)),
        }
    }
}
