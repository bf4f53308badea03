//! Background intent-store cleanup (component C3).
//!
//! A transaction's intents must outlive the transaction's own commit/abort
//! decision, since the transaction participant (C6) needs them to apply or
//! discard, and other readers need them resolvable until then. But once a
//! transaction has reached a terminal outcome and its intents have been
//! applied or discarded, leaving them in the intent store forever would
//! leak space and slow every future reverse-index lookup on the rows it
//! touched. [`IntentCleaner`] periodically sweeps the intent store for
//! transactions in a terminal state and removes their remaining intents.

use crate::committed::CommittedStore;
use crate::intent_store::IntentStore;
use crate::kv_store::KvStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tablet_core::{HybridTime, TabletResult, TransactionId};
use tracing::{debug, warn};

/// The outcome of a transaction, as far as the cleaner is concerned. A real
/// answer comes from the transaction participant cache or the status
/// tablet coordinator (`tablet-txn`); this crate only depends on the
/// trait, not on that crate, to keep the dependency graph acyclic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Still running or undecided; do not touch its intents.
    Pending,
    /// Committed; its intents have already been (or are being) applied to
    /// the committed store and may be removed once resolved.
    Committed,
    /// Aborted; its intents may be removed unconditionally.
    Aborted,
}

/// Resolves a transaction id to its outcome. Implemented by
/// `tablet-txn`'s transaction participant.
pub trait TransactionResolver: Send + Sync {
    /// Look up a transaction's current outcome.
    fn resolve(&self, txn_id: TransactionId) -> TabletResult<TransactionOutcome>;
}

/// Drives periodic cleanup of one tablet's intent store.
pub struct IntentCleaner<S: KvStore + 'static> {
    intents: Arc<IntentStore<S>>,
}

impl<S: KvStore + 'static> IntentCleaner<S> {
    /// Wrap an intent store for cleanup.
    pub fn new(intents: Arc<IntentStore<S>>) -> Self {
        IntentCleaner { intents }
    }

    /// Run a single sweep: find every transaction with live intents,
    /// resolve each one, and remove the intents of any transaction that has
    /// reached a terminal outcome. Returns the number of transactions
    /// cleaned.
    pub fn sweep_once(&self, resolver: &dyn TransactionResolver) -> TabletResult<usize> {
        let candidates = self.intents.distinct_transaction_ids()?;
        let mut cleaned = 0;
        for txn_id in candidates {
            match resolver.resolve(txn_id) {
                Ok(TransactionOutcome::Pending) => continue,
                Ok(TransactionOutcome::Committed) | Ok(TransactionOutcome::Aborted) => {
                    self.intents.remove_transaction_intents(txn_id)?;
                    cleaned += 1;
                }
                Err(err) => {
                    // A resolver failure (e.g. the status tablet is
                    // temporarily unreachable) should not abort the whole
                    // sweep; other transactions may still be safely
                    // cleaned this round.
                    warn!(%txn_id, error = %err, "failed to resolve transaction outcome during intent cleanup");
                }
            }
        }
        debug!(cleaned, "intent cleanup sweep completed");
        Ok(cleaned)
    }

    /// Spawn a background thread that calls [`IntentCleaner::sweep_once`]
    /// on `interval`, until `stop` is set to `true`.
    pub fn spawn_background(
        self: Arc<Self>,
        resolver: Arc<dyn TransactionResolver>,
        interval: Duration,
        stop: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if let Err(err) = self.sweep_once(resolver.as_ref()) {
                    warn!(error = %err, "intent cleanup sweep failed");
                }
                std::thread::sleep(interval);
            }
        })
    }
}

/// Drives the periodic whole-file intent-SST drop:
/// repeatedly find the live intent file with the smallest max-hybrid-time
/// frontier and, if that bound is strictly below the earliest running
/// transaction's start time, force-flush the committed store (the flush
/// ordering invariant requires its frontier to be at least as advanced
/// before the intent file can go) and delete the file outright.
pub struct SstCleaner<IS: KvStore + 'static, CS: KvStore + 'static> {
    intents: Arc<IntentStore<IS>>,
    committed: Arc<CommittedStore<CS>>,
}

impl<IS: KvStore + 'static, CS: KvStore + 'static> SstCleaner<IS, CS> {
    /// Pair an intent store with the committed store its flushes must stay
    /// ahead of.
    pub fn new(intents: Arc<IntentStore<IS>>, committed: Arc<CommittedStore<CS>>) -> Self {
        SstCleaner { intents, committed }
    }

    /// Run one sweep, dropping every eligible file. Returns the number of
    /// files dropped.
    pub fn sweep_once(&self, min_running_hybrid_time: HybridTime) -> TabletResult<usize> {
        let mut dropped = 0;
        loop {
            let engine = self.intents.engine();
            let smallest = engine
                .get_live_files()
                .into_iter()
                .filter_map(|file| engine.file_frontier(file).map(|frontier| (file, frontier.largest.hybrid_time)))
                .min_by_key(|&(_, max_ht)| max_ht);

            let Some((file, max_ht)) = smallest else {
                break;
            };
            if max_ht >= min_running_hybrid_time {
                break;
            }

            self.committed.engine().flush()?;
            engine.delete_file(file)?;
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "intent SST cleanup dropped files below the running-transaction horizon");
        }
        Ok(dropped)
    }

    /// Spawn a background thread that calls [`SstCleaner::sweep_once`] on
    /// `interval`, sourcing the horizon from `min_running_hybrid_time` each
    /// round, until `stop` is set to `true`.
    pub fn spawn_background(
        self: Arc<Self>,
        min_running_hybrid_time: impl Fn() -> HybridTime + Send + Sync + 'static,
        interval: Duration,
        stop: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if let Err(err) = self.sweep_once(min_running_hybrid_time()) {
                    warn!(error = %err, "intent SST cleanup sweep failed");
                }
                std::thread::sleep(interval);
            }
        })
    }
}
