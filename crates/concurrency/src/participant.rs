//! The per-tablet transaction participant.
//!
//! Every tablet touched by a transaction keeps one [`LocalTxnState`] entry
//! for it: a local cache of the transaction's status, good enough to
//! answer the intent-aware iterator's and conflict resolver's questions
//! without an RPC to the status tablet on every read, plus the
//! bookkeeping needed to apply the transaction's intents once the status
//! tablet reports COMMITTED.

use crate::oracle::{TxnStatusKind, TxnStatusOracle};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tablet_core::{HybridTime, TabletResult, TransactionId};
use tablet_storage::{CommittedRecord, CommittedStore, IntentStore, KvStore, TransactionOutcome, TransactionResolver};

/// Remote half of a status lookup: RPCs the status tablet (implemented
/// in `tablet-txn`) for a transaction this participant has no opinion on
/// yet, or whose cached status might be stale. Defined here rather than in
/// `tablet-txn` for the same acyclic-dependency reason as
/// [`crate::oracle::TxnStatusOracle`].
pub trait StatusTabletClient: Send + Sync {
    /// Fetch `txn_id`'s current status and, if committed, its commit
    /// hybrid time.
    fn fetch_status(&self, txn_id: TransactionId) -> TabletResult<(TxnStatusKind, HybridTime)>;
}

/// Per-transaction, per-tablet local state.
#[derive(Debug, Clone)]
pub struct LocalTxnState {
    /// Most recently known status. May be a stale `Pending` but never a
    /// stale `Committed`.
    pub status: TxnStatusKind,
    /// The commit hybrid time, once known.
    pub commit_ht: Option<HybridTime>,
    /// The transaction's start time, used by
    /// [`TransactionParticipant::min_running_hybrid_time`].
    pub start_time: HybridTime,
    /// Replay table: batch index to the write id it was assigned, so a
    /// replayed `prepare_batch_data` call (the same consensus entry
    /// re-applied after a leader change) returns the identical answer
    /// instead of minting a new write id.
    batch_write_ids: HashMap<u64, u32>,
    next_write_id: u32,
    /// The highest `(hybrid_time, write_id)` consensus has confirmed for
    /// this transaction, set by `batch_replicated`.
    pub last_batch_data: Option<(HybridTime, u32)>,
}

impl LocalTxnState {
    fn new(start_time: HybridTime) -> Self {
        LocalTxnState {
            status: TxnStatusKind::Pending,
            commit_ht: None,
            start_time,
            batch_write_ids: HashMap::new(),
            next_write_id: 0,
            last_batch_data: None,
        }
    }
}

/// The write id (and, for replay, confirmation that it is the id already
/// assigned) returned by [`TransactionParticipant::prepare_batch_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPrepareData {
    /// The write id this batch's intents should carry.
    pub write_id: u32,
}

/// One tablet's view of every transaction currently touching it.
///
/// Holds `Arc`-shared handles to its tablet's stores rather than borrowing
/// them, so it can live alongside them as a long-lived field (its `txns`
/// cache is exactly the kind of state a tablet must keep across calls, not
/// rebuild per request).
pub struct TransactionParticipant<CS: KvStore, IS: KvStore> {
    committed: Arc<CommittedStore<CS>>,
    intents: Arc<IntentStore<IS>>,
    status_client: Arc<dyn StatusTabletClient>,
    txns: DashMap<TransactionId, LocalTxnState>,
}

impl<CS: KvStore, IS: KvStore> TransactionParticipant<CS, IS> {
    /// Wrap a tablet's committed/intent stores with a fresh, empty
    /// participant map.
    pub fn new(committed: Arc<CommittedStore<CS>>, intents: Arc<IntentStore<IS>>, status_client: Arc<dyn StatusTabletClient>) -> Self {
        TransactionParticipant {
            committed,
            intents,
            status_client,
            txns: DashMap::new(),
        }
    }

    /// Register the first intent this tablet has seen for `txn_id` at
    /// `start_time`. Idempotent: a second call for an already-known
    /// transaction is a no-op. Returns `false` if the transaction is
    /// already known locally to be aborted, in which case the caller must
    /// reject the write rather than add to an intent set that is about to
    /// be cleaned up.
    pub fn add(&self, txn_id: TransactionId, start_time: HybridTime) -> bool {
        if let Some(existing) = self.txns.get(&txn_id) {
            return existing.status != TxnStatusKind::Aborted;
        }
        self.txns.entry(txn_id).or_insert_with(|| LocalTxnState::new(start_time));
        true
    }

    /// Assign (or, on replay, recall) the write id for `batch_idx` of
    /// `txn_id`'s writes.
    pub fn prepare_batch_data(&self, txn_id: TransactionId, batch_idx: u64) -> TabletResult<BatchPrepareData> {
        let mut entry = self
            .txns
            .entry(txn_id)
            .or_insert_with(|| LocalTxnState::new(HybridTime::MIN));
        if let Some(write_id) = entry.batch_write_ids.get(&batch_idx) {
            return Ok(BatchPrepareData { write_id: *write_id });
        }
        let write_id = entry.next_write_id;
        entry.next_write_id += 1;
        entry.batch_write_ids.insert(batch_idx, write_id);
        Ok(BatchPrepareData { write_id })
    }

    /// Record that a batch has been confirmed by consensus: updates the
    /// highest `(hybrid_time, write_id)` this participant has seen for
    /// `txn_id`, kept separate from `prepare_batch_data` so a batch that
    /// fails to replicate does not advance any persistent state.
    pub fn batch_replicated(&self, txn_id: TransactionId, confirmed_write_id: u32, confirmed_ht: HybridTime) {
        let mut entry = self.txns.entry(txn_id).or_insert_with(|| LocalTxnState::new(HybridTime::MIN));
        let advances = match entry.last_batch_data {
            Some((ht, write_id)) => (confirmed_ht, confirmed_write_id) > (ht, write_id),
            None => true,
        };
        if advances {
            entry.last_batch_data = Some((confirmed_ht, confirmed_write_id));
        }
    }

    /// Resolve `txn_id`'s status, consulting the local cache first and
    /// falling back to the status tablet. A cached `Committed` is final
    /// and never re-fetched; a cached `Pending` is always re-checked,
    /// since only the status tablet can promote it.
    pub fn request_status_at(&self, txn_id: TransactionId) -> TabletResult<(TxnStatusKind, HybridTime)> {
        if let Some(state) = self.txns.get(&txn_id) {
            if state.status == TxnStatusKind::Committed {
                return Ok((TxnStatusKind::Committed, state.commit_ht.unwrap_or(HybridTime::MIN)));
            }
            if state.status == TxnStatusKind::Aborted {
                return Ok((TxnStatusKind::Aborted, HybridTime::MIN));
            }
        }
        let (status, ht) = self.status_client.fetch_status(txn_id)?;
        let mut entry = self.txns.entry(txn_id).or_insert_with(|| LocalTxnState::new(HybridTime::MIN));
        entry.status = status;
        if status == TxnStatusKind::Committed {
            entry.commit_ht = Some(ht);
        }
        Ok((status, ht))
    }

    /// Apply `txn_id`'s intents as committed records at `commit_ht`: every
    /// live intent is rewritten into the committed store with `commit_ht`
    /// as its write time, in a single write batch, and only then are the
    /// intent entries (primary and reverse index) removed.
    pub fn apply(&self, txn_id: TransactionId, commit_ht: HybridTime) -> TabletResult<()> {
        let intents = self.intents.scan_transaction_intents(txn_id)?;
        let records: Vec<CommittedRecord> = intents
            .into_iter()
            .map(|intent| CommittedRecord {
                doc_key: intent.doc_key,
                write_time: tablet_core::DocHybridTime::from_hybrid_time(commit_ht),
                value: intent.value,
            })
            .collect();
        self.committed.apply(&records)?;
        self.intents.remove_transaction_intents(txn_id)?;

        let mut entry = self.txns.entry(txn_id).or_insert_with(|| LocalTxnState::new(HybridTime::MIN));
        entry.status = TxnStatusKind::Committed;
        entry.commit_ht = Some(commit_ht);
        Ok(())
    }

    /// Delete every live intent belonging to each transaction in
    /// `txn_ids` and mark them locally aborted. Used once the status
    /// tablet reports ABORTED.
    pub fn remove_intents(&self, txn_ids: &[TransactionId]) -> TabletResult<()> {
        for &txn_id in txn_ids {
            self.intents.remove_transaction_intents(txn_id)?;
            let mut entry = self.txns.entry(txn_id).or_insert_with(|| LocalTxnState::new(HybridTime::MIN));
            entry.status = TxnStatusKind::Aborted;
        }
        Ok(())
    }

    /// The smallest start time among transactions this participant still
    /// believes are pending, or [`HybridTime::MAX`] if none are running.
    /// The background intent-SST cleaner uses this as the floor below
    /// which an intent file can be safely dropped.
    pub fn min_running_hybrid_time(&self) -> HybridTime {
        self.txns
            .iter()
            .filter(|entry| entry.status == TxnStatusKind::Pending)
            .map(|entry| entry.start_time)
            .min()
            .unwrap_or(HybridTime::MAX)
    }

    /// The highest `(hybrid_time, write_id)` [`TransactionParticipant::batch_replicated`]
    /// has recorded for `txn_id`, or `None` if no batch has been confirmed yet.
    pub fn last_batch_data(&self, txn_id: TransactionId) -> Option<(HybridTime, u32)> {
        self.txns.get(&txn_id).and_then(|entry| entry.last_batch_data)
    }
}

impl<CS: KvStore, IS: KvStore> TxnStatusOracle for TransactionParticipant<CS, IS> {
    fn status(&self, txn_id: TransactionId) -> TabletResult<(TxnStatusKind, HybridTime)> {
        self.request_status_at(txn_id)
    }
}

/// Lets the background intent-SST cleaner (`tablet-storage`) resolve a
/// transaction's outcome through the same cache/status-tablet path every
/// other caller uses, without that crate depending back on this one.
impl<CS: KvStore + 'static, IS: KvStore + 'static> TransactionResolver for TransactionParticipant<CS, IS> {
    fn resolve(&self, txn_id: TransactionId) -> TabletResult<TransactionOutcome> {
        let (status, _) = self.request_status_at(txn_id)?;
        Ok(match status {
            TxnStatusKind::Pending => TransactionOutcome::Pending,
            TxnStatusKind::Committed => TransactionOutcome::Committed,
            TxnStatusKind::Aborted => TransactionOutcome::Aborted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tablet_core::ValueBytes;
    use tablet_storage::{IntentRecord, MemKvStore};

    struct FakeStatusTabletClient {
        status: parking_lot::RwLock<HashMap<TransactionId, (TxnStatusKind, HybridTime)>>,
        calls: AtomicU32,
    }

    impl FakeStatusTabletClient {
        fn new() -> Self {
            FakeStatusTabletClient {
                status: parking_lot::RwLock::new(HashMap::new()),
                calls: AtomicU32::new(0),
            }
        }

        fn set(&self, txn_id: TransactionId, status: TxnStatusKind, ht: HybridTime) {
            self.status.write().insert(txn_id, (status, ht));
        }
    }

    impl StatusTabletClient for FakeStatusTabletClient {
        fn fetch_status(&self, txn_id: TransactionId) -> TabletResult<(TxnStatusKind, HybridTime)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.status.read().get(&txn_id).copied().unwrap_or((TxnStatusKind::Pending, HybridTime::MIN)))
        }
    }

    fn row(n: i64) -> tablet_core::DocKey {
        tablet_core::DocKey::builder().add_i64(n).finish()
    }

    #[test]
    fn add_registers_a_new_transaction_and_is_idempotent() {
        let committed = CommittedStore::new(MemKvStore::new());
        let intents = IntentStore::new(MemKvStore::new());
        let client = FakeStatusTabletClient::new();
        let participant = TransactionParticipant::new(Arc::new(committed), Arc::new(intents), Arc::new(client));

        let txn = TransactionId::generate();
        assert!(participant.add(txn, HybridTime::pack(10, 0)));
        assert!(participant.add(txn, HybridTime::pack(10, 0)));
    }

    #[test]
    fn add_rejects_writes_for_a_locally_known_aborted_transaction() {
        let committed = CommittedStore::new(MemKvStore::new());
        let intents = IntentStore::new(MemKvStore::new());
        let client = FakeStatusTabletClient::new();
        let participant = TransactionParticipant::new(Arc::new(committed), Arc::new(intents), Arc::new(client));

        let txn = TransactionId::generate();
        participant.add(txn, HybridTime::pack(10, 0));
        participant.remove_intents(&[txn]).unwrap();
        assert!(!participant.add(txn, HybridTime::pack(10, 0)));
    }

    #[test]
    fn batch_replicated_tracks_the_highest_confirmed_hybrid_time_and_write_id() {
        let committed = CommittedStore::new(MemKvStore::new());
        let intents = IntentStore::new(MemKvStore::new());
        let client = FakeStatusTabletClient::new();
        let participant = TransactionParticipant::new(Arc::new(committed), Arc::new(intents), Arc::new(client));

        let txn = TransactionId::generate();
        participant.batch_replicated(txn, 0, HybridTime::pack(10, 0));
        assert_eq!(participant.txns.get(&txn).unwrap().last_batch_data, Some((HybridTime::pack(10, 0), 0)));

        participant.batch_replicated(txn, 1, HybridTime::pack(20, 0));
        assert_eq!(participant.txns.get(&txn).unwrap().last_batch_data, Some((HybridTime::pack(20, 0), 1)));

        // An out-of-order confirmation (e.g. a replayed, already-superseded
        // batch) must not move the recorded high-water mark backward.
        participant.batch_replicated(txn, 0, HybridTime::pack(5, 0));
        assert_eq!(participant.txns.get(&txn).unwrap().last_batch_data, Some((HybridTime::pack(20, 0), 1)));
    }

    #[test]
    fn prepare_batch_data_replays_the_same_write_id_for_a_repeated_batch_index() {
        let committed = CommittedStore::new(MemKvStore::new());
        let intents = IntentStore::new(MemKvStore::new());
        let client = FakeStatusTabletClient::new();
        let participant = TransactionParticipant::new(Arc::new(committed), Arc::new(intents), Arc::new(client));

        let txn = TransactionId::generate();
        let first = participant.prepare_batch_data(txn, 0).unwrap();
        let second = participant.prepare_batch_data(txn, 1).unwrap();
        let replay = participant.prepare_batch_data(txn, 0).unwrap();
        assert_ne!(first.write_id, second.write_id);
        assert_eq!(first.write_id, replay.write_id);
    }

    #[test]
    fn request_status_at_caches_committed_and_does_not_refetch() {
        let committed = CommittedStore::new(MemKvStore::new());
        let intents = IntentStore::new(MemKvStore::new());
        let client = FakeStatusTabletClient::new();
        let txn = TransactionId::generate();
        client.set(txn, TxnStatusKind::Committed, HybridTime::pack(500, 0));

        let participant = TransactionParticipant::new(Arc::new(committed), Arc::new(intents), Arc::new(client));
        let (status, ht) = participant.request_status_at(txn).unwrap();
        assert_eq!(status, TxnStatusKind::Committed);
        assert_eq!(ht, HybridTime::pack(500, 0));
        let calls_after_first = client.calls.load(Ordering::SeqCst);

        participant.request_status_at(txn).unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[test]
    fn apply_rewrites_intents_as_committed_records_and_clears_them() {
        let committed = CommittedStore::new(MemKvStore::new());
        let intents = IntentStore::new(MemKvStore::new());
        let client = FakeStatusTabletClient::new();
        let participant = TransactionParticipant::new(Arc::new(committed), Arc::new(intents), Arc::new(client));

        let txn = TransactionId::generate();
        intents
            .put_intents(
                txn,
                &[IntentRecord {
                    doc_key: row(1),
                    doc_hybrid_time: tablet_core::DocHybridTime::from_hybrid_time(HybridTime::pack(100, 0)),
                    value: ValueBytes::int64(42, None, None),
                }],
            )
            .unwrap();

        participant.apply(txn, HybridTime::pack(150, 0)).unwrap();

        let visible = committed.get_latest_visible(&row(1), HybridTime::pack(200, 0)).unwrap().unwrap();
        assert_eq!(visible.as_int64(), Some(42));
        assert!(intents.find_intent_on_row(&row(1)).unwrap().is_none());
    }

    #[test]
    fn min_running_hybrid_time_ignores_committed_and_aborted_transactions() {
        let committed = CommittedStore::new(MemKvStore::new());
        let intents = IntentStore::new(MemKvStore::new());
        let client = FakeStatusTabletClient::new();
        let participant = TransactionParticipant::new(Arc::new(committed), Arc::new(intents), Arc::new(client));

        let still_running = TransactionId::generate();
        participant.add(still_running, HybridTime::pack(50, 0));

        let committed_txn = TransactionId::generate();
        participant.add(committed_txn, HybridTime::pack(10, 0));
        participant.apply(committed_txn, HybridTime::pack(20, 0)).unwrap();

        assert_eq!(participant.min_running_hybrid_time(), HybridTime::pack(50, 0));
    }

    #[test]
    fn min_running_hybrid_time_is_max_when_nothing_is_running() {
        let committed = CommittedStore::new(MemKvStore::new());
        let intents = IntentStore::new(MemKvStore::new());
        let client = FakeStatusTabletClient::new();
        let participant = TransactionParticipant::new(Arc::new(committed), Arc::new(intents), Arc::new(client));
        assert_eq!(participant.min_running_hybrid_time(), HybridTime::MAX);
    }
}
