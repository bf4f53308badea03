//! The intent-aware iterator: a forward cursor over the union of the
//! committed store and the intent store, honoring a read point and
//! resolving every intent it encounters through a [`TxnStatusOracle`].
//!
//! Document keys in this workspace have no nested subkeys — a
//! [`tablet_core::DocKey`] names a whole row directly — so the merge only
//! ever needs to happen at row granularity. The iterator still supports a
//! single forward walk that is valid beyond one row, a prefix stack for
//! restricting a walk to a key range, and read-restart tracking.

use crate::oracle::{TxnStatusKind, TxnStatusOracle};
use std::collections::VecDeque;
use tablet_core::{DocKey, HybridTime, ReadHybridTime, TabletError, TabletResult, TransactionId, ValueBytes};
use tablet_storage::{CommittedStore, IntentStore, KvStore};

/// One resolved row: the value visible to the reader and the hybrid time it
/// was written (or, for an intent, the time it will be committed at).
struct CurrentEntry {
    doc_key: DocKey,
    value_time: HybridTime,
    value: ValueBytes,
}

/// Per-operation context needed to resolve intents: the reader's own
/// transaction id (writes of its own transaction are always visible) and
/// the oracle used to resolve other transactions' commit status.
pub struct TxnReadContext<'a> {
    /// The reading transaction's own id, if this read is part of a
    /// transaction. `None` for a non-transactional read.
    pub self_id: Option<TransactionId>,
    /// Resolves another transaction's commit status.
    pub oracle: &'a dyn TxnStatusOracle,
}

/// A forward cursor over the union of a committed store and an intent
/// store, at a fixed [`ReadHybridTime`].
pub struct IntentAwareIterator<'a, CS: KvStore, IS: KvStore> {
    committed: &'a CommittedStore<CS>,
    intents: &'a IntentStore<IS>,
    read_time: ReadHybridTime,
    ctx: TxnReadContext<'a>,
    prefix_stack: Vec<Vec<u8>>,
    max_seen_ht: Option<HybridTime>,
    pending_rows: VecDeque<DocKey>,
    current: Option<CurrentEntry>,
}

impl<'a, CS: KvStore, IS: KvStore> IntentAwareIterator<'a, CS, IS> {
    /// Build an iterator over `committed`/`intents` at `read_time`.
    pub fn new(committed: &'a CommittedStore<CS>, intents: &'a IntentStore<IS>, read_time: ReadHybridTime, ctx: TxnReadContext<'a>) -> Self {
        IntentAwareIterator {
            committed,
            intents,
            read_time,
            ctx,
            prefix_stack: Vec::new(),
            max_seen_ht: None,
            pending_rows: VecDeque::new(),
            current: None,
        }
    }

    /// Restrict validity to rows whose encoded key starts with `prefix`;
    /// nested calls narrow further. Matches a document-tree walk's use of
    /// `push_prefix`/`pop_prefix` to bound a sub-scan.
    pub fn push_prefix(&mut self, prefix: Vec<u8>) {
        self.prefix_stack.push(prefix);
    }

    /// Undo the most recent [`IntentAwareIterator::push_prefix`].
    pub fn pop_prefix(&mut self) {
        self.prefix_stack.pop();
    }

    fn satisfies_prefix_stack(&self, key: &[u8]) -> bool {
        self.prefix_stack.iter().all(|p| key.starts_with(p.as_slice()))
    }

    /// Position the cursor at the first row with an encoded key `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> TabletResult<bool> {
        self.pending_rows = self.collect_candidate_rows(key)?;
        self.current = None;
        self.advance()
    }

    /// Equivalent to [`IntentAwareIterator::seek`] from the iterator's
    /// current position forward (the underlying committed-store cursor's
    /// position is used as an upper bound hint in the real engine; this
    /// reference implementation simply reseeks, since a fresh in-memory
    /// scan is cheap enough not to need that optimization).
    pub fn seek_forward(&mut self, key: &[u8]) -> TabletResult<bool> {
        self.seek(key)
    }

    /// Alias for [`IntentAwareIterator::seek_forward`]: in a document model
    /// with subkey components, this would skip past the remainder of the
    /// current subkey to the next one at the same level. With no subkeys in
    /// this workspace's document model, "past the subkey" and "past the
    /// row" coincide.
    pub fn seek_past_subkey(&mut self, key: &[u8]) -> TabletResult<bool> {
        self.seek_forward(key)
    }

    /// Alias for [`IntentAwareIterator::seek_forward`]; see
    /// [`IntentAwareIterator::seek_past_subkey`].
    pub fn seek_out_of_subdoc(&mut self, key: &[u8]) -> TabletResult<bool> {
        self.seek_forward(key)
    }

    /// Whether the cursor currently points at a resolved, visible row.
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// The current row's key and the hybrid time its visible value was
    /// written at. Panics if `!valid()`.
    pub fn fetch_key(&self) -> (&DocKey, HybridTime) {
        let entry = self.current.as_ref().expect("iterator not valid");
        (&entry.doc_key, entry.value_time)
    }

    /// The current row's visible value. Panics if `!valid()`.
    pub fn value(&self) -> &ValueBytes {
        &self.current.as_ref().expect("iterator not valid").value
    }

    /// Advance to the next candidate row and re-resolve. Returns whether
    /// the cursor landed on a valid row.
    pub fn next(&mut self) -> TabletResult<bool> {
        self.advance()
    }

    /// The read-restart signal accumulated so far: the maximum hybrid time
    /// of any record or intent inspected whose effective write/commit time
    /// fell strictly after `read_time.read` but within the local or global
    /// limit. `None` means no restart is required.
    pub fn max_seen_ht(&self) -> Option<HybridTime> {
        self.max_seen_ht
    }

    fn note_seen(&mut self, ht: HybridTime, is_local: bool) {
        if ht <= self.read_time.read {
            return;
        }
        let bound = if is_local { self.read_time.local_limit } else { self.read_time.global_limit };
        if ht > bound {
            return;
        }
        self.max_seen_ht = Some(match self.max_seen_ht {
            Some(existing) => existing.max(ht),
            None => ht,
        });
    }

    /// Merge-sorted, deduplicated candidate rows `>= start` present in
    /// either the committed store or the intent store's reverse index.
    fn collect_candidate_rows(&self, start: &[u8]) -> TabletResult<VecDeque<DocKey>> {
        let committed_keys = self.scan_committed_row_keys(start)?;
        let intent_keys = self.intents.distinct_row_keys_from(start)?;

        let mut out = VecDeque::new();
        let (mut ci, mut ii) = (0, 0);
        loop {
            match (committed_keys.get(ci), intent_keys.get(ii)) {
                (Some(c), Some(i)) => match c.as_bytes().cmp(i.as_bytes()) {
                    std::cmp::Ordering::Less => {
                        out.push_back(c.clone());
                        ci += 1;
                    }
                    std::cmp::Ordering::Greater => {
                        out.push_back(i.clone());
                        ii += 1;
                    }
                    std::cmp::Ordering::Equal => {
                        out.push_back(c.clone());
                        ci += 1;
                        ii += 1;
                    }
                },
                (Some(c), None) => {
                    out.push_back(c.clone());
                    ci += 1;
                }
                (None, Some(i)) => {
                    out.push_back(i.clone());
                    ii += 1;
                }
                (None, None) => break,
            }
        }
        Ok(out)
    }

    fn scan_committed_row_keys(&self, start: &[u8]) -> TabletResult<Vec<DocKey>> {
        let mut iter = self.committed.engine().new_iterator();
        let mut out = Vec::new();
        if !iter.seek(start) {
            return Ok(out);
        }
        loop {
            if !iter.valid() {
                break;
            }
            let sdk = tablet_core::SubDocKey::decode(iter.key()).map_err(|e| TabletError::Corruption(format!("committed key: {e}")))?;
            if out.last().map(|last: &DocKey| last != sdk.doc_key()).unwrap_or(true) {
                out.push(sdk.doc_key().clone());
            }
            if !iter.next() {
                break;
            }
        }
        Ok(out)
    }

    fn resolve_row(&mut self, doc_key: &DocKey) -> TabletResult<Option<CurrentEntry>> {
        let committed = self
            .committed
            .get_latest_visible(doc_key, self.read_time.read)?
            .map(|value| (self.committed_write_time(doc_key, self.read_time.read)?, value));
        let committed = match committed {
            Some((ht, value)) => {
                self.note_seen(ht, true);
                Some((ht, value))
            }
            None => None,
        };

        let intent = self.resolve_intent(doc_key)?;

        Ok(match (committed, intent) {
            (Some((c_ht, c_val)), Some((i_ht, i_val))) => {
                if i_ht >= c_ht {
                    Some(CurrentEntry { doc_key: doc_key.clone(), value_time: i_ht, value: i_val })
                } else {
                    Some(CurrentEntry { doc_key: doc_key.clone(), value_time: c_ht, value: c_val })
                }
            }
            (Some((c_ht, c_val)), None) => Some(CurrentEntry { doc_key: doc_key.clone(), value_time: c_ht, value: c_val }),
            (None, Some((i_ht, i_val))) => Some(CurrentEntry { doc_key: doc_key.clone(), value_time: i_ht, value: i_val }),
            (None, None) => None,
        })
    }

    fn committed_write_time(&self, doc_key: &DocKey, read_time: HybridTime) -> TabletResult<HybridTime> {
        // `get_latest_visible` already found a visible version; recover its
        // write time the same way it did, by taking the newest entry in the
        // version history at or before the read point.
        Ok(self
            .committed
            .versions_visible_at(doc_key, read_time)?
            .into_iter()
            .next()
            .map(|(ht, _)| ht)
            .unwrap_or(HybridTime::MIN))
    }

    /// Resolve the single live intent on `doc_key`, if any. Only one
    /// transaction can hold a write intent on a row at a time (the
    /// conflict resolver enforces this before a write batch is ever
    /// applied), so there is never more than one candidate to weigh here.
    fn resolve_intent(&mut self, doc_key: &DocKey) -> TabletResult<Option<(HybridTime, ValueBytes)>> {
        let Some((txn_id, record)) = self.intents.find_intent_on_row(doc_key)? else {
            return Ok(None);
        };
        let same_txn = self.ctx.self_id == Some(txn_id);
        let value_time = if same_txn {
            record.doc_hybrid_time.hybrid_time()
        } else {
            let commit_ht = self.ctx.oracle.commit_time(txn_id)?;
            if commit_ht != HybridTime::MIN {
                self.note_seen(commit_ht, false);
            }
            if commit_ht > self.read_time.global_limit {
                // Committed too recently to trust without a restart
                // (kInvalidPrefix path): invisible to this read, but the
                // restart signal above already captured it.
                return Ok(None);
            }
            commit_ht
        };
        if value_time == HybridTime::MIN {
            // Uncommitted or aborted: invisible (kNoIntent path).
            return Ok(None);
        }
        if value_time > self.read_time.read && !same_txn {
            return Ok(None);
        }
        Ok(Some((value_time, record.value)))
    }

    fn advance(&mut self) -> TabletResult<bool> {
        loop {
            let Some(candidate) = self.pending_rows.pop_front() else {
                self.current = None;
                return Ok(false);
            };
            if !self.satisfies_prefix_stack(candidate.as_bytes()) {
                continue;
            }
            if let Some(entry) = self.resolve_row(&candidate)? {
                self.current = Some(entry);
                return Ok(true);
            }
        }
    }
}
