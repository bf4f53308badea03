//! The committed store: durable, MVCC-versioned rows (component C3).
//!
//! Keys are [`SubDocKey`]s (row key + write time, newest-first within a
//! row); values are [`ValueBytes`]. A read at a given hybrid time finds the
//! newest version with a write time `<=` the read point by seeking to the
//! row's prefix and skipping forward past any version newer than the read
//! point — the key encoding guarantees those always sort first.

use crate::kv_store::{KvStore, WriteBatch};
use tablet_core::{DocHybridTime, DocKey, HybridTime, SubDocKey, TabletError, TabletResult, ValueBytes};

/// One committed write, as applied during the write pipeline's apply step
/// (C9) or by direct non-transactional writes.
#[derive(Debug, Clone)]
pub struct CommittedRecord {
    /// The row being written.
    pub doc_key: DocKey,
    /// The write time of this version.
    pub write_time: DocHybridTime,
    /// The new value (or tombstone).
    pub value: ValueBytes,
}

/// Wraps a [`KvStore`] with the committed store's key/value conventions.
pub struct CommittedStore<S: KvStore> {
    store: S,
}

impl<S: KvStore> CommittedStore<S> {
    /// Wrap a storage engine instance as a committed store.
    pub fn new(store: S) -> Self {
        CommittedStore { store }
    }

    /// Apply a batch of committed writes atomically.
    pub fn apply(&self, records: &[CommittedRecord]) -> TabletResult<()> {
        let mut batch = WriteBatch::new();
        for record in records {
            let key = SubDocKey::new(record.doc_key.clone(), record.write_time).encode();
            batch.put(key, record.value.encode());
        }
        self.store.write(batch)
    }

    /// The newest version of `doc_key` visible at `read_time`: the value
    /// with the largest write time `<= read_time`, or `None` if the row
    /// does not exist, has only later versions, or its newest visible
    /// version is a tombstone.
    pub fn get_latest_visible(&self, doc_key: &DocKey, read_time: HybridTime) -> TabletResult<Option<ValueBytes>> {
        // Versions of this row sort newest-write-time-first immediately
        // after the row's key prefix, so seeking to the prefix lands on the
        // newest version; we then skip forward past any version strictly
        // newer than `read_time`.
        let mut iter = self.store.new_iterator();
        if !iter.seek(doc_key.as_bytes()) {
            return Ok(None);
        }
        loop {
            if !iter.valid() || !iter.key().starts_with(doc_key.as_bytes()) {
                return Ok(None);
            }
            let sdk = SubDocKey::decode(iter.key()).map_err(|e| TabletError::Corruption(format!("committed key: {e}")))?;
            if sdk.doc_key() != doc_key {
                return Ok(None);
            }
            if sdk.write_time().hybrid_time() <= read_time {
                let value = ValueBytes::decode(iter.value()).map_err(|e| TabletError::Corruption(format!("committed value: {e}")))?;
                return Ok(if value.is_tombstone() { None } else { Some(value) });
            }
            if !iter.next() {
                return Ok(None);
            }
        }
    }

    /// All versions of `doc_key` with write time `<= read_time`, newest
    /// first. Used by the index backfill orchestrator (C10), which needs
    /// the visible value rather than the full version chain, and by tests
    /// asserting MVCC history is retained until compaction collapses it.
    pub fn versions_visible_at(&self, doc_key: &DocKey, read_time: HybridTime) -> TabletResult<Vec<(HybridTime, ValueBytes)>> {
        let mut out = Vec::new();
        let mut iter = self.store.new_iterator();
        if !iter.seek(doc_key.as_bytes()) {
            return Ok(out);
        }
        while iter.valid() && iter.key().starts_with(doc_key.as_bytes()) {
            let sdk = SubDocKey::decode(iter.key()).map_err(|e| TabletError::Corruption(format!("committed key: {e}")))?;
            if sdk.doc_key() == doc_key && sdk.write_time().hybrid_time() <= read_time {
                let value = ValueBytes::decode(iter.value()).map_err(|e| TabletError::Corruption(format!("committed value: {e}")))?;
                out.push((sdk.write_time().hybrid_time(), value));
            }
            if !iter.next() {
                break;
            }
        }
        Ok(out)
    }

    /// Scan up to `limit` distinct rows in key order, starting strictly
    /// after `start` (or from the beginning of the tablet if `None`),
    /// returning each row's value visible at `read_time`. Rows with no
    /// value visible at `read_time` (not yet written, or tombstoned) are
    /// scanned but omitted from [`RowScanChunk::rows`], so the caller's
    /// resume cursor still advances past them.
    ///
    /// Used by the index backfill orchestrator (C10) to walk a table's
    /// rows at one pinned safe time, chunk by chunk, without re-reading
    /// rows already scanned in an earlier chunk.
    pub fn scan_rows_from(&self, start: Option<&DocKey>, read_time: HybridTime, limit: usize) -> TabletResult<RowScanChunk> {
        // Appending 14 bytes of 0xFF after the row prefix sorts past every
        // version of that row: `SubDocKey::encode` always emits exactly 13
        // suffix bytes, and the highest possible 13-byte suffix (12 bytes of
        // 0xFF plus length byte 12) still compares less than a 14th 0xFF
        // byte, so the probe lands on the next row's newest version.
        let probe: Vec<u8> = match start {
            Some(key) => {
                let mut probe = key.as_bytes().to_vec();
                probe.extend(std::iter::repeat(0xFFu8).take(14));
                probe
            }
            None => Vec::new(),
        };

        let mut iter = self.store.new_iterator();
        let mut row_keys: Vec<DocKey> = Vec::new();
        if iter.seek(&probe) {
            while row_keys.len() < limit && iter.valid() {
                let sdk = SubDocKey::decode(iter.key()).map_err(|e| TabletError::Corruption(format!("committed key: {e}")))?;
                if row_keys.last().map(|last: &DocKey| last != sdk.doc_key()).unwrap_or(true) {
                    row_keys.push(sdk.doc_key().clone());
                }
                if !iter.next() {
                    break;
                }
            }
        }

        let exhausted = row_keys.len() < limit;
        let last_key = if exhausted { None } else { row_keys.last().cloned() };

        let mut rows = Vec::with_capacity(row_keys.len());
        for doc_key in row_keys {
            if let Some(value) = self.get_latest_visible(&doc_key, read_time)? {
                rows.push((doc_key, value));
            }
        }
        Ok(RowScanChunk { rows, last_key })
    }

    /// Borrow the underlying engine, e.g. to call [`KvStore::flush`].
    pub fn engine(&self) -> &S {
        &self.store
    }
}

/// One chunk of a full-table row scan (see
/// [`CommittedStore::scan_rows_from`]).
#[derive(Debug, Clone)]
pub struct RowScanChunk {
    /// Rows with a value visible at the scan's read time, in key order.
    pub rows: Vec<(DocKey, ValueBytes)>,
    /// The last row key the scan inspected, to pass as the next chunk's
    /// `start`. `None` once the scan has reached the end of the tablet.
    pub last_key: Option<DocKey>,
}

impl RowScanChunk {
    /// Whether this chunk reached the end of the tablet's rows.
    pub fn exhausted(&self) -> bool {
        self.last_key.is_none()
    }
}
