//! The provisional-write (intent) store (component C3).
//!
//! Every write made inside a distributed transaction lands here first, as a
//! *primary intent* keyed by `transaction_id || subdoc_key`, paired with a
//! *reverse-index* entry keyed by `doc_key || transaction_id` that points
//! back at the primary. The reverse index is what lets the intent-aware
//! iterator (C4) find "is there an intent on this row" without knowing the
//! transaction id in advance; the primary layout is what lets the cleaner
//! and the transaction participant (C6) find "every intent this
//! transaction wrote" by a single prefix scan over `transaction_id`.

use crate::kv_store::{KvStore, WriteBatch};
use tablet_core::{DocHybridTime, DocKey, TabletError, TabletResult, TransactionId, ValueBytes};

fn primary_key(txn_id: TransactionId, doc_key: &DocKey) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + doc_key.len());
    key.extend_from_slice(txn_id.as_bytes());
    key.extend_from_slice(doc_key.as_bytes());
    key
}

fn reverse_key(doc_key: &DocKey, txn_id: TransactionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(doc_key.len() + 16);
    key.extend_from_slice(doc_key.as_bytes());
    key.extend_from_slice(txn_id.as_bytes());
    key
}

/// One provisional write, as stored in the primary intent record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentRecord {
    /// The row this intent writes.
    pub doc_key: DocKey,
    /// The hybrid time the write was proposed at, and the write id
    /// disambiguating it from sibling writes in the same batch.
    pub doc_hybrid_time: DocHybridTime,
    /// The provisional value (or tombstone).
    pub value: ValueBytes,
}

fn encode_intent_value(record: &IntentRecord) -> Vec<u8> {
    // The hybrid time suffix is appended last, matching `SubDocKey`'s
    // convention, so decoding strips it off the back of the buffer.
    let mut out = record.value.encode();
    record.doc_hybrid_time.encode(&mut out);
    out
}

fn decode_intent_value(doc_key: DocKey, bytes: &[u8]) -> TabletResult<IntentRecord> {
    let (doc_hybrid_time, suffix_len) =
        DocHybridTime::decode_from_end(bytes).map_err(|e| TabletError::Corruption(format!("intent record hybrid time: {e}")))?;
    let value_bytes = &bytes[..bytes.len() - suffix_len];
    let value = ValueBytes::decode(value_bytes).map_err(|e| TabletError::Corruption(format!("intent record value: {e}")))?;
    Ok(IntentRecord {
        doc_key,
        doc_hybrid_time,
        value,
    })
}

/// The provisional-write store: a primary keyspace plus a reverse index,
/// both backed by the same underlying [`KvStore`] but with disjoint key
/// namespaces (a leading `0x00`/`0x01` byte, so the two scan orders never
/// interleave).
pub struct IntentStore<S: KvStore> {
    store: S,
}

const PRIMARY_NAMESPACE: u8 = 0x00;
const REVERSE_NAMESPACE: u8 = 0x01;

fn namespaced(namespace: u8, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(namespace);
    out.extend_from_slice(key);
    out
}

impl<S: KvStore> IntentStore<S> {
    /// Wrap a storage engine instance as an intent store.
    pub fn new(store: S) -> Self {
        IntentStore { store }
    }

    /// Write one transaction's intents atomically: a primary record and a
    /// reverse-index pointer for each.
    pub fn put_intents(&self, txn_id: TransactionId, intents: &[IntentRecord]) -> TabletResult<()> {
        let mut batch = WriteBatch::new();
        for intent in intents {
            let primary = namespaced(PRIMARY_NAMESPACE, &primary_key(txn_id, &intent.doc_key));
            batch.put(primary.clone(), encode_intent_value(intent));
            let reverse = namespaced(REVERSE_NAMESPACE, &reverse_key(&intent.doc_key, txn_id));
            batch.put(reverse, primary);
        }
        self.store.write(batch)
    }

    /// Look up the intent a transaction holds on a row, if any.
    pub fn get_intent(&self, txn_id: TransactionId, doc_key: &DocKey) -> TabletResult<Option<IntentRecord>> {
        let primary = namespaced(PRIMARY_NAMESPACE, &primary_key(txn_id, doc_key));
        match self.store.get(&primary)? {
            Some(bytes) => Ok(Some(decode_intent_value(doc_key.clone(), &bytes)?)),
            None => Ok(None),
        }
    }

    /// Find any intent on `doc_key`, regardless of which transaction holds
    /// it, via the reverse index. Returns the holding transaction id and
    /// the intent record.
    pub fn find_intent_on_row(&self, doc_key: &DocKey) -> TabletResult<Option<(TransactionId, IntentRecord)>> {
        let prefix = namespaced(REVERSE_NAMESPACE, doc_key.as_bytes());
        let mut iter = self.store.new_iterator();
        if !iter.seek(&prefix) || !iter.key().starts_with(&prefix) {
            return Ok(None);
        }
        let reverse_key_bytes = iter.key();
        let txn_bytes = &reverse_key_bytes[reverse_key_bytes.len() - 16..];
        let mut txn_array = [0u8; 16];
        txn_array.copy_from_slice(txn_bytes);
        let txn_id = TransactionId::new(txn_array);
        let primary_bytes = iter.value().to_vec();
        let primary_payload = self
            .store
            .get(&primary_bytes)?
            .ok_or_else(|| TabletError::Corruption("reverse index points at missing primary intent".into()))?;
        Ok(Some((txn_id, decode_intent_value(doc_key.clone(), &primary_payload)?)))
    }

    /// Every intent written by `txn_id`, found via a single prefix scan
    /// over the primary keyspace. Used by the transaction participant (C6)
    /// to apply or remove a transaction's intents in bulk.
    pub fn scan_transaction_intents(&self, txn_id: TransactionId) -> TabletResult<Vec<IntentRecord>> {
        let prefix = namespaced(PRIMARY_NAMESPACE, txn_id.as_bytes());
        let mut out = Vec::new();
        let mut iter = self.store.new_iterator();
        if !iter.seek(&prefix) {
            return Ok(out);
        }
        while iter.valid() && iter.key().starts_with(&prefix) {
            let doc_key_bytes = iter.key()[prefix.len()..].to_vec();
            let doc_key = DocKey::from_encoded(doc_key_bytes);
            out.push(decode_intent_value(doc_key, iter.value())?);
            if !iter.next() {
                break;
            }
        }
        Ok(out)
    }

    /// Remove every intent a transaction holds, both primary records and
    /// their reverse-index entries. Called once a transaction's write
    /// batch has been durably applied to the committed store, or once it
    /// has aborted.
    pub fn remove_transaction_intents(&self, txn_id: TransactionId) -> TabletResult<()> {
        let intents = self.scan_transaction_intents(txn_id)?;
        let mut batch = WriteBatch::new();
        for intent in &intents {
            batch.delete(namespaced(PRIMARY_NAMESPACE, &primary_key(txn_id, &intent.doc_key)));
            batch.delete(namespaced(REVERSE_NAMESPACE, &reverse_key(&intent.doc_key, txn_id)));
        }
        self.store.write(batch)
    }

    /// Every distinct transaction id with at least one live intent,
    /// discovered by scanning the primary keyspace once and deduplicating
    /// adjacent 16-byte prefixes. Used by the background cleaner ([`crate::cleaner`])
    /// to find cleanup candidates without needing an independent index of
    /// "transactions with intents".
    pub fn distinct_transaction_ids(&self) -> TabletResult<Vec<TransactionId>> {
        let mut out = Vec::new();
        let mut iter = self.store.new_iterator();
        let prefix = [PRIMARY_NAMESPACE];
        if !iter.seek(&prefix) {
            return Ok(out);
        }
        while iter.valid() && iter.key().starts_with(&prefix) {
            let key = iter.key();
            if key.len() < 1 + 16 {
                if !iter.next() {
                    break;
                }
                continue;
            }
            let mut txn_bytes = [0u8; 16];
            txn_bytes.copy_from_slice(&key[1..17]);
            let txn_id = TransactionId::new(txn_bytes);
            if out.last() != Some(&txn_id) {
                out.push(txn_id);
            }
            // Skip ahead past this transaction's remaining intents rather
            // than visiting each one, since we only need distinct ids.
            let mut next_prefix = Vec::with_capacity(17);
            next_prefix.extend_from_slice(&prefix);
            next_prefix.extend_from_slice(&txn_bytes);
            // Seeking to `txn_bytes` followed by a 0xff byte lands just
            // past every key sharing this transaction's prefix.
            next_prefix.push(0xff);
            if !iter.seek(&next_prefix) {
                break;
            }
        }
        Ok(out)
    }

    /// Every distinct row with a live intent whose encoded key is `>=
    /// start`, in ascending order. Used by the intent-aware iterator (C4)
    /// to merge the intent store's reverse index into its row-candidate
    /// walk alongside the committed store.
    pub fn distinct_row_keys_from(&self, start: &[u8]) -> TabletResult<Vec<DocKey>> {
        let mut out = Vec::new();
        let mut iter = self.store.new_iterator();
        let prefix_start = namespaced(REVERSE_NAMESPACE, start);
        if !iter.seek(&prefix_start) {
            return Ok(out);
        }
        while iter.valid() && iter.key().first() == Some(&REVERSE_NAMESPACE) {
            let reverse_key_bytes = iter.key();
            let doc_key_bytes = reverse_key_bytes[1..reverse_key_bytes.len() - 16].to_vec();
            let doc_key = DocKey::from_encoded(doc_key_bytes);
            if out.last() != Some(&doc_key) {
                out.push(doc_key);
            }
            if !iter.next() {
                break;
            }
        }
        Ok(out)
    }

    /// Borrow the underlying engine, e.g. to call [`KvStore::flush`].
    pub fn engine(&self) -> &S {
        &self.store
    }
}
