//! Byte encoding for entries replicated through a [`tablet_durability::ConsensusLog`].
//!
//! The log's contract is `(OpId, Vec<u8>)`; everything above it is opaque
//! to the log itself. [`ReplicatedOp`] is what the write pipeline
//! proposes and what the tablet's apply loop decodes back, hand-encoded in
//! the same length-prefixed, big-endian style as [`tablet_core::key`] and
//! [`tablet_core::value`] rather than pulled in through a generic
//! serialization crate, since every field already has a natural byte
//! encoding of its own.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read};
use tablet_core::{DocHybridTime, DocKey, HybridTime, TabletError, TabletResult, TransactionId, ValueBytes};

/// Which store a replicated write's entries belong in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireTarget {
    /// Route straight to the committed store.
    NonTransactional,
    /// Route to the intent store under this transaction.
    Transactional(TransactionId),
}

/// One row touched by a replicated write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireEntry {
    /// The row being written.
    pub doc_key: DocKey,
    /// The write's doc hybrid time (carries the write id, for
    /// transactional entries).
    pub doc_hybrid_time: DocHybridTime,
    /// The new value, or a tombstone.
    pub value: ValueBytes,
}

/// The decoded form of one entry proposed to the consensus log.
///
/// Every variant carries a `fence` hybrid time purely for local
/// synchronization: the pipeline registers it as pending in the tablet's
/// [`tablet_core::MvccState`] before proposing and the apply loop marks it
/// applied once the corresponding store mutation lands, so a caller can
/// block on [`tablet_core::MvccState::safe_time`] reaching `fence` to know
/// its proposal has been durably applied without a separate ack channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicatedOp {
    /// Apply a batch of row writes.
    Write {
        /// Synchronization fence; see the enum's documentation.
        fence: HybridTime,
        /// Which store the entries belong in.
        target: WireTarget,
        /// The rows written, in batch order.
        entries: Vec<WireEntry>,
    },
    /// Rewrite a transaction's intents into the committed store at
    /// `commit_ht` and drop the intents.
    ApplyTransaction {
        /// Synchronization fence; see the enum's documentation.
        fence: HybridTime,
        /// The transaction being applied.
        txn_id: TransactionId,
        /// The hybrid time its writes become visible at.
        commit_ht: HybridTime,
    },
    /// Discard a transaction's intents unconditionally.
    AbortTransaction {
        /// Synchronization fence; see the enum's documentation.
        fence: HybridTime,
        /// The transaction being discarded.
        txn_id: TransactionId,
    },
}

impl ReplicatedOp {
    /// The fence hybrid time every variant carries.
    pub fn fence(&self) -> HybridTime {
        match self {
            ReplicatedOp::Write { fence, .. } => *fence,
            ReplicatedOp::ApplyTransaction { fence, .. } => *fence,
            ReplicatedOp::AbortTransaction { fence, .. } => *fence,
        }
    }
}

const TAG_WRITE: u8 = 0;
const TAG_APPLY_TRANSACTION: u8 = 1;
const TAG_ABORT_TRANSACTION: u8 = 2;

const TARGET_NON_TRANSACTIONAL: u8 = 0;
const TARGET_TRANSACTIONAL: u8 = 1;

fn write_lp_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> io::Result<()> {
    out.write_u32::<BigEndian>(bytes.len() as u32)?;
    out.extend_from_slice(bytes);
    Ok(())
}

fn read_lp_bytes(input: &mut &[u8]) -> Result<Vec<u8>, WireDecodeError> {
    let len = input.read_u32::<BigEndian>().map_err(|_| WireDecodeError::Truncated)? as usize;
    if input.len() < len {
        return Err(WireDecodeError::Truncated);
    }
    let (head, tail) = input.split_at(len);
    let out = head.to_vec();
    *input = tail;
    Ok(out)
}

fn write_txn_id(out: &mut Vec<u8>, txn_id: TransactionId) {
    out.extend_from_slice(txn_id.as_bytes());
}

fn read_txn_id(input: &mut &[u8]) -> Result<TransactionId, WireDecodeError> {
    if input.len() < 16 {
        return Err(WireDecodeError::Truncated);
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&input[..16]);
    *input = &input[16..];
    Ok(TransactionId::new(bytes))
}

fn write_doc_hybrid_time(out: &mut Vec<u8>, ht: DocHybridTime) -> io::Result<()> {
    out.write_u64::<BigEndian>(ht.hybrid_time().raw())?;
    out.write_u32::<BigEndian>(ht.write_id())?;
    out.write_i64::<BigEndian>(ht.leader_term())?;
    Ok(())
}

fn read_doc_hybrid_time(input: &mut &[u8]) -> Result<DocHybridTime, WireDecodeError> {
    let raw = input.read_u64::<BigEndian>().map_err(|_| WireDecodeError::Truncated)?;
    let write_id = input.read_u32::<BigEndian>().map_err(|_| WireDecodeError::Truncated)?;
    let leader_term = input.read_i64::<BigEndian>().map_err(|_| WireDecodeError::Truncated)?;
    Ok(DocHybridTime::new(HybridTime::from_raw(raw), write_id, leader_term))
}

fn write_entry(out: &mut Vec<u8>, entry: &WireEntry) -> io::Result<()> {
    write_lp_bytes(out, entry.doc_key.as_bytes())?;
    write_doc_hybrid_time(out, entry.doc_hybrid_time)?;
    write_lp_bytes(out, &entry.value.encode())?;
    Ok(())
}

fn read_entry(input: &mut &[u8]) -> Result<WireEntry, WireDecodeError> {
    let doc_key = DocKey::from_encoded(read_lp_bytes(input)?);
    let doc_hybrid_time = read_doc_hybrid_time(input)?;
    let value_bytes = read_lp_bytes(input)?;
    let value = ValueBytes::decode(&value_bytes).map_err(|e| WireDecodeError::Value(e.to_string()))?;
    Ok(WireEntry { doc_key, doc_hybrid_time, value })
}

/// Encode a [`ReplicatedOp`] into the bytes proposed to the consensus log.
pub fn encode(op: &ReplicatedOp) -> Vec<u8> {
    let mut out = Vec::new();
    // `Vec<u8>`'s `Write` impl never fails; the `expect`s below only guard
    // against a logic error in this function, not I/O.
    match op {
        ReplicatedOp::Write { fence, target, entries } => {
            out.write_u8(TAG_WRITE).expect("write to Vec cannot fail");
            out.write_u64::<BigEndian>(fence.raw()).expect("write to Vec cannot fail");
            match target {
                WireTarget::NonTransactional => out.write_u8(TARGET_NON_TRANSACTIONAL).expect("write to Vec cannot fail"),
                WireTarget::Transactional(txn_id) => {
                    out.write_u8(TARGET_TRANSACTIONAL).expect("write to Vec cannot fail");
                    write_txn_id(&mut out, *txn_id);
                }
            }
            out.write_u32::<BigEndian>(entries.len() as u32).expect("write to Vec cannot fail");
            for entry in entries {
                write_entry(&mut out, entry).expect("write to Vec cannot fail");
            }
        }
        ReplicatedOp::ApplyTransaction { fence, txn_id, commit_ht } => {
            out.write_u8(TAG_APPLY_TRANSACTION).expect("write to Vec cannot fail");
            out.write_u64::<BigEndian>(fence.raw()).expect("write to Vec cannot fail");
            write_txn_id(&mut out, *txn_id);
            out.write_u64::<BigEndian>(commit_ht.raw()).expect("write to Vec cannot fail");
        }
        ReplicatedOp::AbortTransaction { fence, txn_id } => {
            out.write_u8(TAG_ABORT_TRANSACTION).expect("write to Vec cannot fail");
            out.write_u64::<BigEndian>(fence.raw()).expect("write to Vec cannot fail");
            write_txn_id(&mut out, *txn_id);
        }
    }
    out
}

/// Error raised while decoding a replicated log entry. Any occurrence means
/// the apply loop's input is corrupt, which the caller treats as fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireDecodeError {
    /// The buffer ended before a required field was read.
    #[error("truncated replicated op encoding")]
    Truncated,
    /// The tag byte did not match any known variant.
    #[error("unknown replicated op tag: {0}")]
    UnknownTag(u8),
    /// The embedded value envelope failed to decode.
    #[error("replicated op value: {0}")]
    Value(String),
}

impl From<WireDecodeError> for TabletError {
    fn from(err: WireDecodeError) -> Self {
        TabletError::Corruption(format!("replicated op: {err}"))
    }
}

/// Decode a [`ReplicatedOp`] previously produced by [`encode`].
pub fn decode(bytes: &[u8]) -> TabletResult<ReplicatedOp> {
    let mut input = bytes;
    let tag = input.read_u8().map_err(|_| WireDecodeError::Truncated)?;
    let op = match tag {
        TAG_WRITE => {
            let fence = HybridTime::from_raw(input.read_u64::<BigEndian>().map_err(|_| WireDecodeError::Truncated)?);
            let target_tag = input.read_u8().map_err(|_| WireDecodeError::Truncated)?;
            let target = match target_tag {
                TARGET_NON_TRANSACTIONAL => WireTarget::NonTransactional,
                TARGET_TRANSACTIONAL => WireTarget::Transactional(read_txn_id(&mut input)?),
                other => return Err(WireDecodeError::UnknownTag(other).into()),
            };
            let count = input.read_u32::<BigEndian>().map_err(|_| WireDecodeError::Truncated)? as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(read_entry(&mut input)?);
            }
            ReplicatedOp::Write { fence, target, entries }
        }
        TAG_APPLY_TRANSACTION => {
            let fence = HybridTime::from_raw(input.read_u64::<BigEndian>().map_err(|_| WireDecodeError::Truncated)?);
            let txn_id = read_txn_id(&mut input)?;
            let commit_ht = HybridTime::from_raw(input.read_u64::<BigEndian>().map_err(|_| WireDecodeError::Truncated)?);
            ReplicatedOp::ApplyTransaction { fence, txn_id, commit_ht }
        }
        TAG_ABORT_TRANSACTION => {
            let fence = HybridTime::from_raw(input.read_u64::<BigEndian>().map_err(|_| WireDecodeError::Truncated)?);
            let txn_id = read_txn_id(&mut input)?;
            ReplicatedOp::AbortTransaction { fence, txn_id }
        }
        other => return Err(WireDecodeError::UnknownTag(other).into()),
    };
    Ok(op)
}
