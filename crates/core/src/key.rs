//! Order-preserving key encoding.
//!
//! [`DocKey`] is the encoded primary-key prefix for a row: a sequence of
//! column values encoded so that unsigned byte-wise comparison of the
//! encoded bytes matches the natural ordering of the original column
//! values. [`SubDocKey`] appends a [`DocHybridTime`] write-time suffix to a
//! `DocKey`, which is what actually gets stored as a key in the committed
//! store and the intent store: for a fixed `DocKey` prefix, ascending byte
//! order over the suffix yields descending write-time order, so the
//! newest version of a row sorts immediately after its key prefix.

use crate::hybrid_time::{DocHybridTime, HybridTimeDecodeError};
use thiserror::Error;

/// Flip the sign bit of a two's-complement `i64` and encode big-endian, so
/// that unsigned byte comparison matches signed integer comparison.
pub fn encode_i64_sortable(v: i64) -> [u8; 8] {
    let flipped = (v as u64) ^ (1u64 << 63);
    flipped.to_be_bytes()
}

/// Inverse of [`encode_i64_sortable`].
pub fn decode_i64_sortable(bytes: [u8; 8]) -> i64 {
    let v = u64::from_be_bytes(bytes) ^ (1u64 << 63);
    v as i64
}

/// Encode an arbitrary byte string so that it compares correctly against
/// other escaped strings even when one is a prefix of another: every `0x00`
/// byte in `input` is escaped to `0x00 0x01`, and the whole encoding is
/// terminated by `0x00 0x00`, which cannot appear as a result of escaping
/// and therefore always sorts before any continuation of a longer string.
pub fn encode_bytes_escaped(input: &[u8], out: &mut Vec<u8>) {
    for &b in input {
        if b == 0 {
            out.push(0);
            out.push(1);
        } else {
            out.push(b);
        }
    }
    out.push(0);
    out.push(0);
}

/// Decode one [`encode_bytes_escaped`]-encoded string starting at the front
/// of `input`. Returns the decoded bytes and the number of input bytes
/// consumed (including the terminator).
pub fn decode_bytes_escaped(input: &[u8]) -> Result<(Vec<u8>, usize), KeyDecodeError> {
    let mut decoded = Vec::new();
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            0 => {
                if i + 1 >= input.len() {
                    return Err(KeyDecodeError::Truncated);
                }
                match input[i + 1] {
                    0 => return Ok((decoded, i + 2)),
                    1 => {
                        decoded.push(0);
                        i += 2;
                    }
                    _ => return Err(KeyDecodeError::InvalidEscape),
                }
            }
            b => {
                decoded.push(b);
                i += 1;
            }
        }
    }
    Err(KeyDecodeError::Truncated)
}

/// Error raised while decoding an escaped byte string or a [`DocKey`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyDecodeError {
    /// The input ended before a terminator or suffix was found.
    #[error("truncated key encoding")]
    Truncated,
    /// An escape sequence other than `00 00` or `00 01` was found.
    #[error("invalid escape sequence in key encoding")]
    InvalidEscape,
    /// The hybrid-time suffix failed to decode.
    #[error("invalid hybrid time suffix: {0}")]
    BadSuffix(#[from] HybridTimeDecodeError),
}

/// A single encoded column value, appended to a [`DocKeyBuilder`].
#[derive(Debug, Clone)]
enum Column {
    Int(i64),
    Bytes(Vec<u8>),
}

/// Builds a [`DocKey`] one column at a time, in primary-key column order.
#[derive(Debug, Clone, Default)]
pub struct DocKeyBuilder {
    columns: Vec<Column>,
}

impl DocKeyBuilder {
    /// Start an empty key.
    pub fn new() -> Self {
        DocKeyBuilder::default()
    }

    /// Append a signed-integer column.
    pub fn add_i64(mut self, v: i64) -> Self {
        self.columns.push(Column::Int(v));
        self
    }

    /// Append a raw-bytes (or UTF-8 string, as bytes) column.
    pub fn add_bytes(mut self, v: impl Into<Vec<u8>>) -> Self {
        self.columns.push(Column::Bytes(v.into()));
        self
    }

    /// Finish building, producing the encoded [`DocKey`].
    pub fn finish(self) -> DocKey {
        let mut encoded = Vec::new();
        for col in &self.columns {
            match col {
                Column::Int(v) => encoded.extend_from_slice(&encode_i64_sortable(*v)),
                Column::Bytes(b) => encode_bytes_escaped(b, &mut encoded),
            }
        }
        DocKey { encoded }
    }
}

/// An encoded, order-preserving document (row) key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocKey {
    encoded: Vec<u8>,
}

impl DocKey {
    /// Wrap an already-encoded byte string directly. Used when a key is
    /// read back off disk rather than built from typed columns.
    pub fn from_encoded(encoded: Vec<u8>) -> Self {
        DocKey { encoded }
    }

    /// Start building a key from typed columns.
    pub fn builder() -> DocKeyBuilder {
        DocKeyBuilder::new()
    }

    /// Borrow the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.encoded
    }

    /// Number of encoded bytes.
    pub fn len(&self) -> usize {
        self.encoded.len()
    }

    /// Whether the encoded key is empty.
    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }
}

/// A stored key: a [`DocKey`] row prefix plus the [`DocHybridTime`] at which
/// that version of the row was written. This is the actual key type stored
/// in the committed store and, with a transaction id prepended, in the
/// intent store (see `tablet-storage::intent_store`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDocKey {
    doc_key: DocKey,
    write_time: DocHybridTime,
}

impl SubDocKey {
    /// Pair a row key with its write time.
    pub fn new(doc_key: DocKey, write_time: DocHybridTime) -> Self {
        SubDocKey { doc_key, write_time }
    }

    /// The row-key prefix.
    pub fn doc_key(&self) -> &DocKey {
        &self.doc_key
    }

    /// The write time.
    pub fn write_time(&self) -> DocHybridTime {
        self.write_time
    }

    /// Encode as `doc_key_bytes || write_time_suffix`, ready to be used as a
    /// storage-engine key. For a fixed `doc_key`, ascending byte order over
    /// encodings of different `write_time`s yields descending write-time
    /// order (newest first), matching the intent-aware iterator's scan
    /// direction.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.doc_key.as_bytes().to_vec();
        self.write_time.encode(&mut out);
        out
    }

    /// Decode a key previously produced by [`SubDocKey::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, KeyDecodeError> {
        let (write_time, suffix_len) = DocHybridTime::decode_from_end(bytes)?;
        if suffix_len > bytes.len() {
            return Err(KeyDecodeError::Truncated);
        }
        let doc_key = DocKey::from_encoded(bytes[..bytes.len() - suffix_len].to_vec());
        Ok(SubDocKey { doc_key, write_time })
    }

    /// Whether `bytes` shares this key's `doc_key` prefix, i.e. whether it
    /// is some other write-time version of the same row. Used by the
    /// iterator's `seek_out_of_subdoc` to find the end of a row's version
    /// history.
    pub fn shares_doc_key_prefix(&self, bytes: &[u8]) -> bool {
        bytes.starts_with(self.doc_key.as_bytes())
    }
}
