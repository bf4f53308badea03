//! The on-disk value envelope shared by the committed store and the intent
//! store.
//!
//! A [`ValueBytes`] is the payload half of a stored record (the key half is
//! a [`crate::key::SubDocKey`]). It carries a type tag, an optional
//! per-cell TTL, and an optional user-supplied timestamp override, followed
//! by the raw payload bytes. Tombstones are a distinct [`ValueType`] rather
//! than an empty payload, so a deleted cell and an empty-string cell never
//! collide.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// The logical type of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// SQL `NULL`.
    Null,
    /// A 64-bit signed integer.
    Int64,
    /// An opaque byte string (includes UTF-8 text).
    Bytes,
    /// A delete marker: this cell was removed as of the record's write
    /// time.
    Tombstone,
}

impl ValueType {
    fn tag(self) -> u8 {
        match self {
            ValueType::Null => 0,
            ValueType::Int64 => 1,
            ValueType::Bytes => 2,
            ValueType::Tombstone => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, ValueDecodeError> {
        match tag {
            0 => Ok(ValueType::Null),
            1 => Ok(ValueType::Int64),
            2 => Ok(ValueType::Bytes),
            3 => Ok(ValueType::Tombstone),
            other => Err(ValueDecodeError::UnknownType(other)),
        }
    }
}

const FLAG_HAS_TTL: u8 = 1 << 4;
const FLAG_HAS_USER_TIMESTAMP: u8 = 1 << 5;

/// A decoded stored value: type, optional TTL, optional user timestamp, and
/// payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueBytes {
    value_type: ValueType,
    ttl_micros: Option<u64>,
    user_timestamp: Option<i64>,
    payload: Vec<u8>,
}

impl ValueBytes {
    /// A 64-bit integer value.
    pub fn int64(v: i64, ttl_micros: Option<u64>, user_timestamp: Option<i64>) -> Self {
        ValueBytes {
            value_type: ValueType::Int64,
            ttl_micros,
            user_timestamp,
            payload: v.to_be_bytes().to_vec(),
        }
    }

    /// An opaque byte-string value.
    pub fn bytes(v: impl Into<Vec<u8>>, ttl_micros: Option<u64>, user_timestamp: Option<i64>) -> Self {
        ValueBytes {
            value_type: ValueType::Bytes,
            ttl_micros,
            user_timestamp,
            payload: v.into(),
        }
    }

    /// A SQL `NULL` value.
    pub fn null(ttl_micros: Option<u64>, user_timestamp: Option<i64>) -> Self {
        ValueBytes {
            value_type: ValueType::Null,
            ttl_micros,
            user_timestamp,
            payload: Vec::new(),
        }
    }

    /// A tombstone: marks the cell deleted as of the owning record's write
    /// time.
    pub fn tombstone(user_timestamp: Option<i64>) -> Self {
        ValueBytes {
            value_type: ValueType::Tombstone,
            ttl_micros: None,
            user_timestamp,
            payload: Vec::new(),
        }
    }

    /// The value's logical type.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Whether this value is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value_type == ValueType::Tombstone
    }

    /// The configured TTL, in microseconds from the write time, if any.
    pub fn ttl_micros(&self) -> Option<u64> {
        self.ttl_micros
    }

    /// The user-supplied timestamp override, if any.
    pub fn user_timestamp(&self) -> Option<i64> {
        self.user_timestamp
    }

    /// Interpret the payload as an `Int64`, if that is this value's type.
    pub fn as_int64(&self) -> Option<i64> {
        if self.value_type != ValueType::Int64 || self.payload.len() != 8 {
            return None;
        }
        let mut array = [0u8; 8];
        array.copy_from_slice(&self.payload);
        Some(i64::from_be_bytes(array))
    }

    /// Borrow the payload as raw bytes, if this value is a `Bytes` value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        if self.value_type == ValueType::Bytes {
            Some(&self.payload)
        } else {
            None
        }
    }

    /// Encode into the canonical on-disk representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 8 + 8 + self.payload.len());
        let mut tag = self.value_type.tag();
        if self.ttl_micros.is_some() {
            tag |= FLAG_HAS_TTL;
        }
        if self.user_timestamp.is_some() {
            tag |= FLAG_HAS_USER_TIMESTAMP;
        }
        out.write_u8(tag).expect("write to Vec cannot fail");
        if let Some(ttl) = self.ttl_micros {
            out.write_u64::<BigEndian>(ttl).expect("write to Vec cannot fail");
        }
        if let Some(ts) = self.user_timestamp {
            out.write_i64::<BigEndian>(ts).expect("write to Vec cannot fail");
        }
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a value previously produced by [`ValueBytes::encode`].
    pub fn decode(mut bytes: &[u8]) -> Result<Self, ValueDecodeError> {
        let tag = bytes.read_u8().map_err(|_| ValueDecodeError::Truncated)?;
        let value_type = ValueType::from_tag(tag & 0x0F)?;
        let ttl_micros = if tag & FLAG_HAS_TTL != 0 {
            Some(bytes.read_u64::<BigEndian>().map_err(|_| ValueDecodeError::Truncated)?)
        } else {
            None
        };
        let user_timestamp = if tag & FLAG_HAS_USER_TIMESTAMP != 0 {
            Some(bytes.read_i64::<BigEndian>().map_err(|_| ValueDecodeError::Truncated)?)
        } else {
            None
        };
        Ok(ValueBytes {
            value_type,
            ttl_micros,
            user_timestamp,
            payload: bytes.to_vec(),
        })
    }
}

/// Error raised while decoding a [`ValueBytes`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValueDecodeError {
    /// The byte string ended before a required field was read.
    #[error("truncated value encoding")]
    Truncated,
    /// The type tag did not match any known [`ValueType`].
    #[error("unknown value type tag: {0}")]
    UnknownType(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int64_round_trips() {
        let v = ValueBytes::int64(-42, None, None);
        let encoded = v.encode();
        let decoded = ValueBytes::decode(&encoded).unwrap();
        assert_eq!(decoded.as_int64(), Some(-42));
        assert_eq!(decoded.value_type(), ValueType::Int64);
    }

    #[test]
    fn bytes_round_trips_with_ttl_and_timestamp() {
        let v = ValueBytes::bytes(b"payload".to_vec(), Some(5_000_000), Some(123));
        let encoded = v.encode();
        let decoded = ValueBytes::decode(&encoded).unwrap();
        assert_eq!(decoded.as_bytes(), Some(&b"payload"[..]));
        assert_eq!(decoded.ttl_micros(), Some(5_000_000));
        assert_eq!(decoded.user_timestamp(), Some(123));
    }

    #[test]
    fn null_has_empty_payload_and_no_int_or_bytes_view() {
        let v = ValueBytes::null(None, None);
        let decoded = ValueBytes::decode(&v.encode()).unwrap();
        assert_eq!(decoded.value_type(), ValueType::Null);
        assert_eq!(decoded.as_int64(), None);
        assert_eq!(decoded.as_bytes(), None);
    }

    #[test]
    fn tombstone_is_distinct_from_empty_bytes() {
        let tombstone = ValueBytes::tombstone(None);
        let empty_bytes = ValueBytes::bytes(Vec::new(), None, None);
        assert!(tombstone.is_tombstone());
        assert!(!empty_bytes.is_tombstone());
        assert_ne!(tombstone.encode(), empty_bytes.encode());
    }

    #[test]
    fn decode_rejects_unknown_type_tag() {
        let err = ValueBytes::decode(&[0x0F]).unwrap_err();
        assert_eq!(err, ValueDecodeError::UnknownType(0x0F));
    }

    #[test]
    fn decode_rejects_truncated_ttl_field() {
        let tag = ValueType::Int64.tag() | FLAG_HAS_TTL;
        let err = ValueBytes::decode(&[tag, 0, 0]).unwrap_err();
        assert_eq!(err, ValueDecodeError::Truncated);
    }
}
