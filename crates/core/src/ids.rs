//! Fixed-size identifiers used across the tablet engine.
//!
//! The design notes call for replacing `unordered_map<string, _>` lookups
//! keyed by string identifiers with maps keyed by fixed-length binary ids.
//! [`TransactionId`] and [`TabletId`] are both 16 bytes, UUID-shaped, so they
//! implement `Copy` and hash cheaply in a `DashMap`.

use std::fmt;
use uuid::Uuid;

/// A transaction id: 16 bytes, minted locally without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId([u8; 16]);

impl TransactionId {
    /// Wrap a raw 16-byte id.
    pub const fn new(bytes: [u8; 16]) -> Self {
        TransactionId(bytes)
    }

    /// Mint a fresh, randomly generated transaction id.
    pub fn generate() -> Self {
        TransactionId(*Uuid::new_v4().as_bytes())
    }

    /// Borrow the raw bytes, e.g. for use as an intent-store key component.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

/// A tablet id: 16 bytes, UUID-shaped, assigned by the cluster catalog
/// (out of scope) and treated here as an opaque handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabletId([u8; 16]);

impl TabletId {
    /// Wrap a raw 16-byte id.
    pub const fn new(bytes: [u8; 16]) -> Self {
        TabletId(bytes)
    }

    /// Mint a fresh, randomly generated tablet id (used in tests).
    pub fn generate() -> Self {
        TabletId(*Uuid::new_v4().as_bytes())
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_ids_are_unique() {
        let a = TransactionId::generate();
        let b = TransactionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn transaction_id_round_trips_bytes() {
        let bytes = [3u8; 16];
        let id = TransactionId::new(bytes);
        assert_eq!(id.as_bytes(), &bytes);
    }

    #[test]
    fn tablet_id_display_is_stable_for_same_bytes() {
        let a = TabletId::new([1u8; 16]);
        let b = TabletId::new([1u8; 16]);
        assert_eq!(a.to_string(), b.to_string());
    }
}
