//! Concurrency control above the raw committed/intent stores: the
//! intent-aware read path, row-level locking, conflict resolution, and the
//! per-tablet transaction participant.
//!
//! - [`oracle`]: the [`oracle::TxnStatusOracle`] contract shared by the
//!   iterator and the conflict resolver.
//! - [`lock_manager`]: per-path shared/exclusive locking used by the
//!   conflict resolver.
//! - [`conflict`]: conflict resolution against the intent store.
//! - [`iterator`]: the intent-aware merge-read iterator.
//! - [`participant`]: the per-tablet transaction participant.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conflict;
pub mod iterator;
pub mod lock_manager;
pub mod oracle;
pub mod participant;

pub use conflict::{ConflictReason, ConflictResolution, ConflictResolver, IsolationLevel, PreparedOp};
pub use iterator::{IntentAwareIterator, TxnReadContext};
pub use lock_manager::{LockGuard, LockManager, LockMode};
pub use oracle::{FakeOracle, TxnStatusKind, TxnStatusOracle};
pub use participant::{BatchPrepareData, LocalTxnState, StatusTabletClient, TransactionParticipant};
