//! Core types for the tablet storage and transaction engine
//!
//! This crate defines the foundational, storage-engine-agnostic types shared
//! by every other crate in the workspace:
//!
//! - [`hybrid_time`]: the monotonic hybrid logical clock and per-tablet safe
//!   time oracle.
//! - [`key`]: canonical, order-preserving encoding for document keys, subdoc
//!   keys, and hybrid times.
//! - [`frontier`]: per-SST frontier metadata and its merge rules.
//! - [`value`]: the on-disk value envelope shared by the committed store and
//!   the intent store.
//! - [`ids`]: fixed-size identifiers (transaction id, tablet id).
//! - [`error`]: the unified error type and retry/fatal classification.
//! - [`config`]: immutable tablet configuration plus hot-reloadable knobs.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod frontier;
pub mod hybrid_time;
pub mod ids;
pub mod key;
pub mod mvcc;
pub mod value;

pub use config::{RuntimeConfig, TabletConfig};
pub use error::{ErrorCode, TabletError, TabletResult};
pub use frontier::{Frontier, FrontierEdge, OpId};
pub use hybrid_time::{ClockError, DocHybridTime, HybridClock, HybridTime, PhysicalClock, ReadHybridTime, SystemClock};
pub use ids::{TabletId, TransactionId};
pub use key::{DocKey, DocKeyBuilder, KeyDecodeError, SubDocKey};
pub use mvcc::{MvccState, SafeTimeError};
pub use value::{ValueBytes, ValueDecodeError, ValueType};
