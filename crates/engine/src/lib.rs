//! The tablet write pipeline, RPC surface, and index backfill
//! orchestrator: the top-level crate assembling every lower layer into a
//! runnable tablet.
//!
//! - [`tablet`]: [`tablet::Tablet`], the per-tablet assembly of the
//!   committed/intent stores, MVCC safe time, locks, and the transaction
//!   participant, plus the propose/apply loop that replicates through a
//!   [`tablet_durability::ConsensusLog`].
//! - [`wire`]: the byte encoding for entries proposed to that log.
//! - [`pipeline`]: [`pipeline::WritePipeline`], orchestrating
//!   prepare → conflict-resolve → locks → compute → write-batch →
//!   replicate → apply for one batch.
//! - [`rpc`]: the tablet-local RPC surface as plain request/response
//!   structs plus a synchronous [`rpc::TabletOps`] trait — no wire framing
//!   or transport, both out of scope.
//! - [`backfill`]: [`backfill::BackfillOrchestrator`], the index-backfill
//!   permission state machine and chunked, throttled, resumable per-tablet
//!   scan.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backfill;
pub mod pipeline;
pub mod rpc;
pub mod tablet;
pub mod wire;

pub use backfill::{BackfillJob, BackfillJobStatus, BackfillOrchestrator, IndexDropPermission, IndexPermission};
pub use pipeline::{WriteOutcome, WritePipeline};
pub use rpc::TabletOps;
pub use tablet::Tablet;
pub use wire::{ReplicatedOp, WireEntry, WireTarget};
