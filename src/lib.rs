//! # Tablet
//!
//! A tablet-local storage and transaction engine for a sharded, replicated
//! document store — the piece of a distributed SQL/NoSQL database that runs
//! on one node and owns one shard's data: MVCC storage, provisional writes
//! (intents), multi-tablet transactions, and online index backfill.
//!
//! This crate is the facade over the workspace's internal crates; most
//! callers only need what is re-exported here.
//!
//! # Architecture
//!
//! | Crate | Responsibility |
//! |-------|----------------|
//! | [`tablet_core`] | Hybrid logical clock, document keys, value envelope, errors, config |
//! | [`tablet_storage`] | Committed store and intent store over a pluggable [`tablet_storage::KvStore`] |
//! | [`tablet_concurrency`] | Intent-aware reads, row locking, conflict resolution, the transaction participant |
//! | [`tablet_durability`] | The consensus log contract and on-disk tablet layout/metadata |
//! | [`tablet_txn`] | The status-tablet coordinator and the caller-side transaction client |
//! | [`tablet_engine`] | [`Tablet`], the write pipeline, the RPC surface, and index backfill |
//!
//! A [`Tablet`] owns one committed store, one intent store, a lock manager,
//! and a transaction participant; callers drive it through
//! [`tablet_engine::pipeline::WritePipeline`] for reads/writes and
//! [`tablet_engine::backfill::BackfillOrchestrator`] for online index
//! builds.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use tablet_core as core;
pub use tablet_concurrency as concurrency;
pub use tablet_durability as durability;
pub use tablet_engine as engine;
pub use tablet_storage as storage;
pub use tablet_txn as txn;

pub use tablet_core::{DocKey, HybridTime, ReadHybridTime, TabletConfig, TabletError, TabletId, TabletResult, TransactionId, ValueBytes};
pub use tablet_engine::{BackfillOrchestrator, Tablet, TabletOps, WritePipeline};
pub use tablet_txn::TransactionClient;
