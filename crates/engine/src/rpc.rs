//! The tablet-local RPC surface: plain request/response structs plus a
//! synchronous [`TabletOps`] trait.
//!
//! No wire framing and no transport are modeled here — these are the
//! structs a (not-implemented-here) RPC layer would marshal to and from
//! the wire. [`crate::tablet::Tablet`] implements the storage/transaction-
//! visible half of this surface directly; [`crate::backfill::BackfillOrchestrator`]
//! implements `BackfillIndex` and `GetSafeTime` for its own coordination
//! needs.

use tablet_core::{DocKey, HybridTime, ReadHybridTime, TabletId, TabletResult, TransactionId, ValueBytes};

use crate::wire::WireTarget;

/// One row write carried by a [`WriteRequest`].
#[derive(Debug, Clone)]
pub struct WriteRowRequest {
    /// The row being written.
    pub doc_key: DocKey,
    /// The new value, or a tombstone.
    pub value: ValueBytes,
}

/// `Write(batch)`: apply a batch of row writes to one tablet.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// The tablet the batch is addressed to.
    pub tablet_id: TabletId,
    /// Whether the batch is non-transactional (committed store) or
    /// belongs to a transaction (intent store).
    pub target: WireTarget,
    /// The rows written, in batch order.
    pub rows: Vec<WriteRowRequest>,
}

/// Response to a [`WriteRequest`].
#[derive(Debug, Clone, Copy)]
pub struct WriteResponse {
    /// The hybrid time the batch was applied (and became visible) at.
    pub applied_at: HybridTime,
}

/// `Read(request, read_time)`: read one row at a given read point.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    /// The tablet being read.
    pub tablet_id: TabletId,
    /// The row to read.
    pub doc_key: DocKey,
    /// The read point.
    pub read_time: ReadHybridTime,
    /// The reading transaction's own id, if this read is part of a
    /// transaction (its own uncommitted writes are always visible to it).
    pub txn_id: Option<TransactionId>,
}

/// Response to a [`ReadRequest`].
#[derive(Debug, Clone)]
pub struct ReadResponse {
    /// The row's value visible at the request's read time, or `None` if
    /// absent or tombstoned.
    pub value: Option<ValueBytes>,
    /// The read time actually used (after a possible local restart).
    pub used_read_time: ReadHybridTime,
    /// If set, the read observed a record or intent that may have been
    /// concurrent with the snapshot; the caller must re-issue the read
    /// with `read_time.read` advanced to this hybrid time.
    pub restart_required: Option<HybridTime>,
}

/// The status a status tablet reports for a transaction, mirrored from
/// [`tablet_concurrency::TxnStatusKind`] plus the terminal `Applied` state
/// that only the status tablet itself (not a participant's cache) needs to
/// distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTxnState {
    /// Still running.
    Pending,
    /// Committed; involved tablets are being (or have been) sent APPLY.
    Committed,
    /// Every involved tablet has acknowledged APPLY; eligible for GC.
    Applied,
}

/// `UpdateTransaction({tablet_id, state, involved_tablets, propagated_ht})`:
/// sent by the status tablet coordinator to each involved tablet to drive
/// a participant's apply pipeline, and by the transaction client to the
/// status tablet to report a commit decision.
#[derive(Debug, Clone)]
pub struct UpdateTransactionRequest {
    /// The tablet (participant or status tablet) this update targets.
    pub tablet_id: TabletId,
    /// The transaction being updated.
    pub txn_id: TransactionId,
    /// The new status.
    pub state: RemoteTxnState,
    /// The transaction's full involved-tablet set, carried so a status
    /// tablet receiving a COMMIT request knows who to notify.
    pub involved_tablets: Vec<TabletId>,
    /// The highest hybrid time observed by the sender, folded into the
    /// receiver's clock.
    pub propagated_ht: HybridTime,
}

/// `AbortTransaction({tablet_id, transaction_id})`.
#[derive(Debug, Clone, Copy)]
pub struct AbortTransactionRequest {
    /// The tablet being asked to discard the transaction's intents.
    pub tablet_id: TabletId,
    /// The transaction being aborted.
    pub txn_id: TransactionId,
}

/// `GetSafeTime({tablet_id, min_hybrid_time_for_backfill})`: used by the
/// backfill orchestrator to pick the single safe time a backfill job reads
/// at.
#[derive(Debug, Clone, Copy)]
pub struct GetSafeTimeRequest {
    /// The tablet being queried.
    pub tablet_id: TabletId,
    /// If set, the orchestrator's own clock reading at the time of the
    /// request, passed through as `min_allowed` to the tablet's blocking
    /// `safe_time` wait so the response reflects a point no earlier than
    /// when the backfill job asked.
    pub min_hybrid_time_for_backfill: Option<HybridTime>,
}

/// Response to a [`GetSafeTimeRequest`].
#[derive(Debug, Clone, Copy)]
pub struct GetSafeTimeResponse {
    /// The tablet's safe time at (or after) the requested bound.
    pub safe_time: HybridTime,
}

/// Opaque identifier for one secondary index, scoped to the indexed
/// table. Cluster-level catalog assignment of these ids is out of scope
/// here; the orchestrator treats them as already-resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexId(pub u64);

/// `BackfillIndex({tablet_id, read_at_hybrid_time, start_key, indexes})`:
/// run one chunk of a tablet's backfill scan.
#[derive(Debug, Clone)]
pub struct BackfillIndexRequest {
    /// The tablet being backfilled.
    pub tablet_id: TabletId,
    /// The pinned safe time every chunk of this job reads at.
    pub read_at_hybrid_time: HybridTime,
    /// Resume cursor from a prior chunk, or `None` to start from the
    /// beginning of the tablet.
    pub start_key: Option<DocKey>,
    /// The indexes being backfilled in this pass.
    pub indexes: Vec<IndexId>,
}

/// Response to a [`BackfillIndexRequest`].
#[derive(Debug, Clone)]
pub struct BackfillIndexResponse {
    /// The resume cursor for the next chunk, or `None` if this chunk
    /// reached the end of the tablet.
    pub backfilled_until: Option<DocKey>,
    /// Indexes that failed during this chunk and should be marked
    /// `FAILED` in the backfill job.
    pub failed_index_ids: Vec<IndexId>,
}

/// The tablet-local RPC surface a transport layer (out of scope) would
/// expose over the network. Implemented for `Arc<`[`crate::tablet::Tablet`]`>`
/// (the storage/transaction half needs to share ownership of the tablet
/// with the write pipeline it delegates to), and by
/// [`crate::backfill::BackfillOrchestrator`] for `GetSafeTime` and
/// `BackfillIndex`.
pub trait TabletOps {
    /// Apply a batch of non-transactional or transactional row writes.
    fn write(&self, request: WriteRequest) -> TabletResult<WriteResponse>;
    /// Read one row at a given read point.
    fn read(&self, request: ReadRequest) -> TabletResult<ReadResponse>;
    /// Update a transaction's status as observed by the status tablet or
    /// a participant.
    fn update_transaction(&self, request: UpdateTransactionRequest) -> TabletResult<()>;
    /// Discard a transaction's intents unconditionally.
    fn abort_transaction(&self, request: AbortTransactionRequest) -> TabletResult<()>;
    /// Report the tablet's current (or soon-to-be-reached) safe time.
    fn get_safe_time(&self, request: GetSafeTimeRequest) -> TabletResult<GetSafeTimeResponse>;
}
