//! Tablet metadata: schema version, partition bounds, and the tablet's
//! data-state lifecycle.
//!
//! Mirrors the `metadata.pb` file the on-disk layout (see [`crate::layout`])
//! keeps at the root of each tablet directory: small, infrequently updated,
//! and safe to rewrite wholesale on every change rather than incrementally
//! patched.

use tablet_core::{OpId, TabletError, TabletResult};

/// A tablet's lifecycle state with respect to tablet splitting, remote
/// bootstrap, and deletion. Transitions are one-directional; the only
/// exception is `Copying` reverting to `Ready` if a remote bootstrap is
/// abandoned before completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TabletDataState {
    /// Normal operation: the tablet serves reads and writes.
    Ready,
    /// A remote bootstrap or tablet split is copying data into this
    /// tablet's directory; it must not yet serve reads.
    Copying,
    /// The tablet has been split or otherwise superseded; its data is kept
    /// only long enough for any lagging readers to notice, not served.
    Tombstoned,
    /// Fully retired; the directory may be deleted.
    Deleted,
}

impl TabletDataState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: TabletDataState) -> bool {
        use TabletDataState::*;
        matches!(
            (self, next),
            (Ready, Copying) | (Copying, Ready) | (Copying, Tombstoned) | (Ready, Tombstoned) | (Tombstoned, Deleted)
        )
    }
}

/// A tablet's persistent metadata record.
#[derive(Debug, Clone)]
pub struct TabletMetadata {
    /// Monotonically increasing schema version; bumped on every DDL
    /// change applied to this tablet (DDL execution itself is out of
    /// scope, but the version number gates which schema a write batch was
    /// computed against).
    pub schema_version: u64,
    /// The inclusive-start, exclusive-end partition key range this tablet
    /// owns.
    pub partition_start: Vec<u8>,
    /// ditto, end bound.
    pub partition_end: Vec<u8>,
    /// Current lifecycle state.
    pub data_state: TabletDataState,
    /// The highest op id whose effects are known to be durable in this
    /// tablet's stores, used to decide how far back a restarted tablet
    /// must replay from the consensus log.
    pub tombstoned_op_id: OpId,
}

impl TabletMetadata {
    /// A freshly created, empty-range tablet in the `Ready` state.
    pub fn new(partition_start: Vec<u8>, partition_end: Vec<u8>) -> Self {
        TabletMetadata {
            schema_version: 0,
            partition_start,
            partition_end,
            data_state: TabletDataState::Ready,
            tombstoned_op_id: OpId::ZERO,
        }
    }

    /// Move to `next`, failing if the transition is not legal from the
    /// current state.
    pub fn transition_to(&mut self, next: TabletDataState) -> TabletResult<()> {
        if !self.data_state.can_transition_to(next) {
            return Err(TabletError::IllegalState(format!(
                "tablet data state: illegal transition {:?} -> {:?}",
                self.data_state, next
            )));
        }
        self.data_state = next;
        Ok(())
    }
}
