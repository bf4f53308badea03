//! An in-memory reference implementation of [`KvStore`], used by this
//! crate's own tests and by every downstream crate's tests. Mirrors the
//! teacher corpus's `UnifiedStore`: a `BTreeMap` behind a `parking_lot`
//! lock plus an atomic counter, with no actual background compaction.
//!
//! Unlike a real log-structured engine, `flush()` here does not discard the
//! in-memory data — a snapshot is recorded purely so [`KvStore::get_live_files`]
//! and frontier bookkeeping have something real to exercise. Correctness of
//! the reference engine matters more than faithfully modeling on-disk file
//! churn.

use crate::kv_store::{FileId, KvIterator, KvStore, WriteBatch, WriteOp};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tablet_core::{Frontier, TabletResult};

struct FileRecord {
    id: FileId,
    frontier: Frontier,
}

/// An in-memory [`KvStore`]. Not durable; intended for tests and for
/// exercising the rest of the stack without a real storage engine wired
/// in.
#[derive(Default)]
pub struct MemKvStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    files: RwLock<Vec<FileRecord>>,
    next_file_id: AtomicU64,
    flushed_frontier: RwLock<Option<Frontier>>,
}

impl MemKvStore {
    /// An empty store.
    pub fn new() -> Self {
        MemKvStore::default()
    }

    /// Record a flush with an explicit frontier, merging it into the
    /// flushed frontier the way a real engine's flush would. Exposed
    /// separately from [`KvStore::flush`] so callers that already computed
    /// a frontier for the batch they just wrote (the write pipeline does,
    /// per its componentwise-merge rule) can supply it directly.
    pub fn flush_with_frontier(&self, frontier: Frontier) -> TabletResult<()> {
        let id = FileId(self.next_file_id.fetch_add(1, Ordering::Relaxed));
        self.files.write().push(FileRecord { id, frontier });
        let mut flushed = self.flushed_frontier.write();
        *flushed = Some(match *flushed {
            Some(existing) => existing.merge(frontier),
            None => frontier,
        });
        Ok(())
    }
}

/// Iterates a point-in-time snapshot of the store's entries, taken at
/// construction time, so a concurrent writer never blocks or is observed
/// mid-iteration.
struct MemIterator {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: Option<usize>,
}

impl KvIterator for MemIterator {
    fn seek(&mut self, key: &[u8]) -> bool {
        let idx = self.entries.partition_point(|(k, _)| k.as_slice() < key);
        self.pos = if idx < self.entries.len() { Some(idx) } else { None };
        self.valid()
    }

    fn seek_to_first(&mut self) -> bool {
        self.pos = if self.entries.is_empty() { None } else { Some(0) };
        self.valid()
    }

    fn next(&mut self) -> bool {
        match self.pos {
            Some(idx) if idx + 1 < self.entries.len() => {
                self.pos = Some(idx + 1);
            }
            _ => self.pos = None,
        }
        self.valid()
    }

    fn valid(&self) -> bool {
        self.pos.is_some()
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.pos.expect("iterator not valid")].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.pos.expect("iterator not valid")].1
    }
}

impl KvStore for MemKvStore {
    fn write(&self, batch: WriteBatch) -> TabletResult<()> {
        let mut guard = self.data.write();
        for op in batch.iter() {
            match op {
                WriteOp::Put { key, value } => {
                    guard.insert(key.clone(), value.clone());
                }
                WriteOp::Delete { key } => {
                    guard.remove(key);
                }
            }
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> TabletResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn new_iterator(&self) -> Box<dyn KvIterator + '_> {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = self.data.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Box::new(MemIterator { entries, pos: None })
    }

    fn flush(&self) -> TabletResult<()> {
        let id = FileId(self.next_file_id.fetch_add(1, Ordering::Relaxed));
        // A flush with no explicit batch frontier records bookkeeping only
        // (no frontier to merge); callers that need frontier tracking
        // should use `flush_with_frontier`.
        self.files.write().push(FileRecord {
            id,
            frontier: self.flushed_frontier.read().unwrap_or(Frontier::single(
                tablet_core::FrontierEdge::new(tablet_core::OpId::ZERO, tablet_core::HybridTime::MIN, tablet_core::HybridTime::MIN),
            )),
        });
        Ok(())
    }

    fn get_live_files(&self) -> Vec<FileId> {
        self.files.read().iter().map(|f| f.id).collect()
    }

    fn file_frontier(&self, file: FileId) -> Option<Frontier> {
        self.files.read().iter().find(|f| f.id == file).map(|f| f.frontier)
    }

    fn delete_file(&self, file: FileId) -> TabletResult<()> {
        self.files.write().retain(|f| f.id != file);
        Ok(())
    }

    fn get_flushed_frontier(&self) -> Option<Frontier> {
        *self.flushed_frontier.read()
    }

    fn modify_flushed_frontier(&self, frontier: Frontier) -> TabletResult<()> {
        *self.flushed_frontier.write() = Some(frontier);
        Ok(())
    }
}
