//! The caller-side transaction client runtime.
//!
//! One [`TransactionClient`] is shared by every session participating in a
//! transaction. The public API is thread-safe (every method takes `&self`
//! and locks an internal mutex); internally the handle behaves as if
//! single-threaded, matching the design notes' guidance of replacing a
//! callback-heavy async runtime with plain closures plus a cancellation
//! token — here, a dropped `Arc<TransactionClient>` is the cancellation
//! token the background heartbeat thread polls for via a [`Weak`]
//! reference.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tablet_concurrency::IsolationLevel;
use tablet_core::{HybridClock, HybridTime, ReadHybridTime, RuntimeConfig, TabletError, TabletId, TabletResult, TransactionId};

use crate::status::StatusTabletCoordinator;

/// The client-visible lifecycle state. `Running` has two substates,
/// folded into the `status_tablet` field: `None` is not-ready, `Some` is
/// ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Still running; writes may be queued if the status tablet has not
    /// yet been selected.
    Running,
    /// Committed at the paired hybrid time.
    Committed(HybridTime),
    /// Aborted.
    Aborted,
}

/// What a write-pipeline call needs before it can prepare a batch against
/// this transaction.
#[derive(Debug, Clone)]
pub struct PrepareData {
    /// This transaction's id.
    pub txn_id: TransactionId,
    /// The isolation level this transaction was started with.
    pub isolation: IsolationLevel,
    /// The read point to use, populated for snapshot-isolation operations;
    /// serializable operations read the latest snapshot instead (see
    /// [`tablet_concurrency::ConflictResolution::need_read_snapshot`]).
    pub read_time: Option<ReadHybridTime>,
}

/// The outcome of a child transaction once its session is done: the
/// tablets it touched and any restart times it accumulated, both of which
/// the parent merges into its own state via
/// [`TransactionClient::apply_child_result`].
#[derive(Debug, Clone, Default)]
pub struct ChildResult {
    /// Tablets the child touched.
    pub involved_tablets: Vec<TabletId>,
    /// Per-tablet restart hybrid times the child observed.
    pub restart_times: HashMap<TabletId, HybridTime>,
}

struct Inner {
    state: ClientState,
    status_tablet: Option<TabletId>,
    involved_tablets: HashSet<TabletId>,
    restart_times: HashMap<TabletId, HybridTime>,
    waiters: Vec<Box<dyn FnOnce() + Send>>,
    read_time: ReadHybridTime,
}

/// One transaction's caller-side handle.
pub struct TransactionClient {
    txn_id: TransactionId,
    isolation: IsolationLevel,
    clock: Arc<HybridClock>,
    inner: Mutex<Inner>,
}

impl TransactionClient {
    /// Start a new transaction: mint an id, pick the initial read time
    /// from `clock`'s current confidence window, and kick off asynchronous
    /// status-tablet selection on a background thread. Returns immediately
    /// in the not-ready substate; `select` runs on its own thread and the
    /// client becomes ready once it completes.
    pub fn start(isolation: IsolationLevel, clock: Arc<HybridClock>, select: impl FnOnce() -> TabletResult<TabletId> + Send + 'static) -> Arc<Self> {
        let (start_time, local_limit) = clock.now_range();
        let read_time = ReadHybridTime {
            read: start_time,
            local_limit,
            global_limit: local_limit,
            local_limits: Default::default(),
        };
        let client = Arc::new(TransactionClient {
            txn_id: TransactionId::generate(),
            isolation,
            clock,
            inner: Mutex::new(Inner {
                state: ClientState::Running,
                status_tablet: None,
                involved_tablets: HashSet::new(),
                restart_times: HashMap::new(),
                waiters: Vec::new(),
                read_time,
            }),
        });

        let weak = Arc::downgrade(&client);
        thread::spawn(move || {
            let result = select();
            let Some(client) = weak.upgrade() else { return };
            let mut inner = client.inner.lock();
            if let Ok(tablet) = result {
                inner.status_tablet = Some(tablet);
                let waiters = std::mem::take(&mut inner.waiters);
                drop(inner);
                for waiter in waiters {
                    waiter();
                }
            }
        });
        client
    }

    /// This transaction's id.
    pub fn txn_id(&self) -> TransactionId {
        self.txn_id
    }

    /// Whether the status tablet has been selected yet.
    pub fn is_ready(&self) -> bool {
        self.inner.lock().status_tablet.is_some()
    }

    /// If ready, record that this batch touches `tablets` and return the
    /// data the write pipeline needs to prepare it. If not ready, queue
    /// `on_ready` to run once status-tablet selection completes and return
    /// `None` — the caller is expected to retry `prepare` from within
    /// `on_ready`.
    pub fn prepare(&self, tablets: &[TabletId], on_ready: impl FnOnce() + Send + 'static) -> Option<PrepareData> {
        let mut inner = self.inner.lock();
        if inner.status_tablet.is_none() {
            inner.waiters.push(Box::new(on_ready));
            return None;
        }
        inner.involved_tablets.extend(tablets.iter().copied());
        let read_time = match self.isolation {
            IsolationLevel::Snapshot => Some(inner.read_time.clone()),
            IsolationLevel::Serializable => None,
        };
        Some(PrepareData {
            txn_id: self.txn_id,
            isolation: self.isolation,
            read_time,
        })
    }

    /// Feedback from a replicated batch: fold `propagated_ht` (the highest
    /// hybrid time observed in the batch's replies) into the clock, and if
    /// the batch failed with a retryable conflict, move the transaction to
    /// `Aborted` — a conflict anywhere means the whole transaction cannot
    /// commit.
    pub fn flushed(&self, result: &TabletResult<()>, propagated_ht: Option<HybridTime>) {
        if let Some(ht) = propagated_ht {
            self.clock.update(ht);
        }
        if let Err(err) = result {
            if err.is_retryable() {
                self.inner.lock().state = ClientState::Aborted;
            }
        }
    }

    /// Merge a read-restart signal for `tablet`, keeping the maximum
    /// restart time observed for it so far. The caller must follow up with
    /// [`TransactionClient::create_restarted`] to obtain the transaction's
    /// new read point before retrying.
    pub fn restart_required(&self, tablet: TabletId, restart_time: HybridTime) {
        let mut inner = self.inner.lock();
        let entry = inner.restart_times.entry(tablet).or_insert(HybridTime::MIN);
        *entry = (*entry).max(restart_time);
    }

    /// Build the transaction's restarted read point: `read` advances to
    /// the maximum restart time observed across every tablet, and
    /// `local_limit` is repinned to the clock's current confidence window.
    pub fn create_restarted(&self) -> ReadHybridTime {
        let mut inner = self.inner.lock();
        let max_seen = inner.restart_times.values().copied().max().unwrap_or(inner.read_time.read);
        let (_, local_limit) = self.clock.now_range();
        let restarted = inner.read_time.restarted(max_seen, local_limit);
        inner.read_time = restarted.clone();
        inner.restart_times.clear();
        restarted
    }

    /// Commit the transaction. If no tablet was ever touched, this
    /// degrades to an abort (nothing to apply) but still reports success
    /// to the caller, per the design's "empty transaction" handling.
    pub fn commit(&self, coordinator: &StatusTabletCoordinator) -> TabletResult<HybridTime> {
        let tablets: Vec<TabletId> = {
            let inner = self.inner.lock();
            inner.involved_tablets.iter().copied().collect()
        };
        if tablets.is_empty() {
            let _ = coordinator.abort(self.txn_id);
            self.inner.lock().state = ClientState::Aborted;
            return Ok(HybridTime::MIN);
        }
        let commit_ht = coordinator.commit(self.txn_id, &tablets)?;
        self.inner.lock().state = ClientState::Committed(commit_ht);
        Ok(commit_ht)
    }

    /// Abort the transaction; fire-and-forget, swallowing any error from
    /// an already-decided status tablet record.
    pub fn abort(&self, coordinator: &StatusTabletCoordinator) {
        let _ = coordinator.abort(self.txn_id);
        self.inner.lock().state = ClientState::Aborted;
    }

    /// The client's current state.
    pub fn state(&self) -> ClientState {
        self.inner.lock().state
    }

    /// Produce this transaction's result for a parent transaction to
    /// merge via [`TransactionClient::apply_child_result`]. Child
    /// transactions share their parent's id and metadata (constructed with
    /// the same `txn_id` by the caller) but run against their own
    /// [`TransactionClient`] handle so their prepare/flush bookkeeping
    /// does not race the parent's.
    pub fn finish_child(&self) -> ChildResult {
        let inner = self.inner.lock();
        ChildResult {
            involved_tablets: inner.involved_tablets.iter().copied().collect(),
            restart_times: inner.restart_times.clone(),
        }
    }

    /// Merge a child transaction's result into this (parent) handle.
    pub fn apply_child_result(&self, result: ChildResult) {
        let mut inner = self.inner.lock();
        inner.involved_tablets.extend(result.involved_tablets);
        for (tablet, ht) in result.restart_times {
            let entry = inner.restart_times.entry(tablet).or_insert(HybridTime::MIN);
            *entry = (*entry).max(ht);
        }
    }

    /// Spawn the heartbeat loop: every `config.current().heartbeat_interval`,
    /// heartbeat `coordinator` on behalf of this transaction, checking a
    /// weak reference each tick so the loop exits as soon as the last
    /// strong reference to this handle is dropped (the "handle drop is the
    /// cancellation token" contract).
    pub fn spawn_heartbeater(self: &Arc<Self>, coordinator: Arc<StatusTabletCoordinator>, config: Arc<RuntimeConfig>) {
        let weak: Weak<TransactionClient> = Arc::downgrade(self);
        thread::spawn(move || loop {
            let Some(client) = weak.upgrade() else { return };
            let txn_id = client.txn_id;
            let still_running = matches!(client.state(), ClientState::Running);
            let interval = config.current().heartbeat_interval;
            drop(client);
            if !still_running {
                return;
            }
            let _ = coordinator.heartbeat(txn_id);
            thread::sleep(interval);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration as StdDuration;

    fn clock() -> Arc<HybridClock> {
        Arc::new(HybridClock::system(StdDuration::from_millis(500)))
    }

    fn coordinator() -> Arc<StatusTabletCoordinator> {
        Arc::new(StatusTabletCoordinator::new(clock(), Arc::new(RuntimeConfig::default())))
    }

    #[test]
    fn starts_not_ready_and_becomes_ready_once_selection_completes() {
        let tablet = TabletId::generate();
        let client = TransactionClient::start(IsolationLevel::Snapshot, clock(), move || Ok(tablet));
        // Selection runs on another thread; wait briefly for it.
        for _ in 0..100 {
            if client.is_ready() {
                break;
            }
            thread::sleep(StdDuration::from_millis(5));
        }
        assert!(client.is_ready());
    }

    #[test]
    fn prepare_queues_a_waiter_when_not_ready_and_runs_it_once_ready() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let tablet = TabletId::generate();
        // A slow selector so we can observe the not-ready path deterministically.
        let client = TransactionClient::start(IsolationLevel::Snapshot, clock(), move || {
            thread::sleep(StdDuration::from_millis(50));
            Ok(tablet)
        });

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let result = client.prepare(&[tablet], move || {
            ran2.store(true, Ordering::SeqCst);
            let _ = tx.send(());
        });
        assert!(result.is_none());

        rx.recv_timeout(StdDuration::from_secs(2)).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn prepare_returns_data_once_ready() {
        let tablet = TabletId::generate();
        let client = TransactionClient::start(IsolationLevel::Snapshot, clock(), move || Ok(tablet));
        for _ in 0..100 {
            if client.is_ready() {
                break;
            }
            thread::sleep(StdDuration::from_millis(5));
        }
        let data = client.prepare(&[tablet], || {}).unwrap();
        assert_eq!(data.txn_id, client.txn_id());
        assert!(data.read_time.is_some());
    }

    #[test]
    fn serializable_transactions_do_not_get_a_pinned_read_time() {
        let tablet = TabletId::generate();
        let client = TransactionClient::start(IsolationLevel::Serializable, clock(), move || Ok(tablet));
        for _ in 0..100 {
            if client.is_ready() {
                break;
            }
            thread::sleep(StdDuration::from_millis(5));
        }
        let data = client.prepare(&[tablet], || {}).unwrap();
        assert!(data.read_time.is_none());
    }

    #[test]
    fn commit_with_no_involved_tablets_degrades_to_abort_but_reports_success() {
        let tablet = TabletId::generate();
        let client = TransactionClient::start(IsolationLevel::Snapshot, clock(), move || Ok(tablet));
        for _ in 0..100 {
            if client.is_ready() {
                break;
            }
            thread::sleep(StdDuration::from_millis(5));
        }
        let coordinator = coordinator();
        let result = client.commit(&coordinator);
        assert!(result.is_ok());
        assert_eq!(client.state(), ClientState::Aborted);
    }

    #[test]
    fn commit_after_touching_a_tablet_reaches_committed_state() {
        let tablet = TabletId::generate();
        let client = TransactionClient::start(IsolationLevel::Snapshot, clock(), move || Ok(tablet));
        for _ in 0..100 {
            if client.is_ready() {
                break;
            }
            thread::sleep(StdDuration::from_millis(5));
        }
        client.prepare(&[tablet], || {});

        let coordinator = coordinator();
        coordinator.heartbeat(client.txn_id()).unwrap();
        let commit_ht = client.commit(&coordinator).unwrap();
        assert!(matches!(client.state(), ClientState::Committed(ht) if ht == commit_ht));
    }

    #[test]
    fn flushed_with_a_retryable_error_moves_to_aborted() {
        let tablet = TabletId::generate();
        let client = TransactionClient::start(IsolationLevel::Snapshot, clock(), move || Ok(tablet));
        client.flushed(&Err(TabletError::try_again("conflict")), None);
        assert_eq!(client.state(), ClientState::Aborted);
    }

    #[test]
    fn restart_required_and_create_restarted_advance_the_read_point() {
        let tablet = TabletId::generate();
        let client = TransactionClient::start(IsolationLevel::Snapshot, clock(), move || Ok(tablet));
        let original_read = client.inner.lock().read_time.read;
        client.restart_required(tablet, original_read.incremented().incremented());
        let restarted = client.create_restarted();
        assert!(restarted.read > original_read);
    }

    #[test]
    fn child_result_merges_into_parent_state() {
        let tablet_a = TabletId::generate();
        let tablet_b = TabletId::generate();
        let parent = TransactionClient::start(IsolationLevel::Snapshot, clock(), move || Ok(tablet_a));
        for _ in 0..100 {
            if parent.is_ready() {
                break;
            }
            thread::sleep(StdDuration::from_millis(5));
        }
        parent.prepare(&[tablet_a], || {});

        let mut restart_times = HashMap::new();
        restart_times.insert(tablet_b, HybridTime::pack(999, 0));
        let child_result = ChildResult {
            involved_tablets: vec![tablet_b],
            restart_times,
        };
        parent.apply_child_result(child_result);

        let merged = parent.inner.lock();
        assert!(merged.involved_tablets.contains(&tablet_a));
        assert!(merged.involved_tablets.contains(&tablet_b));
        assert_eq!(merged.restart_times.get(&tablet_b), Some(&HybridTime::pack(999, 0)));
    }
}
