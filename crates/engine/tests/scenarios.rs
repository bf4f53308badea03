//! End-to-end tests driving a [`Tablet`] the way a real caller would:
//! through [`WritePipeline`] and [`BackfillOrchestrator`] rather than by
//! poking internal state directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tablet_concurrency::conflict::IsolationLevel;
use tablet_concurrency::participant::{StatusTabletClient, TransactionParticipant};
use tablet_concurrency::{LockManager, PreparedOp, TxnStatusKind};
use tablet_core::{DocKey, HybridClock, HybridTime, RuntimeConfig, TabletConfig, TabletId, TabletResult, TransactionId, ValueBytes};
use tablet_durability::{ConsensusLog, InMemoryConsensusLog};
use tablet_engine::backfill::{BackfillJobStatus, BackfillOrchestrator, IndexId};
use tablet_engine::pipeline::WritePipeline;
use tablet_engine::tablet::Tablet;
use tablet_engine::wire::WireTarget;
use tablet_storage::{CommittedStore, IntentStore, MemKvStore};

struct AlwaysPending;
impl StatusTabletClient for AlwaysPending {
    fn fetch_status(&self, _txn_id: TransactionId) -> TabletResult<(TxnStatusKind, HybridTime)> {
        Ok((TxnStatusKind::Pending, HybridTime::MIN))
    }
}

fn new_tablet() -> Arc<Tablet<MemKvStore, MemKvStore>> {
    let committed = Arc::new(CommittedStore::new(MemKvStore::new()));
    let intents = Arc::new(IntentStore::new(MemKvStore::new()));
    let participant = Arc::new(TransactionParticipant::new(Arc::clone(&committed), Arc::clone(&intents), Arc::new(AlwaysPending)));
    let clock = Arc::new(HybridClock::system(Duration::from_millis(500)));
    let config = Arc::new(RuntimeConfig::new(TabletConfig::default()));
    let log: Arc<dyn ConsensusLog> = Arc::new(InMemoryConsensusLog::new(1));
    let tablet = Tablet::new(TabletId::generate(), committed, intents, Arc::new(LockManager::new()), participant, clock, config, log);
    tablet.spawn_apply_loop();
    tablet
}

fn key(letter: &str) -> DocKey {
    DocKey::builder().add_bytes(letter.as_bytes()).finish()
}

/// S1 — write then read, single tablet, snapshot isolation: a committed
/// value is visible to a later snapshot read.
#[test]
fn write_then_read_single_tablet_snapshot_isolation() {
    let tablet = new_tablet();
    let pipeline = WritePipeline::new(Arc::clone(&tablet));

    let read_time = pipeline.pick_read_time().unwrap();
    let ops = vec![PreparedOp { doc_key: key("a"), is_write: true }];
    let outcome = pipeline
        .execute(ops, IsolationLevel::Snapshot, WireTarget::NonTransactional, read_time, true, &|_iter| {
            Ok(vec![(key("a"), ValueBytes::bytes(b"1".to_vec(), None, None))])
        })
        .unwrap();

    let later_read = pipeline.pick_read_time().unwrap();
    assert!(later_read.read >= outcome.applied_at);
    let value = tablet.committed().get_latest_visible(&key("a"), later_read.read).unwrap();
    assert_eq!(value.unwrap().as_bytes(), Some(b"1".as_slice()));

    tablet.stop_apply_loop();
}

/// S2 — write-write conflict, non-transactional overwrite of a
/// transactional intent: a non-transactional write against a row with a
/// live intent is rejected as a conflict; once the transaction commits
/// (the intent moves into the committed store), a later non-transactional
/// write to the same row succeeds.
#[test]
fn nontransactional_write_conflicts_with_a_live_intent_then_succeeds_after_commit() {
    let tablet = new_tablet();
    let pipeline = WritePipeline::new(Arc::clone(&tablet));

    let txn_id = TransactionId::generate();
    let txn_read_time = pipeline.pick_read_time().unwrap();
    tablet.participant().add(txn_id, txn_read_time.read);
    pipeline
        .execute(
            vec![PreparedOp { doc_key: key("a"), is_write: true }],
            IsolationLevel::Snapshot,
            WireTarget::Transactional(txn_id),
            txn_read_time,
            true,
            &|_iter| Ok(vec![(key("a"), ValueBytes::bytes(b"1".to_vec(), None, None))]),
        )
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_millis(50);
    let conflict = pipeline.resolve_conflicts(&[PreparedOp { doc_key: key("a"), is_write: true }], IsolationLevel::Snapshot, deadline, None);
    assert!(conflict.is_err(), "a live intent on the row must block a concurrent non-transactional write");

    let commit_ht = pipeline.pick_read_time().unwrap().read;
    tablet.propose_apply_transaction(txn_id, commit_ht).unwrap();

    let read_time = pipeline.pick_read_time().unwrap();
    let outcome = pipeline
        .execute(
            vec![PreparedOp { doc_key: key("a"), is_write: true }],
            IsolationLevel::Snapshot,
            WireTarget::NonTransactional,
            read_time,
            true,
            &|_iter| Ok(vec![(key("a"), ValueBytes::bytes(b"2".to_vec(), None, None))]),
        )
        .unwrap();
    let value = tablet.committed().get_latest_visible(&key("a"), outcome.applied_at).unwrap();
    assert_eq!(value.unwrap().as_bytes(), Some(b"2".as_slice()));

    tablet.stop_apply_loop();
}

/// S6 — backfill picks a single safe time: two tablets at different safe
/// times are backfilled at the maximum of the two, and the job reaches
/// `READ_WRITE_AND_DELETE`-equivalent completion (`BackfillJobStatus::Done`)
/// once every tablet's rows have been scanned.
#[test]
fn backfill_picks_the_maximum_safe_time_across_tablets() {
    let t1 = new_tablet();
    let t2 = new_tablet();
    let index = new_tablet();

    let pipeline1 = WritePipeline::new(Arc::clone(&t1));
    let read_time = pipeline1.pick_read_time().unwrap();
    pipeline1
        .execute(vec![PreparedOp { doc_key: key("row1"), is_write: true }], IsolationLevel::Snapshot, WireTarget::NonTransactional, read_time, true, &|_iter| {
            Ok(vec![(key("row1"), ValueBytes::bytes(b"x".to_vec(), None, None))])
        })
        .unwrap();

    let t1_safe_time_before = t1.safe_time();
    std::thread::sleep(Duration::from_millis(5));
    let pipeline2 = WritePipeline::new(Arc::clone(&t2));
    let read_time = pipeline2.pick_read_time().unwrap();
    pipeline2
        .execute(vec![PreparedOp { doc_key: key("row2"), is_write: true }], IsolationLevel::Snapshot, WireTarget::NonTransactional, read_time, true, &|_iter| {
            Ok(vec![(key("row2"), ValueBytes::bytes(b"y".to_vec(), None, None))])
        })
        .unwrap();

    let mut table_tablets = HashMap::new();
    table_tablets.insert(t1.id, Arc::clone(&t1));
    table_tablets.insert(t2.id, Arc::clone(&t2));
    let mut index_tablets = HashMap::new();
    index_tablets.insert(IndexId(1), Arc::clone(&index));
    let orchestrator = BackfillOrchestrator::new(table_tablets, index_tablets);

    let mut job = orchestrator.start_job().unwrap();
    assert!(job.read_at >= t1_safe_time_before);
    assert!(job.read_at >= t2.safe_time());

    let project = |k: &DocKey, v: &ValueBytes| Some((k.clone(), v.clone()));
    orchestrator.run(&mut job, &project);

    assert_eq!(job.status, BackfillJobStatus::Done);
    assert!(job.failed_tablets.is_empty());
    assert!(index.committed().get_latest_visible(&key("row1"), index.safe_time()).unwrap().is_some());
    assert!(index.committed().get_latest_visible(&key("row2"), index.safe_time()).unwrap().is_some());

    t1.stop_apply_loop();
    t2.stop_apply_loop();
    index.stop_apply_loop();
}
