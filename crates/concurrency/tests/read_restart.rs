//! A reader whose read point trails a row's most recent write gets a
//! restart signal advising the hybrid time to retry at, and retrying with
//! that advice resolves cleanly.

use tablet_concurrency::oracle::FakeOracle;
use tablet_concurrency::{IntentAwareIterator, TxnReadContext};
use tablet_core::{DocHybridTime, DocKey, HybridTime, ReadHybridTime, ValueBytes};
use tablet_storage::{CommittedRecord, CommittedStore, IntentStore, MemKvStore};

fn key() -> DocKey {
    DocKey::builder().add_bytes(b"a".to_vec()).finish()
}

#[test]
fn restart_signal_is_resolved_by_retrying_at_the_advised_hybrid_time() {
    let committed = CommittedStore::new(MemKvStore::new());
    let intents = IntentStore::new(MemKvStore::new());
    committed
        .apply(&[CommittedRecord {
            doc_key: key(),
            write_time: DocHybridTime::from_hybrid_time(HybridTime::pack(50, 0)),
            value: ValueBytes::bytes(b"1".to_vec(), None, None),
        }])
        .unwrap();

    let oracle = FakeOracle::new();
    let read_time = ReadHybridTime {
        read: HybridTime::pack(40, 0),
        local_limit: HybridTime::pack(60, 0),
        global_limit: HybridTime::pack(60, 0),
        local_limits: Default::default(),
    };
    let mut iter = IntentAwareIterator::new(&committed, &intents, read_time, TxnReadContext { self_id: None, oracle: &oracle });
    iter.seek(key().as_bytes()).unwrap();
    assert_eq!(iter.max_seen_ht(), Some(HybridTime::pack(50, 0)));

    let restarted = ReadHybridTime {
        read: HybridTime::pack(50, 0),
        local_limit: HybridTime::pack(50, 0),
        global_limit: HybridTime::pack(60, 0),
        local_limits: Default::default(),
    };
    let mut iter = IntentAwareIterator::new(&committed, &intents, restarted, TxnReadContext { self_id: None, oracle: &oracle });
    assert!(iter.seek(key().as_bytes()).unwrap());
    assert_eq!(iter.max_seen_ht(), None);
    assert_eq!(iter.value().as_bytes(), Some(b"1".as_slice()));
}
