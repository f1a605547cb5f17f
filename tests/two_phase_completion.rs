//! Two-phase completion under contention.
//!
//! Copy-on-write updates and copies to the tail race with each other, with
//! eviction, and with readers. Lost updates or records left tentative would
//! show up as a wrong counter value or as a stuck record in the log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use oxifaster_locking::cache::ReadCacheConfig;
use oxifaster_locking::store::{FasterKv, FasterKvConfig};
use oxifaster_locking::{Address, Status};

const THREADS: usize = 4;
const INCREMENTS: u64 = 300;

fn create_store(config: FasterKvConfig) -> Arc<FasterKv<u64>> {
    Arc::new(FasterKv::new(config).unwrap())
}

/// No record may be left tentative and valid, and nothing in memory may
/// stay locked once every operation has returned.
fn assert_log_quiescent(store: &FasterKv<u64>) {
    let head = store.head_address();
    let mut address = Address::FIRST_VALID;
    while address < store.tail_address() {
        let record = store.hlog().read_evicted(address).unwrap();
        assert!(
            record.info.is_invalid() || !record.info.is_tentative(),
            "record at {address} left tentative"
        );
        if address >= head {
            assert!(!record.info.is_locked(), "record at {address} left locked");
        }
        address += 1;
    }
    assert!(store.lock_table().is_empty(), "lock table not drained");
}

fn run_counter(store: Arc<FasterKv<u64>>, evict: bool) {
    {
        let mut session = store.start_session().unwrap();
        assert_eq!(session.upsert(0, 0), Status::Ok);
    }

    let barrier = Arc::new(Barrier::new(THREADS + 1));
    let done = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let mut session = store.start_session().unwrap();
            barrier.wait();
            for _ in 0..INCREMENTS {
                let status = session.rmw(0, |value| {
                    *value += 1;
                    true
                });
                assert_eq!(status, Status::Ok);
            }
        }));
    }

    let evictor = {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut session = store.start_session().unwrap();
            while !done.load(Ordering::Acquire) {
                if evict {
                    store.evict_all();
                }
                let _ = session.read(&0).unwrap();
                thread::yield_now();
            }
        })
    };

    barrier.wait();
    for handle in handles {
        handle.join().unwrap();
    }
    done.store(true, Ordering::Release);
    evictor.join().unwrap();

    let mut session = store.start_session().unwrap();
    assert_eq!(session.read(&0).unwrap(), Some(THREADS as u64 * INCREMENTS));
    session.refresh();
    assert_log_quiescent(&store);
}

#[test]
fn test_concurrent_rmw_in_mutable_region() {
    run_counter(create_store(FasterKvConfig::new(64, 1 << 16)), false);
}

#[test]
fn test_concurrent_copy_on_write() {
    let config = FasterKvConfig::new(64, 1 << 16).with_mutable_records(0);
    run_counter(create_store(config), false);
}

#[test]
fn test_concurrent_updates_with_eviction() {
    let config = FasterKvConfig::new(64, 1 << 16).with_mutable_records(2);
    run_counter(create_store(config), true);
}

#[test]
fn test_concurrent_updates_with_read_cache() {
    let config = FasterKvConfig::new(64, 1 << 16)
        .with_mutable_records(2)
        .with_read_cache(ReadCacheConfig::new(1 << 14));
    run_counter(create_store(config), true);
}

#[test]
fn test_readers_see_committed_values_only() {
    let config = FasterKvConfig::new(64, 1 << 16).with_mutable_records(0);
    let store = create_store(config);
    {
        let mut session = store.start_session().unwrap();
        assert_eq!(session.upsert(1, 0), Status::Ok);
    }

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let mut session = store.start_session().unwrap();
            for value in 1..=500u64 {
                assert_eq!(session.upsert(1, value), Status::Ok);
            }
        })
    };
    let reader = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let mut session = store.start_session().unwrap();
            let mut last = 0;
            for _ in 0..500 {
                let value = session.read(&1).unwrap().unwrap();
                assert!(value >= last, "read went backwards: {value} < {last}");
                last = value;
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();

    let mut session = store.start_session().unwrap();
    assert_eq!(session.read(&1).unwrap(), Some(500));
    assert_log_quiescent(&store);
}
