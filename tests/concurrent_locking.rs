//! Mixed concurrent workload over a small key space.
//!
//! Sessions read, upsert, rmw, delete and copy keys to the tail while
//! another thread keeps evicting the log. Each key carries a per-key counter
//! only ever changed by rmw, so the final values can be checked exactly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use oxifaster_locking::cache::ReadCacheConfig;
use oxifaster_locking::store::{FasterKv, FasterKvConfig, LockingConfig};
use oxifaster_locking::{LockType, Status};

const KEYS: u64 = 16;
const THREADS: usize = 4;
const OPS_PER_THREAD: usize = 2_000;

fn counter_key(key: u64) -> u64 {
    key + 1_000
}

fn run_mixed(config: FasterKvConfig, seed: u64) {
    let store = Arc::new(FasterKv::<u64>::new(config).unwrap());
    {
        let mut session = store.start_session().unwrap();
        for key in 0..KEYS {
            assert_eq!(session.upsert(counter_key(key), 0), Status::Ok);
        }
    }

    let barrier = Arc::new(Barrier::new(THREADS + 1));
    let done = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::new();
    for thread_id in 0..THREADS {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        workers.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(seed + thread_id as u64);
            let mut increments: HashMap<u64, u64> = HashMap::new();
            let mut session = store.start_session().unwrap();
            barrier.wait();
            for _ in 0..OPS_PER_THREAD {
                let key = rng.gen_range(0..KEYS);
                match rng.gen_range(0..6) {
                    0 => {
                        let _ = session.read(&key).unwrap();
                    }
                    1 => assert_eq!(session.upsert(key, rng.gen()), Status::Ok),
                    2 => assert_eq!(session.delete(&key), Status::Ok),
                    3 => {
                        let status = session.copy_to_tail(&key);
                        assert!(matches!(status, Status::Ok | Status::NotFound), "{status:?}");
                    }
                    4 => {
                        let status = session.rmw(counter_key(key), |value| {
                            *value += 1;
                            true
                        });
                        assert_eq!(status, Status::Ok);
                        *increments.entry(key).or_default() += 1;
                    }
                    _ => {
                        let mut lockable = session.lockable();
                        assert_eq!(lockable.lock(&counter_key(key), LockType::Exclusive), Status::Ok);
                        let status = lockable.rmw(counter_key(key), |value| {
                            *value += 1;
                            true
                        });
                        assert_eq!(status, Status::Ok);
                        assert_eq!(lockable.unlock(&counter_key(key), LockType::Exclusive), Status::Ok);
                        *increments.entry(key).or_default() += 1;
                    }
                }
            }
            increments
        }));
    }

    let evictor = {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut session = store.start_session().unwrap();
            while !done.load(Ordering::Acquire) {
                store.evict_all();
                session.refresh();
                thread::yield_now();
            }
        })
    };

    barrier.wait();
    let mut expected: HashMap<u64, u64> = HashMap::new();
    for worker in workers {
        for (key, count) in worker.join().unwrap() {
            *expected.entry(key).or_default() += count;
        }
    }
    done.store(true, Ordering::Release);
    evictor.join().unwrap();

    let mut session = store.start_session().unwrap();
    for key in 0..KEYS {
        let want = expected.get(&key).copied().unwrap_or(0);
        assert_eq!(session.read(&counter_key(key)).unwrap(), Some(want), "counter of key {key}");
    }
    session.refresh();
    assert!(store.lock_table().is_empty());
}

#[test]
fn test_mixed_workload() {
    let config = FasterKvConfig::new(64, 1 << 16).with_mutable_records(8);
    run_mixed(config, 7);
}

#[test]
fn test_mixed_workload_with_read_cache() {
    let config = FasterKvConfig::new(64, 1 << 16)
        .with_mutable_records(8)
        .with_read_cache(ReadCacheConfig::new(1 << 15));
    run_mixed(config, 11);
}

#[test]
fn test_mixed_workload_with_tight_spin_budgets() {
    let locking = LockingConfig::default()
        .with_lock_spin_count(0)
        .with_tentative_wait_spins(1)
        .with_close_wait_spins(0)
        .with_lock_table_shards(2);
    let config = FasterKvConfig::new(64, 1 << 16)
        .with_mutable_records(4)
        .with_copy_reads_to_tail(true)
        .with_locking(locking);
    run_mixed(config, 23);
}
