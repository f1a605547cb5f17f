use std::sync::Arc;

use super::*;
use crate::cache::ReadCacheConfig;
use crate::record::LockType;
use crate::store::record_source::Tier;

fn locking() -> LockingConfig {
    LockingConfig::default()
        .with_tentative_wait_spins(2)
        .with_close_wait_spins(2)
        .with_lock_spin_count(2)
}

fn create_test_store() -> Arc<FasterKv<u64>> {
    let config = FasterKvConfig::new(64, 1024).with_locking(locking());
    Arc::new(FasterKv::new(config).unwrap())
}

fn create_read_only_store() -> Arc<FasterKv<u64>> {
    let config = FasterKvConfig::new(64, 1024)
        .with_mutable_records(0)
        .with_locking(locking());
    Arc::new(FasterKv::new(config).unwrap())
}

fn create_cached_store() -> Arc<FasterKv<u64>> {
    let config = FasterKvConfig::new(64, 1024)
        .with_locking(locking())
        .with_read_cache(ReadCacheConfig::new(64));
    Arc::new(FasterKv::new(config).unwrap())
}

fn ephemeral(store: &FasterKv<u64>) -> ExecutionContext<SessionLocking> {
    ExecutionContext {
        slot: store.epoch.acquire_slot().unwrap(),
        locking: SessionLocking::new(LockingMode::Ephemeral, store.config.locking.lock_spin_count),
    }
}

fn hash(key: u64) -> KeyHash {
    KeyHash::new(key.get_hash())
}

#[test]
fn test_create_store() {
    let store = create_test_store();
    assert_eq!(store.head_address(), Address::FIRST_VALID);
    assert_eq!(store.tail_address(), Address::FIRST_VALID);
    assert!(store.read_cache().is_none());
    assert!(store.lock_table().is_empty());
}

#[test]
fn test_manual_mode_is_not_a_session_default() {
    let config = FasterKvConfig::new(64, 16).with_locking(LockingConfig::default().with_mode(LockingMode::Manual));
    assert_eq!(FasterKv::<u64>::new(config).unwrap_err(), Status::InvalidArgument);

    let store = create_test_store();
    assert_eq!(
        store.start_session_with_mode(LockingMode::Manual).unwrap_err(),
        Status::InvalidArgument
    );
}

#[test]
fn test_invalid_table_size() {
    let config = FasterKvConfig::new(100, 16);
    assert_eq!(FasterKv::<u64>::new(config).unwrap_err(), Status::InvalidArgument);
}

#[test]
fn test_in_place_update_in_mutable_region() {
    let store = create_test_store();
    let mut session = store.start_session().unwrap();

    assert_eq!(session.upsert(1, 10), Status::Ok);
    let tail = store.tail_address();
    assert_eq!(session.upsert(1, 11), Status::Ok);
    assert_eq!(store.tail_address(), tail);
    assert_eq!(session.read(&1).unwrap(), Some(11));
}

#[test]
fn test_update_in_read_only_region_seals_source() {
    let store = create_read_only_store();
    let mut session = store.start_session().unwrap();

    assert_eq!(session.upsert(1, 10), Status::Ok);
    let first = Address::FIRST_VALID;
    assert!(first < store.read_only_address());

    assert_eq!(session.upsert(1, 11), Status::Ok);
    let old = store.hlog.read_evicted(first).unwrap();
    assert!(old.info.is_sealed());
    assert!(!old.info.is_locked());

    let new = store.hlog.read_evicted(first + 1).unwrap();
    assert!(!new.info.is_tentative());
    assert!(!new.info.is_locked());
    assert_eq!(session.read(&1).unwrap(), Some(11));
}

#[test]
fn test_tentative_record_blocks_shared_lock() {
    let store = create_test_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(7, 1), Status::Ok);

    // Thread A's copy-on-write: a tentative record at the head of the chain.
    let stack = store.new_stack_context(hash(7));
    let (address, record) = store
        .hlog
        .allocate(7, 2, stack.rec_src.latest_log_address, false)
        .unwrap();
    assert!(store.try_insert_into_chain(&stack, address));

    // Thread B cannot lock the key while A's record is tentative.
    let ctx = ephemeral(&store);
    let mut b_stack = store.new_stack_context(hash(7));
    assert_eq!(
        store.try_find_and_ephemeral_lock_record(&7, &mut b_stack, &ctx, LockType::Shared),
        OperationStatus::RetryLater
    );
    assert!(!b_stack.rec_src.has_lock());

    // Once A completes, B locks the new record and sees A's value.
    record.info.clear_tentative();
    let mut b_stack = store.new_stack_context(hash(7));
    assert_eq!(
        store.try_find_and_ephemeral_lock_record(&7, &mut b_stack, &ctx, LockType::Shared),
        OperationStatus::Success
    );
    assert_eq!(b_stack.rec_src.logical_address, address);
    assert_eq!(store.src_record(&b_stack.rec_src).unwrap().value(), 2);
    store.ephemeral_sunlock(&7, &mut b_stack, &ctx);
    assert!(!record.info.is_locked());
}

#[test]
fn test_invalidated_tentative_record_is_skipped() {
    let store = create_test_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(3, 30), Status::Ok);

    let stack = store.new_stack_context(hash(3));
    let (address, record) = store
        .hlog
        .allocate(3, 31, stack.rec_src.latest_log_address, false)
        .unwrap();
    assert!(store.try_insert_into_chain(&stack, address));
    record.info.set_invalid_atomic();

    assert_eq!(session.read(&3).unwrap(), Some(30));
}

#[test]
fn test_update_blocked_by_lock_table_lock() {
    let store = create_test_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(5, 50), Status::Ok);
    store.evict_all();

    assert_eq!(
        store.internal_lock(&5, hash(5), LockOperation::Lock, LockType::Shared),
        Ok(OperationStatus::Success)
    );
    assert_eq!(store.lock_table().try_get(&5, hash(5)).unwrap().locks.shared, 1);

    let ctx = ephemeral(&store);
    assert_eq!(
        store.internal_upsert(&5, hash(5), 51, &ctx),
        Ok(OperationStatus::RetryLater)
    );
    // The failed attempt left the entry exactly as it was.
    let entry = store.lock_table().try_get(&5, hash(5)).unwrap();
    assert_eq!(entry.locks.shared, 1);
    assert!(!entry.locks.exclusive);

    assert_eq!(
        store.internal_lock(&5, hash(5), LockOperation::Unlock, LockType::Shared),
        Ok(OperationStatus::Success)
    );
    assert!(store.lock_table().is_empty());
    assert_eq!(session.upsert(5, 51), Status::Ok);
    assert_eq!(session.read(&5).unwrap(), Some(51));
}

#[test]
fn test_shared_unlock_chases_lock_into_lock_table() {
    let store = create_test_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(9, 90), Status::Ok);

    let ctx = ephemeral(&store);
    let mut stack = store.new_stack_context(hash(9));
    assert_eq!(
        store.try_find_and_ephemeral_lock_record(&9, &mut stack, &ctx, LockType::Shared),
        OperationStatus::Success
    );
    assert_eq!(stack.rec_src.tier, Tier::MainLog);

    // Eviction closes the record and moves the shared lock into the table.
    store.evict_all();
    let record = store.src_record(&stack.rec_src).unwrap();
    assert!(record.info.is_closed());
    assert_eq!(store.lock_table().try_get(&9, hash(9)).unwrap().locks.shared, 1);

    store.ephemeral_sunlock(&9, &mut stack, &ctx);
    assert!(!stack.rec_src.has_lock());
    assert!(store.lock_table().is_empty());
    assert_eq!(store.stats().unlock_chases, 1);
}

#[test]
fn test_exclusive_release_after_eviction() {
    let store = create_test_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(4, 40), Status::Ok);

    let ctx = ephemeral(&store);
    let mut stack = store.new_stack_context(hash(4));
    assert_eq!(
        store.try_find_and_ephemeral_lock_record(&4, &mut stack, &ctx, LockType::Exclusive),
        OperationStatus::Success
    );
    store.evict_all();
    assert!(store.lock_table().try_get(&4, hash(4)).unwrap().locks.exclusive);

    store.ephemeral_xunlock_after_update(&4, &mut stack, &ctx);
    assert!(store.lock_table().is_empty());
    assert_eq!(stack.rec_src.tier, Tier::None);
}

#[test]
fn test_exclusive_holder_helps_close() {
    let store = create_test_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(6, 60), Status::Ok);

    let ctx = ephemeral(&store);
    let mut stack = store.new_stack_context(hash(6));
    assert_eq!(
        store.try_find_and_ephemeral_lock_record(&6, &mut stack, &ctx, LockType::Exclusive),
        OperationStatus::Success
    );

    // A lagging session keeps the deferred close from running.
    let lagging = store.epoch.acquire_slot().unwrap();
    store.epoch.protect(lagging);
    store.evict_all();
    let record = store.src_record(&stack.rec_src).unwrap();
    assert!(!record.info.is_closed());

    store.ephemeral_xunlock_after_update(&6, &mut stack, &ctx);
    assert!(record.info.is_closed());
    assert!(store.lock_table().is_empty());
    assert_eq!(store.stats().closes_helped, 1);

    store.epoch.unprotect(lagging);
    store.epoch.release_slot(lagging);
    session.refresh();
    assert_eq!(store.epoch.pending_actions(), 0);
}

#[test]
fn test_pending_close_defers_operations() {
    let store = create_test_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(8, 80), Status::Ok);

    let lagging = store.epoch.acquire_slot().unwrap();
    store.epoch.protect(lagging);
    store.evict_all();

    let ctx = ephemeral(&store);
    let mut stack = store.new_stack_context(hash(8));
    assert_eq!(
        store.try_find_and_ephemeral_lock_record(&8, &mut stack, &ctx, LockType::Exclusive),
        OperationStatus::RetryLater
    );
    assert_eq!(
        store.internal_lock(&8, hash(8), LockOperation::Lock, LockType::Exclusive),
        Ok(OperationStatus::RetryLater)
    );

    store.epoch.unprotect(lagging);
    store.epoch.release_slot(lagging);
    assert_eq!(session.upsert(8, 81), Status::Ok);
    assert_eq!(session.read(&8).unwrap(), Some(81));
}

#[test]
fn test_copy_to_tail_moves_read_locks() {
    let store = create_read_only_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(2, 20), Status::Ok);
    let source = Address::FIRST_VALID;

    assert_eq!(
        store.internal_lock(&2, hash(2), LockOperation::Lock, LockType::Shared),
        Ok(OperationStatus::Success)
    );
    assert_eq!(session.copy_to_tail(&2), Status::Ok);

    let old = store.hlog.read_evicted(source).unwrap();
    let new = store.hlog.read_evicted(source + 1).unwrap();
    assert!(old.info.is_sealed());
    assert!(!old.info.is_locked());
    assert_eq!(new.info.num_locked_shared(), 1, "only the held lock moved");
    assert_eq!(new.value(), 20);

    assert_eq!(
        store.internal_lock(&2, hash(2), LockOperation::Unlock, LockType::Shared),
        Ok(OperationStatus::Success)
    );
    assert!(!new.info.is_locked());
}

#[test]
fn test_copy_to_tail_of_evicted_key_takes_lock_table_locks() {
    let store = create_test_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(11, 110), Status::Ok);
    store.evict_all();

    assert_eq!(
        store.internal_lock(&11, hash(11), LockOperation::Lock, LockType::Shared),
        Ok(OperationStatus::Success)
    );
    let tail = store.tail_address();
    assert_eq!(session.copy_to_tail(&11), Status::Ok);

    assert!(store.lock_table().is_empty());
    let new = store.hlog.get(tail).unwrap();
    assert_eq!(new.info.num_locked_shared(), 1);
    assert!(!new.info.is_tentative());

    assert_eq!(
        store.internal_lock(&11, hash(11), LockOperation::Unlock, LockType::Shared),
        Ok(OperationStatus::Success)
    );
    assert_eq!(session.copy_to_tail(&12), Status::NotFound);
}

#[test]
fn test_copy_to_tail_from_lock_table_blocks_exclusive_until_committed() {
    let store = create_test_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(11, 110), Status::Ok);
    store.evict_all();

    // A manual shared lock lives in the lock table.
    assert_eq!(
        store.internal_lock(&11, hash(11), LockOperation::Lock, LockType::Shared),
        Ok(OperationStatus::Success)
    );

    // The copier locks the entry and appends its tentative copy.
    let copier = ephemeral(&store);
    let mut stack = store.new_stack_context(hash(11));
    assert_eq!(
        store.try_find_and_ephemeral_lock_record(&11, &mut stack, &copier, LockType::Shared),
        OperationStatus::Success
    );
    assert!(stack.rec_src.has_lock_table_lock);
    let (address, record) = store
        .hlog
        .allocate(11, 110, stack.rec_src.latest_log_address, false)
        .unwrap();
    assert!(store.try_insert_into_chain(&stack, address));

    // No exclusive lock while the copy is in flight.
    let writer = ephemeral(&store);
    let mut w_stack = store.new_stack_context(hash(11));
    assert_eq!(
        store.try_find_and_ephemeral_lock_record(&11, &mut w_stack, &writer, LockType::Exclusive),
        OperationStatus::RetryLater
    );
    assert!(!w_stack.rec_src.has_lock());

    // A reader still locks the entry; its lock moves with the others.
    let reader = ephemeral(&store);
    let mut r_stack = store.new_stack_context(hash(11));
    assert_eq!(
        store.try_find_and_ephemeral_lock_record(&11, &mut r_stack, &reader, LockType::Shared),
        OperationStatus::Success
    );
    assert_eq!(store.lock_table().try_get(&11, hash(11)).unwrap().locks.shared, 3);

    assert!(store.complete_two_phase_copy_to_tail(&11, &mut stack, record, &copier));
    assert!(!record.info.is_tentative());
    assert!(store.lock_table().is_empty());
    assert_eq!(record.info.num_locked_shared(), 2, "the copier's own lock was dropped");
    assert!(!stack.rec_src.has_lock());

    // Readers still hold the new record, so the writer keeps waiting.
    let mut w_stack = store.new_stack_context(hash(11));
    assert_eq!(
        store.try_find_and_ephemeral_lock_record(&11, &mut w_stack, &writer, LockType::Exclusive),
        OperationStatus::RetryLater
    );

    store.ephemeral_sunlock(&11, &mut r_stack, &reader);
    assert_eq!(record.info.num_locked_shared(), 1);
    assert_eq!(
        store.internal_lock(&11, hash(11), LockOperation::Unlock, LockType::Shared),
        Ok(OperationStatus::Success)
    );

    let mut w_stack = store.new_stack_context(hash(11));
    assert_eq!(
        store.try_find_and_ephemeral_lock_record(&11, &mut w_stack, &writer, LockType::Exclusive),
        OperationStatus::Success
    );
    assert_eq!(w_stack.rec_src.logical_address, address);
    assert!(record.info.is_locked_exclusive());
}

#[test]
fn test_copy_to_tail_from_read_cache_blocks_exclusive_until_committed() {
    let store = create_cached_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(21, 210), Status::Ok);
    store.evict_all();
    assert_eq!(session.read(&21).unwrap(), Some(210));

    // The copier and a reader both hold the read cache copy.
    let copier = ephemeral(&store);
    let mut stack = store.new_stack_context(hash(21));
    assert_eq!(
        store.try_find_and_ephemeral_lock_record(&21, &mut stack, &copier, LockType::Shared),
        OperationStatus::Success
    );
    assert!(stack.rec_src.has_read_cache_src());
    let cached = store.src_record(&stack.rec_src).unwrap();

    let reader = ephemeral(&store);
    let mut r_stack = store.new_stack_context(hash(21));
    assert_eq!(
        store.try_find_and_ephemeral_lock_record(&21, &mut r_stack, &reader, LockType::Shared),
        OperationStatus::Success
    );
    assert_eq!(cached.info.num_locked_shared(), 2);

    let (address, record) = store
        .hlog
        .allocate(21, 210, stack.rec_src.latest_log_address, false)
        .unwrap();
    assert!(store.try_insert_into_chain(&stack, address));

    let writer = ephemeral(&store);
    let mut w_stack = store.new_stack_context(hash(21));
    assert_eq!(
        store.try_find_and_ephemeral_lock_record(&21, &mut w_stack, &writer, LockType::Exclusive),
        OperationStatus::RetryLater
    );
    assert!(!w_stack.rec_src.has_lock());

    assert!(store.complete_two_phase_copy_to_tail(&21, &mut stack, record, &copier));
    assert!(cached.info.is_invalid());
    assert!(!cached.info.is_locked());
    assert_eq!(record.info.num_locked_shared(), 1);
    assert!(!stack.rec_src.has_lock());

    // The reader's release follows its lock onto the new record.
    store.ephemeral_sunlock(&21, &mut r_stack, &reader);
    assert!(!record.info.is_locked());

    let mut w_stack = store.new_stack_context(hash(21));
    assert_eq!(
        store.try_find_and_ephemeral_lock_record(&21, &mut w_stack, &writer, LockType::Exclusive),
        OperationStatus::Success
    );
    assert_eq!(w_stack.rec_src.logical_address, address);
}

#[test]
fn test_read_cache_lookup_since_previous_snapshot() {
    let store = create_cached_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(31, 310), Status::Ok);
    store.evict_all();

    let before = store.new_stack_context(hash(31));
    assert!(!before.hei.is_read_cache());
    assert_eq!(session.read(&31).unwrap(), Some(310));

    // Everything in the cache is newer than a snapshot without a cache prefix.
    let mut current = store.new_stack_context(hash(31));
    assert!(store.find_in_read_cache(&31, &mut current, before.hei.address));
    let cached = current.rec_src.logical_address;
    assert!(cached.in_read_cache());

    // Nothing was cached after the current head.
    let mut again = store.new_stack_context(hash(31));
    assert!(!store.find_in_read_cache(&31, &mut again, cached));
    assert!(store.find_in_read_cache(&31, &mut again, Address::INVALID));

    // A second read hits the cache instead of caching another copy.
    assert_eq!(session.read(&31).unwrap(), Some(310));
    assert_eq!(store.read_cache().unwrap().len(), 1);
}

#[test]
fn test_read_promotes_into_read_cache() {
    let store = create_cached_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(1, 100), Status::Ok);
    store.evict_all();

    assert_eq!(session.read(&1).unwrap(), Some(100));
    let rc = store.read_cache().unwrap();
    assert_eq!(rc.len(), 1);

    assert_eq!(session.read(&1).unwrap(), Some(100));
    assert!(rc.stats().read_hits() >= 1);

    let stack = store.new_stack_context(hash(1));
    assert!(stack.hei.is_read_cache());
    assert_eq!(stack.rec_src.lowest_read_cache_address, Some(stack.hei.address));
}

#[test]
fn test_update_replaces_read_cache_copy() {
    let store = create_cached_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(1, 100), Status::Ok);
    store.evict_all();
    assert_eq!(session.read(&1).unwrap(), Some(100));

    let cached = store.new_stack_context(hash(1)).hei.address;
    assert_eq!(session.upsert(1, 101), Status::Ok);

    let rc = store.read_cache().unwrap();
    assert!(rc.get(cached).unwrap().info.is_invalid());
    assert_eq!(session.read(&1).unwrap(), Some(101));

    // The new main-log record was spliced below the cache prefix.
    let stack = store.new_stack_context(hash(1));
    assert_eq!(stack.hei.address, cached);
    assert!(store.hlog.get(stack.rec_src.latest_log_address).is_some());
}

#[test]
fn test_copy_reads_to_tail_without_read_cache() {
    let config = FasterKvConfig::new(64, 1024)
        .with_locking(locking())
        .with_copy_reads_to_tail(true);
    let store = Arc::new(FasterKv::<u64>::new(config).unwrap());
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(1, 100), Status::Ok);
    store.evict_all();

    let tail = store.tail_address();
    assert_eq!(session.read(&1).unwrap(), Some(100));
    assert_eq!(store.tail_address(), tail + 1);
    assert_eq!(store.hlog.get(tail).unwrap().value(), 100);
}

#[test]
fn test_rmw_outcomes() {
    let store = create_test_store();
    let mut session = store.start_session().unwrap();

    assert_eq!(session.rmw(1, |value| {
        *value += 1;
        true
    }), Status::NotFound);

    assert_eq!(session.upsert(1, 5), Status::Ok);
    assert_eq!(session.rmw(1, |_| false), Status::Aborted);
    assert_eq!(session.rmw(1, |value| {
        *value *= 3;
        true
    }), Status::Ok);
    assert_eq!(session.read(&1).unwrap(), Some(15));

    // The aborted attempt left no lock behind.
    let stack = store.new_stack_context(hash(1));
    let record = store.hlog.read_evicted(stack.rec_src.latest_log_address).unwrap();
    assert!(!record.info.is_locked());
}

#[test]
fn test_rmw_on_evicted_key() {
    let store = create_test_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(1, 5), Status::Ok);
    store.evict_all();

    assert_eq!(session.rmw(1, |value| {
        *value += 1;
        true
    }), Status::Ok);
    assert_eq!(session.read(&1).unwrap(), Some(6));
}

#[test]
fn test_delete_appends_tombstone() {
    let store = create_test_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(1, 5), Status::Ok);
    assert_eq!(session.delete(&1), Status::Ok);
    assert_eq!(session.read(&1).unwrap(), None);
    assert_eq!(session.rmw(1, |_| true), Status::NotFound);

    assert_eq!(session.upsert(1, 6), Status::Ok);
    assert_eq!(session.read(&1).unwrap(), Some(6));
}

#[test]
fn test_out_of_memory_releases_lock() {
    let config = FasterKvConfig::new(64, 1)
        .with_mutable_records(0)
        .with_locking(locking());
    let store = Arc::new(FasterKv::<u64>::new(config).unwrap());
    let mut session = store.start_session().unwrap();

    assert_eq!(session.upsert(1, 1), Status::Ok);
    assert_eq!(session.upsert(1, 2), Status::OutOfMemory);
    let record = store.hlog.read_evicted(Address::FIRST_VALID).unwrap();
    assert!(!record.info.is_locked());
    assert_eq!(session.read(&1).unwrap(), Some(1));
}

#[test]
fn test_session_slots_are_released() {
    let store = create_test_store();
    let slot = {
        let session = store.start_session().unwrap();
        session.slot()
    };
    let session = store.start_session().unwrap();
    assert_eq!(session.slot(), slot);
}
