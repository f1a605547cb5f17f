//! Record-source resolution: which tier holds the authoritative record for a
//! key.

use std::sync::atomic::{fence, Ordering};

use crate::address::Address;
use crate::allocator::LogRecord;
use crate::index::KeyHash;
use crate::record::{Key, RecordInfo};
use crate::store::record_source::{OperationStackContext, RecordSource};

use super::FasterKv;

/// Outcome of walking the main-log part of a chain.
pub(super) enum ChainSearch<'a, K> {
    /// Newest committed, valid record of the key
    Found(Address, &'a LogRecord<K>),
    /// No such record in the searched range
    Absent,
    /// A tentative record of the key did not settle within the wait budget
    TentativeTimeout,
}

enum TentativeWait {
    Committed,
    Invalid,
    TimedOut,
}

impl<K: Key> FasterKv<K> {
    /// Wait (bounded) for a tentative record to be committed or invalidated.
    fn wait_while_tentative(&self, info: &RecordInfo) -> TentativeWait {
        let mut spins = self.config.locking.tentative_wait_spins;
        loop {
            if info.is_invalid() {
                return TentativeWait::Invalid;
            }
            if !info.is_tentative() {
                return TentativeWait::Committed;
            }
            if spins == 0 {
                return TentativeWait::TimedOut;
            }
            spins -= 1;
            std::thread::yield_now();
        }
    }

    /// Walk the main-log chain from `from` down to `min`, skipping invalid
    /// records and waiting on tentative ones.
    pub(super) fn search_chain(&self, key: &K, from: Address, min: Address) -> ChainSearch<'_, K> {
        let mut address = from;
        while address.is_valid() && !address.in_read_cache() && address >= min {
            let Some(record) = self.hlog.read_evicted(address) else {
                break;
            };
            if record.has_key(key) {
                match self.wait_while_tentative(&record.info) {
                    TentativeWait::Committed => return ChainSearch::Found(address, record),
                    TentativeWait::Invalid => {}
                    TentativeWait::TimedOut => return ChainSearch::TentativeTimeout,
                }
            }
            address = record.info.previous_address();
        }
        ChainSearch::Absent
    }

    /// The in-memory record a source descriptor points at.
    pub(super) fn src_record(&self, src: &RecordSource) -> Option<&LogRecord<K>> {
        if !src.has_in_memory_src {
            return None;
        }
        if src.logical_address.in_read_cache() {
            self.read_cache.as_ref()?.get(src.logical_address)
        } else {
            self.hlog.read_evicted(src.logical_address)
        }
    }

    /// Look the key up in the read cache prefix of the snapshot.
    ///
    /// When `prev_highest` is a read cache address (the bucket head seen by
    /// an earlier snapshot), only records inserted after it are searched.
    /// Tentative read cache records are reported too; the caller decides
    /// whether to wait for them.
    pub(super) fn find_in_read_cache(
        &self,
        key: &K,
        stack: &mut OperationStackContext,
        prev_highest: Address,
    ) -> bool {
        let Some(rc) = &self.read_cache else {
            return false;
        };
        let until = if prev_highest.in_read_cache() {
            prev_highest
        } else {
            Address::INVALID
        };
        match rc.find(key, stack.hei.address, until) {
            Some((address, _)) => {
                stack.rec_src.set_read_cache_src(address);
                true
            }
            None => false,
        }
    }

    /// Look the key up in the in-memory region of the main log.
    pub(super) fn find_in_main_log(&self, key: &K, stack: &mut OperationStackContext) -> ChainSearch<'_, K> {
        let result = self.search_chain(key, stack.rec_src.latest_log_address, self.head_address());
        if let ChainSearch::Found(address, _) = result {
            stack.rec_src.set_main_log_src(address);
        }
        result
    }

    /// Newest committed record of the key anywhere in the log, evicted
    /// region included. Stands in for a device read.
    pub(super) fn find_evicted(&self, key: &K, stack: &OperationStackContext) -> ChainSearch<'_, K> {
        self.search_chain(key, stack.rec_src.latest_log_address, Address::FIRST_VALID)
    }

    /// Whether the key has a record below head whose close has not run yet.
    ///
    /// Such a record may still carry in-memory locks that are about to move
    /// into the lock table, so neither tier can be trusted until it closes.
    pub(super) fn evicted_record_pending_close(&self, key: &K, stack: &OperationStackContext) -> bool {
        let head = self.head_address();
        let closed_until = self.hlog.get_closed_until_address();
        let mut address = stack.rec_src.latest_log_address;
        while address.is_valid() && !address.in_read_cache() && address >= closed_until {
            let Some(record) = self.hlog.read_evicted(address) else {
                break;
            };
            if address < head && record.has_key(key) && record.info.is_valid() && !record.info.is_closed() {
                return true;
            }
            address = record.info.previous_address();
        }
        false
    }

    /// Whether any in-memory tier holds a record of the key, tentative
    /// records included.
    ///
    /// Called after a fence by a manual locker that just created a tentative
    /// lock table entry.
    pub(super) fn key_in_memory(&self, key: &K, hash: KeyHash) -> bool {
        fence(Ordering::SeqCst);
        let stack = self.new_stack_context(hash);
        if let Some(rc) = &self.read_cache {
            if rc.find(key, stack.hei.address, Address::INVALID).is_some() {
                return true;
            }
        }

        let head = self.head_address();
        let mut address = stack.rec_src.latest_log_address;
        while address.is_valid() && !address.in_read_cache() && address >= head {
            let Some(record) = self.hlog.read_evicted(address) else {
                break;
            };
            if record.has_key(key) && record.info.is_valid() {
                return true;
            }
            address = record.info.previous_address();
        }
        self.evicted_record_pending_close(key, &stack)
    }
}
