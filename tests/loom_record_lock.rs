//! Loom-based model-checked tests for the record lock word.
//!
//! These tests replicate the lock-word transitions from `src/record.rs`
//! (shared/exclusive locking, sealing, and closing on eviction) in a
//! test-local struct that uses loom atomics, so that Loom can explore every
//! interleaving of lockers against sealers and closers.
//!
//! Run with:
//! ```bash
//! cargo test --test loom_record_lock
//! ```

use loom::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;

// ---------------------------------------------------------------------------
// Test-local harness: the lock word layout and CAS loops of `RecordInfo`.
// ---------------------------------------------------------------------------

const SHARED_SHIFT: u32 = 48;
const SHARED_UNIT: u64 = 1 << SHARED_SHIFT;
const SHARED_MASK: u64 = 0x7f << SHARED_SHIFT;
const EXCLUSIVE_BIT: u64 = 1 << 55;
const SEALED_BIT: u64 = 1 << 57;
const VALID_BIT: u64 = 1 << 58;
const CLOSED_BIT: u64 = 1 << 60;
const LOCK_MASK: u64 = SHARED_MASK | EXCLUSIVE_BIT;

struct TestLockWord {
    word: AtomicU64,
}

impl TestLockWord {
    fn new() -> Self {
        Self {
            word: AtomicU64::new(VALID_BIT),
        }
    }

    fn refuses_locks(word: u64) -> bool {
        word & (SEALED_BIT | CLOSED_BIT) != 0 || word & VALID_BIT == 0
    }

    fn try_lock_shared(&self) -> bool {
        let expected = self.word.load(Ordering::Acquire);
        if Self::refuses_locks(expected) || expected & EXCLUSIVE_BIT != 0 {
            return false;
        }
        self.word
            .compare_exchange(expected, expected + SHARED_UNIT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn try_lock_exclusive(&self) -> bool {
        let expected = self.word.load(Ordering::Acquire);
        if Self::refuses_locks(expected) || expected & LOCK_MASK != 0 {
            return false;
        }
        self.word
            .compare_exchange(expected, expected | EXCLUSIVE_BIT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn try_unlock_shared(&self) -> bool {
        let mut expected = self.word.load(Ordering::Acquire);
        loop {
            if expected & (SEALED_BIT | CLOSED_BIT) != 0 || expected & VALID_BIT == 0 {
                return false;
            }
            match self.word.compare_exchange(
                expected,
                expected - SHARED_UNIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => expected = actual,
            }
        }
    }

    fn unlock_exclusive(&self) {
        self.word.fetch_and(!EXCLUSIVE_BIT, Ordering::AcqRel);
    }

    /// Close the record and hand back the lock bits it held at that moment.
    fn close(&self) -> Option<u64> {
        let mut expected = self.word.load(Ordering::Acquire);
        loop {
            if expected & CLOSED_BIT != 0 {
                return None;
            }
            match self.word.compare_exchange(
                expected,
                (expected | CLOSED_BIT) & !LOCK_MASK,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(expected & LOCK_MASK),
                Err(actual) => expected = actual,
            }
        }
    }

    fn seal(&self) {
        self.word.fetch_or(SEALED_BIT, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Every shared lock is released exactly once: either on the record, or,
/// after the close moved it away, by chasing it into the lock table.
#[test]
fn loom_shared_unlock_races_close() {
    loom::model(|| {
        let record = Arc::new(TestLockWord::new());
        let chased = Arc::new(AtomicUsize::new(0));

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let record = Arc::clone(&record);
                let chased = Arc::clone(&chased);
                thread::spawn(move || {
                    if record.try_lock_shared() && !record.try_unlock_shared() {
                        chased.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        let moved = record.close().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }

        let moved_shared = ((moved & SHARED_MASK) >> SHARED_SHIFT) as usize;
        assert_eq!(moved_shared, chased.load(Ordering::Relaxed));
        assert_eq!(moved & EXCLUSIVE_BIT, 0);
    });
}

/// An exclusive lock and a shared lock are never held at the same time.
#[test]
fn loom_exclusive_excludes_shared() {
    loom::model(|| {
        let record = Arc::new(TestLockWord::new());
        let inside = Arc::new(AtomicUsize::new(0));

        let writer = {
            let record = Arc::clone(&record);
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                if record.try_lock_exclusive() {
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    record.unlock_exclusive();
                }
            })
        };

        if record.try_lock_shared() {
            inside.fetch_add(1, Ordering::SeqCst);
            assert_eq!(record.word.load(Ordering::Acquire) & EXCLUSIVE_BIT, 0);
            inside.fetch_sub(1, Ordering::SeqCst);
            assert!(record.try_unlock_shared());
        }
        writer.join().unwrap();

        assert_eq!(record.word.load(Ordering::Acquire) & LOCK_MASK, 0);
    });
}

/// No lock is granted on a record once it is sealed; locks taken before the
/// seal stay in place until their holder releases them.
#[test]
fn loom_seal_stops_new_locks() {
    loom::model(|| {
        let record = Arc::new(TestLockWord::new());

        let locker = {
            let record = Arc::clone(&record);
            thread::spawn(move || record.try_lock_exclusive())
        };

        record.seal();
        let late = record.try_lock_shared();
        let locked = locker.join().unwrap();

        assert!(!late);
        let word = record.word.load(Ordering::Acquire);
        assert_eq!(word & EXCLUSIVE_BIT != 0, locked);
    });
}

/// Closing twice moves the lock bits once.
#[test]
fn loom_close_is_single_shot() {
    loom::model(|| {
        let record = Arc::new(TestLockWord::new());
        assert!(record.try_lock_shared());

        let closers: Vec<_> = (0..2)
            .map(|_| {
                let record = Arc::clone(&record);
                thread::spawn(move || record.close())
            })
            .collect();

        let results: Vec<_> = closers.into_iter().map(|c| c.join().unwrap()).collect();
        let moved: Vec<_> = results.into_iter().flatten().collect();
        assert_eq!(moved, vec![SHARED_UNIT]);
        assert!(!record.try_lock_shared());
    });
}
