// PairLock - per-entry reader/writer lock with writer priority
//
// The lock is layered on the cache's single coarse mutex: every method
// requires the caller to hold that mutex, and blocking is implemented with
// condition variables waiting on that same mutex. Acquiring a pair lock
// therefore never takes a second, independently-ordered lock, which rules
// out lock-ordering deadlocks between the coarse lock and pair locks.

use parking_lot::{Condvar, MutexGuard};
use std::sync::atomic::{AtomicU32, Ordering};

/// Per-pair reader/writer lock state.
///
/// The four counters are mutated only while holding the enclosing coarse
/// mutex; they are atomics so the lock can live behind an `Arc` and be
/// inspected through a shared reference. All loads/stores use relaxed
/// ordering because the coarse mutex provides the synchronization.
///
/// Invariants: `writer <= 1`; `pinned > 0` implies `writer == 0`; once a
/// writer is waiting, no new reader acquires the lock until the writer has
/// been serviced.
pub struct PairLock {
    /// Active readers
    pinned: AtomicU32,
    /// Waiting readers
    want_pin: AtomicU32,
    /// Active writer (0 or 1)
    writer: AtomicU32,
    /// Waiting writers
    want_write: AtomicU32,
    /// Readers park here
    cond_read: Condvar,
    /// Writers park here
    cond_write: Condvar,
}

impl PairLock {
    /// Creates an unlocked pair lock
    pub fn new() -> Self {
        PairLock {
            pinned: AtomicU32::new(0),
            want_pin: AtomicU32::new(0),
            writer: AtomicU32::new(0),
            want_write: AtomicU32::new(0),
            cond_read: Condvar::new(),
            cond_write: Condvar::new(),
        }
    }

    /// Acquires the lock in read mode.
    ///
    /// Blocks while a writer is active or waiting; the caller's coarse mutex
    /// guard is released for the duration of each wait.
    pub fn read_lock<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) {
        self.want_pin.fetch_add(1, Ordering::Relaxed);
        while self.writer.load(Ordering::Relaxed) > 0 || self.want_write.load(Ordering::Relaxed) > 0
        {
            self.cond_read.wait(guard);
        }
        self.want_pin.fetch_sub(1, Ordering::Relaxed);
        self.pinned.fetch_add(1, Ordering::Relaxed);
    }

    /// Releases a read lock; the last reader out hands the lock to a
    /// waiting writer if there is one.
    pub fn read_unlock<T: ?Sized>(&self, _guard: &mut MutexGuard<'_, T>) {
        let prev = self.pinned.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "read_unlock without a read lock held");
        if prev == 1 && self.want_write.load(Ordering::Relaxed) > 0 {
            self.cond_write.notify_one();
        }
    }

    /// Acquires the lock in write mode.
    ///
    /// Blocks while any reader is pinned or another writer is active.
    /// Registering in `want_write` before waiting is what gives writers
    /// priority over readers that arrive later.
    pub fn write_lock<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) {
        self.want_write.fetch_add(1, Ordering::Relaxed);
        while self.pinned.load(Ordering::Relaxed) > 0 || self.writer.load(Ordering::Relaxed) > 0 {
            self.cond_write.wait(guard);
        }
        self.want_write.fetch_sub(1, Ordering::Relaxed);
        self.writer.store(1, Ordering::Relaxed);
    }

    /// Releases a write lock; a waiting writer is serviced before any
    /// waiting readers.
    pub fn write_unlock<T: ?Sized>(&self, _guard: &mut MutexGuard<'_, T>) {
        let prev = self.writer.swap(0, Ordering::Relaxed);
        debug_assert!(prev == 1, "write_unlock without the write lock held");
        if self.want_write.load(Ordering::Relaxed) > 0 {
            self.cond_write.notify_one();
        } else if self.want_pin.load(Ordering::Relaxed) > 0 {
            self.cond_read.notify_all();
        }
    }

    /// Downgrades a held write lock to a read lock.
    ///
    /// The downgrade takes effect immediately; waiting readers are admitted
    /// only if no writer is waiting, and waiting writers stay parked until
    /// this reader drains.
    pub fn write_unlock_to_read<T: ?Sized>(&self, _guard: &mut MutexGuard<'_, T>) {
        let prev = self.writer.swap(0, Ordering::Relaxed);
        debug_assert!(prev == 1, "downgrade without the write lock held");
        self.pinned.fetch_add(1, Ordering::Relaxed);
        if self.want_write.load(Ordering::Relaxed) == 0
            && self.want_pin.load(Ordering::Relaxed) > 0
        {
            self.cond_read.notify_all();
        }
    }

    /// Returns the count of active readers
    #[inline]
    pub fn pinned(&self) -> u32 {
        self.pinned.load(Ordering::Relaxed)
    }

    /// Returns true if a writer currently holds the lock
    #[inline]
    pub fn writer_active(&self) -> bool {
        self.writer.load(Ordering::Relaxed) > 0
    }

    /// Returns true if a writer holds or is waiting for the lock
    #[inline]
    pub fn write_contended(&self) -> bool {
        self.writer.load(Ordering::Relaxed) > 0 || self.want_write.load(Ordering::Relaxed) > 0
    }

    /// Total references: active plus waiting readers and writers.
    ///
    /// A pair may only be destroyed when this reaches zero.
    #[inline]
    pub fn users(&self) -> u32 {
        self.pinned.load(Ordering::Relaxed)
            + self.want_pin.load(Ordering::Relaxed)
            + self.writer.load(Ordering::Relaxed)
            + self.want_write.load(Ordering::Relaxed)
    }
}

impl Default for PairLock {
    fn default() -> Self {
        Self::new()
    }
}
