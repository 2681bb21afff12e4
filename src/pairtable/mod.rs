//! Pair table: the open-chaining hash table of cached pages plus the LRU
//! list threading the same entries.
//!
//! Entries live in an arena of slots addressed by integer indices; the hash
//! chains and the LRU links are slot indices rather than pointers, so a
//! rehash preserves entry addresses and no aliasing is possible. A slot is
//! reachable from exactly one bucket chain and one LRU position for as long
//! as it is occupied.

use crate::infrastructure::pairlock::PairLock;
use crate::infrastructure::workqueue::WorkQueue;
use crate::types::{BlockNum, FileNum, Lsn, MIN_BUCKETS, PageValue, ZERO_LSN};
use std::sync::Arc;

/// Sentinel slot index meaning "no entry"
pub const NIL: usize = usize::MAX;

/// Lifecycle state of a cached pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    /// Present and quiescent
    Idle,
    /// Fetch callback in flight; the fetching thread holds the write lock
    Reading,
    /// Flush callback in flight or scheduled
    Writing,
    /// Torn down after a failed fetch or a remove; waiters drain out and
    /// the last one destroys the slot
    Invalid,
}

/// One cached page entry, keyed by `(filenum, block key)`
pub struct Pair {
    /// Owning cachefile identity
    pub filenum: FileNum,
    /// Opaque block identifier within the file
    pub key: BlockNum,
    /// Precomputed hash of `(filenum, key)`
    pub fullhash: u64,
    /// The cached page image; `None` only while `Reading` or after a
    /// failed fetch
    pub value: Option<PageValue>,
    /// Accounted size in bytes
    pub size: usize,
    /// True if the in-memory image is newer than the durable one
    pub dirty: bool,
    /// Lifecycle state
    pub state: PairState,
    /// LSN of the last logical modification
    pub modified_lsn: Lsn,
    /// LSN below which the page is known durable
    pub written_lsn: Lsn,
    /// Evict (and release the value) once the in-flight write completes
    pub remove_on_completion: bool,
    /// Private completion queue redirect; set by the checkpoint coordinator
    /// and the scoped per-file drains. While set, the pair counts as
    /// referenced and cannot be destroyed.
    pub cq: Option<Arc<WorkQueue<usize>>>,
    /// Per-pair reader/writer lock
    pub lock: Arc<PairLock>,
    /// Next entry in the bucket chain
    hash_next: usize,
    /// Neighbor toward the LRU head (more recently used)
    lru_prev: usize,
    /// Neighbor toward the LRU tail (less recently used)
    lru_next: usize,
}

impl Pair {
    /// Creates an unlinked pair
    pub fn new(
        filenum: FileNum,
        key: BlockNum,
        fullhash: u64,
        value: Option<PageValue>,
        size: usize,
        dirty: bool,
        state: PairState,
        modified_lsn: Lsn,
    ) -> Self {
        Pair {
            filenum,
            key,
            fullhash,
            value,
            size,
            dirty,
            state,
            modified_lsn,
            written_lsn: ZERO_LSN,
            remove_on_completion: false,
            cq: None,
            lock: Arc::new(PairLock::new()),
            hash_next: NIL,
            lru_prev: NIL,
            lru_next: NIL,
        }
    }

    /// True if anything holds or awaits this pair: lock users or a pending
    /// completion-queue redirect
    #[inline]
    pub fn referenced(&self) -> bool {
        self.lock.users() > 0 || self.cq.is_some()
    }

    /// True if the eviction policy may select this pair
    #[inline]
    pub fn evictable(&self) -> bool {
        self.state == PairState::Idle && !self.referenced()
    }
}

/// The hash table + LRU list over an arena of pair slots
pub struct PairTable {
    /// Arena; `None` entries are free slots
    slots: Vec<Option<Pair>>,
    /// Free-list of reusable slot indices
    free_slots: Vec<usize>,
    /// Bucket heads; length is always a power of two
    buckets: Vec<usize>,
    /// Most recently used entry
    lru_head: usize,
    /// Least recently used entry
    lru_tail: usize,
    /// Number of live pairs
    n_in_table: usize,
    /// Sum of sizes of all live pairs
    size_current: usize,
    /// Sum of sizes of pairs currently in flight to storage
    size_writing: usize,
    /// Soft limit on `size_current`
    size_limit: usize,
}

impl PairTable {
    /// Creates an empty table with the given byte size limit
    pub fn new(size_limit: usize) -> Self {
        PairTable {
            slots: Vec::new(),
            free_slots: Vec::new(),
            buckets: vec![NIL; MIN_BUCKETS],
            lru_head: NIL,
            lru_tail: NIL,
            n_in_table: 0,
            size_current: 0,
            size_writing: 0,
            size_limit,
        }
    }

    #[inline]
    pub fn n_in_table(&self) -> usize {
        self.n_in_table
    }

    #[inline]
    pub fn size_current(&self) -> usize {
        self.size_current
    }

    #[inline]
    pub fn size_writing(&self) -> usize {
        self.size_writing
    }

    #[inline]
    pub fn size_limit(&self) -> usize {
        self.size_limit
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Borrows the pair in `slot`; the slot must be occupied
    #[inline]
    pub fn pair(&self, slot: usize) -> &Pair {
        self.slots[slot].as_ref().expect("empty pair slot")
    }

    /// Mutably borrows the pair in `slot`; the slot must be occupied
    #[inline]
    pub fn pair_mut(&mut self, slot: usize) -> &mut Pair {
        self.slots[slot].as_mut().expect("empty pair slot")
    }

    /// Returns true if `slot` currently holds a pair
    #[inline]
    pub fn is_occupied(&self, slot: usize) -> bool {
        slot < self.slots.len() && self.slots[slot].is_some()
    }

    #[inline]
    fn bucket_of(&self, fullhash: u64) -> usize {
        (fullhash as usize) & (self.buckets.len() - 1)
    }

    /// Head of the bucket chain `b`, or `NIL`
    #[inline]
    pub fn bucket_head(&self, b: usize) -> usize {
        self.buckets[b]
    }

    /// Next entry in the bucket chain after `slot`, or `NIL`
    #[inline]
    pub fn hash_next(&self, slot: usize) -> usize {
        self.pair(slot).hash_next
    }

    /// Least recently used entry, or `NIL` if the table is empty
    #[inline]
    pub fn lru_tail(&self) -> usize {
        self.lru_tail
    }

    /// Neighbor of `slot` toward the LRU head (more recently used)
    #[inline]
    pub fn lru_prev(&self, slot: usize) -> usize {
        self.pair(slot).lru_prev
    }

    /// Walks the bucket chain for `fullhash` comparing cachefile identity
    /// and key
    pub fn lookup(&self, filenum: FileNum, key: BlockNum, fullhash: u64) -> Option<usize> {
        let mut slot = self.buckets[self.bucket_of(fullhash)];
        while slot != NIL {
            let p = self.pair(slot);
            if p.filenum == filenum && p.key == key {
                return Some(slot);
            }
            slot = p.hash_next;
        }
        None
    }

    /// Inserts a pair, linking it at its bucket head and the LRU head.
    ///
    /// Doubles the bucket array when occupancy exceeds the bucket count.
    /// Returns the slot index.
    pub fn insert(&mut self, pair: Pair) -> usize {
        let size = pair.size;
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(pair);
                slot
            }
            None => {
                self.slots.push(Some(pair));
                self.slots.len() - 1
            }
        };

        self.link_bucket(slot);
        self.link_lru_head(slot);
        self.n_in_table += 1;
        self.size_current += size;

        if self.n_in_table > self.buckets.len() {
            self.rehash(self.buckets.len() * 2);
        }
        slot
    }

    /// Unlinks a pair from both structures and returns it
    pub fn remove(&mut self, slot: usize) -> Pair {
        self.unlink_bucket(slot);
        self.unlink_lru(slot);

        let pair = self.slots[slot].take().expect("empty pair slot");
        self.free_slots.push(slot);
        self.n_in_table -= 1;
        self.size_current -= pair.size;
        if pair.state == PairState::Writing {
            self.size_writing -= pair.size;
        }
        pair
    }

    /// Moves `slot` to the LRU head; called on every successful pin
    pub fn touch(&mut self, slot: usize) {
        if self.lru_head != slot {
            self.unlink_lru(slot);
            self.link_lru_head(slot);
        }
    }

    /// Rehomes a pinned pair under a new key, recomputing its bucket.
    ///
    /// The LRU position and slot index are preserved.
    pub fn rekey(&mut self, slot: usize, new_key: BlockNum, new_fullhash: u64) {
        self.unlink_bucket(slot);
        {
            let p = self.pair_mut(slot);
            p.key = new_key;
            p.fullhash = new_fullhash;
        }
        self.link_bucket(slot);
    }

    /// Re-accounts a pair's size, propagating the delta into
    /// `size_writing` if the pair is mid-write
    pub fn resize_pair(&mut self, slot: usize, new_size: usize) {
        let (old_size, writing) = {
            let p = self.pair(slot);
            (p.size, p.state == PairState::Writing)
        };
        self.size_current = self.size_current - old_size + new_size;
        if writing {
            self.size_writing = self.size_writing - old_size + new_size;
        }
        self.pair_mut(slot).size = new_size;
    }

    /// Marks a pair as entering the write pipeline and accounts its bytes
    /// as in flight
    pub fn begin_writing(&mut self, slot: usize) {
        let p = self.pair_mut(slot);
        debug_assert!(p.state != PairState::Writing, "pair already writing");
        p.state = PairState::Writing;
        let size = p.size;
        self.size_writing += size;
    }

    /// Marks an in-flight write as finished and returns its bytes to the
    /// idle pool
    pub fn end_writing(&mut self, slot: usize) {
        let p = self.pair_mut(slot);
        debug_assert!(p.state == PairState::Writing, "pair not writing");
        p.state = PairState::Idle;
        let size = p.size;
        self.size_writing -= size;
    }

    /// Scans the LRU list from the tail for the first evictable pair
    pub fn first_evictable(&self) -> Option<usize> {
        let mut slot = self.lru_tail;
        while slot != NIL {
            let p = self.pair(slot);
            if p.evictable() {
                return Some(slot);
            }
            slot = p.lru_prev;
        }
        None
    }

    /// Collects the slots of every live pair belonging to `filenum`
    pub fn slots_for_file(&self, filenum: FileNum) -> Vec<usize> {
        let mut out = Vec::new();
        for (slot, entry) in self.slots.iter().enumerate() {
            if let Some(p) = entry {
                if p.filenum == filenum {
                    out.push(slot);
                }
            }
        }
        out
    }

    /// Halves the bucket array if occupancy has dropped below a quarter of
    /// capacity, never shrinking past the floor
    pub fn maybe_shrink(&mut self) {
        if self.buckets.len() > MIN_BUCKETS && self.n_in_table < self.buckets.len() / 4 {
            let new_count = (self.buckets.len() / 2).max(MIN_BUCKETS);
            self.rehash(new_count);
        }
    }

    /// Rebuilds the bucket array at `new_count` buckets, rehoming every
    /// pair by `fullhash & (new_count - 1)`.
    ///
    /// O(n). Entry slots are preserved; only bucket indices change, so
    /// callers must not hold chain positions across this call.
    fn rehash(&mut self, new_count: usize) {
        debug_assert!(new_count.is_power_of_two());
        self.buckets = vec![NIL; new_count];
        for slot in 0..self.slots.len() {
            if self.slots[slot].is_some() {
                self.link_bucket(slot);
            }
        }
    }

    fn link_bucket(&mut self, slot: usize) {
        let b = self.bucket_of(self.pair(slot).fullhash);
        let head = self.buckets[b];
        self.pair_mut(slot).hash_next = head;
        self.buckets[b] = slot;
    }

    fn unlink_bucket(&mut self, slot: usize) {
        let b = self.bucket_of(self.pair(slot).fullhash);
        let mut cur = self.buckets[b];
        if cur == slot {
            self.buckets[b] = self.pair(slot).hash_next;
            return;
        }
        while cur != NIL {
            let next = self.pair(cur).hash_next;
            if next == slot {
                let after = self.pair(slot).hash_next;
                self.pair_mut(cur).hash_next = after;
                return;
            }
            cur = next;
        }
        debug_assert!(false, "pair missing from its bucket chain");
    }

    fn link_lru_head(&mut self, slot: usize) {
        let old_head = self.lru_head;
        {
            let p = self.pair_mut(slot);
            p.lru_prev = NIL;
            p.lru_next = old_head;
        }
        if old_head != NIL {
            self.pair_mut(old_head).lru_prev = slot;
        } else {
            self.lru_tail = slot;
        }
        self.lru_head = slot;
    }

    fn unlink_lru(&mut self, slot: usize) {
        let (prev, next) = {
            let p = self.pair(slot);
            (p.lru_prev, p.lru_next)
        };
        if prev != NIL {
            self.pair_mut(prev).lru_next = next;
        } else {
            self.lru_head = next;
        }
        if next != NIL {
            self.pair_mut(next).lru_prev = prev;
        } else {
            self.lru_tail = prev;
        }
        let p = self.pair_mut(slot);
        p.lru_prev = NIL;
        p.lru_next = NIL;
    }
}
