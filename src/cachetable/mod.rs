//! The cache table: a concurrent page cache over a set of cachefiles.
//!
//! One coarse mutex guards the pair table, the file list, and the
//! checkpoint bookkeeping. Per-pair reader/writer locks layered on that
//! mutex provide page-level concurrency, and a thread pool drains a queue
//! of background fetch and flush jobs. Storage callbacks always run with
//! the coarse mutex released, so workers and clients make progress while
//! I/O is in flight.

mod checkpoint;

use crate::cachefile::{Cachefile, CachefileIo};
use crate::graceful::{CrashMarkers, CrashState};
use crate::infrastructure::workqueue::{Job, ThreadPool, WorkQueue};
use crate::pairtable::{Pair, PairState, PairTable};
use crate::types::{
    BlockNum, CacheError, CacheResult, CacheTableConfig, DirtyState, FileNum, Lsn, PageValue,
    ZERO_LSN,
};
use crate::vfs::{LocalFs, VfsInterface};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;

/// Point-in-time counters for one cache instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Pins satisfied without a fetch
    pub hits: u64,
    /// Pins that required a fetch (or missed outright)
    pub misses: u64,
    /// Bytes of cached pages
    pub size_current: usize,
    /// Bytes of pages in flight to storage
    pub size_writing: usize,
    /// Live pairs
    pub n_in_table: usize,
    /// Open cachefiles
    pub n_files: usize,
}

/// State guarded by the coarse mutex
struct CacheInner {
    table: PairTable,
    files: Vec<Arc<Cachefile>>,
    next_filenum: FileNum,
    checkpointing: bool,
    lsn_of_checkpoint: Lsn,
    hits: u64,
    misses: u64,
}

impl CacheInner {
    fn file_by_num(&self, filenum: FileNum) -> Option<Arc<Cachefile>> {
        self.files.iter().find(|f| f.filenum() == filenum).cloned()
    }
}

/// A page evicted under the mutex whose last reference must be released
/// through the flush callback after the mutex is dropped
struct Evicted {
    cf: Arc<Cachefile>,
    key: BlockNum,
    value: PageValue,
    size: usize,
    checkpoint_lsn: Lsn,
}

/// Everything shared between clients and worker threads
struct CacheShared {
    mutex: Mutex<CacheInner>,
    /// Signaled on every write completion and pair teardown; backpressured
    /// clients and per-file drains park here
    workers_cond: Condvar,
    jobs: Arc<WorkQueue<Job>>,
    markers: CrashMarkers,
    vfs: Arc<dyn VfsInterface>,
}

impl CacheShared {
    /// Backpressure: holds the caller while more than half the cached
    /// bytes are in flight to storage. Never called from unpin, which must
    /// stay wait-free so writers can drain.
    fn wait_write(&self, guard: &mut MutexGuard<'_, CacheInner>) {
        while guard.table.size_writing() > guard.table.size_current() / 2 {
            self.workers_cond.wait(guard);
        }
    }

    /// Builds the deferred-release payload for a pair removed from the
    /// table. A pair that never completed its fetch has no value to
    /// release.
    fn evicted_payload(&self, inner: &CacheInner, pair: Pair) -> Option<Evicted> {
        let value = pair.value?;
        let cf = inner.file_by_num(pair.filenum)?;
        Some(Evicted {
            cf,
            key: pair.key,
            value,
            size: pair.size,
            checkpoint_lsn: inner.lsn_of_checkpoint,
        })
    }

    /// Releases an evicted page through the flush callback; the coarse
    /// mutex must not be held
    fn destroy_evicted(&self, ev: Evicted) {
        let io = ev.cf.io();
        io.flush(
            &ev.cf,
            ev.key,
            ev.value,
            ev.size,
            false,
            false,
            ev.checkpoint_lsn,
            false,
        );
    }

    /// Removes an invalidated pair once nothing references it
    fn reap_if_dead(&self, guard: &mut MutexGuard<'_, CacheInner>, slot: usize) -> Option<Evicted> {
        let p = guard.table.pair(slot);
        if p.state == PairState::Invalid && !p.referenced() {
            let pair = guard.table.remove(slot);
            self.workers_cond.notify_all();
            return self.evicted_payload(guard, pair);
        }
        None
    }

    /// Runs the fetch callback for a `Reading` pair whose write lock is
    /// held by the calling thread, with the mutex released for the I/O.
    ///
    /// On success the pair becomes `Idle` and the write lock stays held.
    /// On failure the pair is invalidated and unlocked; blocked waiters
    /// observe `Invalid` and fail with `Gone`, and the last one out (or
    /// this thread, if there are none) removes the slot.
    fn fetch_pair_locked(
        &self,
        guard: &mut MutexGuard<'_, CacheInner>,
        cf: &Arc<Cachefile>,
        slot: usize,
        key: BlockNum,
        fullhash: u64,
    ) -> CacheResult<()> {
        let io = cf.io();
        let cf2 = Arc::clone(cf);
        let result = MutexGuard::unlocked(guard, move || io.fetch(&cf2, key, fullhash));
        match result {
            Ok(fetched) => {
                guard.table.resize_pair(slot, fetched.size);
                let p = guard.table.pair_mut(slot);
                p.value = Some(fetched.value);
                p.written_lsn = fetched.written_lsn;
                p.state = PairState::Idle;
                Ok(())
            }
            Err(e) => {
                let pl = guard.table.pair(slot).lock.clone();
                guard.table.pair_mut(slot).state = PairState::Invalid;
                pl.write_unlock(guard);
                let _ = self.reap_if_dead(guard, slot);
                Err(e)
            }
        }
    }

    /// Background fetch for a prefetched pair; the write lock was taken by
    /// the prefetching thread and is released here
    fn fetch_pair_job(&self, cf: Arc<Cachefile>, slot: usize, key: BlockNum, fullhash: u64) {
        let mut guard = self.mutex.lock();
        if self
            .fetch_pair_locked(&mut guard, &cf, slot, key, fullhash)
            .is_ok()
        {
            let pl = guard.table.pair(slot).lock.clone();
            pl.write_unlock(&mut guard);
        }
    }

    /// Finishes a write: returns the pair to `Idle`, drops the write lock,
    /// and carries out a pending removal.
    ///
    /// If a completion queue is attached the pair is handed to its drainer
    /// instead, still `Writing` and still write-locked. A pair marked for
    /// removal that picked up waiters while the write was in flight is
    /// kept; the waiters resurrect it.
    fn complete_write_pair(
        &self,
        guard: &mut MutexGuard<'_, CacheInner>,
        slot: usize,
    ) -> Option<Evicted> {
        if let Some(cq) = guard.table.pair(slot).cq.clone() {
            let _ = cq.enqueue(slot);
            return None;
        }
        guard.table.end_writing(slot);
        let pl = guard.table.pair(slot).lock.clone();
        pl.write_unlock(guard);
        self.workers_cond.notify_all();

        let p = guard.table.pair(slot);
        if p.remove_on_completion {
            if !p.referenced() {
                let pair = guard.table.remove(slot);
                return self.evicted_payload(guard, pair);
            }
            guard.table.pair_mut(slot).remove_on_completion = false;
        }
        None
    }

    /// The write path for one `Writing` pair, with the mutex already held.
    ///
    /// Acquires the pair's write lock (waiting out pinners), snapshots the
    /// pair, runs the flush callback with the mutex released if the pair
    /// is dirty, then completes the write.
    fn write_pair_locked(
        &self,
        guard: &mut MutexGuard<'_, CacheInner>,
        slot: usize,
    ) -> Option<Evicted> {
        let pl = guard.table.pair(slot).lock.clone();
        pl.write_lock(guard);

        let (filenum, key, value, size, dirty, modified_lsn, written_lsn) = {
            let p = guard.table.pair(slot);
            (
                p.filenum,
                p.key,
                p.value.clone(),
                p.size,
                p.dirty,
                p.modified_lsn,
                p.written_lsn,
            )
        };
        let checkpoint_lsn = guard.lsn_of_checkpoint;

        if dirty {
            // a write committed after the checkpoint began, against a page
            // not yet durable in this epoch, must not overwrite in place
            let needs_rename = modified_lsn >= checkpoint_lsn && written_lsn < checkpoint_lsn;
            if let (Some(value), Some(cf)) = (value, guard.file_by_num(filenum)) {
                let io = cf.io();
                MutexGuard::unlocked(guard, || {
                    io.flush(&cf, key, value, size, true, true, checkpoint_lsn, needs_rename);
                });
                let p = guard.table.pair_mut(slot);
                p.dirty = false;
                p.written_lsn = modified_lsn;
            }
        }
        self.complete_write_pair(guard, slot)
    }

    /// Worker entry point for a scheduled write
    fn write_pair(&self, slot: usize) {
        let mut guard = self.mutex.lock();
        let ev = self.write_pair_locked(&mut guard, slot);
        drop(guard);
        if let Some(ev) = ev {
            self.destroy_evicted(ev);
        }
    }

    /// Moves an `Idle` pair into the write pipeline.
    ///
    /// Dirty or contended pairs are handed to the worker pool; a clean,
    /// unreferenced pair completes on the calling thread without I/O. With
    /// `remove` set the pair leaves the table when the write finishes.
    fn flush_and_maybe_remove(
        this: &Arc<Self>,
        guard: &mut MutexGuard<'_, CacheInner>,
        slot: usize,
        remove: bool,
        evicted: &mut Vec<Evicted>,
    ) {
        let (dirty, users) = {
            let p = guard.table.pair(slot);
            (p.dirty, p.lock.users())
        };
        guard.table.begin_writing(slot);
        guard.table.pair_mut(slot).remove_on_completion = remove;

        if dirty || users > 0 {
            let shared = Arc::clone(this);
            let job: Job = Box::new(move || shared.write_pair(slot));
            if this.jobs.enqueue(job).is_err() {
                // pool is shutting down; write on this thread
                if let Some(ev) = this.write_pair_locked(guard, slot) {
                    evicted.push(ev);
                }
            }
        } else {
            let pl = guard.table.pair(slot).lock.clone();
            pl.write_lock(guard);
            if let Some(ev) = this.complete_write_pair(guard, slot) {
                evicted.push(ev);
            }
        }
    }

    /// Evicts from the LRU tail until `requested` more bytes fit under the
    /// size limit, counting in-flight writes as already leaving
    fn maybe_flush_some(
        this: &Arc<Self>,
        guard: &mut MutexGuard<'_, CacheInner>,
        requested: usize,
        evicted: &mut Vec<Evicted>,
    ) {
        while guard.table.size_current() + requested
            > guard.table.size_limit() + guard.table.size_writing()
        {
            let Some(slot) = guard.table.first_evictable() else {
                break;
            };
            Self::flush_and_maybe_remove(this, guard, slot, true, evicted);
        }
        guard.table.maybe_shrink();
    }

    /// Finishes a pair handed back through a private completion queue.
    ///
    /// Clears the redirect; a pair still mid-write is completed here (the
    /// queue owner inherits the completion the worker deferred).
    fn finalize_redirected(
        &self,
        guard: &mut MutexGuard<'_, CacheInner>,
        slot: usize,
    ) -> Option<Evicted> {
        guard.table.pair_mut(slot).cq = None;
        let ev = if guard.table.pair(slot).state == PairState::Writing {
            self.complete_write_pair(guard, slot)
        } else {
            None
        };
        self.workers_cond.notify_all();
        ev
    }

    /// Flushes and removes every pair of one cachefile.
    ///
    /// Sweeps until the file has no pairs left: in-flight fetches are
    /// waited out through their pair locks, live pairs are pushed through
    /// the write pipeline with removal set, and pairs owned by a
    /// concurrent checkpoint's queue are left for its drain and picked up
    /// on the next sweep.
    fn flush_file(
        this: &Arc<Self>,
        guard: &mut MutexGuard<'_, CacheInner>,
        filenum: FileNum,
        evicted: &mut Vec<Evicted>,
    ) {
        loop {
            // wait out fetches first so every remaining pair has a value
            loop {
                let mut reading = None;
                for slot in guard.table.slots_for_file(filenum) {
                    match guard.table.pair(slot).state {
                        PairState::Reading => {
                            reading = Some(slot);
                            break;
                        }
                        PairState::Invalid => {
                            if let Some(ev) = this.reap_if_dead(guard, slot) {
                                evicted.push(ev);
                            }
                        }
                        _ => {}
                    }
                }
                let Some(slot) = reading else { break };
                let pl = guard.table.pair(slot).lock.clone();
                pl.read_lock(guard);
                pl.read_unlock(guard);
                // the last waiter out may already have reaped the slot
                if guard.table.is_occupied(slot) && Arc::ptr_eq(&guard.table.pair(slot).lock, &pl) {
                    if let Some(ev) = this.reap_if_dead(guard, slot) {
                        evicted.push(ev);
                    }
                }
            }

            if guard.table.slots_for_file(filenum).is_empty() {
                break;
            }

            let cq = Arc::new(WorkQueue::new());
            let mut nfound = 0usize;
            for slot in guard.table.slots_for_file(filenum) {
                if guard.table.pair(slot).cq.is_some() {
                    continue;
                }
                match guard.table.pair(slot).state {
                    PairState::Idle => {
                        guard.table.pair_mut(slot).cq = Some(Arc::clone(&cq));
                        nfound += 1;
                        Self::flush_and_maybe_remove(this, guard, slot, true, evicted);
                    }
                    PairState::Writing => {
                        let p = guard.table.pair_mut(slot);
                        p.cq = Some(Arc::clone(&cq));
                        p.remove_on_completion = true;
                        nfound += 1;
                    }
                    PairState::Reading | PairState::Invalid => {}
                }
            }

            if nfound == 0 {
                // everything left belongs to a checkpoint in flight
                this.workers_cond.wait(guard);
                continue;
            }
            for _ in 0..nfound {
                match MutexGuard::unlocked(guard, || cq.dequeue()) {
                    Ok(slot) => {
                        if let Some(ev) = this.finalize_redirected(guard, slot) {
                            evicted.push(ev);
                        }
                    }
                    Err(_) => break,
                }
            }
        }
        guard.table.maybe_shrink();
    }
}

/// The public handle to one page cache instance
pub struct CacheTable {
    shared: Arc<CacheShared>,
    pool: Option<ThreadPool>,
    config: CacheTableConfig,
}

impl CacheTable {
    /// Creates a cache over the local filesystem
    pub fn new(config: CacheTableConfig) -> Self {
        Self::with_vfs(config, Arc::new(LocalFs::new()))
    }

    /// Creates a cache over an explicit VFS
    pub fn with_vfs(config: CacheTableConfig, vfs: Arc<dyn VfsInterface>) -> Self {
        if !vfs.exists(&config.data_dir) {
            let _ = vfs.create_dir(&config.data_dir);
        }
        let jobs = Arc::new(WorkQueue::new());
        let n_threads = ThreadPool::default_threads(config.workers_per_core);
        let pool = ThreadPool::new(n_threads, Arc::clone(&jobs));
        let shared = Arc::new(CacheShared {
            mutex: Mutex::new(CacheInner {
                table: PairTable::new(config.size_limit),
                files: Vec::new(),
                next_filenum: 1,
                checkpointing: false,
                lsn_of_checkpoint: ZERO_LSN,
                hits: 0,
                misses: 0,
            }),
            workers_cond: Condvar::new(),
            jobs,
            markers: CrashMarkers::new(Arc::clone(&vfs)),
            vfs,
        });
        CacheTable {
            shared,
            pool: Some(pool),
            config,
        }
    }

    /// The configuration this cache was created with
    pub fn config(&self) -> &CacheTableConfig {
        &self.config
    }

    /// Snapshot of the cache counters
    pub fn stats(&self) -> CacheStats {
        let guard = self.shared.mutex.lock();
        CacheStats {
            hits: guard.hits,
            misses: guard.misses,
            size_current: guard.table.size_current(),
            size_writing: guard.table.size_writing(),
            n_in_table: guard.table.n_in_table(),
            n_files: guard.files.len(),
        }
    }

    /// Opens (or creates) a backing file and binds `io` to it.
    ///
    /// Re-opening a file already open in this cache, under any path that
    /// resolves to the same physical file, returns the existing cachefile
    /// with its refcount bumped and reports `Clean` without consulting the
    /// crash markers.
    pub fn open_file(
        &self,
        path: &str,
        io: Arc<dyn CachefileIo>,
    ) -> CacheResult<(Arc<Cachefile>, CrashState)> {
        let shared = &self.shared;
        let (handle, created) = match shared.vfs.open_file(path) {
            Ok(h) => (h, false),
            Err(e) if e.is_not_found() => (shared.vfs.create_file(path)?, true),
            Err(e) => return Err(e.into()),
        };
        let fileid = handle.file_id()?;

        let mut guard = shared.mutex.lock();
        if let Some(existing) = guard.files.iter().find(|f| f.fileid() == fileid).cloned() {
            existing.refup();
            drop(guard);
            let _ = handle.close();
            return Ok((existing, CrashState::Clean));
        }
        let filenum = guard.next_filenum;
        guard.next_filenum += 1;
        let state = shared.markers.open(path, created)?;
        let cf = Arc::new(Cachefile::new(
            filenum,
            fileid,
            path.to_string(),
            handle,
            io,
            state == CrashState::Dirty,
        ));
        guard.files.push(Arc::clone(&cf));
        Ok((cf, state))
    }

    /// Flushes and removes every page of one cachefile, leaving the file
    /// open. Dirty pages are written back; clean pages are released
    /// without I/O. Blocks until the file has no cached pages left.
    pub fn flush_file(&self, cf: &Arc<Cachefile>) -> CacheResult<()> {
        let shared = &self.shared;
        let mut guard = shared.mutex.lock();
        let mut evicted = Vec::new();
        CacheShared::flush_file(shared, &mut guard, cf.filenum(), &mut evicted);
        drop(guard);
        for ev in evicted {
            shared.destroy_evicted(ev);
        }
        Ok(())
    }

    /// Releases one reference to a cachefile. The last release flushes and
    /// removes every pair of the file, runs the close hook, marks the
    /// crash sentinel clean, and closes the descriptor.
    pub fn close_file(&self, cf: Arc<Cachefile>) -> CacheResult<()> {
        let shared = &self.shared;
        let mut guard = shared.mutex.lock();
        if cf.refdown() > 0 {
            return Ok(());
        }
        let mut evicted = Vec::new();
        CacheShared::flush_file(shared, &mut guard, cf.filenum(), &mut evicted);
        debug_assert!(
            guard.table.slots_for_file(cf.filenum()).is_empty(),
            "pairs remain after file flush"
        );
        guard.files.retain(|f| f.filenum() != cf.filenum());
        drop(guard);

        for ev in evicted {
            shared.destroy_evicted(ev);
        }
        cf.io().close(&cf)?;
        shared.markers.close_clean(cf.path())?;
        if let Some(handle) = cf.take_handle() {
            handle.close()?;
        }
        Ok(())
    }

    /// Inserts a page under `key`, dirty, with the caller holding a read
    /// pin on it.
    ///
    /// If the key is already cached the existing page is pinned instead
    /// and `AlreadyPresent` is returned, so the caller always ends up
    /// holding a pin either way.
    pub fn put(
        &self,
        cf: &Arc<Cachefile>,
        key: BlockNum,
        value: PageValue,
        size: usize,
    ) -> CacheResult<()> {
        let shared = &self.shared;
        let fullhash = cf.fullhash(key);
        let mut guard = shared.mutex.lock();
        shared.wait_write(&mut guard);

        if let Some(slot) = guard.table.lookup(cf.filenum(), key, fullhash) {
            let pl = guard.table.pair(slot).lock.clone();
            pl.read_lock(&mut guard);
            if guard.table.pair(slot).state == PairState::Invalid {
                pl.read_unlock(&mut guard);
                let ev = shared.reap_if_dead(&mut guard, slot);
                drop(guard);
                if let Some(ev) = ev {
                    shared.destroy_evicted(ev);
                }
                return Err(CacheError::Gone);
            }
            guard.table.touch(slot);
            drop(guard);
            return Err(CacheError::AlreadyPresent);
        }

        let mut evicted = Vec::new();
        CacheShared::maybe_flush_some(shared, &mut guard, size, &mut evicted);
        let pair = Pair::new(
            cf.filenum(),
            key,
            fullhash,
            Some(value),
            size,
            true,
            PairState::Idle,
            ZERO_LSN,
        );
        let slot = guard.table.insert(pair);
        let pl = guard.table.pair(slot).lock.clone();
        pl.read_lock(&mut guard);
        let newly_dirty = cf.mark_dirtied();
        drop(guard);

        for ev in evicted {
            shared.destroy_evicted(ev);
        }
        if newly_dirty {
            shared.markers.mark_dirty(cf.path())?;
        }
        Ok(())
    }

    /// Pins a page for reading, fetching it on a miss.
    ///
    /// A hit never invokes the fetch callback. On a miss the calling
    /// thread fetches with the pair write-locked so concurrent callers for
    /// the same key block instead of fetching twice; the lock is
    /// downgraded to the returned read pin. Fails with `Gone` if the pair
    /// was invalidated by a failed fetch while this caller waited.
    pub fn get_and_pin(&self, cf: &Arc<Cachefile>, key: BlockNum) -> CacheResult<PageValue> {
        let shared = &self.shared;
        let fullhash = cf.fullhash(key);
        let mut guard = shared.mutex.lock();
        shared.wait_write(&mut guard);

        if let Some(slot) = guard.table.lookup(cf.filenum(), key, fullhash) {
            guard.hits += 1;
            let pl = guard.table.pair(slot).lock.clone();
            pl.read_lock(&mut guard);
            if guard.table.pair(slot).state == PairState::Invalid {
                pl.read_unlock(&mut guard);
                let ev = shared.reap_if_dead(&mut guard, slot);
                drop(guard);
                if let Some(ev) = ev {
                    shared.destroy_evicted(ev);
                }
                return Err(CacheError::Gone);
            }
            guard.table.touch(slot);
            let value = guard
                .table
                .pair(slot)
                .value
                .clone()
                .expect("pinned pair without a value");
            return Ok(value);
        }

        guard.misses += 1;
        let pair = Pair::new(
            cf.filenum(),
            key,
            fullhash,
            None,
            0,
            false,
            PairState::Reading,
            ZERO_LSN,
        );
        let slot = guard.table.insert(pair);
        let pl = guard.table.pair(slot).lock.clone();
        pl.write_lock(&mut guard);
        shared.fetch_pair_locked(&mut guard, cf, slot, key, fullhash)?;
        pl.write_unlock_to_read(&mut guard);
        guard.table.touch(slot);
        let value = guard
            .table
            .pair(slot)
            .value
            .clone()
            .expect("fetched pair without a value");

        let mut evicted = Vec::new();
        CacheShared::maybe_flush_some(shared, &mut guard, 0, &mut evicted);
        drop(guard);
        for ev in evicted {
            shared.destroy_evicted(ev);
        }
        Ok(value)
    }

    /// Pins a page only if that can happen without blocking or fetching:
    /// the page must be cached, idle, and free of writer contention
    pub fn maybe_get_and_pin(&self, cf: &Arc<Cachefile>, key: BlockNum) -> CacheResult<PageValue> {
        let shared = &self.shared;
        let fullhash = cf.fullhash(key);
        let mut guard = shared.mutex.lock();

        let Some(slot) = guard.table.lookup(cf.filenum(), key, fullhash) else {
            guard.misses += 1;
            return Err(CacheError::NotFound);
        };
        let p = guard.table.pair(slot);
        if p.state != PairState::Idle || p.lock.write_contended() {
            guard.misses += 1;
            return Err(CacheError::NotFound);
        }
        guard.hits += 1;
        let pl = guard.table.pair(slot).lock.clone();
        pl.read_lock(&mut guard);
        guard.table.touch(slot);
        let value = guard
            .table
            .pair(slot)
            .value
            .clone()
            .expect("idle pair without a value");
        Ok(value)
    }

    /// Releases one read pin, optionally marking the page dirty at `lsn`
    /// and re-accounting its size.
    ///
    /// Never blocks on backpressure: a pinned page may be what an
    /// in-flight write is waiting for.
    pub fn unpin(
        &self,
        cf: &Arc<Cachefile>,
        key: BlockNum,
        dirty: DirtyState,
        new_size: Option<usize>,
    ) -> CacheResult<()> {
        let shared = &self.shared;
        let fullhash = cf.fullhash(key);
        let mut guard = shared.mutex.lock();
        let Some(slot) = guard.table.lookup(cf.filenum(), key, fullhash) else {
            return Err(CacheError::NotFound);
        };

        let mut newly_dirty = false;
        if let DirtyState::Dirty(lsn) = dirty {
            let p = guard.table.pair_mut(slot);
            p.dirty = true;
            p.modified_lsn = p.modified_lsn.max(lsn);
            newly_dirty = cf.mark_dirtied();
        }
        if let Some(size) = new_size {
            guard.table.resize_pair(slot, size);
        }
        let pl = guard.table.pair(slot).lock.clone();
        pl.read_unlock(&mut guard);

        let mut evicted = Vec::new();
        CacheShared::maybe_flush_some(shared, &mut guard, 0, &mut evicted);
        drop(guard);
        for ev in evicted {
            shared.destroy_evicted(ev);
        }
        if newly_dirty {
            shared.markers.mark_dirty(cf.path())?;
        }
        Ok(())
    }

    /// Releases the caller's pin and removes the page, discarding any
    /// dirty image without writing it.
    ///
    /// Blocks until the pair has left the table. Waiters blocked on the
    /// pair observe the removal and fail with `Gone`.
    pub fn unpin_and_remove(&self, cf: &Arc<Cachefile>, key: BlockNum) -> CacheResult<()> {
        let shared = &self.shared;
        let fullhash = cf.fullhash(key);
        let mut guard = shared.mutex.lock();
        let Some(slot) = guard.table.lookup(cf.filenum(), key, fullhash) else {
            return Err(CacheError::NotFound);
        };

        let pl = guard.table.pair(slot).lock.clone();
        debug_assert!(pl.pinned() > 0, "unpin_and_remove without a pin held");
        guard.table.pair_mut(slot).dirty = false;
        pl.read_unlock(&mut guard);

        // A checkpoint or eviction may own the pair. Ask its completion to
        // do the removal and wait; if a waiter resurrects the pair in the
        // meantime, come back and remove it ourselves.
        loop {
            if !guard.table.is_occupied(slot) || !Arc::ptr_eq(&guard.table.pair(slot).lock, &pl) {
                return Ok(());
            }
            let (owned, state) = {
                let p = guard.table.pair(slot);
                (p.cq.is_some(), p.state)
            };
            if owned || state == PairState::Writing {
                guard.table.pair_mut(slot).remove_on_completion = true;
                shared.workers_cond.wait(&mut guard);
                continue;
            }
            if state == PairState::Invalid {
                let ev = shared.reap_if_dead(&mut guard, slot);
                drop(guard);
                if let Some(ev) = ev {
                    shared.destroy_evicted(ev);
                }
                return Ok(());
            }
            break;
        }

        // discard any image a concurrent pinner re-dirtied meanwhile
        guard.table.pair_mut(slot).dirty = false;
        let cq = Arc::new(WorkQueue::new());
        guard.table.pair_mut(slot).cq = Some(Arc::clone(&cq));
        let mut evicted = Vec::new();
        CacheShared::flush_and_maybe_remove(shared, &mut guard, slot, true, &mut evicted);

        MutexGuard::unlocked(&mut guard, || cq.dequeue())?;
        guard.table.pair_mut(slot).cq = None;
        guard.table.end_writing(slot);
        pl.write_unlock(&mut guard);
        shared.workers_cond.notify_all();

        let ev = if guard.table.pair(slot).referenced() {
            // surviving waiters must observe the removal, not the page
            let p = guard.table.pair_mut(slot);
            p.state = PairState::Invalid;
            p.remove_on_completion = false;
            None
        } else {
            let pair = guard.table.remove(slot);
            shared.evicted_payload(&guard, pair)
        };
        guard.table.maybe_shrink();
        drop(guard);

        for e in evicted {
            shared.destroy_evicted(e);
        }
        if let Some(ev) = ev {
            shared.destroy_evicted(ev);
        }
        Ok(())
    }

    /// Schedules a background fetch for a page that is not yet cached.
    ///
    /// A page already present (in any state) makes this a no-op. The pair
    /// is inserted `Reading` and write-locked before this returns, so a
    /// following `get_and_pin` blocks until the fetch lands instead of
    /// fetching again.
    pub fn prefetch(&self, cf: &Arc<Cachefile>, key: BlockNum) -> CacheResult<()> {
        let shared = &self.shared;
        let fullhash = cf.fullhash(key);
        let mut guard = shared.mutex.lock();
        shared.wait_write(&mut guard);

        if guard.table.lookup(cf.filenum(), key, fullhash).is_some() {
            return Ok(());
        }
        let pair = Pair::new(
            cf.filenum(),
            key,
            fullhash,
            None,
            0,
            false,
            PairState::Reading,
            ZERO_LSN,
        );
        let slot = guard.table.insert(pair);
        let pl = guard.table.pair(slot).lock.clone();
        pl.write_lock(&mut guard);

        let shared2 = Arc::clone(shared);
        let cf2 = Arc::clone(cf);
        let job: Job = Box::new(move || shared2.fetch_pair_job(cf2, slot, key, fullhash));
        if shared.jobs.enqueue(job).is_err() {
            // pool is shutting down; abandon the placeholder
            pl.write_unlock(&mut guard);
            let _ = guard.table.remove(slot);
            return Err(CacheError::Canceled);
        }

        let mut evicted = Vec::new();
        CacheShared::maybe_flush_some(shared, &mut guard, 0, &mut evicted);
        drop(guard);
        for ev in evicted {
            shared.destroy_evicted(ev);
        }
        Ok(())
    }

    /// Rehomes a pinned page under a new key within the same cachefile.
    ///
    /// The caller must hold a pin; the pin, the LRU position, and the
    /// dirty state all carry over. Fails with `AlreadyPresent` if the new
    /// key is cached.
    pub fn rename(&self, cf: &Arc<Cachefile>, old_key: BlockNum, new_key: BlockNum) -> CacheResult<()> {
        let shared = &self.shared;
        let mut guard = shared.mutex.lock();
        let Some(slot) = guard.table.lookup(cf.filenum(), old_key, cf.fullhash(old_key)) else {
            return Err(CacheError::NotFound);
        };
        if guard.table.pair(slot).lock.pinned() == 0 {
            return Err(CacheError::NotFound);
        }
        if guard
            .table
            .lookup(cf.filenum(), new_key, cf.fullhash(new_key))
            .is_some()
        {
            return Err(CacheError::AlreadyPresent);
        }
        guard.table.rekey(slot, new_key, cf.fullhash(new_key));
        Ok(())
    }

    /// Shuts the cache down: closes every remaining file (flushing its
    /// pairs), then stops the worker pool. The first error is reported;
    /// later files are still closed.
    pub fn close(mut self) -> CacheResult<()> {
        let shared = Arc::clone(&self.shared);
        let mut first_err = None;
        loop {
            let cf = shared.mutex.lock().files.first().cloned();
            let Some(cf) = cf else { break };
            while cf.refcount() > 1 {
                cf.refdown();
            }
            if let Err(e) = self.close_file(cf) {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        if let Some(mut pool) = self.pool.take() {
            pool.shutdown();
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
