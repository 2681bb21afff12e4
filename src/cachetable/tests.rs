// CacheTable behavior tests, driven through a mock storage layer

use super::*;
use crate::cachefile::FetchedPage;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

const PAGE_SIZE: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FlushRecord {
    key: BlockNum,
    write_me: bool,
    keep_me: bool,
    needs_rename: bool,
}

#[derive(Default)]
struct IoLog {
    fetches: Vec<BlockNum>,
    flushes: Vec<FlushRecord>,
    checkpoints: Vec<Lsn>,
    closes: u32,
}

/// Mock storage: an in-memory "disk" of u64 page payloads. A key never
/// written reads back as `key * 100`.
#[derive(Default)]
struct MockIo {
    disk: Mutex<HashMap<BlockNum, u64>>,
    log: Mutex<IoLog>,
    fail_fetch: Mutex<HashSet<BlockNum>>,
    gated: Mutex<HashSet<BlockNum>>,
    gated_flush: Mutex<HashSet<BlockNum>>,
    gate_cond: Condvar,
    fetches_started: Mutex<u32>,
    flushes_started: Mutex<u32>,
}

impl MockIo {
    fn fail_fetch(&self, key: BlockNum) {
        self.fail_fetch.lock().insert(key);
    }

    fn clear_fail(&self, key: BlockNum) {
        self.fail_fetch.lock().remove(&key);
    }

    fn gate(&self, key: BlockNum) {
        self.gated.lock().insert(key);
    }

    fn gate_flush(&self, key: BlockNum) {
        self.gated_flush.lock().insert(key);
    }

    fn open_gates(&self) {
        self.gated.lock().clear();
        self.gated_flush.lock().clear();
        self.gate_cond.notify_all();
    }

    fn fetches_started(&self) -> u32 {
        *self.fetches_started.lock()
    }

    fn flushes_started(&self) -> u32 {
        *self.flushes_started.lock()
    }

    fn flushes(&self) -> Vec<FlushRecord> {
        self.log.lock().flushes.clone()
    }

    fn fetch_count(&self) -> usize {
        self.log.lock().fetches.len()
    }

    fn on_disk(&self, key: BlockNum) -> Option<u64> {
        self.disk.lock().get(&key).copied()
    }
}

impl CachefileIo for MockIo {
    fn fetch(&self, _cf: &Cachefile, key: BlockNum, _fullhash: u64) -> CacheResult<FetchedPage> {
        *self.fetches_started.lock() += 1;
        {
            let mut gated = self.gated.lock();
            while gated.contains(&key) {
                self.gate_cond.wait(&mut gated);
            }
        }
        if self.fail_fetch.lock().contains(&key) {
            return Err(CacheError::NotFound);
        }
        self.log.lock().fetches.push(key);
        let value = *self.disk.lock().entry(key).or_insert(key * 100);
        Ok(FetchedPage {
            value: Arc::new(value),
            size: PAGE_SIZE,
            written_lsn: ZERO_LSN,
        })
    }

    fn flush(
        &self,
        _cf: &Cachefile,
        key: BlockNum,
        value: PageValue,
        _size: usize,
        write_me: bool,
        keep_me: bool,
        _checkpoint_lsn: Lsn,
        needs_rename: bool,
    ) {
        *self.flushes_started.lock() += 1;
        {
            let mut gated = self.gated_flush.lock();
            while gated.contains(&key) {
                self.gate_cond.wait(&mut gated);
            }
        }
        if write_me {
            let v = *value.downcast_ref::<u64>().expect("unexpected page type");
            self.disk.lock().insert(key, v);
        }
        self.log.lock().flushes.push(FlushRecord {
            key,
            write_me,
            keep_me,
            needs_rename,
        });
    }

    fn checkpoint(&self, _cf: &Cachefile, checkpoint_lsn: Lsn) -> CacheResult<()> {
        self.log.lock().checkpoints.push(checkpoint_lsn);
        Ok(())
    }

    fn close(&self, _cf: &Cachefile) -> CacheResult<()> {
        self.log.lock().closes += 1;
        Ok(())
    }
}

fn setup(size_limit: usize) -> (tempfile::TempDir, CacheTable, Arc<Cachefile>, Arc<MockIo>) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let data_dir = dir.path().to_str().unwrap().to_string();
    let config = CacheTableConfig {
        size_limit,
        workers_per_core: 1,
        data_dir: data_dir.clone(),
    };
    let cache = CacheTable::new(config);
    let io = Arc::new(MockIo::default());
    let path = format!("{}/test.db", data_dir);
    let (cf, state) = cache
        .open_file(&path, Arc::clone(&io) as Arc<dyn CachefileIo>)
        .unwrap();
    assert_eq!(state, CrashState::Created);
    (dir, cache, cf, io)
}

fn as_u64(v: &PageValue) -> u64 {
    *v.downcast_ref::<u64>().expect("unexpected page type")
}

fn wait_until<F: FnMut() -> bool>(mut pred: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !pred() {
        assert!(Instant::now() < deadline, "condition never became true");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_put_pins_and_hit_does_not_fetch() {
    let (_dir, cache, cf, io) = setup(64);
    cache.put(&cf, 1, Arc::new(42u64), PAGE_SIZE).unwrap();

    // put leaves the caller pinned; a reader shares the pin
    let v = cache.get_and_pin(&cf, 1).unwrap();
    assert_eq!(as_u64(&v), 42);
    assert_eq!(io.fetch_count(), 0);

    cache.unpin(&cf, 1, DirtyState::Clean, None).unwrap();
    cache.unpin(&cf, 1, DirtyState::Clean, None).unwrap();
    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.n_in_table, 1);
}

#[test]
fn test_put_duplicate_pins_existing() {
    let (_dir, cache, cf, _io) = setup(64);
    cache.put(&cf, 1, Arc::new(1u64), PAGE_SIZE).unwrap();
    let err = cache.put(&cf, 1, Arc::new(2u64), PAGE_SIZE).unwrap_err();
    assert!(matches!(err, CacheError::AlreadyPresent));

    // both calls left a pin; the original value is the one cached
    let v = cache.get_and_pin(&cf, 1).unwrap();
    assert_eq!(as_u64(&v), 1);
    for _ in 0..3 {
        cache.unpin(&cf, 1, DirtyState::Clean, None).unwrap();
    }
}

#[test]
fn test_miss_fetches_once() {
    let (_dir, cache, cf, io) = setup(64);
    let v = cache.get_and_pin(&cf, 3).unwrap();
    assert_eq!(as_u64(&v), 300);
    assert_eq!(io.fetch_count(), 1);
    cache.unpin(&cf, 3, DirtyState::Clean, None).unwrap();

    let v = cache.get_and_pin(&cf, 3).unwrap();
    assert_eq!(as_u64(&v), 300);
    assert_eq!(io.fetch_count(), 1);
    cache.unpin(&cf, 3, DirtyState::Clean, None).unwrap();

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

#[test]
fn test_unpin_unknown_key_fails() {
    let (_dir, cache, cf, _io) = setup(64);
    let err = cache.unpin(&cf, 99, DirtyState::Clean, None).unwrap_err();
    assert!(matches!(err, CacheError::NotFound));
}

#[test]
fn test_eviction_writes_back_dirty_pages() {
    let (_dir, cache, cf, io) = setup(4);
    for key in 1..=5u64 {
        cache.put(&cf, key, Arc::new(key * 10), PAGE_SIZE).unwrap();
        cache
            .unpin(&cf, key, DirtyState::Dirty(key), None)
            .unwrap();
    }

    // the fifth insert pushes the cache over its limit; the LRU tail is
    // written back and evicted
    wait_until(|| {
        let s = cache.stats();
        s.size_current <= 4 && s.size_writing == 0
    });
    assert_eq!(io.on_disk(1), Some(10));
    // the write-back, then the release of the evicted image
    assert!(io.flushes().iter().any(|f| f.key == 1 && f.write_me));
    assert!(io
        .flushes()
        .iter()
        .any(|f| f.key == 1 && !f.write_me && !f.keep_me));

    // every page still reads back its written value
    for key in 1..=5u64 {
        let v = cache.get_and_pin(&cf, key).unwrap();
        assert_eq!(as_u64(&v), key * 10);
        cache.unpin(&cf, key, DirtyState::Clean, None).unwrap();
    }
}

#[test]
fn test_eviction_skips_pinned_pages() {
    let (_dir, cache, cf, _io) = setup(2);
    for key in 1..=3u64 {
        cache.put(&cf, key, Arc::new(key), PAGE_SIZE).unwrap();
    }
    // all three are pinned: the limit is soft, nothing was evicted
    assert_eq!(cache.stats().size_current, 3);

    for key in 1..=3u64 {
        cache
            .unpin(&cf, key, DirtyState::Dirty(key), None)
            .unwrap();
    }
    wait_until(|| {
        let s = cache.stats();
        s.size_current <= 2 && s.size_writing == 0
    });
}

#[test]
fn test_maybe_get_and_pin() {
    let (_dir, cache, cf, io) = setup(64);
    let err = cache.maybe_get_and_pin(&cf, 5).unwrap_err();
    assert!(matches!(err, CacheError::NotFound));
    assert_eq!(io.fetch_count(), 0);

    cache.put(&cf, 5, Arc::new(55u64), PAGE_SIZE).unwrap();
    cache.unpin(&cf, 5, DirtyState::Clean, None).unwrap();
    let v = cache.maybe_get_and_pin(&cf, 5).unwrap();
    assert_eq!(as_u64(&v), 55);
    cache.unpin(&cf, 5, DirtyState::Clean, None).unwrap();
}

#[test]
fn test_prefetch_then_pin_without_second_fetch() {
    let (_dir, cache, cf, io) = setup(64);
    cache.prefetch(&cf, 7).unwrap();
    let v = cache.get_and_pin(&cf, 7).unwrap();
    assert_eq!(as_u64(&v), 700);
    assert_eq!(io.fetch_count(), 1);
    cache.unpin(&cf, 7, DirtyState::Clean, None).unwrap();

    // prefetch of a cached page is a no-op
    cache.prefetch(&cf, 7).unwrap();
    assert_eq!(io.fetch_count(), 1);
}

#[test]
fn test_concurrent_misses_fetch_once() {
    let (_dir, cache, cf, io) = setup(64);
    let cache = Arc::new(cache);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let cache = Arc::clone(&cache);
        let cf = Arc::clone(&cf);
        handles.push(std::thread::spawn(move || {
            let v = cache.get_and_pin(&cf, 9).unwrap();
            as_u64(&v)
        }));
    }
    for h in handles {
        assert_eq!(h.join().unwrap(), 900);
    }
    assert_eq!(io.fetch_count(), 1);
    for _ in 0..4 {
        cache.unpin(&cf, 9, DirtyState::Clean, None).unwrap();
    }
}

#[test]
fn test_failed_fetch_is_not_cached() {
    let (_dir, cache, cf, io) = setup(64);
    io.fail_fetch(2);
    let err = cache.get_and_pin(&cf, 2).unwrap_err();
    assert!(matches!(err, CacheError::NotFound));
    assert_eq!(cache.stats().n_in_table, 0);

    io.clear_fail(2);
    let v = cache.get_and_pin(&cf, 2).unwrap();
    assert_eq!(as_u64(&v), 200);
    cache.unpin(&cf, 2, DirtyState::Clean, None).unwrap();
}

#[test]
fn test_waiter_on_failed_fetch_gets_gone() {
    let (_dir, cache, cf, io) = setup(64);
    let cache = Arc::new(cache);
    io.fail_fetch(2);
    io.gate(2);

    let t1 = {
        let (cache, cf) = (Arc::clone(&cache), Arc::clone(&cf));
        std::thread::spawn(move || cache.get_and_pin(&cf, 2))
    };
    wait_until(|| io.fetches_started() == 1);
    let t2 = {
        let (cache, cf) = (Arc::clone(&cache), Arc::clone(&cf));
        std::thread::spawn(move || cache.get_and_pin(&cf, 2))
    };
    // let the second caller block on the in-flight pair before failing it
    std::thread::sleep(Duration::from_millis(100));
    io.open_gates();

    assert!(matches!(t1.join().unwrap(), Err(CacheError::NotFound)));
    assert!(matches!(t2.join().unwrap(), Err(CacheError::Gone)));
    assert_eq!(cache.stats().n_in_table, 0);
}

#[test]
fn test_unpin_and_remove_discards_dirty_image() {
    let (_dir, cache, cf, io) = setup(64);
    cache.put(&cf, 6, Arc::new(66u64), PAGE_SIZE).unwrap();
    cache.unpin_and_remove(&cf, 6).unwrap();

    assert_eq!(cache.stats().n_in_table, 0);
    // the image was released, never written
    assert_eq!(io.on_disk(6), None);
    assert!(io
        .flushes()
        .iter()
        .any(|f| f.key == 6 && !f.write_me && !f.keep_me));

    // a later read goes back to storage
    let v = cache.get_and_pin(&cf, 6).unwrap();
    assert_eq!(as_u64(&v), 600);
    cache.unpin(&cf, 6, DirtyState::Clean, None).unwrap();
}

#[test]
fn test_rename_carries_pin_and_value() {
    let (_dir, cache, cf, io) = setup(64);
    cache.put(&cf, 1, Arc::new(42u64), PAGE_SIZE).unwrap();
    cache.rename(&cf, 1, 2).unwrap();

    // the page answers to its new key, pin intact
    let v = cache.get_and_pin(&cf, 2).unwrap();
    assert_eq!(as_u64(&v), 42);
    cache.unpin(&cf, 2, DirtyState::Clean, None).unwrap();
    cache.unpin(&cf, 2, DirtyState::Dirty(1), None).unwrap();

    // the old key is a miss again
    assert_eq!(io.fetch_count(), 0);
    let v = cache.get_and_pin(&cf, 1).unwrap();
    assert_eq!(as_u64(&v), 100);
    assert_eq!(io.fetch_count(), 1);
    cache.unpin(&cf, 1, DirtyState::Clean, None).unwrap();
}

#[test]
fn test_rename_requires_pin() {
    let (_dir, cache, cf, _io) = setup(64);
    cache.put(&cf, 3, Arc::new(3u64), PAGE_SIZE).unwrap();
    cache.unpin(&cf, 3, DirtyState::Clean, None).unwrap();

    let err = cache.rename(&cf, 3, 4).unwrap_err();
    assert!(matches!(err, CacheError::NotFound));
    let err = cache.rename(&cf, 99, 4).unwrap_err();
    assert!(matches!(err, CacheError::NotFound));
}

#[test]
fn test_rename_rejects_occupied_target() {
    let (_dir, cache, cf, _io) = setup(64);
    cache.put(&cf, 1, Arc::new(1u64), PAGE_SIZE).unwrap();
    cache.put(&cf, 2, Arc::new(2u64), PAGE_SIZE).unwrap();
    let err = cache.rename(&cf, 1, 2).unwrap_err();
    assert!(matches!(err, CacheError::AlreadyPresent));
    cache.unpin(&cf, 1, DirtyState::Clean, None).unwrap();
    cache.unpin(&cf, 2, DirtyState::Clean, None).unwrap();
}

#[test]
fn test_checkpoint_writes_dirty_pairs_and_keeps_them() {
    let (_dir, cache, cf, io) = setup(64);
    for key in 1..=3u64 {
        cache.put(&cf, key, Arc::new(key * 10), PAGE_SIZE).unwrap();
        cache
            .unpin(&cf, key, DirtyState::Dirty(10), None)
            .unwrap();
    }
    cache.checkpoint(20).unwrap();

    for key in 1..=3u64 {
        assert_eq!(io.on_disk(key), Some(key * 10));
    }
    assert_eq!(io.log.lock().checkpoints, vec![20]);
    // checkpointed pairs stay cached and clean
    assert_eq!(cache.stats().n_in_table, 3);
    let before = io.fetch_count();
    let v = cache.get_and_pin(&cf, 2).unwrap();
    assert_eq!(as_u64(&v), 20);
    assert_eq!(io.fetch_count(), before);
    cache.unpin(&cf, 2, DirtyState::Clean, None).unwrap();
}

#[test]
fn test_checkpoint_clean_pairs_write_nothing() {
    let (_dir, cache, cf, io) = setup(64);
    let v = cache.get_and_pin(&cf, 4).unwrap();
    assert_eq!(as_u64(&v), 400);
    cache.unpin(&cf, 4, DirtyState::Clean, None).unwrap();

    cache.checkpoint(5).unwrap();
    assert!(io.flushes().iter().all(|f| !f.write_me));
    assert_eq!(io.log.lock().checkpoints, vec![5]);
}

#[test]
fn test_checkpoint_needs_rename_for_current_epoch_writes() {
    let (_dir, cache, cf, io) = setup(64);
    cache.put(&cf, 9, Arc::new(9u64), PAGE_SIZE).unwrap();
    // modified at LSN 30, never yet durable: a checkpoint at LSN 20 still
    // depends on the prior on-disk image
    cache.unpin(&cf, 9, DirtyState::Dirty(30), None).unwrap();
    cache.checkpoint(20).unwrap();

    assert!(io
        .flushes()
        .iter()
        .any(|f| f.key == 9 && f.write_me && f.needs_rename));
}

#[test]
fn test_checkpoint_pre_epoch_write_overwrites_in_place() {
    let (_dir, cache, cf, io) = setup(64);
    cache.put(&cf, 9, Arc::new(9u64), PAGE_SIZE).unwrap();
    // modified before the checkpoint epoch began: the on-disk location may
    // be overwritten in place
    cache.unpin(&cf, 9, DirtyState::Dirty(10), None).unwrap();
    cache.checkpoint(20).unwrap();

    assert!(io
        .flushes()
        .iter()
        .any(|f| f.key == 9 && f.write_me && !f.needs_rename));

    // the page is clean now; a later checkpoint writes nothing more
    let writes = io.flushes().iter().filter(|f| f.write_me).count();
    cache.checkpoint(30).unwrap();
    assert_eq!(io.flushes().iter().filter(|f| f.write_me).count(), writes);
}

#[test]
fn test_backpressure_waits_for_writeback() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let (_dir, cache, cf, io) = setup(4);
    cache.put(&cf, 1, Arc::new(1u64), 4).unwrap();
    cache.unpin(&cf, 1, DirtyState::Dirty(1), None).unwrap();

    // the next insert pushes key 1 into a write-back that we hold open
    io.gate_flush(1);
    cache.put(&cf, 2, Arc::new(2u64), PAGE_SIZE).unwrap();
    cache.unpin(&cf, 2, DirtyState::Clean, None).unwrap();
    wait_until(|| io.flushes_started() == 1);
    assert_eq!(cache.stats().size_writing, 4);

    // in-flight bytes exceed half the cached bytes: a new insert must wait
    let cache = Arc::new(cache);
    let done = Arc::new(AtomicBool::new(false));
    let t = {
        let (cache, cf, done) = (Arc::clone(&cache), Arc::clone(&cf), Arc::clone(&done));
        std::thread::spawn(move || {
            cache.put(&cf, 3, Arc::new(3u64), PAGE_SIZE).unwrap();
            cache.unpin(&cf, 3, DirtyState::Clean, None).unwrap();
            done.store(true, Ordering::SeqCst);
        })
    };
    std::thread::sleep(Duration::from_millis(100));
    assert!(!done.load(Ordering::SeqCst));

    io.open_gates();
    t.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(io.on_disk(1), Some(1));
    wait_until(|| cache.stats().size_writing == 0);
}

#[test]
fn test_page_clean_after_checkpoint() {
    let (_dir, cache, cf, io) = setup(2);
    cache.put(&cf, 1, Arc::new(11u64), PAGE_SIZE).unwrap();
    cache.unpin(&cf, 1, DirtyState::Dirty(1), None).unwrap();
    cache.checkpoint(2).unwrap();
    assert_eq!(io.on_disk(1), Some(11));

    // push the now-clean page out; its eviction must not rewrite it
    for key in 2..=3u64 {
        let v = cache.get_and_pin(&cf, key).unwrap();
        assert_eq!(as_u64(&v), key * 100);
        cache.unpin(&cf, key, DirtyState::Clean, None).unwrap();
    }
    wait_until(|| {
        let s = cache.stats();
        s.size_current <= 2 && s.size_writing == 0
    });
    assert!(io
        .flushes()
        .iter()
        .any(|f| f.key == 1 && !f.write_me && !f.keep_me));
    assert_eq!(io.on_disk(1), Some(11));
}

#[test]
fn test_flush_file_drains_without_closing() {
    let (_dir, cache, cf, io) = setup(64);
    for key in 1..=3u64 {
        cache.put(&cf, key, Arc::new(key * 7), PAGE_SIZE).unwrap();
        cache.unpin(&cf, key, DirtyState::Dirty(key), None).unwrap();
    }
    cache.flush_file(&cf).unwrap();

    assert_eq!(cache.stats().n_in_table, 0);
    assert_eq!(cache.stats().n_files, 1);
    assert_eq!(io.log.lock().closes, 0);
    for key in 1..=3u64 {
        assert_eq!(io.on_disk(key), Some(key * 7));
    }

    // the file is still usable; reads fetch the written images back
    let v = cache.get_and_pin(&cf, 2).unwrap();
    assert_eq!(as_u64(&v), 14);
    cache.unpin(&cf, 2, DirtyState::Clean, None).unwrap();
}

#[test]
fn test_close_file_flushes_and_marks_clean() {
    let (_dir, cache, cf, io) = setup(64);
    let path = cf.path().to_string();
    cache.put(&cf, 1, Arc::new(10u64), PAGE_SIZE).unwrap();
    cache.unpin(&cf, 1, DirtyState::Dirty(1), None).unwrap();
    assert!(std::path::Path::new(&format!("{}.dirty", path)).exists());

    cache.close_file(cf).unwrap();
    assert_eq!(io.on_disk(1), Some(10));
    assert_eq!(io.log.lock().closes, 1);
    assert_eq!(cache.stats().n_in_table, 0);
    assert_eq!(cache.stats().n_files, 0);
    assert!(std::path::Path::new(&format!("{}.clean", path)).exists());
    assert!(!std::path::Path::new(&format!("{}.dirty", path)).exists());
}

#[test]
fn test_open_file_deduplicates_physical_files() {
    let (_dir, cache, cf, io) = setup(64);
    let path = cf.path().to_string();
    let (cf2, state) = cache
        .open_file(&path, Arc::clone(&io) as Arc<dyn CachefileIo>)
        .unwrap();
    assert!(Arc::ptr_eq(&cf, &cf2));
    assert_eq!(state, CrashState::Clean);
    assert_eq!(cache.stats().n_files, 1);

    // one close releases a reference; the file stays open
    cache.close_file(cf2).unwrap();
    assert_eq!(cache.stats().n_files, 1);
    assert_eq!(io.log.lock().closes, 0);
    cache.close_file(cf).unwrap();
    assert_eq!(cache.stats().n_files, 0);
    assert_eq!(io.log.lock().closes, 1);
}

#[test]
fn test_reopen_after_clean_close_reports_clean() {
    let (_dir, cache, cf, io) = setup(64);
    let path = cf.path().to_string();
    cache.put(&cf, 1, Arc::new(1u64), PAGE_SIZE).unwrap();
    cache.unpin(&cf, 1, DirtyState::Dirty(1), None).unwrap();
    cache.close_file(cf).unwrap();

    let (cf, state) = cache
        .open_file(&path, Arc::clone(&io) as Arc<dyn CachefileIo>)
        .unwrap();
    assert_eq!(state, CrashState::Clean);
    cache.close_file(cf).unwrap();
}

#[test]
fn test_open_unknown_file_reports_dirty() {
    let (_dir, cache, cf, io) = setup(64);
    // a backing file with no sentinel history is treated as a crash
    let stray = format!("{}.stray", cf.path());
    std::fs::write(&stray, b"data").unwrap();
    let (cf2, state) = cache
        .open_file(&stray, Arc::clone(&io) as Arc<dyn CachefileIo>)
        .unwrap();
    assert_eq!(state, CrashState::Dirty);
    cache.close_file(cf2).unwrap();
}

#[test]
fn test_cache_close_flushes_everything() {
    let (_dir, cache, cf, io) = setup(64);
    for key in 1..=4u64 {
        cache.put(&cf, key, Arc::new(key + 1), PAGE_SIZE).unwrap();
        cache
            .unpin(&cf, key, DirtyState::Dirty(key), None)
            .unwrap();
    }
    drop(cf);
    cache.close().unwrap();
    for key in 1..=4u64 {
        assert_eq!(io.on_disk(key), Some(key + 1));
    }
    assert_eq!(io.log.lock().closes, 1);
}

#[test]
fn test_stress_many_threads() {
    use rand::Rng;

    let (_dir, cache, cf, _io) = setup(8);
    let cache = Arc::new(cache);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let cache = Arc::clone(&cache);
        let cf = Arc::clone(&cf);
        handles.push(std::thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for i in 0..200u64 {
                let key = rng.gen_range(0..32u64);
                match rng.gen_range(0..10) {
                    0 => {
                        // put pins on success and on AlreadyPresent alike
                        match cache.put(&cf, key, Arc::new(key * 100), PAGE_SIZE) {
                            Ok(()) | Err(CacheError::AlreadyPresent) => {
                                cache.unpin(&cf, key, DirtyState::Dirty(i), None).unwrap();
                            }
                            Err(CacheError::Gone) => {}
                            Err(e) => panic!("put failed: {}", e),
                        }
                    }
                    1 => {
                        let _ = cache.prefetch(&cf, key);
                    }
                    2 => {
                        if let Ok(v) = cache.maybe_get_and_pin(&cf, key) {
                            assert_eq!(as_u64(&v), key * 100);
                            cache.unpin(&cf, key, DirtyState::Clean, None).unwrap();
                        }
                    }
                    3 => match cache.get_and_pin(&cf, key) {
                        Ok(v) => {
                            assert_eq!(as_u64(&v), key * 100);
                            cache.unpin_and_remove(&cf, key).unwrap();
                        }
                        Err(CacheError::Gone) => {}
                        Err(e) => panic!("get_and_pin failed: {}", e),
                    },
                    _ => match cache.get_and_pin(&cf, key) {
                        Ok(v) => {
                            assert_eq!(as_u64(&v), key * 100);
                            let dirty = if i % 3 == 0 {
                                DirtyState::Dirty(i)
                            } else {
                                DirtyState::Clean
                            };
                            cache.unpin(&cf, key, dirty, None).unwrap();
                        }
                        Err(CacheError::Gone) => {}
                        Err(e) => panic!("get_and_pin failed: {}", e),
                    },
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    cache.checkpoint(1000).unwrap();
    drop(cf);
    match Arc::try_unwrap(cache) {
        Ok(cache) => cache.close().unwrap(),
        Err(_) => panic!("cache still shared"),
    }
}
