//! Cachefile: a refcounted handle to one backing file.
//!
//! A cachefile carries the storage-layer callbacks used to fetch and flush
//! pages, the crash-marker dirty flag for its backing file, and the open
//! descriptor those callbacks do their I/O through. A single physical file
//! opened twice resolves to one cachefile with a bumped refcount; the
//! refcount tracks logical owners (open handles, retained transactional
//! references) and is unrelated to the pin counts on individual pages.

use crate::infrastructure::hash;
use crate::types::{BlockNum, CacheError, CacheResult, FileNum, Lsn, PageValue};
use crate::vfs::{FileHandle, FileId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Result of a successful page fetch
pub struct FetchedPage {
    /// The reconstructed page, now owned by the cache
    pub value: PageValue,
    /// Accounted size in bytes
    pub size: usize,
    /// LSN up to which the on-disk image was durable when read
    pub written_lsn: Lsn,
}

/// Storage-layer callbacks attached to one cachefile.
///
/// The cache invokes these with its coarse mutex released; implementations
/// may re-enter the cache for other pages from other threads, but must not
/// re-enter it for the pair they were invoked for.
pub trait CachefileIo: Send + Sync {
    /// Reconstruct the page `key` from storage
    fn fetch(&self, cf: &Cachefile, key: BlockNum, fullhash: u64) -> CacheResult<FetchedPage>;

    /// Persist or release a page image.
    ///
    /// Must write `value` to storage if `write_me`. When `keep_me` is
    /// false, `value` is the cache's last owning reference being released
    /// on eviction. `checkpoint_lsn` is the epoch in force; `needs_rename`
    /// is true when this write belongs to the current checkpoint and the
    /// on-disk location must be renamed rather than overwritten.
    fn flush(
        &self,
        cf: &Cachefile,
        key: BlockNum,
        value: PageValue,
        size: usize,
        write_me: bool,
        keep_me: bool,
        checkpoint_lsn: Lsn,
        needs_rename: bool,
    );

    /// Per-file hook run at the end of every checkpoint
    fn checkpoint(&self, _cf: &Cachefile, _checkpoint_lsn: Lsn) -> CacheResult<()> {
        Ok(())
    }

    /// Hook run when the last reference to the cachefile closes, after all
    /// of its pages have drained
    fn close(&self, _cf: &Cachefile) -> CacheResult<()> {
        Ok(())
    }
}

/// A refcounted handle to one backing file
pub struct Cachefile {
    /// Logical identifier visible to the log
    filenum: FileNum,
    /// Physical identity, used to deduplicate re-opens
    fileid: FileId,
    /// Path of the backing file (also names the crash-marker sentinels)
    path: String,
    /// Open descriptor. Fetch/flush I/O against one cachefile serializes
    /// on this mutex; the Option empties at close.
    handle: Mutex<Option<Box<dyn FileHandle>>>,
    /// Storage-layer callbacks
    io: Arc<dyn CachefileIo>,
    /// One count per logical owner; mutated only under the cache mutex
    refcount: AtomicU32,
    /// Mirrors the crash-marker sentinel state for this session
    is_dirty: AtomicBool,
}

impl Cachefile {
    pub(crate) fn new(
        filenum: FileNum,
        fileid: FileId,
        path: String,
        handle: Box<dyn FileHandle>,
        io: Arc<dyn CachefileIo>,
        already_dirty: bool,
    ) -> Self {
        Cachefile {
            filenum,
            fileid,
            path,
            handle: Mutex::new(Some(handle)),
            io,
            refcount: AtomicU32::new(1),
            is_dirty: AtomicBool::new(already_dirty),
        }
    }

    /// Logical file number
    #[inline]
    pub fn filenum(&self) -> FileNum {
        self.filenum
    }

    /// Physical file identity
    #[inline]
    pub fn fileid(&self) -> FileId {
        self.fileid
    }

    /// Path of the backing file
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Precomputed hash of `(this file, key)` for the pair table
    #[inline]
    pub fn fullhash(&self, key: BlockNum) -> u64 {
        hash::fullhash(self.filenum, key)
    }

    /// True if this file has been dirtied since it was opened
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Relaxed)
    }

    pub(crate) fn io(&self) -> Arc<dyn CachefileIo> {
        Arc::clone(&self.io)
    }

    pub(crate) fn refup(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn refdown(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "cachefile refcount underflow");
        prev - 1
    }

    pub(crate) fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    /// Flips the session dirty flag; returns true if this call made the
    /// clean-to-dirty transition (and the sentinel must be renamed)
    pub(crate) fn mark_dirtied(&self) -> bool {
        !self.is_dirty.swap(true, Ordering::Relaxed)
    }

    /// Empties the descriptor slot at close
    pub(crate) fn take_handle(&self) -> Option<Box<dyn FileHandle>> {
        self.handle.lock().take()
    }

    /// Positioned read through the file's descriptor
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> CacheResult<usize> {
        let guard = self.handle.lock();
        match guard.as_ref() {
            Some(h) => Ok(h.pread(buf, offset)?),
            None => Err(CacheError::Gone),
        }
    }

    /// Positioned write through the file's descriptor
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> CacheResult<usize> {
        let guard = self.handle.lock();
        match guard.as_ref() {
            Some(h) => Ok(h.pwrite(buf, offset)?),
            None => Err(CacheError::Gone),
        }
    }

    /// Flushes the descriptor to stable storage
    pub fn sync(&self) -> CacheResult<()> {
        let guard = self.handle.lock();
        match guard.as_ref() {
            Some(h) => Ok(h.sync()?),
            None => Err(CacheError::Gone),
        }
    }
}
