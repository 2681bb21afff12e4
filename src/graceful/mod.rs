//! Crash-marker ("graceful") subsystem
//!
//! For a backing file `F`, two sentinel files `F.clean` and `F.dirty` record
//! the last known shutdown state. Opens inspect the sentinels to detect an
//! unclean prior shutdown, the first write after a clean open flips
//! `.clean` to `.dirty`, and a clean close flips it back. Every transition
//! appends one forensic breadcrumb line to the target sentinel; the cache
//! never parses the lines back.
//!
//! All transitions serialize on the registry's own mutex, which is owned by
//! the cache instance rather than being process-global state.

use crate::vfs::{VfsInterface, VfsResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Shutdown state of a backing file as reported by a graceful open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashState {
    /// The previous session shut down cleanly
    Clean,
    /// The previous session did not shut down cleanly; the caller should
    /// warn and expect recovery work
    Dirty,
    /// The backing file was freshly created; there is no previous session
    Created,
}

impl fmt::Display for CrashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrashState::Clean => write!(f, "clean"),
            CrashState::Dirty => write!(f, "dirty"),
            CrashState::Created => write!(f, "created"),
        }
    }
}

/// Sentinel-file registry for one cache instance
pub struct CrashMarkers {
    vfs: Arc<dyn VfsInterface>,
    lock: Mutex<()>,
}

fn clean_path(path: &str) -> String {
    format!("{}.clean", path)
}

fn dirty_path(path: &str) -> String {
    format!("{}.dirty", path)
}

impl CrashMarkers {
    /// Creates a marker registry over the given VFS
    pub fn new(vfs: Arc<dyn VfsInterface>) -> Self {
        CrashMarkers {
            vfs,
            lock: Mutex::new(()),
        }
    }

    /// Appends one breadcrumb line to a sentinel file.
    ///
    /// Line format: operation, prior state, new state, pid, tid, unix
    /// timestamp in seconds. Creates the sentinel if it does not exist.
    fn note(&self, sentinel: &str, op: &str, prior: &str, new: &str) -> VfsResult<()> {
        let pid = unsafe { libc::getpid() };
        let tid = std::thread::current().id();
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let line = format!("{} {} {} pid={} tid={:?} ts={}\n", op, prior, new, pid, tid, ts);
        self.vfs.append(sentinel, line.as_bytes())?;
        Ok(())
    }

    /// Graceful-open check for `path`.
    ///
    /// Rules: only `.dirty` (or neither sentinel) means the previous
    /// shutdown was unclean; only `.clean` means it was clean; if both
    /// exist, `.clean` is discarded in favor of `.dirty`. A freshly created
    /// backing file reports `Created` and draws no warning.
    pub fn open(&self, path: &str, created: bool) -> VfsResult<CrashState> {
        let _guard = self.lock.lock();
        let clean = clean_path(path);
        let dirty = dirty_path(path);

        match (self.vfs.exists(&clean), self.vfs.exists(&dirty)) {
            (true, true) => {
                // Conflicting sentinels: trust the dirty one
                self.vfs.remove_file(&clean)?;
                self.note(&dirty, "open", "conflicted", "dirty")?;
                Ok(CrashState::Dirty)
            }
            (false, true) => {
                self.note(&dirty, "open", "dirty", "dirty")?;
                Ok(CrashState::Dirty)
            }
            (true, false) => {
                self.note(&clean, "open", "clean", "clean")?;
                Ok(CrashState::Clean)
            }
            (false, false) => {
                if created {
                    Ok(CrashState::Created)
                } else {
                    // Existing file with no sentinel history: assume the
                    // worst and leave a dirty sentinel behind
                    self.note(&dirty, "open", "unknown", "dirty")?;
                    Ok(CrashState::Dirty)
                }
            }
        }
    }

    /// Graceful-dirty transition, run on the first write after a clean
    /// open: rename `.clean` to `.dirty`, or create `.dirty`.
    pub fn mark_dirty(&self, path: &str) -> VfsResult<()> {
        let _guard = self.lock.lock();
        let clean = clean_path(path);
        let dirty = dirty_path(path);

        if self.vfs.exists(&clean) {
            self.vfs.rename(&clean, &dirty)?;
            self.note(&dirty, "dirty", "clean", "dirty")?;
        } else if !self.vfs.exists(&dirty) {
            self.note(&dirty, "dirty", "none", "dirty")?;
        }
        Ok(())
    }

    /// Graceful-close transition, run on clean shutdown: rename `.dirty` to
    /// `.clean`, or drop a stale `.clean` if no `.dirty` exists.
    pub fn close_clean(&self, path: &str) -> VfsResult<()> {
        let _guard = self.lock.lock();
        let clean = clean_path(path);
        let dirty = dirty_path(path);

        if self.vfs.exists(&dirty) {
            self.vfs.rename(&dirty, &clean)?;
            self.note(&clean, "close", "dirty", "clean")?;
        } else if self.vfs.exists(&clean) {
            self.vfs.remove_file(&clean)?;
        }
        Ok(())
    }
}
