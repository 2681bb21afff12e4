use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::vfs::VfsError;

/// Global type definitions
///
/// Stores type aliases, constants, configuration, and the error type used
/// globally by the page cache.
/// Logical file number, assigned per open cachefile and visible to the log
pub type FileNum = u64;

/// Block number identifying one page within a backing file
pub type BlockNum = u64;

/// Log sequence number, used only as an opaque ordering token for
/// checkpoint epochs
pub type Lsn = u64;

/// LSN value meaning "never written / never modified"
pub const ZERO_LSN: Lsn = 0;

/// Opaque page handle owned by the cache once inserted.
///
/// The cache never interprets the contents; clients downcast back to their
/// concrete page type. The last owning reference is released through the
/// flush callback with `keep_me == false`.
pub type PageValue = Arc<dyn Any + Send + Sync>;

/// Minimum number of hash buckets in the pair table
pub const MIN_BUCKETS: usize = 4;

/// Dirty state handed to `unpin`
///
/// A dirtied page carries the LSN of the logical modification so the
/// checkpoint coordinator can decide which epoch the page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// Page was not modified while pinned
    Clean,
    /// Page was modified; the LSN marks the log position of the change
    Dirty(Lsn),
}

/// Page cache error type
#[derive(Debug)]
pub enum CacheError {
    /// `put` against a key that is already cached
    AlreadyPresent,
    /// Operation against a key that is not cached
    NotFound,
    /// The pair was invalidated by a concurrent failed fetch while this
    /// caller was blocked acquiring its lock
    Gone,
    /// The work queue was closed while a caller was blocked on it
    Canceled,
    /// I/O operation error
    IoError(std::io::Error),
    /// VFS layer error
    VfsError(VfsError),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::AlreadyPresent => write!(f, "Key already present in cache"),
            CacheError::NotFound => write!(f, "Key not found in cache"),
            CacheError::Gone => write!(f, "Pair was invalidated while waiting"),
            CacheError::Canceled => write!(f, "Work queue closed"),
            CacheError::IoError(err) => write!(f, "I/O error: {}", err),
            CacheError::VfsError(err) => write!(f, "VFS error: {}", err),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::IoError(err) => Some(err),
            CacheError::VfsError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::IoError(err)
    }
}

impl From<VfsError> for CacheError {
    fn from(err: VfsError) -> Self {
        CacheError::VfsError(err)
    }
}

/// Page cache result type
pub type CacheResult<T> = Result<T, CacheError>;

/// Page cache configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheTableConfig {
    /// Soft limit on the total bytes of cached pages
    pub size_limit: usize,
    /// Worker threads started per logical CPU
    pub workers_per_core: usize,
    /// Directory containing backing files and crash-marker sentinels
    pub data_dir: String,
}

impl Default for CacheTableConfig {
    fn default() -> Self {
        Self {
            size_limit: 128 * 1024 * 1024, // 128MB
            workers_per_core: 2,
            data_dir: String::from("./data"),
        }
    }
}

impl CacheTableConfig {
    /// Parses a configuration from a JSON string
    pub fn from_json_str(s: &str) -> CacheResult<Self> {
        serde_json::from_str(s).map_err(|e| {
            CacheError::IoError(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    /// Loads a configuration from a JSON file
    pub fn from_json_file(path: &str) -> CacheResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
