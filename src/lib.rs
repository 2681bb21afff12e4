//! Cachestore concurrent page cache library

// Global type definitions
pub mod types;

// Import various modules
pub mod cachefile;
pub mod cachetable;
pub mod graceful;
pub mod infrastructure;
pub mod pairtable;
pub mod vfs;

// Re-export the cache entry points for easier access
pub use cachefile::{Cachefile, CachefileIo, FetchedPage};
pub use cachetable::{CacheStats, CacheTable};
pub use graceful::CrashState;
pub use types::{CacheError, CacheResult, CacheTableConfig, DirtyState, PageValue};

// Re-export vfs items for easier access
pub use vfs::VfsError;
pub use vfs::VfsInterface;
