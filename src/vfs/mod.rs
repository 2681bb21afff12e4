//! Virtual File System boundary
//!
//! The cache touches the disk in exactly two places: through per-cachefile
//! descriptors (page fetch/flush I/O issued by client callbacks) and through
//! the crash-marker sentinel files. Both go through this trait so tests can
//! substitute an in-memory implementation.

pub mod error;
pub mod interface;
pub mod local_fs;

pub use error::{VfsError, VfsResult};
pub use interface::{FileHandle, FileId, VfsInterface};
pub use local_fs::LocalFs;
