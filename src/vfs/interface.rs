//! VFS interface definitions

use crate::vfs::error::VfsResult;

/// Unique identity of a physical file: device and inode numbers (or the
/// platform equivalent). Used to deduplicate re-opens of the same file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    /// Device number
    pub device: u64,
    /// Inode number
    pub inode: u64,
}

/// File handle trait for VFS operations
/// This trait represents a handle to an open file and provides methods for
/// positioned reads and writes
pub trait FileHandle: Send + Sync {
    /// Read from the file at a specific offset
    fn pread(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize>;

    /// Write to the file at a specific offset
    fn pwrite(&self, buf: &[u8], offset: u64) -> VfsResult<usize>;

    /// Resize the file to the specified length
    fn truncate(&self, length: u64) -> VfsResult<()>;

    /// Flush file contents to stable storage
    fn sync(&self) -> VfsResult<()>;

    /// Return the unique identity of the underlying file
    fn file_id(&self) -> VfsResult<FileId>;

    /// Close the file handle
    fn close(self: Box<Self>) -> VfsResult<()>;
}

/// VFS interface trait
/// This trait defines the interface for all VFS implementations
pub trait VfsInterface: Send + Sync {
    /// Create a new directory
    fn create_dir(&self, path: &str) -> VfsResult<()>;

    /// Remove an existing directory
    fn remove_dir(&self, path: &str) -> VfsResult<()>;

    /// Create a new file and return a handle to it
    fn create_file(&self, path: &str) -> VfsResult<Box<dyn FileHandle>>;

    /// Open an existing file and return a handle to it
    fn open_file(&self, path: &str) -> VfsResult<Box<dyn FileHandle>>;

    /// Remove an existing file
    fn remove_file(&self, path: &str) -> VfsResult<()>;

    /// Rename a file, replacing any existing target
    fn rename(&self, from: &str, to: &str) -> VfsResult<()>;

    /// Return true if the path exists
    fn exists(&self, path: &str) -> bool;

    /// Return the unique identity of the file at `path`
    fn file_id(&self, path: &str) -> VfsResult<FileId>;

    /// Append a buffer to the end of a file, creating it if absent
    fn append(&self, path: &str, buf: &[u8]) -> VfsResult<usize>;

    /// Read from a file at a specific offset
    fn pread(&self, path: &str, buf: &mut [u8], offset: u64) -> VfsResult<usize>;

    /// Write to a file at a specific offset
    fn pwrite(&self, path: &str, buf: &[u8], offset: u64) -> VfsResult<usize>;
}
