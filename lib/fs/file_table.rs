use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use scc::HashMap as ConcurrentHashMap;

use super::cache::FileCache;
use super::{FileHandle, InodeAddr};

/// One successful open of a file.
#[derive(Debug, Clone)]
pub struct OpenHandle {
    /// Inode the handle was opened on.
    pub ino: InodeAddr,
    /// Cache state shared by every handle of the file.
    pub cache: Arc<FileCache>,
    /// Whether the open granted write access.
    pub writable: bool,
}

/// Monotonically increasing file handle allocator plus the set of open handles.
#[must_use]
pub struct FileTable {
    next_fh: AtomicU64,
    open: ConcurrentHashMap<FileHandle, OpenHandle>,
}

impl FileTable {
    /// An empty table. Handle numbers start at 1.
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            open: ConcurrentHashMap::new(),
        }
    }

    /// Register `handle` under a fresh handle number.
    pub fn insert(&self, handle: OpenHandle) -> FileHandle {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        // Handle numbers are never reused, so the slot is always vacant.
        _ = self.open.insert(fh, handle);
        fh
    }

    /// The handle registered under `fh`.
    #[must_use]
    pub fn get(&self, fh: FileHandle) -> Option<OpenHandle> {
        self.open.read(&fh, |_, h| h.clone())
    }

    /// Unregister `fh`.
    pub fn remove(&self, fh: FileHandle) -> Option<OpenHandle> {
        self.open.remove(&fh).map(|(_, h)| h)
    }

    /// Remove and return every open handle.
    pub fn drain(&self) -> Vec<OpenHandle> {
        let mut handles = Vec::new();
        self.open.retain(|_, h| {
            handles.push(h.clone());
            false
        });
        handles
    }

    /// Number of open handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.open.len()
    }

    /// Whether no handle is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}
