//! The compressing filesystem: metadata tree, decompression cache, and the FUSE bridge.
/// Per-file decompression cache lifecycle.
pub mod cache;
pub mod error;
/// Open file handle bookkeeping.
pub mod file_table;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`session::CompressFs`].
pub mod fuser;
/// Map from inode address to tree slot.
pub mod index;
pub mod inode_factory;
pub mod session;
/// In-memory mirror of the backing directory layout.
pub mod tree;

pub use error::FsError;
pub use session::{CompressFs, Lookup, MountError, MountOptions, OpenPolicy};

use std::ffi::OsString;
use std::time::SystemTime;

use bitflags::bitflags;

/// Type representing an inode identifier.
pub type InodeAddr = u64;

/// Type representing a file handle.
pub type FileHandle = u64;

/// The inode address of the mount root.
pub const ROOT_INO: InodeAddr = 1;

/// Suffix appended to a backing file name to form its decompressed shadow.
pub const SHADOW_SUFFIX: &str = ".compressfs.raw";

/// Suffix of the sibling a write-back is staged in before it replaces the backing file.
pub const PENDING_SUFFIX: &str = ".compressfs.new";

/// Name of the file in the backing root that records the codec in use.
pub const CODEC_MARKER: &str = ".compressfs-codec";

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;
    }
}

impl OpenFlags {
    /// Whether these flags grant write access.
    #[must_use]
    pub fn is_writable(self) -> bool {
        (self.bits() & libc::O_ACCMODE) != libc::O_RDONLY
    }
}

/// The type of an inode entry in the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum INodeType {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}

/// Attributes reported for an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct INode {
    /// The address of this inode, which serves as its unique identifier.
    pub addr: InodeAddr,
    /// Permission bits.
    pub perm: u16,
    /// The user ID of the owner of this inode.
    pub uid: u32,
    /// The group ID of the owner of this inode.
    pub gid: u32,
    /// Last modification time of the backing entry.
    pub last_modified_at: SystemTime,
    /// Uncompressed size in bytes. Zero for directories.
    pub size: u64,
    /// Whether this is a file or a directory.
    pub itype: INodeType,
}

impl INode {
    /// Mode bits for files.
    pub const FILE_PERM: u16 = 0o644;
    /// Mode bits for directories.
    pub const DIR_PERM: u16 = 0o755;
}

/// A directory entry yielded by [`CompressFs::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode of the child.
    pub ino: InodeAddr,
    /// Whether the child is a file or a directory.
    pub itype: INodeType,
    /// The name of this entry within its parent directory.
    pub name: OsString,
}

/// Filesystem statistics returned by [`CompressFs::statfs`].
///
/// Block-related sizes are in units of `block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    /// Filesystem block size (bytes).
    pub block_size: u32,
    /// Fragment size (bytes).
    pub fragment_size: u32,
    /// Total number of data blocks.
    pub total_blocks: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Number of blocks available to unprivileged users.
    pub available_blocks: u64,
    /// Total number of file nodes.
    pub total_inodes: u64,
    /// Number of free file nodes.
    pub free_inodes: u64,
    /// Maximum filename length (bytes).
    pub max_filename_length: u32,
}
