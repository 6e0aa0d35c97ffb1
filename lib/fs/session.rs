//! A mounted compressing filesystem.
//!
//! [`CompressFs`] owns the metadata tree, the inode allocator, the open handle table and the
//! codec, and exposes one method per filesystem call. Methods block; callers on an async runtime
//! should dispatch them to a blocking pool.
//!
//! Locking: a file's cache lock may be held while taking the tree lock, never the other way
//! around. The tree lock is only held across path-based syscalls, never across codec work.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use nix::sys::statvfs::statvfs;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::cache::{BackingStore, FileCache};
use super::file_table::{FileTable, OpenHandle};
use super::inode_factory::InodeFactory;
use super::tree::{Tree, pending_path, shadow_path};
use super::{
    CODEC_MARKER, DirEntry, FileHandle, FsError, FsStats, INode, INodeType, InodeAddr, OpenFlags,
    ROOT_INO,
};
use crate::codec::{Codec, UnknownCodec};

pub use super::cache::OpenPolicy;

/// Failures that prevent a backing directory from being mounted.
#[derive(Debug, Error)]
pub enum MountError {
    /// The backing path exists but is not a directory.
    #[error("backing path '{0}' is not a directory")]
    NotADirectory(PathBuf),

    /// The backing directory records a different codec than the one requested.
    #[error("backing directory was populated with codec '{found}', refusing to mount with '{requested}'")]
    CodecMismatch {
        /// Codec passed to the mount.
        requested: Codec,
        /// Codec recorded in the marker file.
        found: Codec,
    },

    /// The marker file does not name a known codec.
    #[error("codec marker is unreadable: {0}")]
    BadMarker(#[from] UnknownCodec),

    /// Reading the backing directory failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// An entry found by [`CompressFs::lookup`].
#[derive(Debug, Clone, Copy)]
pub struct Lookup {
    /// Attributes of the entry.
    pub inode: INode,
    /// False when the file's size could not be decoded. Such attributes must not be cached.
    pub attr_valid: bool,
}

/// Tunables of a mounted session.
#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    /// Codec every backing file is stored with.
    pub codec: Codec,
    /// How concurrent opens of one file are arbitrated.
    pub open_policy: OpenPolicy,
}

impl MountOptions {
    /// Options for `codec` with the default open policy.
    #[must_use]
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            open_policy: OpenPolicy::default(),
        }
    }
}

/// Ensure the backing root records `codec`, writing the marker on first use.
fn check_codec_marker(root: &Path, codec: Codec) -> Result<(), MountError> {
    let marker = root.join(CODEC_MARKER);
    match fs::read_to_string(&marker) {
        Ok(content) => {
            let found: Codec = content.parse()?;
            if found != codec {
                return Err(MountError::CodecMismatch {
                    requested: codec,
                    found,
                });
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(codec = %codec, "recording codec for backing directory");
            fs::write(&marker, format!("{codec}\n"))?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// The compressing filesystem session.
pub struct CompressFs {
    options: MountOptions,
    tree: RwLock<Tree>,
    inodes: InodeFactory,
    handles: FileTable,
    uid: u32,
    gid: u32,
}

impl CompressFs {
    /// Scan `root` and build a session serving it through `options.codec`.
    pub fn mount(root: impl Into<PathBuf>, options: MountOptions) -> Result<Self, MountError> {
        let root = root.into();
        if !fs::metadata(&root)?.is_dir() {
            return Err(MountError::NotADirectory(root));
        }
        let root = root.canonicalize()?;
        check_codec_marker(&root, options.codec)?;

        let inodes = InodeFactory::new(ROOT_INO + 1);
        let tree = Tree::scan(&root, &inodes)?;
        info!(root = %root.display(), entries = tree.len(), codec = %options.codec, "mounted backing directory");

        Ok(Self {
            options,
            tree: RwLock::new(tree),
            inodes,
            handles: FileTable::new(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        })
    }

    /// Codec the backing files are stored with.
    #[must_use]
    pub fn codec(&self) -> Codec {
        self.options.codec
    }

    /// How concurrent opens are arbitrated.
    #[must_use]
    pub fn open_policy(&self) -> OpenPolicy {
        self.options.open_policy
    }

    /// Number of handles currently open.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn file_cache(&self, ino: InodeAddr) -> Result<Arc<FileCache>, FsError> {
        let tree = self.tree.read();
        let id = tree.resolve(ino)?;
        tree.get(id).file().cloned().ok_or(FsError::IsADirectory)
    }

    fn handle(&self, fh: FileHandle) -> Result<OpenHandle, FsError> {
        self.handles.get(fh).ok_or(FsError::BadHandle)
    }

    fn remove_companion(
        &self,
        ino: InodeAddr,
        companion: fn(&Path) -> PathBuf,
    ) -> Result<(), FsError> {
        let tree = self.tree.read();
        let path = match tree.path_of_ino(ino) {
            Ok(path) => companion(&path),
            // Removal already deleted the companions.
            Err(FsError::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn make_inode(&self, ino: InodeAddr, itype: INodeType, size: u64, mtime: SystemTime) -> INode {
        INode {
            addr: ino,
            perm: match itype {
                INodeType::File => INode::FILE_PERM,
                INodeType::Directory => INode::DIR_PERM,
            },
            uid: self.uid,
            gid: self.gid,
            last_modified_at: mtime,
            size,
            itype,
        }
    }

    /// Attributes of the entry with inode `ino`.
    pub fn getattr(&self, ino: InodeAddr) -> Result<INode, FsError> {
        let (itype, cache, backing_mtime) = {
            let tree = self.tree.read();
            let id = tree.resolve(ino)?;
            let entry = tree.get(id);
            let mtime = fs::metadata(tree.path_of(id))
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (entry.itype(), entry.file().cloned(), mtime)
        };

        let Some(cache) = cache else {
            return Ok(self.make_inode(ino, itype, 0, backing_mtime));
        };
        let (size, shadow_mtime) = cache.stat(self, self.options.codec)?;
        Ok(self.make_inode(ino, itype, size, shadow_mtime.unwrap_or(backing_mtime)))
    }

    /// Find `name` in the directory `parent`.
    ///
    /// An existing entry is always found, even when its content cannot be decoded. Such a file is
    /// reported with size zero and [`Lookup::attr_valid`] unset; [`Self::getattr`] and
    /// [`Self::open`] surface the codec error.
    #[instrument(name = "CompressFs::lookup", skip(self))]
    pub fn lookup(&self, parent: InodeAddr, name: &OsStr) -> Result<Lookup, FsError> {
        let (ino, itype) = {
            let tree = self.tree.read();
            let dir = tree.resolve(parent)?;
            let entry = tree.get(tree.lookup(dir, name)?);
            (entry.ino, entry.itype())
        };
        match self.getattr(ino) {
            Ok(inode) => Ok(Lookup {
                inode,
                attr_valid: true,
            }),
            Err(FsError::Codec(e)) => {
                warn!(ino, error = %e, "backing file cannot be decoded");
                Ok(Lookup {
                    inode: self.make_inode(ino, itype, 0, SystemTime::UNIX_EPOCH),
                    attr_valid: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Children of the directory `ino`, files first, then directories, each in name order.
    pub fn readdir(&self, ino: InodeAddr) -> Result<Vec<DirEntry>, FsError> {
        let tree = self.tree.read();
        let dir = tree.resolve(ino)?;
        tree.list(dir)
    }

    /// Create an empty file and open it for writing.
    #[instrument(name = "CompressFs::create", skip(self))]
    pub fn create(&self, parent: InodeAddr, name: &OsStr) -> Result<(INode, FileHandle), FsError> {
        let (id, cache) = {
            let mut tree = self.tree.write();
            let dir = tree.resolve(parent)?;
            tree.create(dir, name, &self.inodes)?
        };
        let ino = cache.ino();
        debug!(ino, slot = id, "created file");

        let fh = self.handles.insert(OpenHandle {
            ino,
            cache,
            writable: true,
        });
        Ok((self.make_inode(ino, INodeType::File, 0, SystemTime::now()), fh))
    }

    /// Create a directory.
    #[instrument(name = "CompressFs::mkdir", skip(self))]
    pub fn mkdir(&self, parent: InodeAddr, name: &OsStr, mode: u32) -> Result<INode, FsError> {
        let ino = {
            let mut tree = self.tree.write();
            let dir = tree.resolve(parent)?;
            let id = tree.mkdir(dir, name, mode, &self.inodes)?;
            tree.get(id).ino
        };
        self.getattr(ino)
    }

    /// Remove a file.
    #[instrument(name = "CompressFs::unlink", skip(self))]
    pub fn unlink(&self, parent: InodeAddr, name: &OsStr) -> Result<(), FsError> {
        let mut tree = self.tree.write();
        let dir = tree.resolve(parent)?;
        tree.remove(dir, name, false)
    }

    /// Remove an empty directory.
    #[instrument(name = "CompressFs::rmdir", skip(self))]
    pub fn rmdir(&self, parent: InodeAddr, name: &OsStr) -> Result<(), FsError> {
        let mut tree = self.tree.write();
        let dir = tree.resolve(parent)?;
        tree.remove(dir, name, true)
    }

    /// Move `name` in `parent` to `new_name` in `new_parent`.
    #[instrument(name = "CompressFs::rename", skip(self))]
    pub fn rename(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        new_parent: InodeAddr,
        new_name: &OsStr,
    ) -> Result<(), FsError> {
        let mut tree = self.tree.write();
        let src = tree.resolve(parent)?;
        let dst = tree.resolve(new_parent)?;
        tree.rename(src, name, dst, new_name)
    }

    /// Open the file `ino`.
    ///
    /// Under [`OpenPolicy::Exclusive`] this blocks until every previous holder of the file has
    /// released it.
    #[instrument(name = "CompressFs::open", skip(self))]
    pub fn open(&self, ino: InodeAddr, flags: OpenFlags) -> Result<FileHandle, FsError> {
        let cache = self.file_cache(ino)?;
        let writable = flags.is_writable();
        let truncate = writable && flags.contains(OpenFlags::TRUNC);
        cache.open(self, self.options.codec, self.options.open_policy, truncate)?;

        let fh = self.handles.insert(OpenHandle {
            ino,
            cache,
            writable,
        });
        debug!(handle = fh, writable, "opened");
        Ok(fh)
    }

    /// Read up to `size` bytes at `offset` through `fh`.
    pub fn read(&self, fh: FileHandle, offset: u64, size: u32) -> Result<Bytes, FsError> {
        self.handle(fh)?.cache.read(offset, size)
    }

    /// Write `data` at `offset` through `fh`.
    pub fn write(&self, fh: FileHandle, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let handle = self.handle(fh)?;
        if !handle.writable {
            return Err(FsError::PermissionDenied);
        }
        handle.cache.write(offset, data)
    }

    /// Resize the file `ino`, through `fh` when one is given.
    #[instrument(name = "CompressFs::truncate", skip(self))]
    pub fn truncate(&self, ino: InodeAddr, fh: Option<FileHandle>, size: u64) -> Result<INode, FsError> {
        match fh.map(|fh| self.handle(fh)).transpose()? {
            Some(handle) => handle.cache.truncate(size)?,
            None => self
                .file_cache(ino)?
                .truncate_any(self, self.options.codec, size)?,
        }
        self.getattr(ino)
    }

    /// Flush the handle's shadow to disk. The backing file is only written on release.
    pub fn flush(&self, fh: FileHandle) -> Result<(), FsError> {
        self.handle(fh)?.cache.sync()
    }

    /// Same as [`Self::flush`].
    pub fn fsync(&self, fh: FileHandle) -> Result<(), FsError> {
        self.flush(fh)
    }

    /// Close `fh`. The last release of a file writes modified content back to its backing file.
    #[instrument(name = "CompressFs::release", skip(self))]
    pub fn release(&self, fh: FileHandle) -> Result<(), FsError> {
        let handle = self.handles.remove(fh).ok_or(FsError::BadHandle)?;
        handle.cache.release(self, self.options.codec)
    }

    /// Statistics of the filesystem holding the backing directory.
    pub fn statfs(&self) -> Result<FsStats, FsError> {
        let (root, inodes) = {
            let tree = self.tree.read();
            (tree.root().to_path_buf(), tree.len() as u64)
        };
        let stat = statvfs(root.as_path()).map_err(io::Error::from)?;
        let to_u32 = |v: u64| {
            u32::try_from(v).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "value too large to fit into u32")
            })
        };

        #[allow(clippy::useless_conversion, reason = "statvfs field widths vary by platform")]
        let stats = FsStats {
            block_size: to_u32(u64::from(stat.block_size()))?,
            fragment_size: to_u32(u64::from(stat.fragment_size()))?,
            total_blocks: u64::from(stat.blocks()),
            free_blocks: u64::from(stat.blocks_free()),
            available_blocks: u64::from(stat.blocks_available()),
            total_inodes: inodes,
            free_inodes: u64::from(stat.files_free()),
            max_filename_length: to_u32(u64::from(stat.name_max()))?,
        };
        Ok(stats)
    }

    /// Release every handle still open and write back retained shadows.
    ///
    /// Called when the filesystem is unmounted so no modification is lost.
    pub fn shutdown(&self) {
        for handle in self.handles.drain() {
            if let Err(e) = handle.cache.release(self, self.options.codec) {
                warn!(ino = handle.ino, error = %e, "failed to write back file on shutdown");
            }
        }

        let caches = self.tree.read().file_caches();
        for cache in caches {
            if let Err(e) = cache.settle(self, self.options.codec) {
                warn!(ino = cache.ino(), error = %e, "failed to write back retained shadow");
            }
        }
        debug!("all files written back");
    }
}

impl BackingStore for CompressFs {
    fn open_source(&self, ino: InodeAddr) -> Result<File, FsError> {
        let tree = self.tree.read();
        Ok(File::open(tree.path_of_ino(ino)?)?)
    }

    fn create_shadow(&self, ino: InodeAddr) -> Result<File, FsError> {
        let tree = self.tree.read();
        let path = shadow_path(&tree.path_of_ino(ino)?);
        Ok(File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?)
    }

    fn remove_shadow(&self, ino: InodeAddr) -> Result<(), FsError> {
        self.remove_companion(ino, shadow_path)
    }

    fn create_pending(&self, ino: InodeAddr) -> Result<File, FsError> {
        let tree = self.tree.read();
        let path = tree.path_of_ino(ino)?;
        let pending = File::options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(pending_path(&path))?;
        if let Ok(meta) = fs::metadata(&path) {
            pending.set_permissions(meta.permissions())?;
        }
        Ok(pending)
    }

    fn commit_pending(&self, ino: InodeAddr) -> Result<(), FsError> {
        let tree = self.tree.read();
        let path = tree.path_of_ino(ino)?;
        Ok(fs::rename(pending_path(&path), path)?)
    }

    fn remove_pending(&self, ino: InodeAddr) -> Result<(), FsError> {
        self.remove_companion(ino, pending_path)
    }
}

impl Drop for CompressFs {
    fn drop(&mut self) {
        self.shutdown();
    }
}
