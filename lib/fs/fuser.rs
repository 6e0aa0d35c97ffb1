//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`CompressFs`].
//!
//! Every request runs on the tokio blocking pool, so an `open` waiting for another holder never
//! stalls the session loop.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Span, debug, error, instrument};

use super::{CompressFs, FsError, INode, INodeType, OpenFlags};

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyWrite,
    fuser::ReplyEmpty,
    fuser::ReplyCreate,
    fuser::ReplyStatfs,
);

/// Extension trait on `Result<T, FsError>` for FUSE reply handling.
///
/// Centralizes the error-logging + errno-reply path so each FUSE callback
/// only has to express its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, FsError> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(FsError::BackingIo(e)) => {
                error!(error = %e, "backing store failure");
                reply.error(FsError::BackingIo(e).errno());
            }
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.errno());
            }
        }
    }
}

/// Convert an `INode` to the fuser-specific `FileAttr`.
fn inode_to_fuser_attr(inode: &INode, block_size: u32) -> fuser::FileAttr {
    fuser::FileAttr {
        ino: inode.addr,
        size: inode.size,
        blocks: inode.size.div_ceil(512),
        atime: inode.last_modified_at,
        mtime: inode.last_modified_at,
        ctime: inode.last_modified_at,
        crtime: inode.last_modified_at,
        kind: inode_type_to_fuser(inode.itype),
        perm: inode.perm,
        nlink: match inode.itype {
            INodeType::File => 1,
            INodeType::Directory => 2,
        },
        uid: inode.uid,
        gid: inode.gid,
        rdev: 0,
        blksize: block_size,
        flags: 0,
    }
}

fn inode_type_to_fuser(itype: INodeType) -> fuser::FileType {
    match itype {
        INodeType::Directory => fuser::FileType::Directory,
        INodeType::File => fuser::FileType::RegularFile,
    }
}

const BLOCK_SIZE: u32 = 4096;

/// Bridges a [`CompressFs`] session to the [`fuser::Filesystem`] trait.
pub struct FuserAdapter {
    fs: Arc<CompressFs>,
    runtime: tokio::runtime::Handle,
    ttl: Duration,
}

impl FuserAdapter {
    /// Attribute and entry TTL used unless configured otherwise.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

    /// Serve `fs`, running each request on `runtime`'s blocking pool.
    pub fn new(fs: Arc<CompressFs>, runtime: tokio::runtime::Handle) -> Self {
        Self {
            fs,
            runtime,
            ttl: Self::DEFAULT_TTL,
        }
    }

    /// Cache entries and attributes in the kernel for `ttl`.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Run `op` against the session on the blocking pool, inside the caller's span.
    fn dispatch(&self, op: impl FnOnce(&CompressFs, Duration) + Send + 'static) {
        let fs = Arc::clone(&self.fs);
        let ttl = self.ttl;
        let span = Span::current();
        drop(self.runtime.spawn_blocking(move || span.in_scope(|| op(&fs, ttl))));
    }
}

impl fuser::Filesystem for FuserAdapter {
    fn init(
        &mut self,
        _req: &fuser::Request<'_>,
        config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        // Let O_TRUNC reach `open` instead of arriving as a separate setattr.
        if let Err(unsupported) = config.add_capabilities(fuser::consts::FUSE_ATOMIC_O_TRUNC) {
            debug!(unsupported, "kernel lacks atomic O_TRUNC support");
        }
        Ok(())
    }

    #[instrument(name = "FuserAdapter::destroy", skip(self))]
    fn destroy(&mut self) {
        self.fs.shutdown();
    }

    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let name = name.to_os_string();
        self.dispatch(move |fs, ttl| {
            fs.lookup(parent, &name).fuse_reply(reply, |found, reply| {
                let f_attr = inode_to_fuser_attr(&found.inode, BLOCK_SIZE);
                let attr_ttl = if found.attr_valid { ttl } else { Duration::ZERO };
                debug!(?f_attr, "replying...");
                reply.entry(&attr_ttl, &f_attr, 0);
            });
        });
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        self.dispatch(move |fs, ttl| {
            fs.getattr(ino).fuse_reply(reply, |inode, reply| {
                let attr = inode_to_fuser_attr(&inode, BLOCK_SIZE);
                debug!(?attr, "replying...");
                reply.attr(&ttl, &attr);
            });
        });
    }

    #[instrument(
        name = "FuserAdapter::setattr",
        skip(self, _req, _mode, _uid, _gid, _atime, _mtime, _ctime, _crtime, _chgtime, _bkuptime, _flags, reply)
    )]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        self.dispatch(move |fs, ttl| {
            let result = match size {
                Some(size) => fs.truncate(ino, fh, size),
                None => fs.getattr(ino),
            };
            result.fuse_reply(reply, |inode, reply| {
                reply.attr(&ttl, &inode_to_fuser_attr(&inode, BLOCK_SIZE));
            });
        });
    }

    #[instrument(name = "FuserAdapter::mkdir", skip(self, _req, umask, reply))]
    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        let name = name.to_os_string();
        self.dispatch(move |fs, ttl| {
            fs.mkdir(parent, &name, mode & !umask)
                .fuse_reply(reply, |inode, reply| {
                    reply.entry(&ttl, &inode_to_fuser_attr(&inode, BLOCK_SIZE), 0);
                });
        });
    }

    #[instrument(name = "FuserAdapter::unlink", skip(self, _req, reply))]
    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let name = name.to_os_string();
        self.dispatch(move |fs, _| {
            fs.unlink(parent, &name)
                .fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(name = "FuserAdapter::rmdir", skip(self, _req, reply))]
    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let name = name.to_os_string();
        self.dispatch(move |fs, _| {
            fs.rmdir(parent, &name)
                .fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(name = "FuserAdapter::rename", skip(self, _req, flags, reply))]
    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        if flags != 0 {
            debug!(flags, "rename flags are not supported");
            reply.error(libc::EINVAL);
            return;
        }
        let name = name.to_os_string();
        let newname = newname.to_os_string();
        self.dispatch(move |fs, _| {
            fs.rename(parent, &name, newparent, &newname)
                .fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, flags, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let flags = OpenFlags::from_bits_truncate(flags);
        self.dispatch(move |fs, _| {
            fs.open(ino, flags).fuse_reply(reply, |fh, reply| {
                debug!(handle = fh, "replying...");
                reply.opened(fh, 0);
            });
        });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _ino, offset, size, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        self.dispatch(move |fs, _| {
            fs.read(fh, offset.cast_unsigned(), size)
                .fuse_reply(reply, |data, reply| {
                    debug!(read_bytes = data.len(), "replying...");
                    reply.data(&data);
                });
        });
    }

    #[instrument(
        name = "FuserAdapter::write",
        skip(self, _req, _ino, offset, data, _write_flags, _flags, _lock_owner, reply)
    )]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let data = data.to_vec();
        self.dispatch(move |fs, _| {
            fs.write(fh, offset.cast_unsigned(), &data)
                .fuse_reply(reply, |written, reply| reply.written(written));
        });
    }

    #[instrument(name = "FuserAdapter::flush", skip(self, _req, _ino, _lock_owner, reply))]
    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        self.dispatch(move |fs, _| {
            fs.flush(fh).fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(name = "FuserAdapter::fsync", skip(self, _req, _ino, _datasync, reply))]
    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.dispatch(move |fs, _| {
            fs.fsync(fh).fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.dispatch(move |fs, _| {
            fs.release(fh).fuse_reply(reply, |(), reply| {
                debug!("replying ok");
                reply.ok();
            });
        });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, _fh, offset, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        self.dispatch(move |fs, _| {
            let entries = match fs.readdir(ino) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.errno());
                    return;
                }
            };

            let skip = usize::try_from(offset).unwrap_or(0);
            for (i, entry) in entries.iter().enumerate().skip(skip) {
                let Ok(idx) = i64::try_from(i + 1) else {
                    error!("Directory entry index {} too large for fuser", i + 1);
                    reply.error(libc::EIO);
                    return;
                };

                debug!(name = ?entry.name, ino = entry.ino, "adding entry to reply...");
                if reply.add(entry.ino, idx, inode_type_to_fuser(entry.itype), &entry.name) {
                    debug!("buffer full for now, stopping readdir");
                    break;
                }
            }

            debug!("finalizing reply...");
            reply.ok();
        });
    }

    #[instrument(name = "FuserAdapter::create", skip(self, _req, _mode, _umask, _flags, reply))]
    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let name = name.to_os_string();
        self.dispatch(move |fs, ttl| {
            fs.create(parent, &name).fuse_reply(reply, |(inode, fh), reply| {
                debug!(handle = fh, "replying...");
                reply.created(&ttl, &inode_to_fuser_attr(&inode, BLOCK_SIZE), 0, fh, 0);
            });
        });
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        self.dispatch(move |fs, _| {
            fs.statfs().fuse_reply(reply, |stats, reply| {
                debug!(?stats, "replying...");
                reply.statfs(
                    stats.total_blocks,
                    stats.free_blocks,
                    stats.available_blocks,
                    stats.total_inodes,
                    stats.free_inodes,
                    stats.block_size,
                    stats.max_filename_length,
                    stats.fragment_size,
                );
            });
        });
    }
}
