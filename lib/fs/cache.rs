//! Decompressed shadow files.
//!
//! Every open file is served from a plain shadow file living next to its compressed backing file.
//! The shadow is created by decompressing the backing file on the first open, absorbs all reads
//! and writes while the file is open, and is deleted once the last holder releases it. A dirty
//! shadow is first recompressed into a pending sibling that then replaces the backing file, so the
//! backing file always holds either the old or the new content.
//!
//! Path-based operations go through a [`BackingStore`], which resolves the file's current
//! location. Streaming codec work only ever touches already-open descriptors.

use std::fs::File;
use std::io::{self, BufWriter, Seek as _, SeekFrom, Write as _};
use std::os::unix::fs::FileExt as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{FsError, InodeAddr};
use crate::codec::Codec;

/// Path-based access to the backing directory for a single file.
///
/// Implementations resolve `ino` to its current location and must perform each operation
/// atomically with respect to renames and removals.
pub trait BackingStore {
    /// Open the compressed backing file for reading.
    fn open_source(&self, ino: InodeAddr) -> Result<File, FsError>;

    /// Create (or truncate) the shadow file, opened for reading and writing.
    fn create_shadow(&self, ino: InodeAddr) -> Result<File, FsError>;

    /// Delete the shadow file. A missing shadow is not an error.
    fn remove_shadow(&self, ino: InodeAddr) -> Result<(), FsError>;

    /// Create (or truncate) the pending sibling a write-back is staged in.
    fn create_pending(&self, ino: InodeAddr) -> Result<File, FsError>;

    /// Replace the backing file with the pending sibling.
    fn commit_pending(&self, ino: InodeAddr) -> Result<(), FsError>;

    /// Delete the pending sibling. A missing one is not an error.
    fn remove_pending(&self, ino: InodeAddr) -> Result<(), FsError>;
}

/// How concurrent opens of one file are arbitrated.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OpenPolicy {
    /// An open waits until every previous holder has released the file.
    #[default]
    Exclusive,
    /// Concurrent opens share one shadow, counted by reference.
    Shared,
}

#[derive(Debug, Default)]
struct CacheState {
    shadow: Option<File>,
    dirty: bool,
    holders: u32,
}

/// Cache state of one regular file.
#[derive(Debug)]
pub struct FileCache {
    ino: InodeAddr,
    state: Mutex<CacheState>,
    released: Condvar,
    unlinked: AtomicBool,
}

impl FileCache {
    /// A file with no shadow.
    #[must_use]
    pub fn closed(ino: InodeAddr) -> Self {
        Self {
            ino,
            state: Mutex::new(CacheState::default()),
            released: Condvar::new(),
            unlinked: AtomicBool::new(false),
        }
    }

    /// A freshly created file, already open once through `shadow`.
    #[must_use]
    pub fn created(ino: InodeAddr, shadow: File) -> Self {
        Self {
            ino,
            state: Mutex::new(CacheState {
                shadow: Some(shadow),
                dirty: false,
                holders: 1,
            }),
            released: Condvar::new(),
            unlinked: AtomicBool::new(false),
        }
    }

    /// Inode of the file.
    #[must_use]
    pub fn ino(&self) -> InodeAddr {
        self.ino
    }

    /// Mark the file as removed from the namespace. Its data is discarded on the last release.
    pub fn mark_unlinked(&self) {
        self.unlinked.store(true, Ordering::Release);
    }

    /// Whether the file was removed from the namespace.
    #[must_use]
    pub fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::Acquire)
    }

    /// Number of open holders.
    #[must_use]
    pub fn holders(&self) -> u32 {
        self.state.lock().holders
    }

    /// Whether a shadow file is currently materialized.
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.state.lock().shadow.is_some()
    }

    /// Acquire the file, materializing its shadow if needed.
    ///
    /// Under [`OpenPolicy::Exclusive`] this blocks until every previous holder has fully released.
    /// With `truncate`, the shadow is emptied and marked dirty.
    pub fn open<B: BackingStore + ?Sized>(
        &self,
        backing: &B,
        codec: Codec,
        policy: OpenPolicy,
        truncate: bool,
    ) -> Result<(), FsError> {
        let mut state = self.state.lock();
        if policy == OpenPolicy::Exclusive {
            while state.holders > 0 {
                debug!(ino = self.ino, "waiting for previous holder to release");
                self.released.wait(&mut state);
            }
        }

        if self.is_unlinked() {
            return Err(FsError::NotFound);
        }

        if state.shadow.is_none() {
            state.shadow = Some(if truncate {
                backing.create_shadow(self.ino)?
            } else {
                self.materialize(backing, codec)?
            });
            state.dirty = false;
        }

        if truncate {
            if let Some(shadow) = state.shadow.as_ref() {
                shadow.set_len(0)?;
            }
            state.dirty = true;
        }

        state.holders += 1;
        Ok(())
    }

    fn materialize<B: BackingStore + ?Sized>(
        &self,
        backing: &B,
        codec: Codec,
    ) -> Result<File, FsError> {
        let source = backing.open_source(self.ino)?;
        let shadow = backing.create_shadow(self.ino)?;

        let decoded = {
            let mut writer = BufWriter::new(&shadow);
            codec
                .decompress(&source, &mut writer)
                .and_then(|n| writer.flush().map(|()| n).map_err(Into::into))
        };
        match decoded {
            Ok(size) => {
                debug!(ino = self.ino, size, "materialized shadow");
                Ok(shadow)
            }
            Err(e) => {
                drop(shadow);
                if let Err(cleanup) = backing.remove_shadow(self.ino) {
                    warn!(ino = self.ino, error = %cleanup, "failed to remove partial shadow");
                }
                Err(e.into())
            }
        }
    }

    /// Read at most `size` bytes starting at `offset`. Short only at end of file.
    pub fn read(&self, offset: u64, size: u32) -> Result<Bytes, FsError> {
        let state = self.state.lock();
        let shadow = state.shadow.as_ref().ok_or(FsError::BadHandle)?;

        let mut buf = vec![0u8; size as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            match shadow.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    /// Write `data` at `offset`, extending the file as needed.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let written = u32::try_from(data.len())
            .map_err(|_| FsError::BackingIo(io::ErrorKind::InvalidInput.into()))?;
        let mut state = self.state.lock();
        let shadow = state.shadow.as_ref().ok_or(FsError::BadHandle)?;
        shadow.write_all_at(data, offset)?;
        state.dirty = true;
        Ok(written)
    }

    /// Resize the open shadow to exactly `size` bytes.
    pub fn truncate(&self, size: u64) -> Result<(), FsError> {
        let mut state = self.state.lock();
        let shadow = state.shadow.as_ref().ok_or(FsError::BadHandle)?;
        shadow.set_len(size)?;
        state.dirty = true;
        Ok(())
    }

    /// Resize the file whether or not it is open.
    ///
    /// Without a shadow the file is materialized, resized, recompressed and torn down while the
    /// file lock is held, so no open can observe the intermediate state.
    pub fn truncate_any<B: BackingStore + ?Sized>(
        &self,
        backing: &B,
        codec: Codec,
        size: u64,
    ) -> Result<(), FsError> {
        let mut state = self.state.lock();
        if let Some(shadow) = state.shadow.as_ref() {
            shadow.set_len(size)?;
            state.dirty = true;
            return Ok(());
        }

        if size == 0 {
            // An empty backing file decodes to empty content for every codec.
            let empty = backing.create_pending(self.ino)?;
            empty.sync_all()?;
            drop(empty);
            return self.commit(backing);
        }

        let shadow = self.materialize(backing, codec)?;
        shadow.set_len(size)?;
        state.shadow = Some(shadow);
        state.dirty = true;
        self.settle_locked(&mut state, backing, codec)
    }

    /// Flush the shadow to its own medium. The backing file is not touched.
    pub fn sync(&self) -> Result<(), FsError> {
        let state = self.state.lock();
        match state.shadow.as_ref() {
            Some(shadow) => Ok(shadow.sync_all()?),
            None => Ok(()),
        }
    }

    /// Drop one hold on the file. The last release recompresses a dirty shadow and deletes it.
    ///
    /// When recompression fails the shadow and its dirty flag are kept, so the written data is
    /// served by the next open and written back by the next release.
    pub fn release<B: BackingStore + ?Sized>(
        &self,
        backing: &B,
        codec: Codec,
    ) -> Result<(), FsError> {
        let mut state = self.state.lock();
        state.holders = state.holders.saturating_sub(1);
        let result = if state.holders == 0 {
            self.settle_locked(&mut state, backing, codec)
        } else {
            Ok(())
        };
        drop(state);
        self.released.notify_all();
        result
    }

    /// Write back and tear down a shadow that nobody holds, if any.
    pub fn settle<B: BackingStore + ?Sized>(
        &self,
        backing: &B,
        codec: Codec,
    ) -> Result<(), FsError> {
        let mut state = self.state.lock();
        if state.holders > 0 {
            return Ok(());
        }
        let result = self.settle_locked(&mut state, backing, codec);
        drop(state);
        self.released.notify_all();
        result
    }

    fn settle_locked<B: BackingStore + ?Sized>(
        &self,
        state: &mut CacheState,
        backing: &B,
        codec: Codec,
    ) -> Result<(), FsError> {
        let Some(shadow) = state.shadow.as_ref() else {
            return Ok(());
        };

        if self.is_unlinked() {
            debug!(ino = self.ino, "discarding shadow of removed file");
            state.shadow = None;
            state.dirty = false;
            return Ok(());
        }

        if state.dirty {
            let written = self
                .stage(shadow, backing, codec)
                .and_then(|written| self.commit(backing).map(|()| written));
            match written {
                Ok(written) => debug!(ino = self.ino, size = written, "recompressed shadow"),
                Err(e) if self.is_unlinked() => {
                    debug!(ino = self.ino, error = %e, "file removed during write-back");
                }
                Err(e) => return Err(e),
            }
            state.dirty = false;
        }

        state.shadow = None;
        backing.remove_shadow(self.ino)
    }

    /// Compress `shadow` into the pending sibling. Returns the number of plain bytes written.
    fn stage<B: BackingStore + ?Sized>(
        &self,
        shadow: &File,
        backing: &B,
        codec: Codec,
    ) -> Result<u64, FsError> {
        let staged = Self::compress_into(shadow, backing.create_pending(self.ino)?, codec);
        if staged.is_err() {
            self.discard_pending(backing);
        }
        staged
    }

    fn compress_into(mut shadow: &File, sink: File, codec: Codec) -> Result<u64, FsError> {
        shadow.seek(SeekFrom::Start(0))?;
        let mut writer = BufWriter::new(&sink);
        let written = codec.compress(shadow, &mut writer)?;
        writer.flush()?;
        drop(writer);
        sink.sync_all()?;
        Ok(written)
    }

    /// Move the staged write-back over the backing file.
    fn commit<B: BackingStore + ?Sized>(&self, backing: &B) -> Result<(), FsError> {
        let committed = backing.commit_pending(self.ino);
        if committed.is_err() {
            self.discard_pending(backing);
        }
        committed
    }

    fn discard_pending<B: BackingStore + ?Sized>(&self, backing: &B) {
        if let Err(e) = backing.remove_pending(self.ino) {
            warn!(ino = self.ino, error = %e, "failed to remove pending write-back");
        }
    }

    /// Uncompressed size, plus the shadow's modification time when one exists.
    ///
    /// Without a shadow the backing file is decoded into a counting sink.
    pub fn stat<B: BackingStore + ?Sized>(
        &self,
        backing: &B,
        codec: Codec,
    ) -> Result<(u64, Option<SystemTime>), FsError> {
        let state = self.state.lock();
        if let Some(shadow) = state.shadow.as_ref() {
            let meta = shadow.metadata()?;
            return Ok((meta.len(), meta.modified().ok()));
        }

        let source = backing.open_source(self.ino)?;
        let size = codec.decompress(&source, io::sink())?;
        Ok((size, None))
    }
}
