//! Errors surfaced by filesystem operations.

use thiserror::Error;

use crate::codec::CodecError;

/// Failure of a single filesystem operation.
#[derive(Debug, Error)]
pub enum FsError {
    /// No entry with that name or inode.
    #[error("no such file or directory")]
    NotFound,

    /// The handle does not allow the operation.
    #[error("operation not permitted")]
    PermissionDenied,

    /// The target name is taken.
    #[error("entry already exists")]
    AlreadyExists,

    /// A directory operation named a file.
    #[error("not a directory")]
    NotADirectory,

    /// A file operation named a directory.
    #[error("is a directory")]
    IsADirectory,

    /// The directory still has children.
    #[error("directory not empty")]
    NotEmpty,

    /// The name collides with the filesystem's own bookkeeping files.
    #[error("name is reserved by the filesystem")]
    ReservedName,

    /// The file handle is unknown or already released.
    #[error("file handle not open")]
    BadHandle,

    /// The backing directory rejected an operation.
    #[error("backing store io error: {0}")]
    BackingIo(#[from] std::io::Error),

    /// Encoding or decoding file content failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl FsError {
    /// The errno reported to the kernel for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::PermissionDenied => libc::EPERM,
            Self::AlreadyExists => libc::EEXIST,
            Self::NotADirectory => libc::ENOTDIR,
            Self::IsADirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::ReservedName => libc::EINVAL,
            Self::BadHandle => libc::EBADF,
            Self::BackingIo(e) => io_to_errno(e),
            Self::Codec(CodecError::Io(e)) => io_to_errno(e),
            Self::Codec(CodecError::Corrupt { .. }) => libc::EIO,
        }
    }
}

impl From<FsError> for i32 {
    fn from(e: FsError) -> Self {
        e.errno()
    }
}

/// Convert an I/O error to the corresponding errno value. `ErrorKind` is non-exhaustive, so
/// anything unrecognized becomes `EIO`.
fn io_to_errno(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or_else(|| match e.kind() {
        std::io::ErrorKind::NotFound => libc::ENOENT,
        std::io::ErrorKind::PermissionDenied => libc::EACCES,
        std::io::ErrorKind::AlreadyExists => libc::EEXIST,
        _ => libc::EIO,
    })
}
