//! compressfs shared library.

/// Stream codecs for file contents at rest.
pub mod codec;
/// The compressing filesystem and its FUSE bridge.
pub mod fs;
