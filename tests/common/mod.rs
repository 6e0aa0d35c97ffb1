#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::path::Path;

use compressfs::codec::Codec;
use compressfs::fs::{CompressFs, FileHandle, InodeAddr, MountOptions, OpenFlags, OpenPolicy};

/// Mount `root` with `codec` and the default open policy.
pub fn mount(root: &Path, codec: Codec) -> CompressFs {
    CompressFs::mount(root, MountOptions::new(codec)).unwrap()
}

/// Mount `root` with an explicit open policy.
pub fn mount_with_policy(root: &Path, codec: Codec, open_policy: OpenPolicy) -> CompressFs {
    CompressFs::mount(root, MountOptions { codec, open_policy }).unwrap()
}

/// Store `plain` compressed at `rel` under `root`, bypassing the filesystem.
pub fn put_backing(root: &Path, rel: &str, codec: Codec, plain: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let mut encoded = Vec::new();
    codec.compress(plain, &mut encoded).unwrap();
    std::fs::write(path, encoded).unwrap();
}

/// Decompress the backing file at `rel` under `root`.
pub fn get_backing(root: &Path, rel: &str, codec: Codec) -> Vec<u8> {
    let file = std::fs::File::open(root.join(rel)).unwrap();
    let mut plain = Vec::new();
    codec.decompress(file, &mut plain).unwrap();
    plain
}

/// Read everything readable through `fh`.
pub fn read_all(fs: &CompressFs, fh: FileHandle) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let chunk = fs.read(fh, out.len() as u64, 4096).unwrap();
        if chunk.is_empty() {
            return out;
        }
        out.extend_from_slice(&chunk);
    }
}

/// Open `ino`, read it entirely, and release it.
pub fn read_file(fs: &CompressFs, ino: InodeAddr) -> Vec<u8> {
    let fh = fs.open(ino, OpenFlags::RDONLY).unwrap();
    let data = read_all(fs, fh);
    fs.release(fh).unwrap();
    data
}

/// Resolve a slash separated path from the root.
pub fn resolve(fs: &CompressFs, path: &str) -> InodeAddr {
    path.split('/')
        .filter(|c| !c.is_empty())
        .fold(compressfs::fs::ROOT_INO, |ino, name| {
            fs.lookup(ino, std::ffi::OsStr::new(name)).unwrap().inode.addr
        })
}

/// Names of the shadow files currently present anywhere under `root`.
pub fn shadows_under(root: &Path) -> Vec<String> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if entry
                .file_name()
                .to_string_lossy()
                .ends_with(compressfs::fs::SHADOW_SUFFIX)
            {
                found.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    found
}
