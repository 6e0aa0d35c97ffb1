#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::ffi::OsStr;

use common::{get_backing, mount, put_backing, read_file, resolve, shadows_under};
use compressfs::codec::Codec;
use compressfs::fs::{
    CODEC_MARKER, CompressFs, FsError, INodeType, MountError, MountOptions, OpenFlags, PENDING_SUFFIX,
    ROOT_INO, SHADOW_SUFFIX,
};

fn names(fs: &CompressFs, ino: u64) -> Vec<String> {
    fs.readdir(ino)
        .unwrap()
        .into_iter()
        .map(|e| e.name.to_string_lossy().into_owned())
        .collect()
}

#[test]
fn scan_mirrors_backing_layout() {
    let root = tempfile::tempdir().unwrap();
    put_backing(root.path(), "top.txt", Codec::Zlib, b"top");
    put_backing(root.path(), "docs/readme.md", Codec::Zlib, b"# readme");
    std::fs::create_dir(root.path().join("empty")).unwrap();

    let fs = mount(root.path(), Codec::Zlib);

    assert_eq!(names(&fs, ROOT_INO), vec!["top.txt", "docs", "empty"]);
    let docs = resolve(&fs, "docs");
    assert_eq!(names(&fs, docs), vec!["readme.md"]);

    let readme = fs.lookup(docs, OsStr::new("readme.md")).unwrap().inode;
    assert_eq!(readme.itype, INodeType::File);
    assert_eq!(readme.size, 8);
    assert_eq!(readme.perm, 0o644);
    assert_eq!(fs.getattr(docs).unwrap().perm, 0o755);
    assert_eq!(read_file(&fs, readme.addr), b"# readme");
}

#[test]
fn inodes_are_unique_across_the_tree() {
    let root = tempfile::tempdir().unwrap();
    for rel in ["a", "b", "d/c", "d/e/f"] {
        put_backing(root.path(), rel, Codec::Gzip, rel.as_bytes());
    }
    let fs = mount(root.path(), Codec::Gzip);

    let mut inos: Vec<_> = ["", "a", "b", "d", "d/c", "d/e", "d/e/f"]
        .into_iter()
        .map(|p| resolve(&fs, p))
        .collect();
    assert_eq!(inos[0], ROOT_INO);
    inos.sort_unstable();
    inos.dedup();
    assert_eq!(inos.len(), 7);
}

#[test]
fn lookup_of_missing_name_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let fs = mount(root.path(), Codec::Zlib);

    let err = fs.lookup(ROOT_INO, OsStr::new("nope")).unwrap_err();
    assert!(matches!(err, FsError::NotFound));
    assert_eq!(err.errno(), libc::ENOENT);
}

#[test]
fn lookup_inside_a_file_is_not_a_directory() {
    let root = tempfile::tempdir().unwrap();
    put_backing(root.path(), "f", Codec::Zlib, b"x");
    let fs = mount(root.path(), Codec::Zlib);

    let f = resolve(&fs, "f");
    assert_eq!(
        fs.lookup(f, OsStr::new("child")).unwrap_err().errno(),
        libc::ENOTDIR
    );
}

#[test]
fn orphaned_shadows_are_removed_at_mount_and_never_listed() {
    let root = tempfile::tempdir().unwrap();
    put_backing(root.path(), "a.txt", Codec::Flate1, b"a");
    std::fs::write(root.path().join(format!("a.txt{SHADOW_SUFFIX}")), b"stale").unwrap();
    std::fs::create_dir(root.path().join("sub")).unwrap();
    std::fs::write(root.path().join(format!("sub/gone{SHADOW_SUFFIX}")), b"").unwrap();

    let fs = mount(root.path(), Codec::Flate1);

    assert!(shadows_under(root.path()).is_empty());
    assert_eq!(names(&fs, ROOT_INO), vec!["a.txt", "sub"]);
    assert!(names(&fs, resolve(&fs, "sub")).is_empty());
}

#[test]
fn codec_marker_is_written_and_hidden() {
    let root = tempfile::tempdir().unwrap();
    let fs = mount(root.path(), Codec::Flate9);

    let marker = std::fs::read_to_string(root.path().join(CODEC_MARKER)).unwrap();
    assert_eq!(marker.trim(), "flate9");
    assert!(names(&fs, ROOT_INO).is_empty());
    assert!(matches!(
        fs.lookup(ROOT_INO, OsStr::new(CODEC_MARKER)),
        Err(FsError::NotFound)
    ));
}

#[test]
fn remount_with_another_codec_is_refused() {
    let root = tempfile::tempdir().unwrap();
    drop(mount(root.path(), Codec::Lzw));

    let err = CompressFs::mount(root.path(), MountOptions::new(Codec::Gzip))
        .err()
        .expect("mount must fail");
    assert!(
        matches!(
            err,
            MountError::CodecMismatch {
                requested: Codec::Gzip,
                found: Codec::Lzw
            }
        ),
        "{err}"
    );

    // The original codec still mounts.
    drop(mount(root.path(), Codec::Lzw));
}

#[test]
fn mounting_a_file_fails() {
    let root = tempfile::tempdir().unwrap();
    let file = root.path().join("plain");
    std::fs::write(&file, b"").unwrap();

    assert!(matches!(
        CompressFs::mount(&file, MountOptions::new(Codec::Zlib)),
        Err(MountError::NotADirectory(_))
    ));
}

#[test]
fn create_then_duplicate_is_already_exists() {
    let root = tempfile::tempdir().unwrap();
    let fs = mount(root.path(), Codec::Zlib);

    let (inode, fh) = fs.create(ROOT_INO, OsStr::new("new.txt")).unwrap();
    assert_eq!(inode.size, 0);
    assert!(root.path().join("new.txt").exists());
    assert_eq!(shadows_under(root.path()), vec![format!("new.txt{SHADOW_SUFFIX}")]);
    fs.release(fh).unwrap();

    // Never written: the backing file stays empty.
    assert_eq!(std::fs::metadata(root.path().join("new.txt")).unwrap().len(), 0);
    assert!(shadows_under(root.path()).is_empty());
    assert_eq!(fs.getattr(inode.addr).unwrap().size, 0);

    let err = fs.create(ROOT_INO, OsStr::new("new.txt")).unwrap_err();
    assert_eq!(err.errno(), libc::EEXIST);
}

#[test]
fn reserved_names_cannot_be_created() {
    let root = tempfile::tempdir().unwrap();
    let fs = mount(root.path(), Codec::Zlib);

    let shadow_like = format!("x{SHADOW_SUFFIX}");
    assert!(matches!(
        fs.create(ROOT_INO, OsStr::new(&shadow_like)),
        Err(FsError::ReservedName)
    ));
    assert!(matches!(
        fs.mkdir(ROOT_INO, OsStr::new(CODEC_MARKER), 0o755),
        Err(FsError::ReservedName)
    ));
    assert_eq!(
        fs.create(ROOT_INO, OsStr::new(&shadow_like)).unwrap_err().errno(),
        libc::EINVAL
    );
    assert!(matches!(
        fs.create(ROOT_INO, OsStr::new(&format!("x{PENDING_SUFFIX}"))),
        Err(FsError::ReservedName)
    ));
}

#[test]
fn mkdir_creates_backing_directory() {
    let root = tempfile::tempdir().unwrap();
    let fs = mount(root.path(), Codec::Zlib);

    let dir = fs.mkdir(ROOT_INO, OsStr::new("d"), 0o750).unwrap();
    assert_eq!(dir.itype, INodeType::Directory);
    assert!(root.path().join("d").is_dir());

    let (_, fh) = fs.create(dir.addr, OsStr::new("inner")).unwrap();
    fs.write(fh, 0, b"nested").unwrap();
    fs.release(fh).unwrap();
    assert_eq!(get_backing(root.path(), "d/inner", Codec::Zlib), b"nested");
}

#[test]
fn unlink_removes_backing_file() {
    let root = tempfile::tempdir().unwrap();
    put_backing(root.path(), "f", Codec::Zlib, b"data");
    let fs = mount(root.path(), Codec::Zlib);

    fs.unlink(ROOT_INO, OsStr::new("f")).unwrap();
    assert!(!root.path().join("f").exists());
    assert!(matches!(
        fs.lookup(ROOT_INO, OsStr::new("f")),
        Err(FsError::NotFound)
    ));
    assert!(matches!(
        fs.unlink(ROOT_INO, OsStr::new("f")),
        Err(FsError::NotFound)
    ));
}

#[test]
fn stuck_shadow_paths_do_not_block_unlink_or_rename() {
    let root = tempfile::tempdir().unwrap();
    put_backing(root.path(), "gone", Codec::Zlib, b"a");
    put_backing(root.path(), "moving", Codec::Zlib, b"b");
    let fs = mount(root.path(), Codec::Zlib);

    // Non-empty directories where shadows would live cannot be removed or replaced.
    for name in ["gone", "moving", "moved"] {
        let stuck = root.path().join(format!("{name}{SHADOW_SUFFIX}"));
        std::fs::create_dir(&stuck).unwrap();
        std::fs::write(stuck.join("keep"), b"").unwrap();
    }

    fs.unlink(ROOT_INO, OsStr::new("gone")).unwrap();
    assert!(!root.path().join("gone").exists());
    assert!(matches!(
        fs.lookup(ROOT_INO, OsStr::new("gone")),
        Err(FsError::NotFound)
    ));

    let ino = resolve(&fs, "moving");
    fs.rename(ROOT_INO, OsStr::new("moving"), ROOT_INO, OsStr::new("moved"))
        .unwrap();
    assert!(matches!(
        fs.lookup(ROOT_INO, OsStr::new("moving")),
        Err(FsError::NotFound)
    ));
    assert_eq!(resolve(&fs, "moved"), ino);
    assert_eq!(get_backing(root.path(), "moved", Codec::Zlib), b"b");
}

#[test]
fn rmdir_of_non_empty_directory_changes_nothing() {
    let root = tempfile::tempdir().unwrap();
    put_backing(root.path(), "d/f", Codec::Zlib, b"data");
    let fs = mount(root.path(), Codec::Zlib);

    let err = fs.rmdir(ROOT_INO, OsStr::new("d")).unwrap_err();
    assert!(matches!(err, FsError::NotEmpty));
    assert_eq!(err.errno(), libc::ENOTEMPTY);
    assert!(root.path().join("d/f").exists());
    assert_eq!(names(&fs, resolve(&fs, "d")), vec!["f"]);

    fs.unlink(resolve(&fs, "d"), OsStr::new("f")).unwrap();
    fs.rmdir(ROOT_INO, OsStr::new("d")).unwrap();
    assert!(!root.path().join("d").exists());
    assert!(names(&fs, ROOT_INO).is_empty());
}

#[test]
fn rename_preserves_inode_and_content() {
    let root = tempfile::tempdir().unwrap();
    put_backing(root.path(), "old.txt", Codec::Gzip, b"payload");
    std::fs::create_dir(root.path().join("dst")).unwrap();
    let fs = mount(root.path(), Codec::Gzip);

    let ino = resolve(&fs, "old.txt");
    let dst = resolve(&fs, "dst");
    fs.rename(ROOT_INO, OsStr::new("old.txt"), dst, OsStr::new("new.txt"))
        .unwrap();

    assert!(matches!(
        fs.lookup(ROOT_INO, OsStr::new("old.txt")),
        Err(FsError::NotFound)
    ));
    let moved = fs.lookup(dst, OsStr::new("new.txt")).unwrap().inode;
    assert_eq!(moved.addr, ino);
    assert_eq!(read_file(&fs, ino), b"payload");
    assert_eq!(get_backing(root.path(), "dst/new.txt", Codec::Gzip), b"payload");
}

#[test]
fn renamed_directory_keeps_descendants_writable() {
    let root = tempfile::tempdir().unwrap();
    put_backing(root.path(), "a/b/file", Codec::Zlib, b"v1");
    let fs = mount(root.path(), Codec::Zlib);

    let file = resolve(&fs, "a/b/file");
    fs.rename(ROOT_INO, OsStr::new("a"), ROOT_INO, OsStr::new("z"))
        .unwrap();
    assert_eq!(resolve(&fs, "z/b/file"), file);

    let fh = fs.open(file, OpenFlags::RDWR).unwrap();
    fs.write(fh, 0, b"v2").unwrap();
    fs.release(fh).unwrap();

    assert_eq!(get_backing(root.path(), "z/b/file", Codec::Zlib), b"v2");
    assert!(!root.path().join("a").exists());
}

#[test]
fn rename_over_existing_file_replaces_it() {
    let root = tempfile::tempdir().unwrap();
    put_backing(root.path(), "src", Codec::Zlib, b"new");
    put_backing(root.path(), "dst", Codec::Zlib, b"old");
    let fs = mount(root.path(), Codec::Zlib);

    let src = resolve(&fs, "src");
    let dst = resolve(&fs, "dst");
    fs.rename(ROOT_INO, OsStr::new("src"), ROOT_INO, OsStr::new("dst"))
        .unwrap();

    assert_eq!(names(&fs, ROOT_INO), vec!["dst"]);
    assert_eq!(resolve(&fs, "dst"), src);
    assert!(matches!(fs.getattr(dst), Err(FsError::NotFound)));
    assert_eq!(read_file(&fs, src), b"new");
}

#[test]
fn renaming_an_open_file_moves_its_shadow() {
    let root = tempfile::tempdir().unwrap();
    put_backing(root.path(), "f", Codec::Flate9, b"before");
    let fs = mount(root.path(), Codec::Flate9);

    let ino = resolve(&fs, "f");
    let fh = fs.open(ino, OpenFlags::RDWR).unwrap();
    fs.rename(ROOT_INO, OsStr::new("f"), ROOT_INO, OsStr::new("g"))
        .unwrap();
    assert_eq!(shadows_under(root.path()), vec![format!("g{SHADOW_SUFFIX}")]);

    fs.write(fh, 0, b"after!").unwrap();
    fs.release(fh).unwrap();

    assert!(shadows_under(root.path()).is_empty());
    assert_eq!(get_backing(root.path(), "g", Codec::Flate9), b"after!");
}

#[test]
fn statfs_reports_backing_filesystem() {
    let root = tempfile::tempdir().unwrap();
    put_backing(root.path(), "f", Codec::Zlib, b"x");
    let fs = mount(root.path(), Codec::Zlib);

    let stats = fs.statfs().unwrap();
    assert!(stats.block_size > 0);
    assert_eq!(stats.total_inodes, 2);
}
