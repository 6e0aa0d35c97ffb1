//! The tree is an arena of entries addressed by [`NodeId`]. Directories hold ordered child maps
//! of slot ids and every entry links back to its parent, so paths are derived on demand by
//! walking to the root. Moving a directory therefore never rewrites anything below it.
//!
//! Every mutation performs the backing-store operation first and touches the arena only once it
//! has succeeded.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs::{self, DirBuilder, File};
use std::io;
use std::os::unix::fs::DirBuilderExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::cache::FileCache;
use super::index::InodeIndex;
use super::inode_factory::InodeFactory;
use super::{
    CODEC_MARKER, DirEntry, FsError, INodeType, InodeAddr, PENDING_SUFFIX, ROOT_INO, SHADOW_SUFFIX,
};

/// Slot of an entry in the tree arena.
pub type NodeId = usize;

const ROOT_NODE: NodeId = 0;

/// Children of a directory, split by kind.
#[derive(Debug, Default)]
pub struct DirNode {
    files: BTreeMap<OsString, NodeId>,
    dirs: BTreeMap<OsString, NodeId>,
}

impl DirNode {
    fn child(&self, name: &OsStr) -> Option<NodeId> {
        self.files.get(name).or_else(|| self.dirs.get(name)).copied()
    }

    /// Whether the directory has no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }
}

/// What an entry is.
#[derive(Debug)]
pub enum EntryKind {
    /// A regular file and its cache state.
    File(Arc<FileCache>),
    /// A directory and its children.
    Directory(DirNode),
}

/// One node of the tree.
#[derive(Debug)]
pub struct Entry {
    /// Inode address, stable for the lifetime of the mount.
    pub ino: InodeAddr,
    /// Name within the parent. Empty for the root.
    pub name: OsString,
    parent: Option<NodeId>,
    /// File or directory payload.
    pub kind: EntryKind,
}

impl Entry {
    /// File or directory.
    #[must_use]
    pub fn itype(&self) -> INodeType {
        match self.kind {
            EntryKind::File(_) => INodeType::File,
            EntryKind::Directory(_) => INodeType::Directory,
        }
    }

    /// The file cache, if this entry is a file.
    #[must_use]
    pub fn file(&self) -> Option<&Arc<FileCache>> {
        match &self.kind {
            EntryKind::File(cache) => Some(cache),
            EntryKind::Directory(_) => None,
        }
    }
}

/// Whether `name` may not be used for an entry of the directory `parent`.
fn is_reserved(name: &OsStr, parent_is_root: bool) -> bool {
    is_companion(name) || (parent_is_root && name == CODEC_MARKER)
}

/// Whether `name` is a shadow or a pending write-back rather than a backing file.
fn is_companion(name: &OsStr) -> bool {
    let bytes = name.as_encoded_bytes();
    bytes.ends_with(SHADOW_SUFFIX.as_bytes()) || bytes.ends_with(PENDING_SUFFIX.as_bytes())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsStr::to_os_string).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// The shadow path belonging to the backing file at `path`.
#[must_use]
pub fn shadow_path(path: &Path) -> PathBuf {
    with_suffix(path, SHADOW_SUFFIX)
}

/// The path a write-back of the backing file at `path` is staged in.
#[must_use]
pub fn pending_path(path: &Path) -> PathBuf {
    with_suffix(path, PENDING_SUFFIX)
}

/// Shadow and pending paths that travel with the backing file at `path`.
fn companions(path: &Path) -> [PathBuf; 2] {
    [shadow_path(path), pending_path(path)]
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn rename_if_exists(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// In-memory mirror of the backing directory.
#[derive(Debug)]
pub struct Tree {
    root: PathBuf,
    slots: Vec<Option<Entry>>,
    free: Vec<NodeId>,
    index: InodeIndex,
}

impl Tree {
    /// Build the tree by walking `root`. Shadows and pending write-backs left by an unclean
    /// shutdown are deleted; the backing files they belong to are untouched.
    pub fn scan(root: &Path, inodes: &InodeFactory) -> io::Result<Self> {
        let mut tree = Self {
            root: root.to_path_buf(),
            slots: vec![Some(Entry {
                ino: ROOT_INO,
                name: OsString::new(),
                parent: None,
                kind: EntryKind::Directory(DirNode::default()),
            })],
            free: Vec::new(),
            index: InodeIndex::default(),
        };
        tree.index.insert(ROOT_INO, ROOT_NODE);
        tree.scan_dir(ROOT_NODE, root, inodes)?;
        debug!(entries = tree.index.len(), "scanned backing directory");
        Ok(tree)
    }

    fn scan_dir(&mut self, dir: NodeId, path: &Path, inodes: &InodeFactory) -> io::Result<()> {
        for dirent in fs::read_dir(path)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let child_path = dirent.path();

            if is_companion(&name) {
                info!(path = %child_path.display(), "removing orphaned shadow file");
                remove_if_exists(&child_path)?;
                continue;
            }
            if dir == ROOT_NODE && name.as_os_str() == CODEC_MARKER {
                continue;
            }

            let file_type = dirent.file_type()?;
            if file_type.is_dir() {
                let child = self.attach(dir, name, inodes.allocate(), EntryKind::Directory(DirNode::default()));
                self.scan_dir(child, &child_path, inodes)?;
            } else if file_type.is_file() {
                let ino = inodes.allocate();
                self.attach(dir, name, ino, EntryKind::File(Arc::new(FileCache::closed(ino))));
            } else {
                debug!(path = %child_path.display(), "skipping entry that is neither file nor directory");
            }
        }
        Ok(())
    }

    /// Absolute path of the backing root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of entries, including the root.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the tree holds no entries. Never true once scanned, as the root is always present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn node(&self, id: NodeId) -> &Entry {
        match self.slots.get(id).and_then(Option::as_ref) {
            Some(entry) => entry,
            None => unreachable!("slot {id} is referenced but vacant"),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Entry {
        match self.slots.get_mut(id).and_then(Option::as_mut) {
            Some(entry) => entry,
            None => unreachable!("slot {id} is referenced but vacant"),
        }
    }

    fn dir(&self, id: NodeId) -> Result<&DirNode, FsError> {
        match &self.node(id).kind {
            EntryKind::Directory(d) => Ok(d),
            EntryKind::File(_) => Err(FsError::NotADirectory),
        }
    }

    fn dir_mut(&mut self, id: NodeId) -> Result<&mut DirNode, FsError> {
        match &mut self.node_mut(id).kind {
            EntryKind::Directory(d) => Ok(d),
            EntryKind::File(_) => Err(FsError::NotADirectory),
        }
    }

    /// Resolve an inode address to its slot.
    pub fn resolve(&self, ino: InodeAddr) -> Result<NodeId, FsError> {
        self.index.get(ino).ok_or(FsError::NotFound)
    }

    /// The entry in slot `id`.
    #[must_use]
    pub fn get(&self, id: NodeId) -> &Entry {
        self.node(id)
    }

    /// Backing path of the entry in slot `id`.
    #[must_use]
    pub fn path_of(&self, id: NodeId) -> PathBuf {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let entry = self.node(current);
            if entry.parent.is_some() {
                names.push(entry.name.as_os_str());
            }
            cursor = entry.parent;
        }
        names.iter().rev().fold(self.root.clone(), |path, name| path.join(name))
    }

    /// Backing path of the entry with inode `ino`.
    pub fn path_of_ino(&self, ino: InodeAddr) -> Result<PathBuf, FsError> {
        Ok(self.path_of(self.resolve(ino)?))
    }

    /// Find `name` in the directory `dir`.
    pub fn lookup(&self, dir: NodeId, name: &OsStr) -> Result<NodeId, FsError> {
        self.dir(dir)?.child(name).ok_or(FsError::NotFound)
    }

    /// Direct children of `dir`: files first, then directories, each in name order.
    pub fn list(&self, dir: NodeId) -> Result<Vec<DirEntry>, FsError> {
        let d = self.dir(dir)?;
        Ok(d.files
            .values()
            .chain(d.dirs.values())
            .map(|&id| {
                let e = self.node(id);
                DirEntry {
                    ino: e.ino,
                    itype: e.itype(),
                    name: e.name.clone(),
                }
            })
            .collect())
    }

    /// Every file cache in the tree.
    #[must_use]
    pub fn file_caches(&self) -> Vec<Arc<FileCache>> {
        self.slots
            .iter()
            .flatten()
            .filter_map(|e| e.file().cloned())
            .collect()
    }

    fn check_name(&self, dir: NodeId, name: &OsStr) -> Result<(), FsError> {
        if is_reserved(name, dir == ROOT_NODE) {
            return Err(FsError::ReservedName);
        }
        if self.dir(dir)?.child(name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        Ok(())
    }

    fn attach(&mut self, parent: NodeId, name: OsString, ino: InodeAddr, kind: EntryKind) -> NodeId {
        let is_dir = matches!(kind, EntryKind::Directory(_));
        let entry = Entry {
            ino,
            name: name.clone(),
            parent: Some(parent),
            kind,
        };
        let id = if let Some(id) = self.free.pop() {
            self.slots[id] = Some(entry);
            id
        } else {
            self.slots.push(Some(entry));
            self.slots.len() - 1
        };
        self.index.insert(ino, id);

        if let EntryKind::Directory(d) = &mut self.node_mut(parent).kind {
            if is_dir {
                d.dirs.insert(name, id);
            } else {
                d.files.insert(name, id);
            }
        }
        id
    }

    /// Unlink slot `id` from its parent's maps without freeing it.
    fn unlink_from_parent(&mut self, id: NodeId) {
        let (parent, name) = {
            let e = self.node(id);
            (e.parent, e.name.clone())
        };
        if let Some(parent) = parent {
            if let EntryKind::Directory(d) = &mut self.node_mut(parent).kind {
                d.files.remove(&name);
                d.dirs.remove(&name);
            }
        }
    }

    fn free_slot(&mut self, id: NodeId) -> Option<Entry> {
        let entry = self.slots.get_mut(id).and_then(Option::take)?;
        self.index.remove(entry.ino);
        self.free.push(id);
        Some(entry)
    }

    /// Create an empty file `name` in `dir`, open once through a fresh, empty shadow.
    pub fn create(
        &mut self,
        dir: NodeId,
        name: &OsStr,
        inodes: &InodeFactory,
    ) -> Result<(NodeId, Arc<FileCache>), FsError> {
        self.check_name(dir, name)?;
        let path = self.path_of(dir).join(name);

        File::options().write(true).create_new(true).open(&path)?;
        let shadow = match File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(shadow_path(&path))
        {
            Ok(shadow) => shadow,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %cleanup, "failed to remove half-created file");
                }
                return Err(e.into());
            }
        };

        let ino = inodes.allocate();
        let cache = Arc::new(FileCache::created(ino, shadow));
        let id = self.attach(dir, name.to_os_string(), ino, EntryKind::File(Arc::clone(&cache)));
        Ok((id, cache))
    }

    /// Create the directory `name` in `dir` with the given mode bits.
    pub fn mkdir(
        &mut self,
        dir: NodeId,
        name: &OsStr,
        mode: u32,
        inodes: &InodeFactory,
    ) -> Result<NodeId, FsError> {
        self.check_name(dir, name)?;
        let path = self.path_of(dir).join(name);
        DirBuilder::new().mode(mode & 0o7777).create(&path)?;

        let ino = inodes.allocate();
        Ok(self.attach(
            dir,
            name.to_os_string(),
            ino,
            EntryKind::Directory(DirNode::default()),
        ))
    }

    /// Remove `name` from `dir`. Directories must be empty.
    ///
    /// A removed file that is still open is marked unlinked; its handles keep working and its
    /// data is discarded on the last release.
    pub fn remove(&mut self, dir: NodeId, name: &OsStr, is_directory: bool) -> Result<(), FsError> {
        let parent = self.dir(dir)?;
        let id = if is_directory {
            parent.dirs.get(name)
        } else {
            parent.files.get(name)
        }
        .copied()
        .ok_or(FsError::NotFound)?;
        let path = self.path_of(id);

        match &self.node(id).kind {
            EntryKind::Directory(d) => {
                if !d.is_empty() {
                    return Err(FsError::NotEmpty);
                }
                fs::remove_dir(&path).map_err(|e| match e.raw_os_error() {
                    Some(libc::ENOTEMPTY | libc::EEXIST) => FsError::NotEmpty,
                    _ => FsError::BackingIo(e),
                })?;
            }
            EntryKind::File(cache) => {
                fs::remove_file(&path)?;
                cache.mark_unlinked();
                for companion in companions(&path) {
                    if let Err(e) = remove_if_exists(&companion) {
                        warn!(path = %companion.display(), error = %e, "failed to remove companion of removed file");
                    }
                }
            }
        }

        self.unlink_from_parent(id);
        self.free_slot(id);
        Ok(())
    }

    /// Move `old` in `src_dir` to `new` in `dst_dir`, replacing any existing destination.
    ///
    /// The moved entry keeps its inode. A file's shadow travels with it.
    pub fn rename(
        &mut self,
        src_dir: NodeId,
        old: &OsStr,
        dst_dir: NodeId,
        new: &OsStr,
    ) -> Result<(), FsError> {
        let id = self.lookup(src_dir, old)?;
        self.dir(dst_dir)?;
        if is_reserved(new, dst_dir == ROOT_NODE) {
            return Err(FsError::ReservedName);
        }
        if src_dir == dst_dir && old == new {
            return Ok(());
        }

        let replaced = self.dir(dst_dir)?.child(new);
        let from = self.path_of(id);
        let to = self.path_of(dst_dir).join(new);

        fs::rename(&from, &to)?;
        if let Some(victim) = replaced {
            if let Some(cache) = self.node(victim).file() {
                cache.mark_unlinked();
                for companion in companions(&to) {
                    if let Err(e) = remove_if_exists(&companion) {
                        warn!(path = %companion.display(), error = %e, "failed to remove companion of replaced file");
                    }
                }
            }
        }
        if matches!(self.node(id).kind, EntryKind::File(_)) {
            for (old_companion, new_companion) in companions(&from).into_iter().zip(companions(&to)) {
                if let Err(e) = rename_if_exists(&old_companion, &new_companion) {
                    warn!(from = %old_companion.display(), error = %e, "failed to move companion of renamed file");
                }
            }
        }

        if let Some(victim) = replaced {
            self.unlink_from_parent(victim);
            self.free_slot(victim);
        }
        self.unlink_from_parent(id);

        let is_dir = {
            let entry = self.node_mut(id);
            entry.name = new.to_os_string();
            entry.parent = Some(dst_dir);
            matches!(entry.kind, EntryKind::Directory(_))
        };
        let d = self.dir_mut(dst_dir)?;
        if is_dir {
            d.dirs.insert(new.to_os_string(), id);
        } else {
            d.files.insert(new.to_os_string(), id);
        }
        debug!(from = %from.display(), to = %to.display(), "renamed");
        Ok(())
    }
}
