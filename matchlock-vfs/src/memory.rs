//! In-memory provider: an inode arena plus a handle index, both behind one
//! mutex. Handles are indices into the arena resolved through a monotonic
//! 64-bit map, so stale handles never alias a recycled inode.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use matchlock_proto::vfs::{DirEntry, FileStat};

use crate::provider::{
    Provider, SetAttr, VfsError, VfsResult, normalize_path, split_parent, unix_now,
};

/// Index of the root inode in the arena.
const ROOT: usize = 0;

/// Host-RAM filesystem tree with mode and mtime metadata.
#[derive(Debug)]
pub struct MemoryProvider {
    inner: Mutex<MemFs>,
}

#[derive(Debug)]
struct MemFs {
    /// Inode arena. Slot 0 is the root directory; removed inodes keep their
    /// slot (tombstoned via `None`) so open handles stay unambiguous.
    nodes: Vec<Option<MemNode>>,
    /// Open handle table: wire handle → inode index.
    handles: HashMap<u64, usize>,
    next_handle: u64,
}

#[derive(Debug)]
struct MemNode {
    mode: u32,
    mtime: u64,
    kind: NodeKind,
}

#[derive(Debug)]
enum NodeKind {
    File(Vec<u8>),
    Dir(BTreeMap<String, usize>),
}

impl MemNode {
    fn stat(&self) -> FileStat {
        match &self.kind {
            NodeKind::File(data) => FileStat::new(data.len() as u64, self.mode, self.mtime, false),
            NodeKind::Dir(_) => FileStat::new(0, self.mode, self.mtime, true),
        }
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    /// Creates an empty tree with a `0o755` root.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemFs {
                nodes: vec![Some(MemNode {
                    mode: 0o755,
                    mtime: unix_now(),
                    kind: NodeKind::Dir(BTreeMap::new()),
                })],
                handles: HashMap::new(),
                next_handle: 1,
            }),
        }
    }

    /// Host-side convenience: places a file at `path`, creating parents.
    ///
    /// Used to seed workspace content (CA bundle, init payloads) before the
    /// guest mounts the tree.
    pub fn insert_file(&self, path: &str, mode: u32, data: &[u8]) -> VfsResult<()> {
        let normalized = normalize_path(path);
        let Some((parent, name)) = split_parent(&normalized) else {
            return Err(VfsError::IsADirectory);
        };
        let mut fs = self.lock();
        let dir = fs.ensure_dirs(&parent)?;
        let node = fs.alloc(MemNode {
            mode,
            mtime: unix_now(),
            kind: NodeKind::File(data.to_vec()),
        });
        fs.dir_entries_mut(dir)?.insert(name.to_owned(), node);
        Ok(())
    }

    /// Host-side convenience: reads a whole file.
    pub fn read_file(&self, path: &str) -> VfsResult<Vec<u8>> {
        let normalized = normalize_path(path);
        let fs = self.lock();
        let idx = fs.resolve(&normalized)?;
        match &fs.node(idx)?.kind {
            NodeKind::File(data) => Ok(data.clone()),
            NodeKind::Dir(_) => Err(VfsError::IsADirectory),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemFs> {
        // A poisoned lock means a panic mid-mutation; propagating the inner
        // state is still sound for this tree (no partial invariants cross
        // the mutation boundary).
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl MemFs {
    fn alloc(&mut self, node: MemNode) -> usize {
        self.nodes.push(Some(node));
        self.nodes.len() - 1
    }

    fn node(&self, idx: usize) -> VfsResult<&MemNode> {
        self.nodes.get(idx).and_then(Option::as_ref).ok_or(VfsError::BadHandle)
    }

    fn node_mut(&mut self, idx: usize) -> VfsResult<&mut MemNode> {
        self.nodes
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or(VfsError::BadHandle)
    }

    fn dir_entries_mut(&mut self, idx: usize) -> VfsResult<&mut BTreeMap<String, usize>> {
        match &mut self.node_mut(idx)?.kind {
            NodeKind::Dir(entries) => Ok(entries),
            NodeKind::File(_) => Err(VfsError::NotADirectory),
        }
    }

    /// Walks a normalized path to an inode index.
    fn resolve(&self, path: &str) -> VfsResult<usize> {
        let mut idx = ROOT;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            match &self.node(idx)?.kind {
                NodeKind::Dir(entries) => {
                    idx = *entries.get(comp).ok_or(VfsError::NotFound)?;
                }
                NodeKind::File(_) => return Err(VfsError::NotADirectory),
            }
        }
        Ok(idx)
    }

    /// Resolves the parent directory of a normalized path.
    fn resolve_parent<'p>(&self, path: &'p str) -> VfsResult<(usize, &'p str)> {
        let (parent, name) = split_parent(path).ok_or(VfsError::AlreadyExists)?;
        let idx = self.resolve(&parent)?;
        match &self.node(idx)?.kind {
            NodeKind::Dir(_) => Ok((idx, name)),
            NodeKind::File(_) => Err(VfsError::NotADirectory),
        }
    }

    /// Resolves a directory path, creating missing components with `0o755`.
    fn ensure_dirs(&mut self, path: &str) -> VfsResult<usize> {
        let mut idx = ROOT;
        let components: Vec<String> = path
            .split('/')
            .filter(|c| !c.is_empty())
            .map(str::to_owned)
            .collect();
        for comp in components {
            let existing = match &self.node(idx)?.kind {
                NodeKind::Dir(entries) => entries.get(&comp).copied(),
                NodeKind::File(_) => return Err(VfsError::NotADirectory),
            };
            idx = match existing {
                Some(child) => child,
                None => {
                    let child = self.alloc(MemNode {
                        mode: 0o755,
                        mtime: unix_now(),
                        kind: NodeKind::Dir(BTreeMap::new()),
                    });
                    self.dir_entries_mut(idx)?.insert(comp, child);
                    child
                }
            };
        }
        Ok(idx)
    }

    fn open_handle(&mut self, idx: usize) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, idx);
        handle
    }
}

impl Provider for MemoryProvider {
    fn getattr(&self, path: &str) -> VfsResult<FileStat> {
        let fs = self.lock();
        let idx = fs.resolve(&normalize_path(path))?;
        Ok(fs.node(idx)?.stat())
    }

    fn setattr(&self, path: &str, attr: &SetAttr) -> VfsResult<FileStat> {
        let mut fs = self.lock();
        let idx = fs.resolve(&normalize_path(path))?;
        let node = fs.node_mut(idx)?;
        if let Some(size) = attr.size {
            match &mut node.kind {
                NodeKind::File(data) => data.resize(size as usize, 0),
                NodeKind::Dir(_) => return Err(VfsError::IsADirectory),
            }
        }
        if let Some(mode) = attr.mode {
            node.mode = mode;
        }
        node.mtime = attr.mtime.unwrap_or_else(unix_now);
        Ok(node.stat())
    }

    fn open(&self, path: &str, _flags: u32) -> VfsResult<u64> {
        let mut fs = self.lock();
        let idx = fs.resolve(&normalize_path(path))?;
        if matches!(fs.node(idx)?.kind, NodeKind::Dir(_)) {
            return Err(VfsError::IsADirectory);
        }
        Ok(fs.open_handle(idx))
    }

    fn release(&self, handle: u64) -> VfsResult<()> {
        let mut fs = self.lock();
        fs.handles.remove(&handle).map(|_| ()).ok_or(VfsError::BadHandle)
    }

    fn read(&self, handle: u64, offset: u64, size: u64) -> VfsResult<Vec<u8>> {
        let fs = self.lock();
        let idx = *fs.handles.get(&handle).ok_or(VfsError::BadHandle)?;
        match &fs.node(idx)?.kind {
            NodeKind::File(data) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX);
                if start >= data.len() {
                    return Ok(Vec::new());
                }
                let end = start.saturating_add(usize::try_from(size).unwrap_or(usize::MAX));
                Ok(data[start..end.min(data.len())].to_vec())
            }
            NodeKind::Dir(_) => Err(VfsError::IsADirectory),
        }
    }

    fn write(&self, handle: u64, offset: u64, data: &[u8]) -> VfsResult<u64> {
        let mut fs = self.lock();
        let idx = *fs.handles.get(&handle).ok_or(VfsError::BadHandle)?;
        let node = fs.node_mut(idx)?;
        match &mut node.kind {
            NodeKind::File(contents) => {
                let start = usize::try_from(offset)
                    .map_err(|_| VfsError::InvalidPath("offset exceeds memory".into()))?;
                let end = start + data.len();
                if contents.len() < end {
                    contents.resize(end, 0);
                }
                contents[start..end].copy_from_slice(data);
                node.mtime = unix_now();
                Ok(data.len() as u64)
            }
            NodeKind::Dir(_) => Err(VfsError::IsADirectory),
        }
    }

    fn create(&self, path: &str, mode: u32) -> VfsResult<u64> {
        let normalized = normalize_path(path);
        let mut fs = self.lock();
        let (parent, name) = fs.resolve_parent(&normalized)?;
        if fs.dir_entries_mut(parent)?.contains_key(name) {
            return Err(VfsError::AlreadyExists);
        }
        let node = fs.alloc(MemNode {
            mode,
            mtime: unix_now(),
            kind: NodeKind::File(Vec::new()),
        });
        let owned = name.to_owned();
        fs.dir_entries_mut(parent)?.insert(owned, node);
        Ok(fs.open_handle(node))
    }

    fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        let normalized = normalize_path(path);
        let mut fs = self.lock();
        let (parent, name) = fs.resolve_parent(&normalized)?;
        if fs.dir_entries_mut(parent)?.contains_key(name) {
            return Err(VfsError::AlreadyExists);
        }
        let node = fs.alloc(MemNode {
            mode,
            mtime: unix_now(),
            kind: NodeKind::Dir(BTreeMap::new()),
        });
        let owned = name.to_owned();
        fs.dir_entries_mut(parent)?.insert(owned, node);
        Ok(())
    }

    fn unlink(&self, path: &str) -> VfsResult<()> {
        let normalized = normalize_path(path);
        let mut fs = self.lock();
        let (parent, name) = fs.resolve_parent(&normalized)?;
        let idx = *fs
            .dir_entries_mut(parent)?
            .get(name)
            .ok_or(VfsError::NotFound)?;
        if matches!(fs.node(idx)?.kind, NodeKind::Dir(_)) {
            return Err(VfsError::IsADirectory);
        }
        fs.dir_entries_mut(parent)?.remove(name);
        fs.nodes[idx] = None;
        Ok(())
    }

    fn rmdir(&self, path: &str) -> VfsResult<()> {
        let normalized = normalize_path(path);
        let mut fs = self.lock();
        let (parent, name) = fs.resolve_parent(&normalized)?;
        let idx = *fs
            .dir_entries_mut(parent)?
            .get(name)
            .ok_or(VfsError::NotFound)?;
        match &fs.node(idx)?.kind {
            NodeKind::Dir(entries) if entries.is_empty() => {}
            NodeKind::Dir(_) => return Err(VfsError::NotEmpty),
            NodeKind::File(_) => return Err(VfsError::NotADirectory),
        }
        fs.dir_entries_mut(parent)?.remove(name);
        fs.nodes[idx] = None;
        Ok(())
    }

    fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        let old_n = normalize_path(old);
        let new_n = normalize_path(new);
        let mut fs = self.lock();
        let (old_parent, old_name) = fs.resolve_parent(&old_n)?;
        let idx = *fs
            .dir_entries_mut(old_parent)?
            .get(old_name)
            .ok_or(VfsError::NotFound)?;
        let (new_parent, new_name) = fs.resolve_parent(&new_n)?;
        let old_owned = old_name.to_owned();
        let new_owned = new_name.to_owned();
        fs.dir_entries_mut(old_parent)?.remove(&old_owned);
        if let Some(displaced) = fs.dir_entries_mut(new_parent)?.insert(new_owned, idx) {
            fs.nodes[displaced] = None;
        }
        Ok(())
    }

    fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let fs = self.lock();
        let idx = fs.resolve(&normalize_path(path))?;
        match &fs.node(idx)?.kind {
            NodeKind::Dir(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (name, child) in entries {
                    let stat = fs.node(*child)?.stat();
                    out.push(DirEntry::new(name.clone(), stat.is_dir, stat.mode, stat.size));
                }
                Ok(out)
            }
            NodeKind::File(_) => Err(VfsError::NotADirectory),
        }
    }

    fn fsync(&self, handle: u64) -> VfsResult<()> {
        let fs = self.lock();
        if fs.handles.contains_key(&handle) {
            Ok(())
        } else {
            Err(VfsError::BadHandle)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn create_write_read_roundtrip() {
        let fs = MemoryProvider::new();
        let h = fs.create("/a.txt", 0o644).unwrap();
        assert_eq!(fs.write(h, 0, b"hello").unwrap(), 5);
        assert_eq!(fs.read(h, 0, 64).unwrap(), b"hello");
        assert_eq!(fs.read(h, 2, 2).unwrap(), b"ll");
        assert!(fs.read(h, 100, 10).unwrap().is_empty());
        fs.release(h).unwrap();
        assert!(matches!(fs.read(h, 0, 1), Err(VfsError::BadHandle)));
    }

    #[test]
    fn write_grows_file_with_gap() {
        let fs = MemoryProvider::new();
        let h = fs.create("/gap", 0o644).unwrap();
        fs.write(h, 4, b"xy").unwrap();
        assert_eq!(fs.read(h, 0, 16).unwrap(), &[0, 0, 0, 0, b'x', b'y']);
        assert_eq!(fs.getattr("/gap").unwrap().size, 6);
    }

    #[test]
    fn mkdir_and_readdir() {
        let fs = MemoryProvider::new();
        fs.mkdir("/etc", 0o755).unwrap();
        fs.insert_file("/etc/hosts", 0o644, b"127.0.0.1 localhost")
            .unwrap();
        let entries = fs.readdir("/etc").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "hosts");
        assert!(!entries[0].is_dir);
        assert!(matches!(fs.mkdir("/etc", 0o755), Err(VfsError::AlreadyExists)));
    }

    #[test]
    fn unlink_and_rmdir_semantics() {
        let fs = MemoryProvider::new();
        fs.mkdir("/d", 0o755).unwrap();
        fs.insert_file("/d/f", 0o644, b"x").unwrap();
        assert!(matches!(fs.rmdir("/d"), Err(VfsError::NotEmpty)));
        assert!(matches!(fs.unlink("/d"), Err(VfsError::IsADirectory)));
        fs.unlink("/d/f").unwrap();
        fs.rmdir("/d").unwrap();
        assert!(matches!(fs.getattr("/d"), Err(VfsError::NotFound)));
    }

    #[test]
    fn rename_replaces_destination() {
        let fs = MemoryProvider::new();
        fs.insert_file("/a", 0o644, b"aaa").unwrap();
        fs.insert_file("/b", 0o644, b"bbb").unwrap();
        fs.rename("/a", "/b").unwrap();
        assert!(matches!(fs.getattr("/a"), Err(VfsError::NotFound)));
        assert_eq!(fs.read_file("/b").unwrap(), b"aaa");
    }

    #[test]
    fn setattr_truncates_and_chmods() {
        let fs = MemoryProvider::new();
        fs.insert_file("/t", 0o644, b"0123456789").unwrap();
        let stat = fs
            .setattr(
                "/t",
                &SetAttr {
                    size: Some(4),
                    mode: Some(0o600),
                    mtime: None,
                },
            )
            .unwrap();
        assert_eq!(stat.size, 4);
        assert_eq!(stat.mode, 0o600);
        assert_eq!(fs.read_file("/t").unwrap(), b"0123");
    }

    #[test]
    fn handles_are_monotonic() {
        let fs = MemoryProvider::new();
        let a = fs.create("/a", 0o644).unwrap();
        let b = fs.create("/b", 0o644).unwrap();
        assert!(b > a);
    }
}
