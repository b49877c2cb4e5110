//! Upper/lower overlay with copy-up and OCI-style whiteouts.
//!
//! Reads fall through upper → lower. All mutations land in the upper layer;
//! a file that exists only in the lower layer is copied up on first write.
//! Deletions of lower entries are recorded as `.wh.NAME` whiteout files in
//! the upper layer; an upper directory containing `.wh..wh..opq` hides the
//! whole lower directory.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use matchlock_proto::vfs::{DirEntry, FileStat};

use crate::provider::{
    Provider, SetAttr, VfsError, VfsResult, normalize_path, split_parent,
};

/// Whiteout file prefix masking one lower entry.
const WHITEOUT_PREFIX: &str = ".wh.";
/// Marker hiding the entire lower directory contents.
const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Copy-up chunk size.
const COPY_CHUNK: u64 = 1 << 16;

/// Overlay of a writable upper provider over a lower provider.
#[derive(Debug)]
pub struct OverlayProvider {
    upper: Arc<dyn Provider>,
    lower: Arc<dyn Provider>,
    state: std::sync::Mutex<OverlayState>,
}

#[derive(Debug, Default)]
struct OverlayState {
    handles: HashMap<u64, OverlayHandle>,
    next: u64,
}

#[derive(Debug, Clone)]
struct OverlayHandle {
    path: String,
    side: Side,
    inner: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Upper,
    Lower,
}

impl OverlayProvider {
    /// Builds an overlay from `upper` (writable) and `lower` layers.
    pub fn new(upper: Arc<dyn Provider>, lower: Arc<dyn Provider>) -> Self {
        Self {
            upper,
            lower,
            state: std::sync::Mutex::new(OverlayState {
                handles: HashMap::new(),
                next: 1,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OverlayState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn whiteout_path(path: &str) -> Option<String> {
        let (parent, name) = split_parent(path)?;
        if parent == "/" {
            Some(format!("/{WHITEOUT_PREFIX}{name}"))
        } else {
            Some(format!("{parent}/{WHITEOUT_PREFIX}{name}"))
        }
    }

    fn is_internal_name(path: &str) -> bool {
        split_parent(path).is_some_and(|(_, name)| name.starts_with(WHITEOUT_PREFIX))
    }

    fn upper_has(&self, path: &str) -> bool {
        self.upper.getattr(path).is_ok()
    }

    /// Whether a lower entry shows through at `path`: the entry exists in
    /// the lower layer and neither a whiteout nor an ancestor opaque marker
    /// masks it.
    fn lower_visible(&self, path: &str) -> bool {
        if self.lower.getattr(path).is_err() {
            return false;
        }
        // Check the entry itself and every ancestor for whiteouts, and every
        // strict ancestor for opaque markers.
        let mut current = String::new();
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        for (i, comp) in components.iter().enumerate() {
            let parent_dir = if current.is_empty() { "/" } else { current.as_str() };
            let wh = if parent_dir == "/" {
                format!("/{WHITEOUT_PREFIX}{comp}")
            } else {
                format!("{parent_dir}/{WHITEOUT_PREFIX}{comp}")
            };
            if self.upper.getattr(&wh).is_ok() {
                return false;
            }
            current = if parent_dir == "/" {
                format!("/{comp}")
            } else {
                format!("{parent_dir}/{comp}")
            };
            // An opaque marker on a strict ancestor hides everything below
            // unless the descendant also exists in the upper layer.
            if i + 1 < components.len() {
                let marker = format!("{current}/{OPAQUE_MARKER}");
                if self.upper.getattr(&marker).is_ok() {
                    return false;
                }
            }
        }
        true
    }

    /// Replicates the lower directory chain above `path` into the upper
    /// layer so copy-up targets have parents.
    fn ensure_upper_parents(&self, path: &str) -> VfsResult<()> {
        let Some((parent, _)) = split_parent(path) else {
            return Ok(());
        };
        if parent == "/" {
            return Ok(());
        }
        let mut current = String::new();
        for comp in parent.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(comp);
            if self.upper_has(&current) {
                continue;
            }
            let mode = self.lower.getattr(&current).map_or(0o755, |s| s.mode);
            match self.upper.mkdir(&current, mode) {
                Ok(()) | Err(VfsError::AlreadyExists) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Copies a lower-only file into the upper layer, preserving its mode.
    fn copy_up(&self, path: &str) -> VfsResult<()> {
        let stat = self.lower.getattr(path)?;
        if stat.is_dir {
            self.ensure_upper_parents(path)?;
            match self.upper.mkdir(path, stat.mode) {
                Ok(()) | Err(VfsError::AlreadyExists) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        let src = self.lower.open(path, 0)?;
        let copy = (|| {
            self.ensure_upper_parents(path)?;
            let dst = self.upper.create(path, stat.mode)?;
            let mut offset = 0u64;
            loop {
                let chunk = self.lower.read(src, offset, COPY_CHUNK)?;
                if chunk.is_empty() {
                    break;
                }
                self.upper.write(dst, offset, &chunk)?;
                offset += chunk.len() as u64;
            }
            self.upper.release(dst)
        })();
        let _ = self.lower.release(src);
        copy
    }

    /// Records a whiteout for `path` in the upper layer.
    fn add_whiteout(&self, path: &str) -> VfsResult<()> {
        let Some(wh) = Self::whiteout_path(path) else {
            return Err(VfsError::InvalidPath("cannot whiteout the root".into()));
        };
        self.ensure_upper_parents(path)?;
        match self.upper.create(&wh, 0o000) {
            Ok(h) => self.upper.release(h),
            Err(VfsError::AlreadyExists) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drops a stale whiteout when a path is re-created.
    fn clear_whiteout(&self, path: &str) {
        if let Some(wh) = Self::whiteout_path(path) {
            let _ = self.upper.unlink(&wh);
        }
    }

    fn merged_exists(&self, path: &str) -> bool {
        self.upper_has(path) || self.lower_visible(path)
    }
}

impl Provider for OverlayProvider {
    fn getattr(&self, path: &str) -> VfsResult<FileStat> {
        let path = normalize_path(path);
        if Self::is_internal_name(&path) {
            return Err(VfsError::NotFound);
        }
        if let Ok(stat) = self.upper.getattr(&path) {
            return Ok(stat);
        }
        if self.lower_visible(&path) {
            return self.lower.getattr(&path);
        }
        Err(VfsError::NotFound)
    }

    fn setattr(&self, path: &str, attr: &SetAttr) -> VfsResult<FileStat> {
        let path = normalize_path(path);
        if !self.upper_has(&path) {
            if !self.lower_visible(&path) {
                return Err(VfsError::NotFound);
            }
            self.copy_up(&path)?;
        }
        self.upper.setattr(&path, attr)
    }

    fn open(&self, path: &str, flags: u32) -> VfsResult<u64> {
        let path = normalize_path(path);
        if Self::is_internal_name(&path) {
            return Err(VfsError::NotFound);
        }
        let (side, inner) = if self.upper_has(&path) {
            (Side::Upper, self.upper.open(&path, flags)?)
        } else if self.lower_visible(&path) {
            (Side::Lower, self.lower.open(&path, flags)?)
        } else {
            return Err(VfsError::NotFound);
        };
        let mut state = self.lock();
        let handle = state.next;
        state.next += 1;
        state.handles.insert(handle, OverlayHandle { path, side, inner });
        Ok(handle)
    }

    fn release(&self, handle: u64) -> VfsResult<()> {
        let entry = self.lock().handles.remove(&handle).ok_or(VfsError::BadHandle)?;
        match entry.side {
            Side::Upper => self.upper.release(entry.inner),
            Side::Lower => self.lower.release(entry.inner),
        }
    }

    fn read(&self, handle: u64, offset: u64, size: u64) -> VfsResult<Vec<u8>> {
        let entry = self
            .lock()
            .handles
            .get(&handle)
            .cloned()
            .ok_or(VfsError::BadHandle)?;
        match entry.side {
            Side::Upper => self.upper.read(entry.inner, offset, size),
            Side::Lower => self.lower.read(entry.inner, offset, size),
        }
    }

    fn write(&self, handle: u64, offset: u64, data: &[u8]) -> VfsResult<u64> {
        let mut state = self.lock();
        let entry = state.handles.get(&handle).cloned().ok_or(VfsError::BadHandle)?;
        let upper_handle = match entry.side {
            Side::Upper => entry.inner,
            Side::Lower => {
                // First write to a lower-only file: copy up, then swap the
                // handle to the upper copy. The lock stays held so two
                // writers on the same handle cannot race the swap.
                self.copy_up(&entry.path)?;
                let _ = self.lower.release(entry.inner);
                let new_inner = self.upper.open(&entry.path, 0)?;
                if let Some(slot) = state.handles.get_mut(&handle) {
                    slot.side = Side::Upper;
                    slot.inner = new_inner;
                }
                new_inner
            }
        };
        drop(state);
        self.upper.write(upper_handle, offset, data)
    }

    fn create(&self, path: &str, mode: u32) -> VfsResult<u64> {
        let path = normalize_path(path);
        if Self::is_internal_name(&path) {
            return Err(VfsError::InvalidPath("reserved name".into()));
        }
        if self.merged_exists(&path) {
            return Err(VfsError::AlreadyExists);
        }
        self.ensure_upper_parents(&path)?;
        let inner = self.upper.create(&path, mode)?;
        self.clear_whiteout(&path);
        let mut state = self.lock();
        let handle = state.next;
        state.next += 1;
        state.handles.insert(
            handle,
            OverlayHandle {
                path,
                side: Side::Upper,
                inner,
            },
        );
        Ok(handle)
    }

    fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        let path = normalize_path(path);
        if Self::is_internal_name(&path) {
            return Err(VfsError::InvalidPath("reserved name".into()));
        }
        if self.merged_exists(&path) {
            return Err(VfsError::AlreadyExists);
        }
        self.ensure_upper_parents(&path)?;
        self.upper.mkdir(&path, mode)?;
        self.clear_whiteout(&path);
        Ok(())
    }

    fn unlink(&self, path: &str) -> VfsResult<()> {
        let path = normalize_path(path);
        let in_upper = self.upper_has(&path);
        let in_lower = self.lower_visible(&path);
        if !in_upper && !in_lower {
            return Err(VfsError::NotFound);
        }
        if self.getattr(&path)?.is_dir {
            return Err(VfsError::IsADirectory);
        }
        if in_upper {
            self.upper.unlink(&path)?;
        }
        if self.lower.getattr(&path).is_ok() {
            self.add_whiteout(&path)?;
        }
        Ok(())
    }

    fn rmdir(&self, path: &str) -> VfsResult<()> {
        let path = normalize_path(path);
        let stat = self.getattr(&path)?;
        if !stat.is_dir {
            return Err(VfsError::NotADirectory);
        }
        if !self.readdir(&path)?.is_empty() {
            return Err(VfsError::NotEmpty);
        }
        if self.upper_has(&path) {
            // Clear masking artifacts (whiteouts, opaque marker) so the
            // upper directory is physically empty.
            for entry in self.upper.readdir(&path)? {
                if entry.name.starts_with(WHITEOUT_PREFIX) {
                    let child = if path == "/" {
                        format!("/{}", entry.name)
                    } else {
                        format!("{path}/{}", entry.name)
                    };
                    let _ = self.upper.unlink(&child);
                }
            }
            self.upper.rmdir(&path)?;
        }
        if self.lower.getattr(&path).is_ok() {
            self.add_whiteout(&path)?;
        }
        Ok(())
    }

    fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        let old = normalize_path(old);
        let new = normalize_path(new);
        let stat = self.getattr(&old)?;
        if stat.is_dir {
            // Directory renames are only supported when the tree lives
            // entirely in the upper layer.
            if self.lower.getattr(&old).is_ok() || !self.upper_has(&old) {
                return Err(VfsError::CrossDevice);
            }
            self.ensure_upper_parents(&new)?;
            self.upper.rename(&old, &new)?;
            self.clear_whiteout(&new);
            return Ok(());
        }
        if !self.upper_has(&old) {
            self.copy_up(&old)?;
        }
        self.ensure_upper_parents(&new)?;
        self.upper.rename(&old, &new)?;
        self.clear_whiteout(&new);
        if self.lower.getattr(&old).is_ok() {
            self.add_whiteout(&old)?;
        }
        Ok(())
    }

    fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let path = normalize_path(path);
        let upper_listing = match self.upper.readdir(&path) {
            Ok(entries) => Some(entries),
            Err(VfsError::NotFound) => None,
            Err(e) => return Err(e),
        };
        let lower_dir_visible = self.lower_visible(&path) && {
            match self.lower.getattr(&path) {
                Ok(stat) => stat.is_dir,
                Err(_) => false,
            }
        };
        if upper_listing.is_none() && !lower_dir_visible {
            return Err(VfsError::NotFound);
        }

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut whiteouts = HashSet::new();
        let mut opaque = false;

        if let Some(entries) = upper_listing {
            for entry in entries {
                if entry.name == OPAQUE_MARKER {
                    opaque = true;
                } else if let Some(masked) = entry.name.strip_prefix(WHITEOUT_PREFIX) {
                    whiteouts.insert(masked.to_owned());
                } else {
                    seen.insert(entry.name.clone());
                    out.push(entry);
                }
            }
        }

        if lower_dir_visible && !opaque {
            for entry in self.lower.readdir(&path)? {
                if seen.contains(&entry.name) || whiteouts.contains(&entry.name) {
                    continue;
                }
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn fsync(&self, handle: u64) -> VfsResult<()> {
        let entry = self
            .lock()
            .handles
            .get(&handle)
            .cloned()
            .ok_or(VfsError::BadHandle)?;
        match entry.side {
            Side::Upper => self.upper.fsync(entry.inner),
            Side::Lower => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;

    fn overlay_with_lower(files: &[(&str, &[u8])]) -> (Arc<MemoryProvider>, OverlayProvider) {
        let upper = Arc::new(MemoryProvider::new());
        let lower = Arc::new(MemoryProvider::new());
        for (path, data) in files {
            lower.insert_file(path, 0o644, data).unwrap();
        }
        let ov = OverlayProvider::new(Arc::clone(&upper) as Arc<dyn Provider>, lower);
        (upper, ov)
    }

    #[test]
    fn copy_up_preserves_lower() {
        let (_upper, ov) = overlay_with_lower(&[("/a.txt", b"hi")]);

        let h = ov.open("/a.txt", 0).unwrap();
        assert_eq!(ov.read(h, 0, 16).unwrap(), b"hi");
        ov.write(h, 0, b"ho").unwrap();
        assert_eq!(ov.read(h, 0, 16).unwrap(), b"ho");
        ov.release(h).unwrap();

        // Lower copy is untouched; overlay serves the upper copy.
        let h2 = ov.open("/a.txt", 0).unwrap();
        assert_eq!(ov.read(h2, 0, 16).unwrap(), b"ho");
        ov.release(h2).unwrap();

        ov.unlink("/a.txt").unwrap();
        assert!(ov.readdir("/").unwrap().is_empty());
        assert!(matches!(ov.getattr("/a.txt"), Err(VfsError::NotFound)));
    }

    #[test]
    fn lower_layer_unchanged_after_write() {
        let lower = Arc::new(MemoryProvider::new());
        lower.insert_file("/a.txt", 0o644, b"hi").unwrap();
        let upper = Arc::new(MemoryProvider::new());
        let ov = OverlayProvider::new(
            Arc::clone(&upper) as Arc<dyn Provider>,
            Arc::clone(&lower) as Arc<dyn Provider>,
        );

        let h = ov.open("/a.txt", 0).unwrap();
        ov.write(h, 0, b"ho").unwrap();
        ov.release(h).unwrap();

        assert_eq!(lower.read_file("/a.txt").unwrap(), b"hi");
        assert_eq!(upper.read_file("/a.txt").unwrap(), b"ho");
    }

    #[test]
    fn whiteout_masks_lower_entry() {
        let (_upper, ov) = overlay_with_lower(&[("/doomed", b"x"), ("/kept", b"y")]);
        ov.unlink("/doomed").unwrap();
        let names: Vec<String> = ov.readdir("/").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["kept".to_owned()]);
        assert!(matches!(ov.open("/doomed", 0), Err(VfsError::NotFound)));
        // Re-creating the path drops the whiteout.
        let h = ov.create("/doomed", 0o644).unwrap();
        ov.write(h, 0, b"reborn").unwrap();
        ov.release(h).unwrap();
        assert_eq!(ov.getattr("/doomed").unwrap().size, 6);
    }

    #[test]
    fn readdir_merges_upper_and_lower() {
        let (_upper, ov) = overlay_with_lower(&[("/lower_only", b"1"), ("/both", b"lower")]);
        let h = ov.create("/upper_only", 0o644).unwrap();
        ov.release(h).unwrap();
        let h = ov.open("/both", 0).unwrap();
        ov.write(h, 0, b"upper").unwrap();
        ov.release(h).unwrap();

        let mut names: Vec<String> =
            ov.readdir("/").unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, vec!["both", "lower_only", "upper_only"]);
    }

    #[test]
    fn opaque_marker_hides_lower_directory() {
        let upper = Arc::new(MemoryProvider::new());
        let lower = Arc::new(MemoryProvider::new());
        lower.insert_file("/d/old", 0o644, b"stale").unwrap();
        upper.insert_file("/d/.wh..wh..opq", 0o000, b"").unwrap();
        upper.insert_file("/d/new", 0o644, b"fresh").unwrap();
        let ov = OverlayProvider::new(upper, lower);

        let names: Vec<String> =
            ov.readdir("/d").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["new".to_owned()]);
        assert!(matches!(ov.getattr("/d/old"), Err(VfsError::NotFound)));
    }

    #[test]
    fn setattr_copies_up_lower_file() {
        let (upper, ov) = overlay_with_lower(&[("/f", b"data")]);
        let stat = ov
            .setattr(
                "/f",
                &SetAttr {
                    size: None,
                    mode: Some(0o600),
                    mtime: None,
                },
            )
            .unwrap();
        assert_eq!(stat.mode, 0o600);
        assert_eq!(upper.read_file("/f").unwrap(), b"data");
    }

    #[test]
    fn rename_lower_file_whiteouts_source() {
        let (_upper, ov) = overlay_with_lower(&[("/src", b"move me")]);
        ov.rename("/src", "/dst").unwrap();
        assert!(matches!(ov.getattr("/src"), Err(VfsError::NotFound)));
        let h = ov.open("/dst", 0).unwrap();
        assert_eq!(ov.read(h, 0, 64).unwrap(), b"move me");
        ov.release(h).unwrap();
        let names: Vec<String> = ov.readdir("/").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["dst".to_owned()]);
    }

    #[test]
    fn rmdir_of_lower_dir_records_whiteout() {
        let upper = Arc::new(MemoryProvider::new());
        let lower = Arc::new(MemoryProvider::new());
        lower.mkdir("/empty", 0o755).unwrap();
        let ov = OverlayProvider::new(upper, lower);

        ov.rmdir("/empty").unwrap();
        assert!(matches!(ov.getattr("/empty"), Err(VfsError::NotFound)));
        assert!(ov.readdir("/").unwrap().is_empty());
    }

    #[test]
    fn nested_copy_up_creates_parents() {
        let (upper, ov) = overlay_with_lower(&[("/a/b/c.txt", b"deep")]);
        let h = ov.open("/a/b/c.txt", 0).unwrap();
        ov.write(h, 4, b"er").unwrap();
        ov.release(h).unwrap();
        assert_eq!(upper.read_file("/a/b/c.txt").unwrap(), b"deeper");
        assert!(ov.getattr("/a/b").unwrap().is_dir);
    }
}
