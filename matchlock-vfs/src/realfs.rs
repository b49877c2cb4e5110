//! Host-directory provider. Every guest path is normalized into the root;
//! `..` components clamp at the root, so the provider can never serve or
//! mutate anything outside it.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use matchlock_proto::vfs::{DirEntry, FileStat};

use crate::provider::{Provider, SetAttr, VfsError, VfsResult, normalize_path};

/// Provider rooted at a host directory.
#[derive(Debug)]
pub struct RealFsProvider {
    root: PathBuf,
    state: Mutex<Handles>,
}

#[derive(Debug, Default)]
struct Handles {
    open: HashMap<u64, File>,
    next: u64,
}

impl RealFsProvider {
    /// Creates a provider rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> VfsResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(VfsError::from_io)?;
        Ok(Self {
            root,
            state: Mutex::new(Handles {
                open: HashMap::new(),
                next: 1,
            }),
        })
    }

    /// Returns the host root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a guest path into the root. The normalized form cannot contain
    /// `..`, so the join cannot escape.
    fn host_path(&self, path: &str) -> PathBuf {
        let normalized = normalize_path(path);
        self.root.join(normalized.trim_start_matches('/'))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Handles> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_handle<T>(&self, handle: u64, f: impl FnOnce(&File) -> VfsResult<T>) -> VfsResult<T> {
        let state = self.lock();
        let file = state.open.get(&handle).ok_or(VfsError::BadHandle)?;
        f(file)
    }
}

fn stat_of(meta: &fs::Metadata) -> FileStat {
    FileStat::new(
        if meta.is_dir() { 0 } else { meta.len() },
        meta.permissions().mode() & 0o7777,
        meta.modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs()),
        meta.is_dir(),
    )
}

impl Provider for RealFsProvider {
    fn getattr(&self, path: &str) -> VfsResult<FileStat> {
        let meta = fs::symlink_metadata(self.host_path(path)).map_err(VfsError::from_io)?;
        Ok(stat_of(&meta))
    }

    fn setattr(&self, path: &str, attr: &SetAttr) -> VfsResult<FileStat> {
        let host = self.host_path(path);
        if let Some(size) = attr.size {
            let file = OpenOptions::new()
                .write(true)
                .open(&host)
                .map_err(VfsError::from_io)?;
            file.set_len(size).map_err(VfsError::from_io)?;
        }
        if let Some(mode) = attr.mode {
            fs::set_permissions(&host, fs::Permissions::from_mode(mode))
                .map_err(VfsError::from_io)?;
        }
        if let Some(mtime) = attr.mtime {
            let mtime = i64::try_from(mtime).unwrap_or(i64::MAX);
            filetime::set_file_mtime(&host, filetime::FileTime::from_unix_time(mtime, 0))
                .map_err(VfsError::from_io)?;
        }
        self.getattr(path)
    }

    fn open(&self, path: &str, _flags: u32) -> VfsResult<u64> {
        let host = self.host_path(path);
        let meta = fs::symlink_metadata(&host).map_err(VfsError::from_io)?;
        if meta.is_dir() {
            return Err(VfsError::IsADirectory);
        }
        // Prefer read-write; fall back to read-only for files the sandbox
        // user cannot modify.
        let file = match OpenOptions::new().read(true).write(true).open(&host) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                File::open(&host).map_err(VfsError::from_io)?
            }
            Err(e) => return Err(VfsError::from_io(e)),
        };
        let mut state = self.lock();
        let handle = state.next;
        state.next += 1;
        state.open.insert(handle, file);
        Ok(handle)
    }

    fn release(&self, handle: u64) -> VfsResult<()> {
        let mut state = self.lock();
        state.open.remove(&handle).map(|_| ()).ok_or(VfsError::BadHandle)
    }

    fn read(&self, handle: u64, offset: u64, size: u64) -> VfsResult<Vec<u8>> {
        self.with_handle(handle, |file| {
            let mut buf = vec![0u8; usize::try_from(size).unwrap_or(usize::MAX)];
            let n = file.read_at(&mut buf, offset).map_err(VfsError::from_io)?;
            buf.truncate(n);
            Ok(buf)
        })
    }

    fn write(&self, handle: u64, offset: u64, data: &[u8]) -> VfsResult<u64> {
        self.with_handle(handle, |file| {
            file.write_all_at(data, offset).map_err(VfsError::from_io)?;
            Ok(data.len() as u64)
        })
    }

    fn create(&self, path: &str, mode: u32) -> VfsResult<u64> {
        let host = self.host_path(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&host)
            .map_err(VfsError::from_io)?;
        let mut state = self.lock();
        let handle = state.next;
        state.next += 1;
        state.open.insert(handle, file);
        Ok(handle)
    }

    fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        let host = self.host_path(path);
        fs::create_dir(&host).map_err(VfsError::from_io)?;
        fs::set_permissions(&host, fs::Permissions::from_mode(mode)).map_err(VfsError::from_io)
    }

    fn unlink(&self, path: &str) -> VfsResult<()> {
        let host = self.host_path(path);
        let meta = fs::symlink_metadata(&host).map_err(VfsError::from_io)?;
        if meta.is_dir() {
            return Err(VfsError::IsADirectory);
        }
        fs::remove_file(&host).map_err(VfsError::from_io)
    }

    fn rmdir(&self, path: &str) -> VfsResult<()> {
        fs::remove_dir(self.host_path(path)).map_err(|e| {
            // remove_dir on a non-empty dir reports ENOTEMPTY via raw errno.
            if e.raw_os_error() == Some(libc_enotempty()) {
                VfsError::NotEmpty
            } else {
                VfsError::from_io(e)
            }
        })
    }

    fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        fs::rename(self.host_path(old), self.host_path(new)).map_err(VfsError::from_io)
    }

    fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.host_path(path)).map_err(VfsError::from_io)? {
            let entry = entry.map_err(VfsError::from_io)?;
            let meta = entry.metadata().map_err(VfsError::from_io)?;
            let stat = stat_of(&meta);
            out.push(DirEntry::new(
                entry.file_name().to_string_lossy().into_owned(),
                stat.is_dir,
                stat.mode,
                stat.size,
            ));
        }
        Ok(out)
    }

    fn fsync(&self, handle: u64) -> VfsResult<()> {
        self.with_handle(handle, |file| file.sync_all().map_err(VfsError::from_io))
    }
}

/// `ENOTEMPTY` without pulling the libc crate into this crate's surface.
const fn libc_enotempty() -> i32 {
    39
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn provider() -> (tempfile::TempDir, RealFsProvider) {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFsProvider::new(dir.path()).unwrap();
        (dir, fs)
    }

    #[test]
    fn paths_cannot_escape_root() {
        let (dir, fs) = provider();
        let h = fs.create("/../../escape.txt", 0o644).unwrap();
        fs.write(h, 0, b"inside").unwrap();
        fs.release(h).unwrap();
        assert!(dir.path().join("escape.txt").exists());
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn create_write_read() {
        let (_dir, fs) = provider();
        let h = fs.create("/f.txt", 0o600).unwrap();
        fs.write(h, 0, b"content").unwrap();
        assert_eq!(fs.read(h, 0, 100).unwrap(), b"content");
        assert_eq!(fs.read(h, 3, 2).unwrap(), b"te");
        fs.fsync(h).unwrap();
        fs.release(h).unwrap();
        let stat = fs.getattr("/f.txt").unwrap();
        assert_eq!(stat.size, 7);
        assert_eq!(stat.mode & 0o777, 0o600);
    }

    #[test]
    fn mkdir_readdir_rmdir() {
        let (_dir, fs) = provider();
        fs.mkdir("/sub", 0o755).unwrap();
        let h = fs.create("/sub/x", 0o644).unwrap();
        fs.release(h).unwrap();
        let entries = fs.readdir("/sub").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "x");
        assert!(matches!(fs.rmdir("/sub"), Err(VfsError::NotEmpty)));
        fs.unlink("/sub/x").unwrap();
        fs.rmdir("/sub").unwrap();
    }

    #[test]
    fn rename_within_provider() {
        let (_dir, fs) = provider();
        let h = fs.create("/a", 0o644).unwrap();
        fs.release(h).unwrap();
        fs.rename("/a", "/b").unwrap();
        assert!(matches!(fs.getattr("/a"), Err(VfsError::NotFound)));
        assert!(fs.getattr("/b").is_ok());
    }

    #[test]
    fn setattr_truncate_and_mtime() {
        let (_dir, fs) = provider();
        let h = fs.create("/t", 0o644).unwrap();
        fs.write(h, 0, b"0123456789").unwrap();
        fs.release(h).unwrap();
        let stat = fs
            .setattr(
                "/t",
                &SetAttr {
                    size: Some(3),
                    mode: None,
                    mtime: Some(1_600_000_000),
                },
            )
            .unwrap();
        assert_eq!(stat.size, 3);
        assert_eq!(stat.mtime, 1_600_000_000);
    }

    #[test]
    fn missing_file_is_not_found() {
        let (_dir, fs) = provider();
        assert!(matches!(fs.getattr("/nope"), Err(VfsError::NotFound)));
        assert!(matches!(fs.open("/nope", 0), Err(VfsError::NotFound)));
    }
}
