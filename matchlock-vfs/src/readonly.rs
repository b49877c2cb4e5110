//! Read-only wrapper: observationally identical to the inner provider for
//! non-mutating operations, permission-denied for everything else.

use std::sync::Arc;

use matchlock_proto::vfs::{DirEntry, FileStat};

use crate::provider::{Provider, SetAttr, VfsError, VfsResult};

/// Wraps any provider and rejects every mutating operation.
#[derive(Debug, Clone)]
pub struct ReadonlyProvider {
    inner: Arc<dyn Provider>,
}

impl ReadonlyProvider {
    /// Wraps `inner`.
    pub fn wrap(inner: Arc<dyn Provider>) -> Self {
        Self { inner }
    }
}

impl Provider for ReadonlyProvider {
    fn lookup(&self, path: &str) -> VfsResult<FileStat> {
        self.inner.lookup(path)
    }

    fn getattr(&self, path: &str) -> VfsResult<FileStat> {
        self.inner.getattr(path)
    }

    fn setattr(&self, _path: &str, _attr: &SetAttr) -> VfsResult<FileStat> {
        Err(VfsError::PermissionDenied)
    }

    fn open(&self, path: &str, flags: u32) -> VfsResult<u64> {
        self.inner.open(path, flags)
    }

    fn release(&self, handle: u64) -> VfsResult<()> {
        self.inner.release(handle)
    }

    fn read(&self, handle: u64, offset: u64, size: u64) -> VfsResult<Vec<u8>> {
        self.inner.read(handle, offset, size)
    }

    fn write(&self, _handle: u64, _offset: u64, _data: &[u8]) -> VfsResult<u64> {
        Err(VfsError::PermissionDenied)
    }

    fn create(&self, _path: &str, _mode: u32) -> VfsResult<u64> {
        Err(VfsError::PermissionDenied)
    }

    fn mkdir(&self, _path: &str, _mode: u32) -> VfsResult<()> {
        Err(VfsError::PermissionDenied)
    }

    fn unlink(&self, _path: &str) -> VfsResult<()> {
        Err(VfsError::PermissionDenied)
    }

    fn rmdir(&self, _path: &str) -> VfsResult<()> {
        Err(VfsError::PermissionDenied)
    }

    fn rename(&self, _old: &str, _new: &str) -> VfsResult<()> {
        Err(VfsError::PermissionDenied)
    }

    fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        self.inner.readdir(path)
    }

    fn fsync(&self, _handle: u64) -> VfsResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;

    fn wrapped() -> ReadonlyProvider {
        let mem = MemoryProvider::new();
        mem.insert_file("/data.txt", 0o644, b"immutable").unwrap();
        mem.mkdir("/dir", 0o755).unwrap();
        ReadonlyProvider::wrap(Arc::new(mem))
    }

    #[test]
    fn reads_pass_through() {
        let ro = wrapped();
        assert_eq!(ro.getattr("/data.txt").unwrap().size, 9);
        let h = ro.open("/data.txt", 0).unwrap();
        assert_eq!(ro.read(h, 0, 64).unwrap(), b"immutable");
        ro.release(h).unwrap();
        assert_eq!(ro.readdir("/").unwrap().len(), 2);
    }

    #[test]
    fn every_mutating_op_fails() {
        let ro = wrapped();
        assert!(matches!(ro.create("/x", 0o644), Err(VfsError::PermissionDenied)));
        assert!(matches!(ro.mkdir("/y", 0o755), Err(VfsError::PermissionDenied)));
        assert!(matches!(ro.unlink("/data.txt"), Err(VfsError::PermissionDenied)));
        assert!(matches!(ro.rmdir("/dir"), Err(VfsError::PermissionDenied)));
        assert!(matches!(
            ro.rename("/data.txt", "/renamed"),
            Err(VfsError::PermissionDenied)
        ));
        assert!(matches!(
            ro.setattr("/data.txt", &SetAttr::default()),
            Err(VfsError::PermissionDenied)
        ));
        let h = ro.open("/data.txt", 0).unwrap();
        assert!(matches!(ro.write(h, 0, b"z"), Err(VfsError::PermissionDenied)));
        ro.release(h).unwrap();
        // Inner provider is untouched.
        assert_eq!(ro.getattr("/data.txt").unwrap().size, 9);
    }
}
