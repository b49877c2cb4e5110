//! The filesystem provider trait and its shared contracts.

use std::io;

use matchlock_proto::vfs::{DirEntry, FileStat};

/// Alias for `Result<T, VfsError>`.
pub type VfsResult<T> = Result<T, VfsError>;

/// Errors produced by providers. Each maps to a negative POSIX errno on the
/// wire.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum VfsError {
    /// Path does not exist.
    #[error("no such file or directory")]
    NotFound,

    /// Operation forbidden (read-only provider, mode bits).
    #[error("permission denied")]
    PermissionDenied,

    /// Path already exists.
    #[error("file exists")]
    AlreadyExists,

    /// A non-directory appeared where a directory was required.
    #[error("not a directory")]
    NotADirectory,

    /// A directory appeared where a file was required.
    #[error("is a directory")]
    IsADirectory,

    /// Directory not empty (rmdir).
    #[error("directory not empty")]
    NotEmpty,

    /// Handle does not refer to an open file.
    #[error("bad file handle")]
    BadHandle,

    /// Rename endpoints route to different providers.
    #[error("cross-provider rename")]
    CrossDevice,

    /// Malformed path argument.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl VfsError {
    /// Returns the negative POSIX errno reported on the wire.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => -2,           // ENOENT
            Self::Io(_) => -5,              // EIO
            Self::BadHandle => -9,          // EBADF
            Self::PermissionDenied => -13,  // EACCES
            Self::AlreadyExists => -17,     // EEXIST
            Self::CrossDevice => -18,       // EXDEV
            Self::NotADirectory => -20,     // ENOTDIR
            Self::IsADirectory => -21,      // EISDIR
            Self::InvalidPath(_) => -22,    // EINVAL
            Self::NotEmpty => -39,          // ENOTEMPTY
        }
    }

    /// Classifies an I/O error into the closest provider error.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            io::ErrorKind::DirectoryNotEmpty => Self::NotEmpty,
            io::ErrorKind::NotADirectory => Self::NotADirectory,
            io::ErrorKind::IsADirectory => Self::IsADirectory,
            _ => Self::Io(err),
        }
    }
}

/// Attribute updates for `setattr`. Unset fields are left unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct SetAttr {
    /// Truncate or extend to this size.
    pub size: Option<u64>,
    /// New permission bits.
    pub mode: Option<u32>,
    /// New modification time, seconds since the Unix epoch.
    pub mtime: Option<u64>,
}

/// One filesystem backend.
///
/// Contracts shared by all implementations:
/// - Paths are absolute and provider-relative (the router strips its mount
///   prefix before dispatch).
/// - Handles are opaque, monotonically assigned, and local to the provider
///   instance.
/// - `read` may return fewer bytes than requested at EOF; out-of-range reads
///   yield an empty buffer.
/// - `readdir` never returns `.` or `..`; ordering is unspecified.
/// - `rename` is atomic within one provider.
/// - Mutations of a single inode are totally ordered; independent paths do
///   not block one another beyond the provider's internal lock discipline.
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Resolves a path to its attributes.
    fn lookup(&self, path: &str) -> VfsResult<FileStat> {
        self.getattr(path)
    }

    /// Fetches attributes for a path.
    fn getattr(&self, path: &str) -> VfsResult<FileStat>;

    /// Applies attribute updates and returns the new attributes.
    fn setattr(&self, path: &str, attr: &SetAttr) -> VfsResult<FileStat>;

    /// Opens an existing file, returning an opaque handle.
    fn open(&self, path: &str, flags: u32) -> VfsResult<u64>;

    /// Releases an open handle.
    fn release(&self, handle: u64) -> VfsResult<()>;

    /// Reads up to `size` bytes at `offset`.
    fn read(&self, handle: u64, offset: u64, size: u64) -> VfsResult<Vec<u8>>;

    /// Writes `data` at `offset`, growing the file as needed. Returns the
    /// number of bytes written.
    fn write(&self, handle: u64, offset: u64, data: &[u8]) -> VfsResult<u64>;

    /// Creates a regular file with `mode` and opens it.
    fn create(&self, path: &str, mode: u32) -> VfsResult<u64>;

    /// Creates a directory with `mode`.
    fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()>;

    /// Removes a file.
    fn unlink(&self, path: &str) -> VfsResult<()>;

    /// Removes an empty directory.
    fn rmdir(&self, path: &str) -> VfsResult<()>;

    /// Atomically renames within this provider.
    fn rename(&self, old: &str, new: &str) -> VfsResult<()>;

    /// Enumerates a directory.
    fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>>;

    /// Flushes an open handle to stable storage.
    fn fsync(&self, handle: u64) -> VfsResult<()>;
}

/// Normalizes a path to a clean absolute form (`/a/b`).
///
/// `.` components are dropped and `..` pops — never above the root, so the
/// result cannot escape whatever tree the provider anchors it to.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_owned()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Splits a normalized path into `(parent, name)`.
///
/// Returns `None` for the root, which has no parent.
pub(crate) fn split_parent(path: &str) -> Option<(String, &str)> {
    if path == "/" {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent.to_owned(), &path[idx + 1..]))
}

/// Creates `path` and all missing ancestors on `provider`.
///
/// Existing directories are tolerated; an existing non-directory component
/// fails with `NotADirectory`.
pub fn mkdir_all(provider: &dyn Provider, path: &str, mode: u32) -> VfsResult<()> {
    let normalized = normalize_path(path);
    if normalized == "/" {
        return Ok(());
    }
    let mut current = String::new();
    for comp in normalized.split('/').filter(|c| !c.is_empty()) {
        current.push('/');
        current.push_str(comp);
        match provider.mkdir(&current, mode) {
            Ok(()) => {}
            Err(VfsError::AlreadyExists) => {
                if !provider.getattr(&current)?.is_dir {
                    return Err(VfsError::NotADirectory);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Seconds since the Unix epoch, saturating at zero.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_cleans_components() {
        assert_eq!(normalize_path("/a/b/c"), "/a/b/c");
        assert_eq!(normalize_path("a/b"), "/a/b");
        assert_eq!(normalize_path("/a/./b//c"), "/a/b/c");
        assert_eq!(normalize_path("/a/b/../c"), "/a/c");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn normalize_never_escapes_root() {
        assert_eq!(normalize_path("/../../etc/passwd"), "/etc/passwd");
        assert_eq!(normalize_path("../../.."), "/");
    }

    #[test]
    fn split_parent_basics() {
        assert_eq!(split_parent("/a/b"), Some(("/a".to_owned(), "b")));
        assert_eq!(split_parent("/a"), Some(("/".to_owned(), "a")));
        assert_eq!(split_parent("/"), None);
    }

    #[test]
    fn errno_values_are_posix() {
        assert_eq!(VfsError::NotFound.errno(), -2);
        assert_eq!(VfsError::PermissionDenied.errno(), -13);
        assert_eq!(VfsError::AlreadyExists.errno(), -17);
        assert_eq!(VfsError::CrossDevice.errno(), -18);
        assert_eq!(VfsError::NotEmpty.errno(), -39);
    }
}
