//! FUSE-over-vsock RPC records and framing.
//!
//! Each direction sends `u32 big-endian length || record`. Records are
//! postcard-serialized tagged structs; the operation enumeration is a closed
//! set. Errors travel as signed 32-bit POSIX-style codes on the response
//! (`0` = success, negative = errno).

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_FRAME;

/// Filesystem operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum VfsOp {
    /// Resolve a path to its attributes.
    Lookup,
    /// Fetch attributes for a path.
    Getattr,
    /// Update size/mode/mtime for a path.
    Setattr,
    /// Read from an open handle.
    Read,
    /// Write to an open handle.
    Write,
    /// Create a regular file and open it.
    Create,
    /// Create a directory.
    Mkdir,
    /// Remove a file.
    Unlink,
    /// Remove an empty directory.
    Rmdir,
    /// Rename within one mount.
    Rename,
    /// Open an existing file.
    Open,
    /// Release an open handle.
    Release,
    /// Enumerate a directory.
    Readdir,
    /// Flush an open handle to stable storage.
    Fsync,
    /// Create a directory and all missing parents.
    MkdirAll,
}

/// Stat record returned by lookup/getattr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct FileStat {
    /// File size in bytes (0 for directories).
    pub size: u64,
    /// Unix permission bits plus setuid/setgid/sticky.
    pub mode: u32,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: u64,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

impl FileStat {
    /// Constructs a stat record from its fields.
    #[must_use]
    pub const fn new(size: u64, mode: u32, mtime: u64, is_dir: bool) -> Self {
        Self {
            size,
            mode,
            mtime,
            is_dir,
        }
    }
}

/// One entry of a readdir response. `.` and `..` are never included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct DirEntry {
    /// Entry name (single path component).
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// Unix permission bits.
    pub mode: u32,
    /// File size in bytes.
    pub size: u64,
}

impl DirEntry {
    /// Constructs a readdir entry from its fields.
    #[must_use]
    pub fn new(name: String, is_dir: bool, mode: u32, size: u64) -> Self {
        Self {
            name,
            is_dir,
            mode,
            size,
        }
    }
}

/// A single filesystem request. Unused fields stay `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VfsRequest {
    /// Operation to perform.
    pub op: VfsOp,
    /// Primary path argument.
    pub path: Option<String>,
    /// Destination path (rename only).
    pub new_path: Option<String>,
    /// Open handle (read/write/release/fsync).
    pub handle: Option<u64>,
    /// Byte offset (read/write).
    pub offset: Option<u64>,
    /// Byte count (read) or setattr size.
    pub size: Option<u64>,
    /// Payload bytes (write).
    pub data: Option<Vec<u8>>,
    /// Open flags (open/create).
    pub flags: Option<u32>,
    /// Permission mode (create/mkdir/setattr).
    pub mode: Option<u32>,
}

impl VfsRequest {
    /// Creates a request with every argument unset.
    pub const fn new(op: VfsOp) -> Self {
        Self {
            op,
            path: None,
            new_path: None,
            handle: None,
            offset: None,
            size: None,
            data: None,
            flags: None,
            mode: None,
        }
    }

    /// Creates a request carrying only a path.
    pub fn for_path(op: VfsOp, path: impl Into<String>) -> Self {
        let mut req = Self::new(op);
        req.path = Some(path.into());
        req
    }
}

/// A single filesystem response. `err` is `0` on success, a negative
/// POSIX errno on failure; payload fields are set per-operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VfsResponse {
    /// `0` = success, negative POSIX errno otherwise.
    pub err: i32,
    /// Attributes (lookup/getattr/setattr).
    pub stat: Option<FileStat>,
    /// Read payload.
    pub data: Option<Vec<u8>>,
    /// Bytes accepted by a write.
    pub written: Option<u64>,
    /// Handle from open/create.
    pub handle: Option<u64>,
    /// Readdir entries.
    pub entries: Option<Vec<DirEntry>>,
}

impl VfsResponse {
    /// A bare success response.
    pub fn ok() -> Self {
        Self::default()
    }

    /// A failure response with the given negative errno.
    pub fn error(err: i32) -> Self {
        Self {
            err,
            ..Self::default()
        }
    }

    /// Sets the `stat` field.
    #[must_use]
    pub fn with_stat(mut self, stat: FileStat) -> Self {
        self.stat = Some(stat);
        self
    }

    /// Sets the `data` field.
    #[must_use]
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    /// Sets the `written` field.
    #[must_use]
    pub fn with_written(mut self, written: u64) -> Self {
        self.written = Some(written);
        self
    }

    /// Sets the `handle` field.
    #[must_use]
    pub fn with_handle(mut self, handle: u64) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Sets the `entries` field.
    #[must_use]
    pub fn with_entries(mut self, entries: Vec<DirEntry>) -> Self {
        self.entries = Some(entries);
        self
    }
}

/// Sends a postcard-serialized record with a 4-byte big-endian length prefix.
pub async fn send<T: Serialize>(w: &mut (impl AsyncWrite + Unpin), msg: &T) -> io::Result<()> {
    let payload =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds u32::MAX"))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    w.write_all(&frame).await?;
    w.flush().await
}

/// Receives and deserializes a length-prefixed record.
pub async fn recv<T: for<'de> Deserialize<'de>>(r: &mut (impl AsyncRead + Unpin)) -> io::Result<T> {
    let mut hdr = [0u8; 4];
    r.read_exact(&mut hdr).await?;
    let len = u32::from_be_bytes(hdr);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    postcard::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
