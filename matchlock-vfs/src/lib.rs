//! Virtual filesystem core for matchlock sandboxes.
//!
//! A [`Provider`] is one filesystem backend; the [`MountRouter`] composes
//! providers under guest path prefixes; the [`VfsServer`] serves a router to
//! the in-guest FUSE daemon over any byte stream (the vsock-backed Unix
//! socket in production).
//!
//! Providers:
//! - [`MemoryProvider`] — host-RAM tree with mode/mtime metadata.
//! - [`RealFsProvider`] — rooted at a host directory, never escaping it.
//! - [`ReadonlyProvider`] — wraps any provider, failing every mutating op.
//! - [`OverlayProvider`] — upper + lower with copy-up and whiteouts.

mod memory;
mod overlay;
mod provider;
mod readonly;
mod realfs;
mod router;
mod server;

pub use memory::MemoryProvider;
pub use overlay::OverlayProvider;
pub use provider::{Provider, SetAttr, VfsError, VfsResult, mkdir_all, normalize_path};
pub use readonly::ReadonlyProvider;
pub use realfs::RealFsProvider;
pub use router::MountRouter;
pub use server::VfsServer;
