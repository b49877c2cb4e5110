//! Image layer storage for matchlock micro-VM sandboxes.
//!
//! Pulls OCI images, materialises each layer as a read-only filesystem blob,
//! and tracks everything in a content-addressed, refcounted catalog:
//!
//! ```text
//! {root}/images/
//!   metadata.db   — SQLite: images, image_layers, layer_refs
//!   blobs/        — content-addressed filesystem blobs ({digest}.{fs_type})
//! ```
//!
//! The [`ImageBuilder`] turns an image reference into a [`BuildResult`]; the
//! [`LayerStore`] owns persistence, refcounting and garbage collection.

mod builder;
mod catalog;
mod erofs;
mod extract;
mod reference;
mod registry;
mod store;

use std::path::PathBuf;

pub use builder::{ImageBuilder, squash_digest};
pub use extract::extract_layer;
pub use reference::ImageRef;
pub use store::{LayerStore, SaveMeta, StoreStats};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from image and layer operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The image reference string could not be parsed.
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// The image (or one of its blobs) is not present locally.
    #[error("image not found: {0}")]
    NotFound(String),

    /// Catalog / database error.
    #[error("catalog: {0}")]
    Db(String),

    /// Registry protocol error.
    #[error("registry: {0}")]
    Registry(String),

    /// No manifest matched the host platform.
    #[error("no manifest for {arch}/{os}")]
    NoPlatform {
        /// Requested architecture.
        arch: String,
        /// Requested operating system.
        os: String,
    },

    /// Downloaded content did not hash to the expected digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest the manifest promised.
        expected: String,
        /// Digest the bytes produced.
        actual: String,
    },

    /// An external filesystem tool failed.
    #[error("{tool}: {message}")]
    Tool {
        /// Tool binary name.
        tool: &'static str,
        /// Captured stderr or exit description.
        message: String,
    },

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Catalog scope separating user-tagged images from the pull cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Scope {
    /// User-tagged images (`save_tag`).
    Local,
    /// Pull-cache entries keyed by full reference.
    Registry,
}

impl Scope {
    /// Catalog column value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Registry => "registry",
        }
    }
}

/// Filesystem format of a layer blob. Closed set; the schema is extensible
/// but only erofs is produced today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FsType {
    /// Read-only EROFS image.
    Erofs,
}

impl FsType {
    /// Blob filename suffix and catalog column value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Erofs => "erofs",
        }
    }

    /// Parses a catalog column value.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "erofs" => Ok(Self::Erofs),
            other => Err(Error::Db(format!("unknown fs_type: {other}"))),
        }
    }
}

/// One materialised layer blob.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct LayerRef {
    /// Content digest (`sha256:<hex>` of the uncompressed layer tar).
    pub digest: String,
    /// Blob filesystem format.
    pub fs_type: FsType,
    /// Stored bytes (allocation-aware, used for GC sizing).
    pub size: u64,
    /// Blob path on the host.
    pub path: PathBuf,
}

/// Where an image row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ImageSource {
    /// Pulled from a registry.
    Registry,
    /// Tagged locally from an existing build result.
    Tag,
    /// Imported from a tarball.
    Import,
}

impl ImageSource {
    /// Catalog column value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::Tag => "tag",
            Self::Import => "import",
        }
    }

    /// Parses a catalog column value.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "registry" => Ok(Self::Registry),
            "tag" => Ok(Self::Tag),
            "import" => Ok(Self::Import),
            other => Err(Error::Db(format!("unknown image source: {other}"))),
        }
    }
}

/// Subset of the OCI image configuration relevant to sandbox execution.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub struct ImageConfig {
    /// Default user (`USER` directive).
    #[serde(default, alias = "User")]
    pub user: Option<String>,
    /// Default working directory.
    #[serde(default, alias = "WorkingDir")]
    pub working_dir: Option<String>,
    /// Default entrypoint (`ENTRYPOINT`).
    #[serde(default, alias = "Entrypoint")]
    pub entrypoint: Option<Vec<String>>,
    /// Default command (`CMD`).
    #[serde(default, alias = "Cmd")]
    pub cmd: Option<Vec<String>>,
    /// Default environment variables (`KEY=VALUE`).
    #[serde(default, alias = "Env")]
    pub env: Option<Vec<String>>,
}

impl ImageConfig {
    /// Sets the `env` field.
    #[must_use]
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Returns entrypoint + cmd joined as the final execution command.
    pub fn command(&self) -> Vec<String> {
        let mut parts = Vec::new();
        if let Some(ref ep) = self.entrypoint {
            parts.extend(ep.iter().cloned());
        }
        if let Some(ref cmd) = self.cmd {
            parts.extend(cmd.iter().cloned());
        }
        parts
    }
}

/// Catalog row describing a stored image.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ImageMeta {
    /// Tag (local scope) or full reference (registry scope).
    pub tag: String,
    /// Manifest digest.
    pub digest: String,
    /// Total stored bytes across layers.
    pub size: u64,
    /// Creation timestamp (catalog-local, ISO 8601).
    pub created_at: String,
    /// Provenance of the row.
    pub source: ImageSource,
}

/// Materialised image ready to boot.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct BuildResult {
    /// Manifest digest.
    pub digest: String,
    /// Ordered per-layer canonical blobs.
    pub layers: Vec<LayerRef>,
    /// Total stored bytes across layers.
    pub size: u64,
    /// Whether the result came from cache.
    pub cached: bool,
    /// Runtime lower path the guest mounts (the squashed blob when one is
    /// pinned, otherwise the last layer).
    pub rootfs_path: PathBuf,
    /// OCI execution defaults, when the image carried them.
    pub config: Option<ImageConfig>,
}
