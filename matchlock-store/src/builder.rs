//! Image builder: materialises an image reference into layer store entries.
//!
//! A pull enumerates the OCI layers, computes each diff-id (sha256 of the
//! uncompressed tar), and ensures two kinds of blobs:
//!
//! - one canonical EROFS blob per layer, keyed by diff-id, for cross-image
//!   dedup;
//! - one **squashed** blob per image — all layers replayed in order into a
//!   single tree — keyed by a deterministic digest over the diff-ids. The
//!   squashed blob is always the runtime lower path (every image gets one;
//!   see DESIGN.md for the call-site rule).

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::reference::ImageRef;
use crate::store::{LayerStore, SaveMeta};
use crate::{
    BuildResult, Error, FsType, ImageConfig, ImageSource, LayerRef, Result, Scope, erofs, extract,
    registry,
};

/// Domain prefix for the squashed-image digest.
const SQUASH_DOMAIN: &str = "matchlock-squash-v1";

/// Materialises image references via the registry and the layer store.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    store: Arc<LayerStore>,
}

impl ImageBuilder {
    /// Creates a builder over the given store.
    pub fn new(store: Arc<LayerStore>) -> Self {
        Self { store }
    }

    /// Resolves an image reference to a ready-to-boot [`BuildResult`].
    ///
    /// Unless `force_pull` is set, the local scope is tried first (user
    /// tags), then the registry scope (pull cache); only then does the
    /// registry get involved. Pull errors are fatal.
    pub async fn build(&self, image: &str, force_pull: bool) -> Result<BuildResult> {
        let image_ref = ImageRef::parse(image)?;
        let ref_str = image_ref.to_string();

        if !force_pull {
            if let Ok(cached) = self.store.get(Scope::Local, image) {
                return Ok(cached);
            }
            if let Ok(cached) = self.store.get(Scope::Registry, &ref_str) {
                return Ok(cached);
            }
        }

        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || pull(&store, &image_ref))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    /// Ingests a locally saved image tarball as a single-layer image.
    pub async fn import(&self, tar_path: &Path, tag: &str) -> Result<BuildResult> {
        let store = Arc::clone(&self.store);
        let tar_path = tar_path.to_path_buf();
        let tag = tag.to_owned();
        tokio::task::spawn_blocking(move || import_tar(&store, &tar_path, &tag))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    /// Persists a build result under a user tag in the local scope.
    pub fn save_tag(&self, tag: &str, result: &BuildResult) -> Result<()> {
        self.store.save(
            Scope::Local,
            tag,
            &result.layers,
            &SaveMeta {
                digest: result.digest.clone(),
                source: Some(ImageSource::Tag),
                config: result.config.clone(),
                rootfs_path: Some(result.rootfs_path.clone()),
            },
        )
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<LayerStore> {
        &self.store
    }
}

/// Deterministic digest identifying a squashed image:
/// `sha256("matchlock-squash-v1\n" || join("\n", diff_ids))`.
pub fn squash_digest(diff_ids: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SQUASH_DOMAIN.as_bytes());
    hasher.update(b"\n");
    hasher.update(diff_ids.join("\n").as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

fn pull(store: &LayerStore, image_ref: &ImageRef) -> Result<BuildResult> {
    let ref_str = image_ref.to_string();
    tracing::info!(image = %ref_str, "pulling image");

    let mut client = registry::Client::new();
    let (manifest, manifest_digest) = client.pull_manifest(image_ref)?;
    let config_data = client.fetch_config(image_ref, &manifest.config)?;
    let config = parse_image_config(&config_data);

    let work = tempfile::tempdir()?;
    let mut diff_ids = Vec::with_capacity(manifest.layers.len());
    let mut tar_paths = Vec::with_capacity(manifest.layers.len());
    let mut layers = Vec::with_capacity(manifest.layers.len());

    for (i, descriptor) in manifest.layers.iter().enumerate() {
        tracing::debug!(layer = i + 1, total = manifest.layers.len(), digest = %descriptor.digest, "fetching layer");
        let compressed = work.path().join(format!("layer-{i}.fetch"));
        client.download_blob(image_ref, &descriptor.digest, &compressed)?;

        let tar_path = work.path().join(format!("layer-{i}.tar"));
        let diff_id = decompress_and_hash(&compressed, &tar_path)?;
        fs::remove_file(&compressed).ok();

        layers.push(ensure_layer_blob(store, &diff_id, &tar_path)?);
        diff_ids.push(diff_id);
        tar_paths.push(tar_path);
    }

    let rootfs_path = ensure_squash_blob(store, &squash_digest(&diff_ids), &tar_paths)?;
    let size = layers.iter().map(|l| l.size).sum();

    let result = BuildResult {
        digest: manifest_digest.clone(),
        layers,
        size,
        cached: false,
        rootfs_path: rootfs_path.clone(),
        config: config.clone(),
    };

    store.save(
        Scope::Registry,
        &ref_str,
        &result.layers,
        &SaveMeta {
            digest: manifest_digest,
            source: Some(ImageSource::Registry),
            config,
            rootfs_path: Some(rootfs_path),
        },
    )?;
    Ok(result)
}

fn import_tar(store: &LayerStore, tar_path: &Path, tag: &str) -> Result<BuildResult> {
    tracing::info!(tag, path = %tar_path.display(), "importing image tarball");

    let work = tempfile::tempdir()?;
    let plain_tar = work.path().join("import.tar");
    let diff_id = decompress_and_hash(tar_path, &plain_tar)?;

    let layer = ensure_layer_blob(store, &diff_id, &plain_tar)?;
    let diff_ids = vec![diff_id];
    let rootfs_path = ensure_squash_blob(store, &squash_digest(&diff_ids), &[plain_tar])?;

    let result = BuildResult {
        digest: diff_ids[0].clone(),
        size: layer.size,
        layers: vec![layer],
        cached: false,
        rootfs_path: rootfs_path.clone(),
        config: None,
    };

    store.save(
        Scope::Local,
        tag,
        &result.layers,
        &SaveMeta {
            digest: result.digest.clone(),
            source: Some(ImageSource::Import),
            config: None,
            rootfs_path: Some(rootfs_path),
        },
    )?;
    Ok(result)
}

/// Ensures the canonical per-layer EROFS blob exists; returns its ref.
fn ensure_layer_blob(store: &LayerStore, diff_id: &str, tar_path: &Path) -> Result<LayerRef> {
    let canonical = store.blob_path(diff_id, FsType::Erofs);
    if !store.has_blob(diff_id, FsType::Erofs) {
        let tree = tempfile::tempdir()?;
        extract::extract_layer_file(tar_path, tree.path())?;
        let staging = store.blob_staging_path(diff_id, FsType::Erofs);
        erofs::mkfs(tree.path(), &staging)?;
        fs::rename(&staging, &canonical)?;
    }
    let size = fs::metadata(&canonical)?.len();
    Ok(LayerRef {
        digest: diff_id.to_owned(),
        fs_type: FsType::Erofs,
        size,
        path: canonical,
    })
}

/// Ensures the squashed blob exists: all layers replayed in order into one
/// tree, then formatted. Returns the blob path.
fn ensure_squash_blob(store: &LayerStore, digest: &str, tar_paths: &[PathBuf]) -> Result<PathBuf> {
    let canonical = store.blob_path(digest, FsType::Erofs);
    if store.has_blob(digest, FsType::Erofs) {
        return Ok(canonical);
    }
    let tree = tempfile::tempdir()?;
    for tar_path in tar_paths {
        extract::extract_layer_file(tar_path, tree.path())?;
    }
    let staging = store.blob_staging_path(digest, FsType::Erofs);
    erofs::mkfs(tree.path(), &staging)?;
    fs::rename(&staging, &canonical)?;
    Ok(canonical)
}

/// Streams a possibly-gzipped layer into a plain tar file, returning the
/// diff-id (`sha256:<hex>` of the uncompressed bytes).
fn decompress_and_hash(src: &Path, dst: &Path) -> Result<String> {
    let mut probe = fs::File::open(src)?;
    let mut magic = [0u8; 2];
    let gzipped = probe.read(&mut magic)? == 2 && magic == [0x1f, 0x8b];
    drop(probe);

    let file = fs::File::open(src)?;
    let mut reader: Box<dyn Read> = if gzipped {
        Box::new(flate2::read::GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut out = fs::File::create(dst)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n])?;
    }
    out.flush()?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// The config blob wraps the execution defaults under a top-level `config`
/// key.
fn parse_image_config(data: &[u8]) -> Option<ImageConfig> {
    #[derive(serde::Deserialize)]
    struct TopLevel {
        config: Option<ImageConfig>,
    }
    serde_json::from_slice::<TopLevel>(data).ok()?.config
}
