//! Content-addressed layer store with strict refcounting.
//!
//! Blobs are immutable files named by digest (`/`→`_`, `:`→`-`) plus the
//! fs_type suffix; two layers with the same `(digest, fs_type)` share one
//! blob. Catalog writes are transactional; blob pruning runs outside the
//! transaction and never touches a blob that is referenced or pinned.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::catalog::Catalog;
use crate::{
    BuildResult, Error, FsType, ImageConfig, ImageMeta, ImageSource, LayerRef, Result, Scope,
};

const BLOBS_DIR: &str = "blobs";
const DB_FILE: &str = "metadata.db";

/// Row metadata accompanying a [`LayerStore::save`].
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct SaveMeta {
    /// Manifest digest.
    pub digest: String,
    /// Row provenance.
    pub source: Option<ImageSource>,
    /// OCI execution defaults.
    pub config: Option<ImageConfig>,
    /// Preferred runtime lower path (pins the blob against GC).
    pub rootfs_path: Option<PathBuf>,
}

/// Aggregate numbers for one scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct StoreStats {
    /// Number of image rows.
    pub images: u64,
    /// Stored bytes across their layers.
    pub bytes: u64,
}

/// Content-addressed blob cache plus metadata catalog.
#[derive(Debug)]
pub struct LayerStore {
    root: PathBuf,
    catalog: Catalog,
}

impl LayerStore {
    /// Opens (or creates) the store under `root` (the `images/` cache dir).
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(BLOBS_DIR))?;
        let catalog = Catalog::open(&root.join(DB_FILE))?;
        Ok(Self { root, catalog })
    }

    /// Canonical path for a blob.
    pub fn blob_path(&self, digest: &str, fs_type: FsType) -> PathBuf {
        let name = digest.replace('/', "_").replace(':', "-");
        self.root
            .join(BLOBS_DIR)
            .join(format!("{name}.{}", fs_type.as_str()))
    }

    /// Staging path for a blob being materialised (same directory, so the
    /// final rename is atomic).
    pub fn blob_staging_path(&self, digest: &str, fs_type: FsType) -> PathBuf {
        let mut path = self.blob_path(digest, fs_type).into_os_string();
        path.push(".tmp");
        PathBuf::from(path)
    }

    /// Whether a usable (non-empty) blob exists.
    pub fn has_blob(&self, digest: &str, fs_type: FsType) -> bool {
        blob_usable(&self.blob_path(digest, fs_type))
    }

    /// Upserts a tag's ordered layer list.
    ///
    /// Layers whose path lies outside the store are copied in; the catalog
    /// write (image row, layer rows, refcount rebuild) is one transaction;
    /// unreferenced blobs are pruned after commit.
    pub fn save(
        &self,
        scope: Scope,
        tag: &str,
        layers: &[LayerRef],
        meta: &SaveMeta,
    ) -> Result<()> {
        let mut normalized = Vec::with_capacity(layers.len());
        for layer in layers {
            let canonical = self.blob_path(&layer.digest, layer.fs_type);
            if layer.path != canonical && !blob_usable(&canonical) {
                copy_in(&layer.path, &canonical, &self.blob_staging_path(&layer.digest, layer.fs_type))?;
            }
            let size = fs::metadata(&canonical).map(|m| m.len()).unwrap_or(layer.size);
            normalized.push(LayerRef {
                digest: layer.digest.clone(),
                fs_type: layer.fs_type,
                size,
                path: canonical,
            });
        }

        let source = meta.source.unwrap_or(ImageSource::Tag);
        self.catalog.save_image(
            scope,
            tag,
            &meta.digest,
            source,
            meta.config.as_ref(),
            meta.rootfs_path.as_deref(),
            &normalized,
        )?;
        self.gc()
    }

    /// Loads a tag as a [`BuildResult`] with `cached = true`.
    ///
    /// A missing or zero-size blob means the image is unusable and reports
    /// not-found, even though the catalog row exists.
    pub fn get(&self, scope: Scope, tag: &str) -> Result<BuildResult> {
        let row = self
            .catalog
            .get_image(scope, tag)?
            .ok_or_else(|| Error::NotFound(tag.to_owned()))?;

        for layer in &row.layers {
            if !blob_usable(&layer.path) {
                return Err(Error::NotFound(format!(
                    "{tag}: blob {} missing or corrupt",
                    layer.digest
                )));
            }
        }

        let rootfs_path = match row.rootfs_path {
            Some(ref pinned) if blob_usable(pinned) => pinned.clone(),
            _ => row
                .layers
                .last()
                .map(|l| l.path.clone())
                .ok_or_else(|| Error::NotFound(format!("{tag}: image has no layers")))?,
        };

        Ok(BuildResult {
            digest: row.meta.digest,
            size: row.meta.size,
            layers: row.layers,
            cached: true,
            rootfs_path,
            config: row.config,
        })
    }

    /// Removes a tag: catalog rows go atomically, refcounts resync, then
    /// orphaned blobs are pruned.
    pub fn remove(&self, scope: Scope, tag: &str) -> Result<()> {
        if !self.catalog.remove_image(scope, tag)? {
            return Err(Error::NotFound(tag.to_owned()));
        }
        self.gc()
    }

    /// Lists images in a scope, newest first.
    pub fn list(&self, scope: Scope) -> Result<Vec<ImageMeta>> {
        self.catalog.list_images(scope)
    }

    /// Refcount for one blob identity.
    pub fn ref_count(&self, digest: &str, fs_type: FsType) -> Result<u64> {
        self.catalog.ref_count(digest, fs_type)
    }

    /// Image count and bytes for a scope.
    pub fn stats(&self, scope: Scope) -> Result<StoreStats> {
        let (images, bytes) = self.catalog.stats(scope)?;
        Ok(StoreStats { images, bytes })
    }

    /// Deletes every blob file that is neither referenced with a positive
    /// count nor pinned as some image's runtime lower path.
    pub fn gc(&self) -> Result<()> {
        let mut live: HashSet<PathBuf> = self
            .catalog
            .live_refs()?
            .into_iter()
            .map(|(digest, fs_type)| self.blob_path(&digest, fs_type))
            .collect();
        live.extend(self.catalog.pinned_paths()?);

        for entry in fs::read_dir(self.root.join(BLOBS_DIR))? {
            let path = entry?.path();
            if !path.is_file() || live.contains(&path) {
                continue;
            }
            tracing::debug!(blob = %path.display(), "pruning unreferenced blob");
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// A blob is usable when it exists with a non-zero size; zero-size files are
/// interrupted materialisations and count as missing.
fn blob_usable(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

/// Copies an external blob into the store via staging + rename.
fn copy_in(src: &Path, dst: &Path, staging: &Path) -> Result<()> {
    let mut reader = fs::File::open(src)?;
    let mut writer = fs::File::create(staging)?;
    std::io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    writer.sync_all()?;
    drop(writer);
    fs::rename(staging, dst)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: LayerStore,
        src_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = LayerStore::open(dir.path().join("images")).unwrap();
        let src_dir = dir.path().join("src");
        fs::create_dir_all(&src_dir).unwrap();
        Fixture {
            store,
            src_dir,
            _dir: dir,
        }
    }

    fn fake_layer(fx: &Fixture, digest: &str, content: &[u8]) -> LayerRef {
        let path = fx.src_dir.join(digest.replace(':', "-"));
        fs::write(&path, content).unwrap();
        LayerRef {
            digest: digest.to_owned(),
            fs_type: FsType::Erofs,
            size: content.len() as u64,
            path,
        }
    }

    fn meta(digest: &str) -> SaveMeta {
        SaveMeta {
            digest: digest.to_owned(),
            source: Some(ImageSource::Tag),
            config: None,
            rootfs_path: None,
        }
    }

    #[test]
    fn save_get_roundtrip_preserves_order() {
        let fx = fixture();
        let layers = vec![
            fake_layer(&fx, "sha256:aaa", b"layer a"),
            fake_layer(&fx, "sha256:bbb", b"layer bb"),
        ];
        fx.store
            .save(Scope::Local, "app:v1", &layers, &meta("sha256:manifest"))
            .unwrap();

        let result = fx.store.get(Scope::Local, "app:v1").unwrap();
        assert!(result.cached);
        assert_eq!(result.digest, "sha256:manifest");
        assert_eq!(result.layers.len(), 2);
        assert_eq!(result.layers[0].digest, "sha256:aaa");
        assert_eq!(result.layers[1].digest, "sha256:bbb");
        // Blobs were copied into the store.
        assert!(result.layers.iter().all(|l| l.path.starts_with(
            fx.store.blob_path("x", FsType::Erofs).parent().unwrap()
        )));
        // No pin: runtime lower is the last layer.
        assert_eq!(result.rootfs_path, result.layers[1].path);
        // Refcounts match the layer table.
        assert_eq!(fx.store.ref_count("sha256:aaa", FsType::Erofs).unwrap(), 1);
        assert_eq!(fx.store.ref_count("sha256:bbb", FsType::Erofs).unwrap(), 1);
    }

    #[test]
    fn remove_deletes_unreferenced_blobs() {
        let fx = fixture();
        let layers = vec![
            fake_layer(&fx, "sha256:aaa", b"a"),
            fake_layer(&fx, "sha256:bbb", b"b"),
        ];
        fx.store
            .save(Scope::Local, "app:v1", &layers, &meta("sha256:m"))
            .unwrap();
        let blob_a = fx.store.blob_path("sha256:aaa", FsType::Erofs);
        assert!(blob_a.exists());

        fx.store.remove(Scope::Local, "app:v1").unwrap();
        assert!(!blob_a.exists());
        assert!(!fx.store.blob_path("sha256:bbb", FsType::Erofs).exists());
        assert!(fx.store.list(Scope::Local).unwrap().is_empty());
        assert!(matches!(
            fx.store.get(Scope::Local, "app:v1"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn shared_layer_survives_sibling_removal() {
        let fx = fixture();
        let shared = fake_layer(&fx, "sha256:shared", b"common base");
        let only1 = fake_layer(&fx, "sha256:one", b"one");
        let only2 = fake_layer(&fx, "sha256:two", b"two");

        fx.store
            .save(
                Scope::Local,
                "app1",
                &[shared.clone(), only1],
                &meta("sha256:m1"),
            )
            .unwrap();
        fx.store
            .save(
                Scope::Local,
                "app2",
                &[shared.clone(), only2],
                &meta("sha256:m2"),
            )
            .unwrap();
        assert_eq!(
            fx.store.ref_count("sha256:shared", FsType::Erofs).unwrap(),
            2
        );

        fx.store.remove(Scope::Local, "app1").unwrap();
        assert!(fx.store.blob_path("sha256:shared", FsType::Erofs).exists());
        assert!(!fx.store.blob_path("sha256:one", FsType::Erofs).exists());
        assert_eq!(
            fx.store.ref_count("sha256:shared", FsType::Erofs).unwrap(),
            1
        );
        assert!(fx.store.get(Scope::Local, "app2").is_ok());
    }

    #[test]
    fn identical_resave_is_a_blob_noop() {
        let fx = fixture();
        let layers = vec![fake_layer(&fx, "sha256:aaa", b"stable")];
        fx.store
            .save(Scope::Local, "app", &layers, &meta("sha256:m"))
            .unwrap();
        let blob = fx.store.blob_path("sha256:aaa", FsType::Erofs);
        let mtime = fs::metadata(&blob).unwrap().modified().unwrap();

        fx.store
            .save(Scope::Local, "app", &layers, &meta("sha256:m"))
            .unwrap();
        assert_eq!(fs::metadata(&blob).unwrap().modified().unwrap(), mtime);
        assert_eq!(fx.store.ref_count("sha256:aaa", FsType::Erofs).unwrap(), 1);
    }

    #[test]
    fn pinned_rootfs_survives_gc_and_wins_over_last_layer() {
        let fx = fixture();
        let layers = vec![fake_layer(&fx, "sha256:aaa", b"layer")];
        // Materialise a squashed blob directly in the store and pin it.
        let squash = fx.store.blob_path("sha256:squash", FsType::Erofs);
        fs::write(&squash, b"squashed tree").unwrap();

        let mut m = meta("sha256:m");
        m.rootfs_path = Some(squash.clone());
        fx.store.save(Scope::Local, "app", &layers, &m).unwrap();

        // The squash blob has no layer_refs row, but the pin protects it.
        assert!(squash.exists());
        let result = fx.store.get(Scope::Local, "app").unwrap();
        assert_eq!(result.rootfs_path, squash);

        fx.store.remove(Scope::Local, "app").unwrap();
        assert!(!squash.exists());
    }

    #[test]
    fn zero_size_blob_reports_not_found() {
        let fx = fixture();
        let layers = vec![fake_layer(&fx, "sha256:aaa", b"real")];
        fx.store
            .save(Scope::Local, "app", &layers, &meta("sha256:m"))
            .unwrap();
        // Corrupt the blob.
        fs::write(fx.store.blob_path("sha256:aaa", FsType::Erofs), b"").unwrap();
        assert!(matches!(
            fx.store.get(Scope::Local, "app"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn scopes_are_disjoint() {
        let fx = fixture();
        let layers = vec![fake_layer(&fx, "sha256:aaa", b"x")];
        fx.store
            .save(Scope::Registry, "docker.io/library/alpine:latest", &layers, &meta("sha256:m"))
            .unwrap();
        assert!(fx.store.list(Scope::Local).unwrap().is_empty());
        assert_eq!(fx.store.list(Scope::Registry).unwrap().len(), 1);
        assert!(matches!(
            fx.store.get(Scope::Local, "docker.io/library/alpine:latest"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn stats_track_scope_totals() {
        let fx = fixture();
        let layers = vec![fake_layer(&fx, "sha256:aaa", b"12345")];
        fx.store
            .save(Scope::Local, "app", &layers, &meta("sha256:m"))
            .unwrap();
        let stats = fx.store.stats(Scope::Local).unwrap();
        assert_eq!(stats.images, 1);
        assert_eq!(stats.bytes, 5);
    }
}
