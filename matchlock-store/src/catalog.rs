//! SQLite metadata catalog.
//!
//! Three tables: `images` keyed by `(scope, tag)`, `image_layers` holding the
//! ordered layer list per image, and `layer_refs` — the refcount index over
//! `(digest, fs_type)`. `layer_refs` is always rebuilt from `image_layers`
//! inside the same transaction that mutates it, so the invariant
//! `ref_count = |rows in image_layers with that (digest, fs_type)|` cannot
//! drift.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, params};

use crate::{Error, FsType, ImageConfig, ImageMeta, ImageSource, LayerRef, Result, Scope};

/// Extension to convert `rusqlite::Result` into `crate::Result`.
trait DbResultExt<T> {
    fn db(self) -> Result<T>;
}

impl<T> DbResultExt<T> for rusqlite::Result<T> {
    fn db(self) -> Result<T> {
        self.map_err(|e| Error::Db(e.to_string()))
    }
}

const SCHEMA: &str = "\
    CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);
    INSERT OR IGNORE INTO schema_version VALUES (1);
    CREATE TABLE IF NOT EXISTS images (
        scope       TEXT NOT NULL,
        tag         TEXT NOT NULL,
        digest      TEXT NOT NULL,
        size        INTEGER NOT NULL DEFAULT 0,
        source      TEXT NOT NULL,
        oci_config  TEXT,
        rootfs_path TEXT,
        created     TEXT NOT NULL DEFAULT (datetime('now')),
        PRIMARY KEY (scope, tag)
    );
    CREATE TABLE IF NOT EXISTS image_layers (
        scope    TEXT NOT NULL,
        tag      TEXT NOT NULL,
        ordinal  INTEGER NOT NULL,
        digest   TEXT NOT NULL,
        fs_type  TEXT NOT NULL,
        size     INTEGER NOT NULL DEFAULT 0,
        path     TEXT NOT NULL,
        PRIMARY KEY (scope, tag, ordinal)
    );
    CREATE TABLE IF NOT EXISTS layer_refs (
        digest    TEXT NOT NULL,
        fs_type   TEXT NOT NULL,
        ref_count INTEGER NOT NULL DEFAULT 0,
        size      INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (digest, fs_type)
    );
";

/// Rebuild `layer_refs` from the ground truth in `image_layers`.
const REBUILD_REFS: &str = "\
    DELETE FROM layer_refs;
    INSERT INTO layer_refs (digest, fs_type, ref_count, size)
        SELECT digest, fs_type, COUNT(*), MAX(size)
        FROM image_layers
        GROUP BY digest, fs_type;
";

/// Persisted snapshot of one image row plus its layers.
#[derive(Debug)]
pub(crate) struct ImageRow {
    pub meta: ImageMeta,
    pub config: Option<ImageConfig>,
    pub rootfs_path: Option<PathBuf>,
    pub layers: Vec<LayerRef>,
}

/// Metadata catalog over one SQLite database.
pub(crate) struct Catalog {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog").finish_non_exhaustive()
    }
}

impl Catalog {
    /// Opens (or creates) the catalog database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).db()?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .db()?;
        conn.execute_batch(SCHEMA).db()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Upserts one image and its layer list, then resyncs `layer_refs` —
    /// all in one transaction.
    pub fn save_image(
        &self,
        scope: Scope,
        tag: &str,
        digest: &str,
        source: ImageSource,
        config: Option<&ImageConfig>,
        rootfs_path: Option<&Path>,
        layers: &[LayerRef],
    ) -> Result<()> {
        let total: u64 = layers.iter().map(|l| l.size).sum();
        let config_json = config.map(serde_json::to_string).transpose()?;

        let conn = self.lock();
        let tx = conn.unchecked_transaction().db()?;
        tx.execute(
            "INSERT INTO images (scope, tag, digest, size, source, oci_config, rootfs_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(scope, tag) DO UPDATE SET
                digest = excluded.digest,
                size = excluded.size,
                source = excluded.source,
                oci_config = excluded.oci_config,
                rootfs_path = excluded.rootfs_path,
                created = datetime('now')",
            params![
                scope.as_str(),
                tag,
                digest,
                i64::try_from(total).unwrap_or(i64::MAX),
                source.as_str(),
                config_json,
                rootfs_path.map(|p| p.to_string_lossy().into_owned()),
            ],
        )
        .db()?;

        tx.execute(
            "DELETE FROM image_layers WHERE scope = ?1 AND tag = ?2",
            params![scope.as_str(), tag],
        )
        .db()?;
        for (ordinal, layer) in layers.iter().enumerate() {
            tx.execute(
                "INSERT INTO image_layers (scope, tag, ordinal, digest, fs_type, size, path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    scope.as_str(),
                    tag,
                    i64::try_from(ordinal).unwrap_or(i64::MAX),
                    layer.digest,
                    layer.fs_type.as_str(),
                    i64::try_from(layer.size).unwrap_or(i64::MAX),
                    layer.path.to_string_lossy().into_owned(),
                ],
            )
            .db()?;
        }

        tx.execute_batch(REBUILD_REFS).db()?;
        tx.commit().db()
    }

    /// Loads one image row with its ordered layers.
    pub fn get_image(&self, scope: Scope, tag: &str) -> Result<Option<ImageRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT digest, size, source, oci_config, rootfs_path, created
                 FROM images WHERE scope = ?1 AND tag = ?2",
                params![scope.as_str(), tag],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            );
        let (digest, size, source, config_json, rootfs, created) = match row {
            Ok(r) => r,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(Error::Db(e.to_string())),
        };

        let mut stmt = conn
            .prepare(
                "SELECT digest, fs_type, size, path FROM image_layers
                 WHERE scope = ?1 AND tag = ?2 ORDER BY ordinal",
            )
            .db()?;
        let layer_rows = stmt
            .query_map(params![scope.as_str(), tag], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .db()?;

        let mut layers = Vec::new();
        for layer in layer_rows {
            let (ldigest, fs_type, lsize, path) = layer.db()?;
            layers.push(LayerRef {
                digest: ldigest,
                fs_type: FsType::parse(&fs_type)?,
                size: u64::try_from(lsize).unwrap_or(0),
                path: PathBuf::from(path),
            });
        }

        Ok(Some(ImageRow {
            meta: ImageMeta {
                tag: tag.to_owned(),
                digest,
                size: u64::try_from(size).unwrap_or(0),
                created_at: created,
                source: ImageSource::parse(&source)?,
            },
            config: config_json.and_then(|j| serde_json::from_str(&j).ok()),
            rootfs_path: rootfs.map(PathBuf::from),
            layers,
        }))
    }

    /// Deletes one image and its layer rows, resyncing `layer_refs` in the
    /// same transaction. Returns `false` when the row did not exist.
    pub fn remove_image(&self, scope: Scope, tag: &str) -> Result<bool> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction().db()?;
        let removed = tx
            .execute(
                "DELETE FROM images WHERE scope = ?1 AND tag = ?2",
                params![scope.as_str(), tag],
            )
            .db()?;
        if removed == 0 {
            return Ok(false);
        }
        tx.execute(
            "DELETE FROM image_layers WHERE scope = ?1 AND tag = ?2",
            params![scope.as_str(), tag],
        )
        .db()?;
        tx.execute_batch(REBUILD_REFS).db()?;
        tx.commit().db()?;
        Ok(true)
    }

    /// Lists images in a scope, newest first.
    pub fn list_images(&self, scope: Scope) -> Result<Vec<ImageMeta>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT tag, digest, size, source, created FROM images
                 WHERE scope = ?1 ORDER BY created DESC",
            )
            .db()?;
        let rows = stmt
            .query_map(params![scope.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .db()?;

        let mut images = Vec::new();
        for row in rows {
            let (tag, digest, size, source, created) = row.db()?;
            images.push(ImageMeta {
                tag,
                digest,
                size: u64::try_from(size).unwrap_or(0),
                created_at: created,
                source: ImageSource::parse(&source)?,
            });
        }
        Ok(images)
    }

    /// Refcount for one `(digest, fs_type)`, zero when absent.
    pub fn ref_count(&self, digest: &str, fs_type: FsType) -> Result<u64> {
        let conn = self.lock();
        match conn.query_row(
            "SELECT ref_count FROM layer_refs WHERE digest = ?1 AND fs_type = ?2",
            params![digest, fs_type.as_str()],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(n) => Ok(u64::try_from(n).unwrap_or(0)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(Error::Db(e.to_string())),
        }
    }

    /// Blob identities with a positive refcount.
    pub fn live_refs(&self) -> Result<Vec<(String, FsType)>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT digest, fs_type FROM layer_refs WHERE ref_count > 0")
            .db()?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .db()?;
        let mut out = Vec::new();
        for row in rows {
            let (digest, fs_type) = row.db()?;
            out.push((digest, FsType::parse(&fs_type)?));
        }
        Ok(out)
    }

    /// Every pinned runtime lower path across all image rows.
    pub fn pinned_paths(&self) -> Result<Vec<PathBuf>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT rootfs_path FROM images WHERE rootfs_path IS NOT NULL")
            .db()?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0)).db()?;
        let mut out = Vec::new();
        for row in rows {
            out.push(PathBuf::from(row.db()?));
        }
        Ok(out)
    }

    /// Image count and stored bytes in a scope.
    pub fn stats(&self, scope: Scope) -> Result<(u64, u64)> {
        let conn = self.lock();
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM images WHERE scope = ?1",
            params![scope.as_str()],
            |row| {
                Ok((
                    u64::try_from(row.get::<_, i64>(0)?).unwrap_or(0),
                    u64::try_from(row.get::<_, i64>(1)?).unwrap_or(0),
                ))
            },
        )
        .db()
    }
}
