//! Named volume store: raw ext4 disk files under `<root>/volumes/`.
//!
//! Formatting goes through the external `mkfs.ext4` tool behind a narrow
//! wrapper; a failed create leaves nothing behind.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::process::Command;

use crate::{Error, Result};

const EXT: &str = "ext4";

/// One stored volume.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct VolumeInfo {
    /// Volume name (without the `.ext4` suffix).
    pub name: String,
    /// Apparent file size in bytes.
    pub size: u64,
}

/// Store of named ext4 disk images.
#[derive(Debug, Clone)]
pub struct VolumeStore {
    dir: PathBuf,
}

impl VolumeStore {
    /// Opens (or creates) the volume directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Path of a named volume (it may not exist).
    pub fn path(&self, name: &str) -> Result<PathBuf> {
        let name = validate_name(name)?;
        Ok(self.dir.join(format!("{name}.{EXT}")))
    }

    /// Creates a volume: sparse file of `size_mb` MiB, formatted ext4.
    ///
    /// Fails atomically — if either allocation or formatting fails, no file
    /// remains.
    pub fn create(&self, name: &str, size_mb: u64) -> Result<PathBuf> {
        if size_mb == 0 {
            return Err(Error::Config("volume size must be positive".into()));
        }
        let path = self.path(name)?;
        if path.exists() {
            return Err(Error::Config(format!("volume {name} already exists")));
        }

        let result = (|| -> Result<()> {
            let file = fs::File::create(&path)?;
            file.set_len(size_mb * 1024 * 1024)?;
            drop(file);
            mkfs_ext4(&path)
        })();

        if let Err(e) = result {
            fs::remove_file(&path).ok();
            return Err(e);
        }
        tracing::info!(name, size_mb, "created volume");
        Ok(path)
    }

    /// Copies a volume byte-for-byte, preserving mode, ownership, and mtime.
    pub fn copy(&self, src: &str, dst: &str) -> Result<PathBuf> {
        let src_path = self.path(src)?;
        let dst_path = self.path(dst)?;
        if src_path == dst_path {
            return Err(Error::Config("source and destination are the same".into()));
        }
        if !src_path.exists() {
            return Err(Error::NotFound(format!("volume {src}")));
        }
        if dst_path.exists() {
            return Err(Error::Config(format!("volume {dst} already exists")));
        }

        // fs::copy carries bytes and permission bits.
        fs::copy(&src_path, &dst_path)?;

        let meta = fs::metadata(&src_path)?;
        let _ = nix::unistd::chown(
            &dst_path,
            Some(nix::unistd::Uid::from_raw(meta.uid())),
            Some(nix::unistd::Gid::from_raw(meta.gid())),
        );
        filetime::set_file_mtime(
            &dst_path,
            filetime::FileTime::from_last_modification_time(&meta),
        )?;
        Ok(dst_path)
    }

    /// Removes a volume file.
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        if !path.exists() {
            return Err(Error::NotFound(format!("volume {name}")));
        }
        fs::remove_file(&path)?;
        Ok(())
    }

    /// Lists volumes sorted by name.
    pub fn list(&self) -> Result<Vec<VolumeInfo>> {
        let mut volumes = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name
                .to_str()
                .and_then(|n| n.strip_suffix(&format!(".{EXT}")))
            else {
                continue;
            };
            volumes.push(VolumeInfo {
                name: name.to_owned(),
                size: entry.metadata()?.len(),
            });
        }
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }
}

/// Validates (and trims) a volume name: `^[A-Za-z0-9][A-Za-z0-9._-]*$`.
fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(name)
    } else {
        Err(Error::Config(format!("invalid volume name: {name:?}")))
    }
}

fn mkfs_ext4(path: &std::path::Path) -> Result<()> {
    let output = Command::new("mkfs.ext4")
        .args(["-q", "-F"])
        .arg(path)
        .output()
        .map_err(|e| Error::Config(format!("failed to run mkfs.ext4: {e}")))?;
    if !output.status.success() {
        return Err(Error::Config(format!(
            "mkfs.ext4: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
