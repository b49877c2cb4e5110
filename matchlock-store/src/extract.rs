//! OCI layer tar replay.
//!
//! Entries are replayed explicitly rather than unpacked wholesale so the
//! layer policies hold:
//!
//! - paths are cleaned and absolute-stripped; entries escaping the rootfs
//!   via `..` are skipped;
//! - whiteouts (`.wh.NAME`) and opaque markers (`.wh..wh..opq`) are applied
//!   to previously extracted layers;
//! - symlink targets are never followed during extraction;
//! - an intermediate component extracted as a symlink by an earlier layer is
//!   replaced with a real directory before children land under it;
//! - mode (including setuid/setgid/sticky) is preserved, ownership is
//!   restored best-effort, and hardlinks share the target's inode.

use std::fs;
use std::io::Read;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Component, Path, PathBuf};

use crate::Result;

/// Extracts one tar stream into `rootfs`, applying whiteouts against the
/// layers already present there.
pub fn extract_layer(reader: impl Read, rootfs: &Path) -> Result<()> {
    fs::create_dir_all(rootfs)?;
    let mut archive = tar::Archive::new(reader);

    for raw_entry in archive.entries()? {
        let mut entry = raw_entry?;
        let Some(rel) = clean_entry_path(&entry.path()?) else {
            tracing::warn!(path = %entry.path()?.display(), "skipping escaping tar entry");
            continue;
        };
        let Some(file_name) = rel.file_name().and_then(|n| n.to_str()).map(str::to_owned)
        else {
            continue;
        };

        // Opaque marker: drop everything a lower layer put in this directory.
        if file_name == ".wh..wh..opq" {
            if let Some(parent) = rel.parent() {
                let target = rootfs.join(parent);
                if target.is_dir() {
                    clear_directory(&target)?;
                }
            }
            continue;
        }

        // Plain whiteout: remove the masked entry from a lower layer.
        if let Some(masked) = file_name.strip_prefix(".wh.") {
            if let Some(parent) = rel.parent() {
                let target = rootfs.join(parent).join(masked);
                if target.symlink_metadata().map(|m| m.is_dir()).unwrap_or(false) {
                    fs::remove_dir_all(&target).ok();
                } else {
                    fs::remove_file(&target).ok();
                }
            }
            continue;
        }

        let target = rootfs.join(&rel);
        materialize_parents(rootfs, &rel)?;

        let header = entry.header();
        let mode = header.mode().unwrap_or(0o644);
        let uid = header.uid().unwrap_or(0);
        let gid = header.gid().unwrap_or(0);

        match header.entry_type() {
            tar::EntryType::Directory => {
                if target.symlink_metadata().map(|m| !m.is_dir()).unwrap_or(false) {
                    fs::remove_file(&target)?;
                }
                fs::create_dir_all(&target)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
                chown_best_effort(&target, uid, gid);
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                remove_existing(&target);
                let mut file = fs::File::create(&target)?;
                std::io::copy(&mut entry, &mut file)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
                chown_best_effort(&target, uid, gid);
            }
            tar::EntryType::Symlink => {
                if let Some(link) = entry.link_name()? {
                    remove_existing(&target);
                    symlink(&link, &target)?;
                    chown_best_effort(&target, uid, gid);
                }
            }
            tar::EntryType::Link => {
                if let Some(link) = entry.link_name()? {
                    if let Some(link_rel) = clean_entry_path(&link) {
                        remove_existing(&target);
                        // The inode is shared; the target's metadata applies.
                        fs::hard_link(rootfs.join(link_rel), &target)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Extracts a layer tarball file, transparently decompressing gzip.
pub fn extract_layer_file(path: &Path, rootfs: &Path) -> Result<()> {
    let mut file = fs::File::open(path)?;
    let mut magic = [0u8; 2];
    let gzipped = std::io::Read::read(&mut file, &mut magic)? == 2 && magic == [0x1f, 0x8b];
    drop(file);

    let file = fs::File::open(path)?;
    if gzipped {
        extract_layer(flate2::read::GzDecoder::new(file), rootfs)
    } else {
        extract_layer(file, rootfs)
    }
}

/// Cleans a tar entry path: strips `/` and `.`, rejects `..` escapes.
fn clean_entry_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Creates missing ancestors of `rel` inside `rootfs`, replacing any that an
/// earlier layer left as symlinks with real directories.
fn materialize_parents(rootfs: &Path, rel: &Path) -> Result<()> {
    let Some(parent) = rel.parent() else {
        return Ok(());
    };
    let mut current = rootfs.to_path_buf();
    for comp in parent.components() {
        current.push(comp);
        match current.symlink_metadata() {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                // Symlink or file standing where a directory must go.
                fs::remove_file(&current)?;
                fs::create_dir(&current)?;
            }
            Err(_) => fs::create_dir(&current)?,
        }
    }
    Ok(())
}

fn remove_existing(target: &Path) {
    match target.symlink_metadata() {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(target).ok();
        }
        Ok(_) => {
            fs::remove_file(target).ok();
        }
        Err(_) => {}
    }
}

/// Restores ownership when running with the privilege to do so; extraction
/// as an unprivileged user keeps the caller's ids.
fn chown_best_effort(path: &Path, uid: u64, gid: u64) {
    let _ = std::os::unix::fs::lchown(
        path,
        u32::try_from(uid).ok(),
        u32::try_from(gid).ok(),
    );
}

/// Removes all contents of a directory without removing the directory.
fn clear_directory(dir: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.symlink_metadata()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
