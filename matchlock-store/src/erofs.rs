//! `mkfs.erofs` wrapper.
//!
//! The formatter is an external tool with a narrow contract: turn a
//! directory tree into a read-only EROFS image, or report why it could not.

use std::path::Path;
use std::process::Command;

use crate::{Error, Result};

/// Builds an EROFS image at `output` from the tree at `source`.
pub fn mkfs(source: &Path, output: &Path) -> Result<()> {
    let result = Command::new("mkfs.erofs")
        .arg(output)
        .arg(source)
        .output()
        .map_err(|e| Error::Tool {
            tool: "mkfs.erofs",
            message: format!("failed to run: {e}"),
        })?;

    if !result.status.success() {
        return Err(Error::Tool {
            tool: "mkfs.erofs",
            message: String::from_utf8_lossy(&result.stderr).trim().to_owned(),
        });
    }
    Ok(())
}
