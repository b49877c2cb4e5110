//! Runtime configuration, resolved once and passed explicitly.
//!
//! No hidden process-wide state: everything path- or timeout-shaped lives
//! here and flows into the components that need it.

use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// State root (default `$HOME/.cache/matchlock`, or `$MATCHLOCK_HOME`).
    pub root_dir: PathBuf,
    /// VMM binary invoked with a JSON config file.
    pub vmm_binary: PathBuf,
    /// Guest kernel image.
    pub kernel_image: PathBuf,
    /// Bound on the guest ready signal after VMM spawn.
    pub ready_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,
    /// Overall bound on sandbox start.
    pub start_timeout: Duration,
}

impl Config {
    /// Resolves the configuration from the environment.
    pub fn load() -> Result<Self> {
        let root_dir = if let Ok(home) = std::env::var("MATCHLOCK_HOME") {
            PathBuf::from(home)
        } else {
            dirs::cache_dir()
                .ok_or_else(|| Error::Config("cannot determine cache directory".into()))?
                .join("matchlock")
        };
        Ok(Self::at(root_dir))
    }

    /// Builds a configuration rooted at an explicit directory.
    pub fn at(root_dir: impl Into<PathBuf>) -> Self {
        let root_dir = root_dir.into();
        Self {
            kernel_image: root_dir.join("kernel").join("vmlinux"),
            vmm_binary: PathBuf::from("firecracker"),
            root_dir,
            ready_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(10),
            start_timeout: Duration::from_secs(120),
        }
    }

    /// Per-VM state directories live here.
    pub fn vms_dir(&self) -> PathBuf {
        self.root_dir.join("vms")
    }

    /// Named ext4 volumes live here.
    pub fn volumes_dir(&self) -> PathBuf {
        self.root_dir.join("volumes")
    }

    /// Image blob cache and catalog live here.
    pub fn images_dir(&self) -> PathBuf {
        self.root_dir.join("images")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn directories_hang_off_the_root() {
        let config = Config::at("/tmp/mlk-test");
        assert_eq!(config.vms_dir(), PathBuf::from("/tmp/mlk-test/vms"));
        assert_eq!(config.volumes_dir(), PathBuf::from("/tmp/mlk-test/volumes"));
        assert_eq!(config.images_dir(), PathBuf::from("/tmp/mlk-test/images"));
        assert_eq!(
            config.kernel_image,
            PathBuf::from("/tmp/mlk-test/kernel/vmlinux")
        );
    }
}
