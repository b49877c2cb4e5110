//! Longest-prefix mount routing.
//!
//! A router maps guest path prefixes to providers. Prefixes form an
//! antichain (no mount may be a prefix of another), enforced at mount time,
//! so longest-prefix lookup is unambiguous. Paths outside every mount route
//! to the default provider.

use std::sync::Arc;

use crate::provider::{Provider, VfsError, VfsResult, normalize_path};

/// Mount table dispatching guest paths to providers.
#[derive(Debug)]
pub struct MountRouter {
    /// Mounts sorted by prefix length, longest first.
    mounts: Vec<Mount>,
    /// Provider serving paths no mount covers (the workspace root).
    default: Arc<dyn Provider>,
}

#[derive(Debug, Clone)]
struct Mount {
    prefix: String,
    provider: Arc<dyn Provider>,
}

impl MountRouter {
    /// Creates a router whose unmatched paths go to `default`.
    pub fn new(default: Arc<dyn Provider>) -> Self {
        Self {
            mounts: Vec::new(),
            default,
        }
    }

    /// Adds a mount at `prefix`.
    ///
    /// Fails when the prefix is the root or breaks the antichain invariant.
    pub fn mount(&mut self, prefix: &str, provider: Arc<dyn Provider>) -> VfsResult<()> {
        let prefix = normalize_path(prefix);
        if prefix == "/" {
            return Err(VfsError::InvalidPath(
                "mount at / shadows the default provider".into(),
            ));
        }
        for existing in &self.mounts {
            if is_path_prefix(&existing.prefix, &prefix) || is_path_prefix(&prefix, &existing.prefix)
            {
                return Err(VfsError::InvalidPath(format!(
                    "mount {prefix} overlaps existing mount {}",
                    existing.prefix
                )));
            }
        }
        self.mounts.push(Mount { prefix, provider });
        self.mounts.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(())
    }

    /// Returns the mounted prefixes, longest first.
    pub fn prefixes(&self) -> Vec<&str> {
        self.mounts.iter().map(|m| m.prefix.as_str()).collect()
    }

    /// Routes a guest path to `(provider, provider-relative path)`.
    ///
    /// The longest matching prefix wins; the prefix is stripped so the
    /// provider sees a path rooted at its own `/`.
    pub fn route(&self, path: &str) -> (Arc<dyn Provider>, String) {
        let normalized = normalize_path(path);
        for mount in &self.mounts {
            if is_path_prefix(&mount.prefix, &normalized) {
                let rel = &normalized[mount.prefix.len()..];
                let rel = if rel.is_empty() { "/" } else { rel };
                return (Arc::clone(&mount.provider), rel.to_owned());
            }
        }
        (Arc::clone(&self.default), normalized)
    }

    /// Routes a rename; both endpoints must land on the same provider.
    pub fn route_rename(
        &self,
        old: &str,
        new: &str,
    ) -> VfsResult<(Arc<dyn Provider>, String, String)> {
        let (old_provider, old_rel) = self.route(old);
        let (new_provider, new_rel) = self.route(new);
        if !Arc::ptr_eq(&old_provider, &new_provider) {
            return Err(VfsError::CrossDevice);
        }
        Ok((old_provider, old_rel, new_rel))
    }
}

/// Whether `prefix` is a component-boundary prefix of `path`.
fn is_path_prefix(prefix: &str, path: &str) -> bool {
    path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;

    fn router() -> (MountRouter, Arc<MemoryProvider>, Arc<MemoryProvider>) {
        let default = Arc::new(MemoryProvider::new());
        let work = Arc::new(MemoryProvider::new());
        let nested = Arc::new(MemoryProvider::new());
        let mut router = MountRouter::new(Arc::clone(&default) as Arc<dyn Provider>);
        router
            .mount("/mnt/work", Arc::clone(&work) as Arc<dyn Provider>)
            .unwrap();
        router
            .mount("/mnt/workspace", Arc::clone(&nested) as Arc<dyn Provider>)
            .unwrap();
        (router, work, nested)
    }

    #[test]
    fn longest_prefix_wins() {
        let (router, work, nested) = router();
        let (p, rel) = router.route("/mnt/workspace/src/main.rs");
        assert!(Arc::ptr_eq(&p, &(nested as Arc<dyn Provider>)));
        assert_eq!(rel, "/src/main.rs");

        let (p, rel) = router.route("/mnt/work/notes.txt");
        assert!(Arc::ptr_eq(&p, &(work as Arc<dyn Provider>)));
        assert_eq!(rel, "/notes.txt");
    }

    #[test]
    fn prefix_match_respects_component_boundaries() {
        let (router, work, _nested) = router();
        // "/mnt/workstation" shares a string prefix with "/mnt/work" but is
        // a different component — it must fall through to the default.
        let (p, rel) = router.route("/mnt/workstation/file");
        assert!(!Arc::ptr_eq(&p, &(work as Arc<dyn Provider>)));
        assert_eq!(rel, "/mnt/workstation/file");
    }

    #[test]
    fn mount_root_strips_to_slash() {
        let (router, work, _nested) = router();
        let (p, rel) = router.route("/mnt/work");
        assert!(Arc::ptr_eq(&p, &(work as Arc<dyn Provider>)));
        assert_eq!(rel, "/");
    }

    #[test]
    fn unmatched_path_routes_to_default() {
        let (router, _work, _nested) = router();
        let (_, rel) = router.route("/etc/hosts");
        assert_eq!(rel, "/etc/hosts");
    }

    #[test]
    fn overlapping_mounts_are_rejected() {
        let (mut router, work, _nested) = router();
        let err = router
            .mount("/mnt/work/sub", Arc::clone(&work) as Arc<dyn Provider>)
            .unwrap_err();
        assert!(matches!(err, VfsError::InvalidPath(_)));
        let err = router
            .mount("/mnt", work as Arc<dyn Provider>)
            .unwrap_err();
        assert!(matches!(err, VfsError::InvalidPath(_)));
    }

    #[test]
    fn root_mount_is_rejected() {
        let (mut router, work, _nested) = router();
        assert!(router.mount("/", work as Arc<dyn Provider>).is_err());
    }

    #[test]
    fn cross_provider_rename_fails() {
        let (router, _work, _nested) = router();
        let err = router
            .route_rename("/mnt/work/a", "/mnt/workspace/a")
            .unwrap_err();
        assert!(matches!(err, VfsError::CrossDevice));
        assert!(router.route_rename("/mnt/work/a", "/mnt/work/b").is_ok());
    }
}
