//! Docker-style image reference parsing.
//!
//! - `alpine` → `docker.io/library/alpine:latest`
//! - `alpine:3.20` → `docker.io/library/alpine:3.20`
//! - `ghcr.io/org/app@sha256:…` → pinned digest on a custom registry

use std::fmt;

use crate::{Error, Result};

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";
const OFFICIAL_PREFIX: &str = "library";

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ImageRef {
    /// Registry hostname (`docker.io`, `ghcr.io`, `localhost:5000`).
    pub registry: String,
    /// Repository path (`library/alpine`, `org/app`).
    pub repository: String,
    /// Tag, when the reference names one.
    pub tag: Option<String>,
    /// Digest, when the reference pins one (`sha256:…`).
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parses an image reference string.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidReference("empty reference".into()));
        }

        let (name, digest) = match trimmed.split_once('@') {
            Some((n, d)) if d.contains(':') => (n, Some(d.to_owned())),
            Some((_, d)) => {
                return Err(Error::InvalidReference(format!("invalid digest: {d}")));
            }
            None => (trimmed, None),
        };

        let (registry, rest) = match name.split_once('/') {
            Some((first, rest)) if looks_like_registry(first) => {
                (first.to_owned(), rest.to_owned())
            }
            _ => {
                let repo = if name.contains('/') {
                    name.to_owned()
                } else {
                    format!("{OFFICIAL_PREFIX}/{name}")
                };
                (DEFAULT_REGISTRY.to_owned(), repo)
            }
        };

        let (repository, tag) = if digest.is_some() {
            (rest, None)
        } else {
            match rest.rsplit_once(':') {
                Some((repo, t)) => (repo.to_owned(), Some(t.to_owned())),
                None => (rest, Some(DEFAULT_TAG.to_owned())),
            }
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Registry v2 API base for this reference.
    pub fn api_base(&self) -> String {
        let host = match self.registry.as_str() {
            "docker.io" => "registry-1.docker.io",
            other => other,
        };
        format!("https://{host}/v2")
    }

    /// Tag or digest string used in manifest URLs.
    pub fn manifest_ref(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }
}

/// First path segment is a registry when it carries a dot, a port, or is
/// `localhost`.
fn looks_like_registry(s: &str) -> bool {
    s.contains('.') || s.contains(':') || s == "localhost"
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(ref d) = self.digest {
            write!(f, "@{d}")
        } else {
            write!(f, ":{}", self.tag.as_deref().unwrap_or(DEFAULT_TAG))
        }
    }
}
