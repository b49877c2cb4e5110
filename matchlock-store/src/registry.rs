//! OCI Distribution client: manifest fetch, platform selection, blob
//! download. Covers Docker Hub and GHCR token auth; other registries are
//! tried anonymously.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::reference::ImageRef;
use crate::{Error, Result};

/// Manifest media types accepted during pull.
const ACCEPT_MANIFEST: &str = "\
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json, \
    application/vnd.docker.distribution.manifest.list.v2+json";

/// OCI content descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct Descriptor {
    /// Blob digest.
    pub digest: String,
    /// Blob size in bytes.
    #[allow(dead_code)]
    pub size: u64,
}

/// Single-platform image manifest.
#[derive(Debug, Deserialize)]
pub struct ImageManifest {
    /// Config blob descriptor.
    pub config: Descriptor,
    /// Ordered layer descriptors.
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    architecture: String,
    os: String,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    digest: String,
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct ImageIndex {
    manifests: Vec<IndexEntry>,
}

#[derive(Deserialize)]
struct TokenResp {
    token: String,
}

/// Registry client with per-repository bearer token caching.
#[derive(Debug, Default)]
pub struct Client {
    tokens: HashMap<String, String>,
}

impl Client {
    /// Creates a client with an empty token cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches and resolves the manifest, returning it with its content
    /// digest. Image indexes are narrowed to the host platform first.
    pub fn pull_manifest(&mut self, image: &ImageRef) -> Result<(ImageManifest, String)> {
        let url = format!(
            "{}/{}/manifests/{}",
            image.api_base(),
            image.repository,
            image.manifest_ref()
        );
        let body = self.request(image, &url, ACCEPT_MANIFEST)?;

        let value: serde_json::Value = serde_json::from_slice(&body)?;
        if value.get("manifests").is_some() {
            let index: ImageIndex = serde_json::from_value(value)?;
            let entry = select_platform(&index)?;
            let platform_url = format!(
                "{}/{}/manifests/{}",
                image.api_base(),
                image.repository,
                entry.digest
            );
            let platform_body = self.request(image, &platform_url, ACCEPT_MANIFEST)?;
            let digest = content_digest(&platform_body);
            let manifest: ImageManifest = serde_json::from_slice(&platform_body)?;
            Ok((manifest, digest))
        } else {
            let digest = content_digest(&body);
            let manifest: ImageManifest = serde_json::from_value(value)?;
            Ok((manifest, digest))
        }
    }

    /// Fetches the config blob.
    pub fn fetch_config(&mut self, image: &ImageRef, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let url = format!(
            "{}/{}/blobs/{}",
            image.api_base(),
            image.repository,
            descriptor.digest
        );
        self.request(image, &url, "application/octet-stream")
    }

    /// Streams a layer blob to `dest`, verifying its digest on the way down.
    pub fn download_blob(&mut self, image: &ImageRef, digest: &str, dest: &Path) -> Result<()> {
        let url = format!("{}/{}/blobs/{digest}", image.api_base(), image.repository);
        let token = self.ensure_token(image);

        let mut req = ureq::get(&url);
        if let Some(ref t) = token {
            req = req.header("Authorization", &format!("Bearer {t}"));
        }
        let resp = req.call().map_err(|e| Error::Registry(e.to_string()))?;

        let file = fs::File::create(dest)?;
        let mut out = HashWriter::new(io::BufWriter::new(file));
        io::copy(
            &mut io::BufReader::new(resp.into_body().into_reader()),
            &mut out,
        )?;
        out.flush()?;
        let actual = out.finish();
        if actual != digest {
            fs::remove_file(dest).ok();
            return Err(Error::DigestMismatch {
                expected: digest.to_owned(),
                actual,
            });
        }
        Ok(())
    }

    /// Authenticated GET returning the full body.
    fn request(&mut self, image: &ImageRef, url: &str, accept: &str) -> Result<Vec<u8>> {
        let token = self.ensure_token(image);

        let mut req = ureq::get(url).header("Accept", accept);
        if let Some(ref t) = token {
            req = req.header("Authorization", &format!("Bearer {t}"));
        }
        let resp = req.call().map_err(|e| Error::Registry(e.to_string()))?;
        let mut body = Vec::new();
        resp.into_body()
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| Error::Registry(e.to_string()))?;
        Ok(body)
    }

    /// Returns a cached bearer token, fetching one for known registries.
    fn ensure_token(&mut self, image: &ImageRef) -> Option<String> {
        let key = format!("{}/{}", image.registry, image.repository);
        if let Some(token) = self.tokens.get(&key) {
            return Some(token.clone());
        }

        let (realm, service) = match image.registry.as_str() {
            "docker.io" => ("https://auth.docker.io/token", "registry.docker.io"),
            "ghcr.io" => ("https://ghcr.io/token", "ghcr.io"),
            _ => return None,
        };

        let token = fetch_bearer_token(realm, service, &image.repository).ok()?;
        self.tokens.insert(key, token.clone());
        Some(token)
    }
}

fn fetch_bearer_token(realm: &str, service: &str, repository: &str) -> Result<String> {
    let url = format!("{realm}?service={service}&scope=repository:{repository}:pull");
    let resp = ureq::get(&url)
        .call()
        .map_err(|e| Error::Registry(e.to_string()))?;
    let mut body = Vec::new();
    resp.into_body()
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|e| Error::Registry(e.to_string()))?;
    let t: TokenResp = serde_json::from_slice(&body)?;
    Ok(t.token)
}

/// Selects the manifest entry for the host architecture on linux.
fn select_platform(index: &ImageIndex) -> Result<&IndexEntry> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    index
        .manifests
        .iter()
        .find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.architecture == arch && p.os == "linux")
        })
        .ok_or_else(|| Error::NoPlatform {
            arch: arch.to_owned(),
            os: "linux".to_owned(),
        })
}

/// `sha256:<hex>` digest of a byte slice.
pub fn content_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Writer that hashes while forwarding to an inner writer.
struct HashWriter<W> {
    writer: W,
    hasher: Sha256,
}

impl<W> HashWriter<W> {
    fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> String {
        format!("sha256:{}", hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
