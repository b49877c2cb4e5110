//! Per-sandbox certificate authority.
//!
//! The CA key pair lives only in this process; nothing is persisted. The CA
//! cert PEM is projected into the guest's workspace so tooling can trust it
//! via `SSL_CERT_FILE`. Leaf certificates are minted per intercepted SNI and
//! cached for the sandbox's lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::PrivatePkcs8KeyDer;

use crate::{Error, Result};

/// In-memory root CA for one sandbox.
pub struct SandboxCa {
    cert: Certificate,
    key: KeyPair,
    cert_pem: String,
    /// Per-host rustls server configs, minted on first interception.
    leaf_cache: Mutex<HashMap<String, Arc<rustls::ServerConfig>>>,
}

impl std::fmt::Debug for SandboxCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxCa").finish_non_exhaustive()
    }
}

impl SandboxCa {
    /// Generates a fresh self-signed root whose CN names the sandbox.
    pub fn new(sandbox_id: &str) -> Result<Self> {
        let key = KeyPair::generate().map_err(|e| Error::Ca(e.to_string()))?;
        let mut params =
            CertificateParams::new(Vec::new()).map_err(|e| Error::Ca(e.to_string()))?;
        params
            .distinguished_name
            .push(DnType::CommonName, format!("matchlock {sandbox_id}"));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let cert = params
            .self_signed(&key)
            .map_err(|e| Error::Ca(e.to_string()))?;
        let cert_pem = cert.pem();
        Ok(Self {
            cert,
            key,
            cert_pem,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    /// The CA certificate PEM exposed to the guest.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Returns a rustls server config presenting a leaf for `host`, minting
    /// and caching one on first use.
    pub fn server_config(&self, host: &str) -> Result<Arc<rustls::ServerConfig>> {
        let mut cache = match self.leaf_cache.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(config) = cache.get(host) {
            return Ok(Arc::clone(config));
        }

        let leaf_key = KeyPair::generate().map_err(|e| Error::Ca(e.to_string()))?;
        let mut params = CertificateParams::new(vec![host.to_owned()])
            .map_err(|e| Error::Ca(e.to_string()))?;
        params.distinguished_name.push(DnType::CommonName, host);
        let leaf = params
            .signed_by(&leaf_key, &self.cert, &self.key)
            .map_err(|e| Error::Ca(e.to_string()))?;

        let key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![leaf.der().clone()], key_der.into())
            .map_err(|e| Error::Tls(e.to_string()))?;

        let config = Arc::new(config);
        cache.insert(host.to_owned(), Arc::clone(&config));
        Ok(config)
    }
}
