//! Network mediation plane for matchlock sandboxes.
//!
//! Guest TCP to ports 80/443 is redirected (see [`redirect`]) into a
//! per-sandbox transparent [`Proxy`] that evaluates every intended host
//! against the [`PolicyEngine`] allow-list, substitutes secret placeholders
//! from the [`SecretVault`] into outbound headers, and — for HTTPS —
//! terminates TLS with per-host leaf certificates minted by the sandbox's
//! in-memory [`SandboxCa`].

mod ca;
mod policy;
mod proxy;
mod redirect;
mod secrets;

pub use ca::SandboxCa;
pub use policy::{Decision, PolicyConfig, PolicyEngine};
pub use proxy::{Proxy, ProxyConfig};
pub use redirect::RedirectRules;
pub use secrets::{Secret, SecretVault};

/// Result type for network-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the network mediation plane.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Egress to a host was denied by policy.
    #[error("egress denied: {host}")]
    Denied {
        /// The host that matched no allow rule.
        host: String,
    },

    /// Host did not resolve to a usable address.
    #[error("cannot resolve {host}: {reason}")]
    Resolve {
        /// The host being resolved.
        host: String,
        /// Why resolution failed (or was refused).
        reason: String,
    },

    /// Certificate generation failed.
    #[error("certificate: {0}")]
    Ca(String),

    /// TLS handshake or configuration failure.
    #[error("tls: {0}")]
    Tls(String),

    /// Malformed HTTP traffic from the guest.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Firewall tool invocation failed.
    #[error("firewall: {0}")]
    Firewall(String),

    /// Socket I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
