//! Secret placeholders and outbound substitution.
//!
//! Plaintext secret values never enter the guest. At sandbox boot each
//! secret gets a fresh opaque token; the token — not the value — is exported
//! into the exec environment. The proxy swaps tokens for real values in
//! outbound header values, but only when the request targets a host in the
//! secret's host set.

use crate::policy::HostPattern;

/// One configured secret.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Secret {
    /// Environment variable name exposed to the guest.
    pub name: String,
    /// Real value, substituted on egress.
    pub value: String,
    /// Hosts (literal or wildcard) where substitution is permitted.
    pub hosts: Vec<String>,
}

impl Secret {
    /// Creates a secret limited to the given hosts.
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        hosts: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug)]
struct VaultEntry {
    name: String,
    placeholder: String,
    value: String,
    host_patterns: Vec<HostPattern>,
}

/// Substitution table built once per sandbox boot.
#[derive(Debug, Default)]
pub struct SecretVault {
    entries: Vec<VaultEntry>,
}

impl SecretVault {
    /// Assigns each secret a fresh placeholder token.
    pub fn new(secrets: Vec<Secret>) -> Self {
        let entries = secrets
            .into_iter()
            .map(|secret| {
                let placeholder =
                    format!("MATCHLOCK_SECRET_{}_{}", secret.name.to_uppercase(), nonce());
                let host_patterns = secret
                    .hosts
                    .iter()
                    .filter_map(|h| HostPattern::parse(h))
                    .collect();
                VaultEntry {
                    name: secret.name,
                    placeholder,
                    value: secret.value,
                    host_patterns,
                }
            })
            .collect();
        Self { entries }
    }

    /// `true` when no secrets are configured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Environment entries for the guest: `NAME=<placeholder>`.
    pub fn exec_env(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.placeholder.clone()))
            .collect()
    }

    /// Replaces every placeholder whose secret permits `host`; placeholders
    /// for other hosts pass through untouched.
    pub fn substitute(&self, host: &str, value: &str) -> String {
        let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
        let mut out = value.to_owned();
        for entry in &self.entries {
            if !out.contains(&entry.placeholder) {
                continue;
            }
            if entry.host_patterns.iter().any(|p| p.matches(&host)) {
                out = out.replace(&entry.placeholder, &entry.value);
            }
        }
        out
    }
}

/// Short random token suffix (process id + monotonic time through a seeded
/// hasher — unguessable enough for an opaque placeholder, with no RNG
/// dependency).
fn nonce() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let mut h = RandomState::new().build_hasher();
    h.write_u64(u64::from(std::process::id()));
    h.write_u128(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    format!("{:016x}", h.finish())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn vault() -> SecretVault {
        SecretVault::new(vec![
            Secret::new("API_KEY", "sk-real-value", ["api.example.com"]),
            Secret::new("GH_TOKEN", "ghp_real", ["*.github.com"]),
        ])
    }

    #[test]
    fn env_exposes_placeholders_not_values() {
        let vault = vault();
        let env = vault.exec_env();
        assert_eq!(env.len(), 2);
        let (name, placeholder) = &env[0];
        assert_eq!(name, "API_KEY");
        assert!(placeholder.starts_with("MATCHLOCK_SECRET_API_KEY_"));
        assert!(!placeholder.contains("sk-real-value"));
    }

    #[test]
    fn substitutes_only_for_matching_hosts() {
        let vault = vault();
        let placeholder = &vault.exec_env()[0].1;
        let header = format!("Bearer {placeholder}");

        let allowed = vault.substitute("api.example.com", &header);
        assert_eq!(allowed, "Bearer sk-real-value");

        // Same placeholder, wrong host: passes through untouched.
        let denied = vault.substitute("evil.example.com", &header);
        assert_eq!(denied, header);
    }

    #[test]
    fn wildcard_host_sets_apply() {
        let vault = vault();
        let gh = &vault.exec_env()[1].1;
        let substituted = vault.substitute("api.github.com", &format!("token {gh}"));
        assert_eq!(substituted, "token ghp_real");
        let untouched = vault.substitute("github.com", &format!("token {gh}"));
        assert!(untouched.contains(gh.as_str()));
    }

    #[test]
    fn placeholders_are_unique_per_vault() {
        let a = SecretVault::new(vec![Secret::new("K", "v", ["h.test"])]);
        let b = SecretVault::new(vec![Secret::new("K", "v", ["h.test"])]);
        assert_ne!(a.exec_env()[0].1, b.exec_env()[0].1);
    }

    #[test]
    fn multiple_placeholders_in_one_value() {
        let vault = SecretVault::new(vec![
            Secret::new("A", "one", ["h.test"]),
            Secret::new("B", "two", ["h.test"]),
        ]);
        let env = vault.exec_env();
        let value = format!("{}:{}", env[0].1, env[1].1);
        assert_eq!(vault.substitute("h.test", &value), "one:two");
    }
}
