//! Host allow-list with wildcard matching, pinned hosts, and private-IP
//! blocking.
//!
//! Matching precedence: exact > `*.SUFFIX` > `PREFIX*SUFFIX` > `*`.
//! `*.SUFFIX` requires at least one label before the suffix; an in-label
//! wildcard (`api-*.internal`) matches within a single label only.
//!
//! The allow-list lives behind an `RwLock`: evaluators never block one
//! another, and an update is observed either entirely or not at all.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;

use crate::{Error, Result};

/// One parsed allow-list entry, kept with its normalized source text so
/// entries can be removed by the string that added them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rule {
    source: String,
    pattern: HostPattern,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HostPattern {
    /// The universal `*`.
    Any,
    /// Literal hostname.
    Exact(String),
    /// `*.SUFFIX` — any hostname with ≥1 label before the suffix.
    Suffix(String),
    /// `PREFIX*SUFFIX` — wildcard within a single label.
    Infix {
        prefix: String,
        suffix: String,
    },
}

impl HostPattern {
    /// Parses a normalized (trimmed, lowercased) entry. Empty entries and
    /// multi-wildcard patterns are rejected.
    pub(crate) fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim().to_ascii_lowercase();
        if entry.is_empty() {
            return None;
        }
        if entry == "*" {
            return Some(Self::Any);
        }
        if let Some(suffix) = entry.strip_prefix("*.") {
            if suffix.is_empty() || suffix.contains('*') {
                return None;
            }
            return Some(Self::Suffix(suffix.to_owned()));
        }
        if let Some((prefix, suffix)) = entry.split_once('*') {
            if suffix.contains('*') {
                return None;
            }
            return Some(Self::Infix {
                prefix: prefix.to_owned(),
                suffix: suffix.to_owned(),
            });
        }
        Some(Self::Exact(entry))
    }

    /// Whether a normalized host matches this pattern.
    pub(crate) fn matches(&self, host: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(name) => host == name,
            Self::Suffix(suffix) => host
                .strip_suffix(suffix)
                .is_some_and(|head| head.ends_with('.') && head.len() > 1),
            Self::Infix { prefix, suffix } => {
                if host.len() < prefix.len() + suffix.len() {
                    return false;
                }
                let Some(middle) = host
                    .strip_prefix(prefix.as_str())
                    .and_then(|rest| rest.strip_suffix(suffix.as_str()))
                else {
                    return false;
                };
                // The wildcard never crosses a label boundary.
                !middle.contains('.')
            }
        }
    }

    /// Precedence rank, lower wins.
    const fn rank(&self) -> u8 {
        match self {
            Self::Exact(_) => 0,
            Self::Suffix(_) => 1,
            Self::Infix { .. } => 2,
            Self::Any => 3,
        }
    }
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Decision {
    /// Some allow-list entry matched; carries the winning entry.
    Allow {
        /// Normalized source text of the matching rule.
        rule: String,
    },
    /// No entry matched.
    Deny,
}

impl Decision {
    /// `true` for [`Decision::Allow`].
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Inputs for constructing a [`PolicyEngine`].
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct PolicyConfig {
    /// Allow-list entries (literal, `*.suffix`, `api-*.host`, `*`).
    pub allowed_hosts: Vec<String>,
    /// Pinned name → address overrides, consulted before system resolution.
    pub add_hosts: HashMap<String, IpAddr>,
    /// Deny egress that resolves to RFC1918/loopback/link-local addresses.
    pub block_private_ips: bool,
}

impl PolicyConfig {
    /// Constructs a policy config from its fields.
    #[must_use]
    pub fn new(
        allowed_hosts: Vec<String>,
        add_hosts: HashMap<String, IpAddr>,
        block_private_ips: bool,
    ) -> Self {
        Self {
            allowed_hosts,
            add_hosts,
            block_private_ips,
        }
    }

    /// Sets the `allowed_hosts` field.
    #[must_use]
    pub fn with_allowed_hosts(mut self, allowed_hosts: Vec<String>) -> Self {
        self.allowed_hosts = allowed_hosts;
        self
    }
}

/// Allow-list policy engine.
#[derive(Debug)]
pub struct PolicyEngine {
    rules: RwLock<Vec<Rule>>,
    add_hosts: HashMap<String, IpAddr>,
    block_private_ips: bool,
}

impl PolicyEngine {
    /// Builds the engine; malformed entries are dropped with a warning.
    pub fn new(config: PolicyConfig) -> Self {
        let rules = config
            .allowed_hosts
            .iter()
            .filter_map(|entry| parse_rule(entry))
            .collect();
        Self {
            rules: RwLock::new(rules),
            add_hosts: config
                .add_hosts
                .into_iter()
                .map(|(name, ip)| (name.trim().to_ascii_lowercase(), ip))
                .collect(),
            block_private_ips: config.block_private_ips,
        }
    }

    /// Evaluates a host against the allow-list.
    ///
    /// The host is allowed iff any entry matches; among matching entries the
    /// most specific one (exact > `*.suffix` > in-label > `*`) is reported.
    pub fn evaluate(&self, host: &str) -> Decision {
        let host = normalize_host(host);
        let rules = self.read_rules();
        let best = rules
            .iter()
            .filter(|rule| rule.pattern.matches(&host))
            .min_by_key(|rule| rule.pattern.rank());
        match best {
            Some(rule) => Decision::Allow {
                rule: rule.source.clone(),
            },
            None => Decision::Deny,
        }
    }

    /// Resolves a host: `add_hosts` pin first, then system resolution.
    ///
    /// With `block_private_ips`, a resolved private/loopback/link-local
    /// address is refused — unless an explicit pin exists, which overrides
    /// the block.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        let normalized = normalize_host(host);
        if let Some(pinned) = self.add_hosts.get(&normalized) {
            return Ok(*pinned);
        }

        let addr = tokio::net::lookup_host((normalized.as_str(), 0))
            .await
            .map_err(|e| Error::Resolve {
                host: normalized.clone(),
                reason: e.to_string(),
            })?
            .map(|sock| sock.ip())
            .next()
            .ok_or_else(|| Error::Resolve {
                host: normalized.clone(),
                reason: "no addresses".into(),
            })?;

        if self.block_private_ips && is_private_addr(addr) {
            // A policy denial, not a resolution failure: surfaces to the
            // guest like any other deny.
            return Err(Error::Denied { host: normalized });
        }
        Ok(addr)
    }

    /// Atomically applies an allow-list update.
    ///
    /// Concurrent `evaluate` calls observe either the pre- or post-update
    /// set, never a torn view.
    pub fn update(&self, add: &[String], remove: &[String]) {
        let removed: Vec<String> = remove.iter().map(|e| normalize_host(e)).collect();
        let mut rules = match self.rules.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        rules.retain(|rule| !removed.contains(&rule.source));
        for entry in add {
            if let Some(rule) = parse_rule(entry) {
                if !rules.contains(&rule) {
                    rules.push(rule);
                }
            }
        }
    }

    /// Current allow-list entries (normalized source text).
    pub fn allowed_hosts(&self) -> Vec<String> {
        self.read_rules().iter().map(|r| r.source.clone()).collect()
    }

    /// Pinned address for a host, when configured.
    pub fn pinned(&self, host: &str) -> Option<IpAddr> {
        self.add_hosts.get(&normalize_host(host)).copied()
    }

    fn read_rules(&self) -> std::sync::RwLockReadGuard<'_, Vec<Rule>> {
        match self.rules.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn parse_rule(entry: &str) -> Option<Rule> {
    let source = normalize_host(entry);
    match HostPattern::parse(&source) {
        Some(pattern) => Some(Rule { source, pattern }),
        None => {
            tracing::warn!(entry, "dropping malformed allow-list entry");
            None
        }
    }
}

/// Lowercases, trims whitespace and any trailing dot.
fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// RFC1918, loopback, and link-local ranges (v4 and v6 equivalents).
fn is_private_addr(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00 // unique local fc00::/7
                || (v6.segments()[0] & 0xffc0) == 0xfe80 // link-local fe80::/10
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn engine(hosts: &[&str]) -> PolicyEngine {
        PolicyEngine::new(PolicyConfig {
            allowed_hosts: hosts.iter().map(|s| (*s).to_owned()).collect(),
            ..PolicyConfig::default()
        })
    }

    #[test]
    fn wildcard_suffix_and_infix_rules() {
        let policy = engine(&["*.example.com", "api-*.internal"]);
        assert!(policy.evaluate("api.example.com").is_allowed());
        assert!(!policy.evaluate("x.example.com.evil").is_allowed());
        assert!(policy.evaluate("api-1.internal").is_allowed());
        assert!(!policy.evaluate("internal").is_allowed());
        // Needs a label before the suffix.
        assert!(!policy.evaluate("EXAMPLE.COM").is_allowed());
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let policy = engine(&["API.GitHub.com"]);
        assert!(policy.evaluate("api.github.com").is_allowed());
        assert!(policy.evaluate("API.GITHUB.COM.").is_allowed());
        assert!(!policy.evaluate("github.com").is_allowed());
    }

    #[test]
    fn universal_wildcard_allows_everything() {
        let policy = engine(&["*"]);
        assert!(policy.evaluate("anything.at.all").is_allowed());
    }

    #[test]
    fn infix_wildcard_stays_within_one_label() {
        let policy = engine(&["api-*.example.com"]);
        assert!(policy.evaluate("api-v2.example.com").is_allowed());
        assert!(policy.evaluate("api-.example.com").is_allowed());
        // The wildcard may not swallow a dot.
        assert!(!policy.evaluate("api-x.y.example.com").is_allowed());
    }

    #[test]
    fn precedence_reports_most_specific_rule() {
        let policy = engine(&["*", "*.example.com", "api.example.com"]);
        match policy.evaluate("api.example.com") {
            Decision::Allow { rule } => assert_eq!(rule, "api.example.com"),
            Decision::Deny => panic!("expected allow"),
        }
        match policy.evaluate("docs.example.com") {
            Decision::Allow { rule } => assert_eq!(rule, "*.example.com"),
            Decision::Deny => panic!("expected allow"),
        }
        match policy.evaluate("elsewhere.net") {
            Decision::Allow { rule } => assert_eq!(rule, "*"),
            Decision::Deny => panic!("expected allow"),
        }
    }

    #[test]
    fn update_adds_and_removes_atomically() {
        let policy = engine(&["one.test"]);
        assert!(policy.evaluate("one.test").is_allowed());
        assert!(!policy.evaluate("two.test").is_allowed());

        policy.update(&["two.test".into()], &["one.test".into()]);
        assert!(!policy.evaluate("one.test").is_allowed());
        assert!(policy.evaluate("two.test").is_allowed());
        assert_eq!(policy.allowed_hosts(), vec!["two.test".to_owned()]);
    }

    #[test]
    fn malformed_entries_are_dropped() {
        let policy = engine(&["", "a*b*c", "*.", "good.test"]);
        assert_eq!(policy.allowed_hosts(), vec!["good.test".to_owned()]);
    }

    #[tokio::test]
    async fn pinned_host_overrides_private_block() {
        let mut add_hosts = HashMap::new();
        add_hosts.insert(
            "internal.test".to_owned(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
        );
        let policy = PolicyEngine::new(PolicyConfig {
            allowed_hosts: vec!["*".into()],
            add_hosts,
            block_private_ips: true,
        });
        let ip = policy.resolve("internal.test").await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
    }

    #[test]
    fn private_ranges_are_classified() {
        assert!(is_private_addr("10.1.2.3".parse().unwrap()));
        assert!(is_private_addr("192.168.5.1".parse().unwrap()));
        assert!(is_private_addr("172.16.0.9".parse().unwrap()));
        assert!(is_private_addr("127.0.0.1".parse().unwrap()));
        assert!(is_private_addr("169.254.1.1".parse().unwrap()));
        assert!(is_private_addr("::1".parse().unwrap()));
        assert!(is_private_addr("fe80::1".parse().unwrap()));
        assert!(is_private_addr("fd00::1".parse().unwrap()));
        assert!(!is_private_addr("1.1.1.1".parse().unwrap()));
        assert!(!is_private_addr("2606:4700::1111".parse().unwrap()));
    }
}
