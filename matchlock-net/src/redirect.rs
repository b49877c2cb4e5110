//! Firewall redirect rules pinning guest web traffic to the proxy.
//!
//! Thin wrapper over the `iptables` CLI with a narrow contract: add two nat
//! PREROUTING REDIRECT rules on install, delete them on teardown. Teardown
//! tolerates already-removed rules so repeated cleanup is safe.

use std::process::Command;

use crate::{Error, Result};

/// Installed redirect rules for one sandbox interface.
#[derive(Debug)]
pub struct RedirectRules {
    iface: String,
    http_port: u16,
    https_port: u16,
    installed: bool,
}

impl RedirectRules {
    /// Installs REDIRECT rules: guest :80 → `http_port`, :443 → `https_port`
    /// on `iface`.
    pub fn install(iface: &str, http_port: u16, https_port: u16) -> Result<Self> {
        run_rule("-A", iface, 80, http_port)?;
        if let Err(e) = run_rule("-A", iface, 443, https_port) {
            // Keep rule state consistent: undo the first rule.
            let _ = run_rule("-D", iface, 80, http_port);
            return Err(e);
        }
        tracing::debug!(iface, http_port, https_port, "redirect rules installed");
        Ok(Self {
            iface: iface.to_owned(),
            http_port,
            https_port,
            installed: true,
        })
    }

    /// Removes the rules. Idempotent: repeat calls and already-removed rules
    /// are not errors.
    pub fn remove(&mut self) {
        if !self.installed {
            return;
        }
        if let Err(e) = run_rule("-D", &self.iface, 80, self.http_port) {
            tracing::debug!(iface = %self.iface, error = %e, "http redirect rule already gone");
        }
        if let Err(e) = run_rule("-D", &self.iface, 443, self.https_port) {
            tracing::debug!(iface = %self.iface, error = %e, "https redirect rule already gone");
        }
        self.installed = false;
    }
}

impl Drop for RedirectRules {
    fn drop(&mut self) {
        self.remove();
    }
}

fn run_rule(action: &str, iface: &str, dport: u16, to_port: u16) -> Result<()> {
    let output = Command::new("iptables")
        .args([
            "-t",
            "nat",
            action,
            "PREROUTING",
            "-i",
            iface,
            "-p",
            "tcp",
            "--dport",
            &dport.to_string(),
            "-j",
            "REDIRECT",
            "--to-ports",
            &to_port.to_string(),
        ])
        .output()
        .map_err(|e| Error::Firewall(format!("failed to run iptables: {e}")))?;

    if !output.status.success() {
        return Err(Error::Firewall(
            String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        ));
    }
    Ok(())
}
