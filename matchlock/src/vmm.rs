//! VMM boot configuration and process control.
//!
//! The hypervisor is a black box: we compose its JSON boot config, spawn the
//! binary pointed at an API socket, and control it purely via signals. Kernel
//! boot args carry the guest's static IP assignment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state::is_pid_alive;
use crate::subnet::Subnet;
use crate::{Error, Result};

/// `boot-source` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct BootSource {
    /// Guest kernel image path.
    pub kernel_image_path: PathBuf,
    /// Kernel command line.
    pub boot_args: String,
}

/// One entry of `drives`; the first is the root device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Drive {
    /// Stable identifier.
    pub drive_id: String,
    /// Backing file on the host.
    pub path_on_host: PathBuf,
    /// Whether this is the boot/root device.
    pub is_root_device: bool,
    /// Read-only attachment.
    pub is_read_only: bool,
}

/// `machine-config` section.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[non_exhaustive]
pub struct MachineConfig {
    /// Number of virtual CPUs.
    pub vcpu_count: u8,
    /// RAM size in MiB.
    pub mem_size_mib: u32,
}

/// One entry of `network-interfaces`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct NetworkInterface {
    /// Stable identifier.
    pub iface_id: String,
    /// Guest MAC address.
    pub guest_mac: String,
    /// Host TAP device name.
    pub host_dev_name: String,
}

/// `vsock` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VsockDevice {
    /// Guest context id.
    pub guest_cid: u32,
    /// Host-side UDS multiplexer base path.
    pub uds_path: PathBuf,
}

/// Complete VMM boot configuration, written as `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VmmConfig {
    /// Kernel and command line.
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    /// Block devices; first entry is the writable root.
    pub drives: Vec<Drive>,
    /// CPU and memory sizing.
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,
    /// Virtio-net interfaces.
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<NetworkInterface>,
    /// Vsock device, when the guest needs one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vsock: Option<VsockDevice>,
}

impl VmmConfig {
    /// Composes the standard sandbox boot config for one instance.
    pub fn for_sandbox(
        kernel_image: &Path,
        rootfs: &Path,
        subnet: Subnet,
        vsock_uds: &Path,
        vcpus: u8,
        mem_size_mib: u32,
    ) -> Self {
        Self {
            boot_source: BootSource {
                kernel_image_path: kernel_image.to_path_buf(),
                boot_args: boot_args(subnet.guest_ip(), subnet.gateway(), subnet.netmask()),
            },
            drives: vec![Drive {
                drive_id: "rootfs".into(),
                path_on_host: rootfs.to_path_buf(),
                is_root_device: true,
                is_read_only: false,
            }],
            machine_config: MachineConfig {
                vcpu_count: vcpus,
                mem_size_mib,
            },
            network_interfaces: vec![NetworkInterface {
                iface_id: "eth0".into(),
                guest_mac: guest_mac(subnet),
                host_dev_name: subnet.tap_device(),
            }],
            vsock: Some(VsockDevice {
                guest_cid: 3,
                uds_path: vsock_uds.to_path_buf(),
            }),
        }
    }

    /// Writes the config JSON to `path` (temp + rename).
    pub fn write(&self, path: &Path) -> Result<()> {
        crate::state::write_atomic(path, &serde_json::to_vec_pretty(self)?)
    }
}

/// Kernel command line with the static guest IP assignment.
fn boot_args(guest_ip: Ipv4Addr, gateway: Ipv4Addr, netmask: Ipv4Addr) -> String {
    format!(
        "console=ttyS0 reboot=k panic=1 pci=off ip={guest_ip}::{gateway}:{netmask}::eth0:off"
    )
}

/// Deterministic locally-administered MAC derived from the subnet octet.
fn guest_mac(subnet: Subnet) -> String {
    format!("AA:FC:00:00:00:{:02X}", subnet.octet)
}

/// A spawned VMM child process.
#[derive(Debug)]
pub struct VmmProcess {
    child: tokio::process::Child,
    pid: i32,
}

impl VmmProcess {
    /// Spawns the VMM binary against a written config, with stdout/stderr
    /// appended to the instance log.
    pub async fn spawn(
        binary: &Path,
        config_path: &Path,
        api_sock: &Path,
        log_path: &Path,
    ) -> Result<Self> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let log_err = log.try_clone()?;

        let mut child = tokio::process::Command::new(binary)
            .arg("--api-sock")
            .arg(api_sock)
            .arg("--config-file")
            .arg(config_path)
            .stdin(std::process::Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Vmm(format!("failed to spawn {}: {e}", binary.display())))?;

        let pid = child
            .id()
            .and_then(|p| i32::try_from(p).ok())
            .ok_or_else(|| Error::Vmm("vmm exited before pid was known".into()))?;
        tracing::info!(pid, "vmm started");
        Ok(Self { child, pid })
    }

    /// Host pid of the VMM.
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// `true` while the process has not been reaped and is still alive.
    pub fn is_alive(&self) -> bool {
        is_pid_alive(self.pid)
    }

    /// Graceful stop: SIGTERM, bounded wait, SIGKILL escalation, reap.
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        // SAFETY: plain kill(2) on the child pid we spawned.
        unsafe {
            libc::kill(self.pid, libc::SIGTERM);
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                status.map_err(|e| Error::Vmm(format!("wait: {e}")))?;
            }
            Err(_) => {
                tracing::warn!(pid = self.pid, "vmm ignored SIGTERM, killing");
                self.child
                    .kill()
                    .await
                    .map_err(|e| Error::Vmm(format!("kill: {e}")))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn config_json_uses_spec_key_names() {
        let config = VmmConfig::for_sandbox(
            Path::new("/cache/kernel/vmlinux"),
            Path::new("/cache/images/blobs/sha256-abc.erofs"),
            Subnet { octet: 4 },
            Path::new("/cache/vms/vm-1/vsock.sock"),
            2,
            1024,
        );
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();

        assert_eq!(
            json["boot-source"]["kernel_image_path"],
            "/cache/kernel/vmlinux"
        );
        assert_eq!(
            json["boot-source"]["boot_args"],
            "console=ttyS0 reboot=k panic=1 pci=off ip=192.168.4.2::192.168.4.1:255.255.255.0::eth0:off"
        );
        assert_eq!(json["machine-config"]["vcpu_count"], 2);
        assert_eq!(json["machine-config"]["mem_size_mib"], 1024);
        assert_eq!(json["drives"][0]["is_root_device"], true);
        assert_eq!(json["drives"][0]["is_read_only"], false);
        assert_eq!(json["network-interfaces"][0]["iface_id"], "eth0");
        assert_eq!(json["network-interfaces"][0]["host_dev_name"], "mlk4");
        assert_eq!(json["network-interfaces"][0]["guest_mac"], "AA:FC:00:00:00:04");
        assert_eq!(json["vsock"]["guest_cid"], 3);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let config = VmmConfig::for_sandbox(
            Path::new("/k"),
            Path::new("/r"),
            Subnet { octet: 9 },
            Path::new("/v"),
            1,
            512,
        );
        let text = serde_json::to_string_pretty(&config).unwrap();
        let back: VmmConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.machine_config.vcpu_count, 1);
        assert_eq!(back.network_interfaces[0].host_dev_name, "mlk9");
        assert_eq!(back.vsock.unwrap().guest_cid, 3);
    }

    #[tokio::test]
    async fn spawn_failure_is_a_vmm_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = VmmProcess::spawn(
            Path::new("/nonexistent/definitely-not-a-vmm"),
            &dir.path().join("config.json"),
            &dir.path().join("api.sock"),
            &dir.path().join("log"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Vmm(_)));
    }

    #[tokio::test]
    async fn stop_terminates_a_spawned_process() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        // Stand-in VMM: a script that ignores its arguments and runs long.
        let fake_vmm = dir.path().join("fake-vmm");
        std::fs::write(&fake_vmm, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&fake_vmm, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut vmm = VmmProcess::spawn(
            &fake_vmm,
            &dir.path().join("config.json"),
            &dir.path().join("api.sock"),
            &dir.path().join("log"),
        )
        .await
        .unwrap();
        assert!(vmm.is_alive());
        vmm.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!vmm.is_alive());
    }
}
