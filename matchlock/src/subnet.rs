//! Per-sandbox subnet allocation from the `192.168.N.0/24` pool.
//!
//! The pool is guarded by a single host-wide lock file; the allocation is
//! recorded into the VM's `subnet` file before the lock is released, so two
//! concurrently-starting sandboxes can never share an octet.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::fcntl::{Flock, FlockArg};

use crate::{Error, Result};

/// Octets tried in order, first free wins.
const FIRST_OCTET: u8 = 1;
const LAST_OCTET: u8 = 254;

/// One allocated `/24` out of `192.168.0.0/16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    /// The `N` in `192.168.N.0/24`.
    pub octet: u8,
}

impl Subnet {
    /// Host-side gateway address (`.1`).
    pub const fn gateway(self) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, self.octet, 1)
    }

    /// Guest address (`.2`).
    pub const fn guest_ip(self) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, self.octet, 2)
    }

    /// Network mask for the `/24`.
    pub const fn netmask(self) -> Ipv4Addr {
        Ipv4Addr::new(255, 255, 255, 0)
    }

    /// Host-side TAP device name for this subnet.
    pub fn tap_device(self) -> String {
        format!("mlk{}", self.octet)
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "192.168.{}.0/24", self.octet)
    }
}

impl FromStr for Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let octet = s
            .trim()
            .strip_prefix("192.168.")
            .and_then(|rest| rest.strip_suffix(".0/24"))
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| Error::Lifecycle(format!("malformed subnet: {s}")))?;
        Ok(Self { octet })
    }
}

/// Allocator over the VM state directories.
#[derive(Debug)]
pub struct SubnetPool {
    vms_dir: PathBuf,
}

impl SubnetPool {
    /// Creates a pool scanning (and locking under) `vms_dir`.
    pub fn new(vms_dir: impl Into<PathBuf>) -> Self {
        Self {
            vms_dir: vms_dir.into(),
        }
    }

    /// Allocates the first free subnet and records it in `vm_dir/subnet`
    /// while still holding the pool lock.
    pub fn allocate(&self, vm_dir: &Path) -> Result<Subnet> {
        fs::create_dir_all(&self.vms_dir)?;
        let _guard = self.lock()?;

        let used = self.used_octets()?;
        for octet in FIRST_OCTET..=LAST_OCTET {
            if used.contains(&octet) {
                continue;
            }
            let subnet = Subnet { octet };
            crate::state::write_atomic(&vm_dir.join("subnet"), subnet.to_string().as_bytes())?;
            return Ok(subnet);
        }
        Err(Error::Lifecycle("subnet pool exhausted".into()))
    }

    fn used_octets(&self) -> Result<Vec<u8>> {
        let mut used = Vec::new();
        for entry in fs::read_dir(&self.vms_dir)? {
            let path = entry?.path().join("subnet");
            let Ok(text) = fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(subnet) = Subnet::from_str(&text) {
                used.push(subnet.octet);
            }
        }
        Ok(used)
    }

    fn lock(&self) -> Result<Flock<fs::File>> {
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.vms_dir.join(".subnet.lock"))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| Error::Lifecycle(format!("subnet pool lock: {errno}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn subnet_addresses() {
        let subnet = Subnet { octet: 7 };
        assert_eq!(subnet.to_string(), "192.168.7.0/24");
        assert_eq!(subnet.gateway(), Ipv4Addr::new(192, 168, 7, 1));
        assert_eq!(subnet.guest_ip(), Ipv4Addr::new(192, 168, 7, 2));
        assert_eq!(subnet.tap_device(), "mlk7");
        assert_eq!("192.168.7.0/24".parse::<Subnet>().unwrap(), subnet);
        assert!("10.0.0.0/24".parse::<Subnet>().is_err());
    }

    #[test]
    fn allocations_are_first_free_and_unique() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SubnetPool::new(dir.path());

        let a_dir = dir.path().join("vm-a");
        let b_dir = dir.path().join("vm-b");
        fs::create_dir_all(&a_dir).unwrap();
        fs::create_dir_all(&b_dir).unwrap();

        let a = pool.allocate(&a_dir).unwrap();
        let b = pool.allocate(&b_dir).unwrap();
        assert_eq!(a.octet, FIRST_OCTET);
        assert_eq!(b.octet, FIRST_OCTET + 1);

        // Removing a VM dir frees its octet for the next allocation.
        fs::remove_dir_all(&a_dir).unwrap();
        let c_dir = dir.path().join("vm-c");
        fs::create_dir_all(&c_dir).unwrap();
        let c = pool.allocate(&c_dir).unwrap();
        assert_eq!(c.octet, FIRST_OCTET);
    }

    #[test]
    fn concurrent_allocations_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let root = root.clone();
                std::thread::spawn(move || {
                    let pool = SubnetPool::new(&root);
                    let vm_dir = root.join(format!("vm-{i}"));
                    fs::create_dir_all(&vm_dir).unwrap();
                    pool.allocate(&vm_dir).unwrap().octet
                })
            })
            .collect();

        let mut octets: Vec<u8> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        octets.sort_unstable();
        octets.dedup();
        assert_eq!(octets.len(), 8, "duplicate subnet handed out");
    }
}
