//! VM lifecycle state store.
//!
//! One directory per instance under `<root>/vms/<id>/`, holding plain files
//! (`status`, `pid`, `created_at`, `image`, `subnet`, `config.json`) next to
//! the sockets the running VMM leaves behind. Every write goes through
//! write-temp-then-rename; writers to one VM dir serialise on a per-id lock
//! file, readers never block.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};

use crate::subnet::{Subnet, SubnetPool};
use crate::{Error, Result};

/// VM lifecycle status, stored as ASCII in the `status` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum VmStatus {
    /// The VMM process is (believed) alive.
    Running,
    /// Stopped cleanly.
    Stopped,
    /// Marked running but the process is gone.
    Crashed,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        })
    }
}

impl FromStr for VmStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "crashed" => Ok(Self::Crashed),
            other => Err(Error::Lifecycle(format!("unknown status: {other}"))),
        }
    }
}

/// Serializable per-VM configuration snapshot (`config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VmConfig {
    /// Image reference the sandbox booted from.
    pub image: String,
    /// Number of virtual CPUs.
    pub vcpus: u8,
    /// RAM size in MiB.
    pub mem_size_mib: u32,
}

/// Parsed snapshot of one VM state directory.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct VmRecord {
    /// Instance identifier.
    pub id: String,
    /// State directory.
    pub dir: PathBuf,
    /// Lifecycle status (after crash reconciliation).
    pub status: VmStatus,
    /// VMM process id, when one was recorded.
    pub pid: Option<i32>,
    /// Creation time, seconds since the Unix epoch.
    pub created_at: u64,
    /// Image reference.
    pub image: String,
    /// Allocated subnet, when one was recorded.
    pub subnet: Option<Subnet>,
}

impl VmRecord {
    /// VMM API socket path.
    pub fn api_sock(&self) -> PathBuf {
        self.dir.join("api.sock")
    }

    /// Vsock UDS multiplexer base path.
    pub fn vsock_sock(&self) -> PathBuf {
        self.dir.join("vsock.sock")
    }

    /// Exec relay socket path.
    pub fn exec_sock(&self) -> PathBuf {
        self.dir.join("exec.sock")
    }

    /// VMM log path.
    pub fn log_path(&self) -> PathBuf {
        self.dir.join("log")
    }

    /// VMM boot config path.
    pub fn config_path(&self) -> PathBuf {
        self.dir.join("config.json")
    }
}

/// VM lifecycle manager over the state root.
#[derive(Debug)]
pub struct Lifecycle {
    vms_dir: PathBuf,
    pool: SubnetPool,
}

impl Lifecycle {
    /// Opens (or creates) the state root.
    pub fn open(vms_dir: impl Into<PathBuf>) -> Result<Self> {
        let vms_dir = vms_dir.into();
        fs::create_dir_all(&vms_dir)?;
        let pool = SubnetPool::new(&vms_dir);
        Ok(Self { vms_dir, pool })
    }

    /// State directory for an id (it may not exist yet).
    pub fn dir_of(&self, id: &str) -> PathBuf {
        self.vms_dir.join(id)
    }

    /// Registers a new instance: creates the directory atomically, allocates
    /// the next free subnet, writes `status=running`.
    pub fn register(&self, id: &str, config: &VmConfig) -> Result<VmRecord> {
        let dir = self.dir_of(id);
        fs::create_dir_all(&self.vms_dir)?;
        fs::create_dir(&dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Error::Lifecycle(format!("vm {id} already registered"))
            } else {
                Error::Io(e)
            }
        })?;

        let subnet = self.pool.allocate(&dir)?;
        let created_at = unix_now();

        let _guard = lock_dir(&dir)?;
        write_atomic(&dir.join("status"), VmStatus::Running.to_string().as_bytes())?;
        write_atomic(&dir.join("created_at"), created_at.to_string().as_bytes())?;
        write_atomic(&dir.join("image"), config.image.as_bytes())?;
        write_atomic(
            &dir.join("config.json"),
            serde_json::to_vec_pretty(config)?.as_slice(),
        )?;

        tracing::info!(id, %subnet, "registered vm");
        Ok(VmRecord {
            id: id.to_owned(),
            dir,
            status: VmStatus::Running,
            pid: None,
            created_at,
            image: config.image.clone(),
            subnet: Some(subnet),
        })
    }

    /// Records the VMM pid.
    pub fn set_pid(&self, id: &str, pid: i32) -> Result<()> {
        let dir = self.existing_dir(id)?;
        let _guard = lock_dir(&dir)?;
        write_atomic(&dir.join("pid"), pid.to_string().as_bytes())
    }

    /// Writes a status transition.
    pub fn set_status(&self, id: &str, status: VmStatus) -> Result<()> {
        let dir = self.existing_dir(id)?;
        let _guard = lock_dir(&dir)?;
        write_atomic(&dir.join("status"), status.to_string().as_bytes())
    }

    /// Loads a snapshot, reclassifying a dead `running` entry as `crashed`.
    pub fn get(&self, id: &str) -> Result<VmRecord> {
        let dir = self.existing_dir(id)?;
        let mut record = read_record(id, &dir)?;

        if record.status == VmStatus::Running && !record.pid.is_some_and(is_pid_alive) {
            record.status = VmStatus::Crashed;
            // Best-effort persist; a racing writer wins.
            if let Ok(_guard) = lock_dir(&dir) {
                let _ = write_atomic(&dir.join("status"), b"crashed");
            }
            tracing::warn!(id, "vm process is gone, marked crashed");
        }
        Ok(record)
    }

    /// Lists all instances, applying crash detection to each.
    pub fn list(&self) -> Result<Vec<VmRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.vms_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            match self.get(&id) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(id, error = %e, "skipping unreadable vm dir"),
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// SIGTERM, bounded wait, then SIGKILL; records `stopped`.
    pub async fn kill(&self, id: &str, grace: Duration) -> Result<()> {
        let record = self.get(id)?;
        if let Some(pid) = record.pid.filter(|&p| is_pid_alive(p)) {
            signal_pid(pid, libc::SIGTERM);
            let waited = tokio::time::timeout(grace, async {
                while is_pid_alive(pid) {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            })
            .await;
            if waited.is_err() {
                tracing::warn!(id, pid, "grace expired, escalating to SIGKILL");
                signal_pid(pid, libc::SIGKILL);
            }
        }
        self.set_status(id, VmStatus::Stopped)
    }

    /// Marks stopped but keeps the state directory.
    pub fn unregister(&self, id: &str) -> Result<()> {
        self.set_status(id, VmStatus::Stopped)
    }

    /// Deletes the state directory. Refuses while the process is alive.
    pub fn remove(&self, id: &str) -> Result<()> {
        let record = self.get(id)?;
        if record.status == VmStatus::Running {
            return Err(Error::Lifecycle(format!(
                "vm {id} is still running; stop it first"
            )));
        }
        fs::remove_dir_all(&record.dir)?;
        tracing::info!(id, "removed vm state");
        Ok(())
    }

    /// Removes every non-running entry; returns the removed ids.
    pub fn prune(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for record in self.list()? {
            if record.status == VmStatus::Running {
                continue;
            }
            fs::remove_dir_all(&record.dir)?;
            removed.push(record.id);
        }
        Ok(removed)
    }

    fn existing_dir(&self, id: &str) -> Result<PathBuf> {
        let dir = self.dir_of(id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(Error::NotFound(format!("vm {id}")))
        }
    }
}

fn read_record(id: &str, dir: &Path) -> Result<VmRecord> {
    let status = fs::read_to_string(dir.join("status"))
        .map_err(|e| Error::Lifecycle(format!("vm {id}: {e}")))?
        .parse()?;
    let pid = fs::read_to_string(dir.join("pid"))
        .ok()
        .and_then(|s| s.trim().parse().ok());
    let created_at = fs::read_to_string(dir.join("created_at"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    let image = fs::read_to_string(dir.join("image"))
        .map(|s| s.trim().to_owned())
        .unwrap_or_default();
    let subnet = fs::read_to_string(dir.join("subnet"))
        .ok()
        .and_then(|s| s.parse().ok());

    Ok(VmRecord {
        id: id.to_owned(),
        dir: dir.to_path_buf(),
        status,
        pid,
        created_at,
        image,
        subnet,
    })
}

/// Writes a state file via temp-then-rename; readers see old or new bytes,
/// never a torn write.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Per-VM-dir writer lock.
fn lock_dir(dir: &Path) -> Result<Flock<fs::File>> {
    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(".lock"))?;
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| Error::Lifecycle(format!("vm dir lock: {errno}")))
}

/// Liveness probe via `kill(pid, 0)`.
pub(crate) fn is_pid_alive(pid: i32) -> bool {
    // SAFETY: signal 0 performs only the existence/permission check.
    unsafe { libc::kill(pid, 0) == 0 }
}

fn signal_pid(pid: i32, signal: i32) {
    // SAFETY: plain kill(2) on a pid we recorded ourselves.
    unsafe {
        libc::kill(pid, signal);
    }
}

/// Generates a 12-character hex instance identifier.
pub fn gen_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut h = RandomState::new().build_hasher();
    h.write_u64(u64::from(std::process::id()));
    h.write_u128(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    format!("{:012x}", h.finish())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn lifecycle() -> (tempfile::TempDir, Lifecycle) {
        let dir = tempfile::tempdir().unwrap();
        let lc = Lifecycle::open(dir.path().join("vms")).unwrap();
        (dir, lc)
    }

    fn config() -> VmConfig {
        VmConfig {
            image: "alpine:latest".into(),
            vcpus: 1,
            mem_size_mib: 512,
        }
    }

    /// A pid that certainly refers to no live process.
    fn dead_pid() -> i32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = i32::try_from(child.id()).unwrap();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn register_creates_files_and_subnet() {
        let (_tmp, lc) = lifecycle();
        let record = lc.register("vm-1", &config()).unwrap();
        assert_eq!(record.status, VmStatus::Running);
        assert!(record.subnet.is_some());
        assert!(record.dir.join("status").exists());
        assert!(record.dir.join("created_at").exists());
        assert!(record.dir.join("image").exists());
        assert!(record.dir.join("config.json").exists());
        assert!(record.dir.join("subnet").exists());

        // Double registration is refused.
        assert!(matches!(
            lc.register("vm-1", &config()),
            Err(Error::Lifecycle(_))
        ));
    }

    #[test]
    fn crash_detection_reclassifies_dead_running_vm() {
        let (_tmp, lc) = lifecycle();
        lc.register("vm-x", &config()).unwrap();
        lc.set_pid("vm-x", dead_pid()).unwrap();

        let listed = lc.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, VmStatus::Crashed);
        // The reclassification is persisted.
        assert_eq!(
            fs::read_to_string(listed[0].dir.join("status")).unwrap().trim(),
            "crashed"
        );

        lc.remove("vm-x").unwrap();
        assert!(lc.list().unwrap().is_empty());
        assert!(!lc.dir_of("vm-x").exists());
    }

    #[test]
    fn unregister_keeps_dir_remove_deletes_it() {
        let (_tmp, lc) = lifecycle();
        lc.register("vm-a", &config()).unwrap();
        lc.unregister("vm-a").unwrap();

        let record = lc.get("vm-a").unwrap();
        assert_eq!(record.status, VmStatus::Stopped);
        assert!(record.dir.exists());

        lc.remove("vm-a").unwrap();
        assert!(matches!(lc.get("vm-a"), Err(Error::NotFound(_))));
    }

    #[test]
    fn remove_refuses_live_process() {
        let (_tmp, lc) = lifecycle();
        lc.register("vm-live", &config()).unwrap();
        // Our own pid is certainly alive.
        lc.set_pid("vm-live", i32::try_from(std::process::id()).unwrap())
            .unwrap();
        assert!(matches!(lc.remove("vm-live"), Err(Error::Lifecycle(_))));
        lc.unregister("vm-live").unwrap();
        lc.remove("vm-live").unwrap();
    }

    #[test]
    fn prune_removes_only_non_running() {
        let (_tmp, lc) = lifecycle();
        lc.register("vm-run", &config()).unwrap();
        lc.set_pid("vm-run", i32::try_from(std::process::id()).unwrap())
            .unwrap();
        lc.register("vm-old", &config()).unwrap();
        lc.unregister("vm-old").unwrap();

        let removed = lc.prune().unwrap();
        assert_eq!(removed, vec!["vm-old".to_owned()]);
        assert_eq!(lc.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn kill_marks_stopped() {
        let (_tmp, lc) = lifecycle();
        lc.register("vm-k", &config()).unwrap();
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        lc.set_pid("vm-k", i32::try_from(child.id()).unwrap()).unwrap();
        // Reap the child as soon as the signal lands so liveness flips.
        let reaper = std::thread::spawn(move || child.wait());

        lc.kill("vm-k", Duration::from_secs(5)).await.unwrap();
        reaper.join().unwrap().unwrap();
        assert_eq!(lc.get("vm-k").unwrap().status, VmStatus::Stopped);
    }

    #[test]
    fn ids_are_hex_and_unique() {
        let a = gen_id();
        let b = gen_id();
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
