//! Sandbox coordinator: composes the store, lifecycle, VFS, mediation plane
//! and VMM around one instance, owning startup order, rollback, and
//! teardown.
//!
//! Startup sequence (each completed step is rolled back if a later one
//! fails): resolve image → register + subnet → mount table → VFS server +
//! ready listener → policy/secrets/CA → proxy → firewall redirect → VMM
//! spawn → ready wait → exec relay. Teardown runs in reverse, best-effort,
//! collecting every error instead of stopping at the first.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use matchlock_net::{
    PolicyConfig, PolicyEngine, Proxy, ProxyConfig, RedirectRules, SandboxCa, Secret, SecretVault,
};
use matchlock_proto::exec::{ExecRequest, ExecResult};
use matchlock_proto::{READY_PORT, VFS_PORT};
use matchlock_store::{ImageBuilder, ImageConfig, LayerStore};
use matchlock_vfs::{
    MemoryProvider, MountRouter, Provider, ReadonlyProvider, RealFsProvider, VfsServer,
};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::control::PolicyControl;
use crate::exec::{self, ExecEvent, ExecOutput, ExecRelay};
use crate::state::{Lifecycle, VmConfig, VmStatus, gen_id};
use crate::vmm::{VmmConfig, VmmProcess};
use crate::vsock;
use crate::{Error, Result};

/// Proxy ports on the sandbox-facing interface; firewall rules pin guest
/// :80/:443 here.
const PROXY_HTTP_PORT: u16 = 18080;
const PROXY_HTTPS_PORT: u16 = 18443;

/// Where the CA bundle lands inside the workspace mount.
const CA_WORKSPACE_PATH: &str = "/.matchlock/ca.pem";
/// Guest mount point of the VFS root, used for CA trust env vars.
const GUEST_VFS_ROOT: &str = "/workspace";

/// One host path projected into the guest.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct MountSpec {
    /// Guest path prefix.
    pub guest_path: String,
    /// Host directory backing the mount.
    pub host_path: PathBuf,
    /// Reject all mutations through this mount.
    pub read_only: bool,
}

impl MountSpec {
    /// Read-write projection of `host_path` at `guest_path`.
    pub fn new(guest_path: impl Into<String>, host_path: impl Into<PathBuf>) -> Self {
        Self {
            guest_path: guest_path.into(),
            host_path: host_path.into(),
            read_only: false,
        }
    }

    /// Makes the mount read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Options for starting one sandbox.
#[derive(Debug)]
#[non_exhaustive]
pub struct SandboxOptions {
    /// Image reference to boot.
    pub image: String,
    /// Number of virtual CPUs.
    pub vcpus: u8,
    /// RAM size in MiB.
    pub mem_size_mib: u32,
    /// Host paths projected into the guest.
    pub mounts: Vec<MountSpec>,
    /// Egress allow-list entries.
    pub allowed_hosts: Vec<String>,
    /// Pinned name → address overrides.
    pub add_hosts: HashMap<String, IpAddr>,
    /// Deny egress resolving to private addresses (pins override).
    pub block_private_ips: bool,
    /// Secrets injected by the proxy; only placeholders enter the guest.
    pub secrets: Vec<Secret>,
    /// Extra exec environment.
    pub env: Vec<(String, String)>,
    /// Skip caches and pull the image fresh.
    pub force_pull: bool,
}

impl SandboxOptions {
    /// Options with defaults: 1 vCPU, 512 MiB, empty allow-list.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            vcpus: 1,
            mem_size_mib: 512,
            mounts: Vec::new(),
            allowed_hosts: Vec::new(),
            add_hosts: HashMap::new(),
            block_private_ips: true,
            secrets: Vec::new(),
            env: Vec::new(),
            force_pull: false,
        }
    }

    /// Sets CPU count.
    #[must_use]
    pub const fn vcpus(mut self, n: u8) -> Self {
        self.vcpus = n;
        self
    }

    /// Sets RAM in MiB.
    #[must_use]
    pub const fn mem_size_mib(mut self, mib: u32) -> Self {
        self.mem_size_mib = mib;
        self
    }

    /// Adds a mount.
    #[must_use]
    pub fn mount(mut self, spec: MountSpec) -> Self {
        self.mounts.push(spec);
        self
    }

    /// Adds an allow-list entry.
    #[must_use]
    pub fn allow_host(mut self, entry: impl Into<String>) -> Self {
        self.allowed_hosts.push(entry.into());
        self
    }

    /// Pins a hostname to an address.
    #[must_use]
    pub fn add_host(mut self, name: impl Into<String>, addr: IpAddr) -> Self {
        self.add_hosts.insert(name.into(), addr);
        self
    }

    /// Adds a secret.
    #[must_use]
    pub fn secret(mut self, secret: Secret) -> Self {
        self.secrets.push(secret);
        self
    }

    /// Adds an exec environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Aborts a background task when dropped (rollback safety).
#[derive(Debug)]
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A running sandbox instance.
#[derive(Debug)]
pub struct Sandbox {
    id: String,
    lifecycle: Arc<Lifecycle>,
    vsock_uds: PathBuf,
    exec_sock: PathBuf,
    subnet: crate::subnet::Subnet,
    vmm: VmmProcess,
    relay: ExecRelay,
    control: PolicyControl,
    redirect: RedirectRules,
    proxy: Proxy,
    _vfs_task: TaskGuard,
    policy: Arc<PolicyEngine>,
    workspace: Arc<MemoryProvider>,
    base_env: Vec<(String, String)>,
    image_config: Option<ImageConfig>,
    stop_grace: Duration,
}

impl Sandbox {
    /// Starts a sandbox, honouring the configured start deadline.
    ///
    /// On failure every completed step is rolled back; the returned error
    /// names the failing step and carries any rollback errors.
    pub async fn start(config: &Config, opts: SandboxOptions) -> Result<Self> {
        let id = gen_id();
        let lifecycle = Arc::new(Lifecycle::open(config.vms_dir())?);

        let launch = launch(config, Arc::clone(&lifecycle), id.clone(), opts);
        match tokio::time::timeout(config.start_timeout, launch).await {
            Ok(result) => result,
            Err(_) => {
                // The cancelled future dropped its partial resources; the
                // state record (if created) is finalized here.
                let _ = lifecycle.set_status(&id, VmStatus::Stopped);
                let _ = lifecycle.remove(&id);
                Err(Error::Timeout("sandbox start"))
            }
        }
    }

    /// Instance identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Allocated subnet.
    pub const fn subnet(&self) -> crate::subnet::Subnet {
        self.subnet
    }

    /// Relay socket external exec clients connect to.
    pub fn exec_sock(&self) -> &Path {
        &self.exec_sock
    }

    /// Control socket for runtime allow-list updates.
    pub fn policy_sock(&self) -> &Path {
        self.control.socket_path()
    }

    /// Policy engine; `update` takes effect for in-flight sandboxes.
    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    /// Workspace provider (the VFS default mount).
    pub fn workspace(&self) -> &Arc<MemoryProvider> {
        &self.workspace
    }

    /// Runs a command and collects its output.
    pub async fn exec(&self, mut req: ExecRequest) -> Result<ExecOutput> {
        self.finalize_request(&mut req);
        exec::run_collect(&self.vsock_uds, req, None, None).await
    }

    /// Runs a command with stdin piped in.
    pub async fn exec_with_stdin(
        &self,
        mut req: ExecRequest,
        stdin: &[u8],
        deadline: Option<Duration>,
    ) -> Result<ExecOutput> {
        self.finalize_request(&mut req);
        exec::run_collect(&self.vsock_uds, req, Some(stdin), deadline).await
    }

    /// Runs a command, streaming output via `on`; `deadline` bounds the
    /// whole execution.
    pub async fn exec_stream(
        &self,
        mut req: ExecRequest,
        deadline: Option<Duration>,
        on: impl FnMut(ExecEvent),
    ) -> Result<ExecResult> {
        self.finalize_request(&mut req);
        exec::run(&self.vsock_uds, req, None, deadline, on).await
    }

    /// Applies sandbox defaults (image config, CA trust, secret
    /// placeholders) without overriding caller-set fields.
    fn finalize_request(&self, req: &mut ExecRequest) {
        if req.working_dir.is_none() {
            req.working_dir = self
                .image_config
                .as_ref()
                .and_then(|c| c.working_dir.clone());
        }
        if req.user.is_none() {
            req.user = self.image_config.as_ref().and_then(|c| c.user.clone());
        }
        merge_env(req, &self.base_env);
    }

    /// Stops the sandbox: relay → VMM → firewall → proxy → VFS → subnet →
    /// state record. Every step runs; errors are collected, not fatal.
    pub async fn stop(mut self, remove: bool) -> Result<()> {
        let mut errors = Vec::new();

        self.control.stop();
        self.relay.stop();
        if let Err(e) = self.vmm.stop(self.stop_grace).await {
            errors.push(format!("vmm stop: {e}"));
        }
        self.redirect.remove();
        self.proxy.stop();
        self._vfs_task.0.abort();

        // Release the subnet: the pool scans vm dirs for `subnet` files.
        let dir = self.lifecycle.dir_of(&self.id);
        if let Err(e) = std::fs::remove_file(dir.join("subnet")) {
            errors.push(format!("release subnet: {e}"));
        }

        if let Err(e) = self.lifecycle.unregister(&self.id) {
            errors.push(format!("unregister: {e}"));
        }
        if remove {
            if let Err(e) = self.lifecycle.remove(&self.id) {
                errors.push(format!("remove state: {e}"));
            }
        }

        if errors.is_empty() {
            tracing::info!(id = %self.id, "sandbox stopped");
            Ok(())
        } else {
            tracing::warn!(id = %self.id, ?errors, "sandbox stopped with errors");
            Err(Error::Teardown(errors))
        }
    }
}

/// The startup sequence proper. The `Sandbox` fields double as rollback
/// guards: every component constructed here tears itself down on drop, so
/// an early `?` return unwinds the completed steps, and the explicit
/// `fail()` path finalizes the state record.
async fn launch(
    config: &Config,
    lifecycle: Arc<Lifecycle>,
    id: String,
    opts: SandboxOptions,
) -> Result<Sandbox> {
    // 1. Resolve the image.
    let store = Arc::new(LayerStore::open(config.images_dir())?);
    let builder = ImageBuilder::new(store);
    let image = builder
        .build(&opts.image, opts.force_pull)
        .await
        .map_err(|e| Error::startup("resolve image", e.into(), Vec::new()))?;

    // 2. Register and acquire a subnet.
    let record = lifecycle
        .register(
            &id,
            &VmConfig {
                image: opts.image.clone(),
                vcpus: opts.vcpus,
                mem_size_mib: opts.mem_size_mib,
            },
        )
        .map_err(|e| Error::startup("register", e, Vec::new()))?;
    let Some(subnet) = record.subnet else {
        return Err(Error::startup(
            "register",
            Error::Lifecycle("no subnet allocated".into()),
            Vec::new(),
        ));
    };

    // From here on a failure must also unwind the state record.
    let fail = |step: &'static str, cause: Error| {
        let mut rollback_errors = Vec::new();
        if let Err(e) = lifecycle.set_status(&id, VmStatus::Stopped) {
            rollback_errors.push(format!("set stopped: {e}"));
        }
        if let Err(e) = lifecycle.remove(&id) {
            rollback_errors.push(format!("remove state: {e}"));
        }
        Error::startup(step, cause, rollback_errors)
    };

    let vsock_uds = record.vsock_sock();

    // 3. Mount table: workspace is the default provider, user mounts on top.
    let workspace = Arc::new(MemoryProvider::new());
    let router = build_router(Arc::clone(&workspace), &opts.mounts)
        .map_err(|e| fail("mount table", e))?;

    // 4. VFS server on the guest-reachable endpoint, plus the ready
    //    listener — bound before the VMM exists so the signal cannot race.
    let vfs_listener =
        vsock::bind_port(&vsock_uds, VFS_PORT).map_err(|e| fail("vfs listener", e.into()))?;
    let ready_listener =
        vsock::bind_port(&vsock_uds, READY_PORT).map_err(|e| fail("ready listener", e.into()))?;
    let vfs_server = VfsServer::new(Arc::new(router));
    let vfs_task = TaskGuard(tokio::spawn(async move {
        if let Err(e) = vfs_server.serve(vfs_listener).await {
            tracing::warn!(error = %e, "vfs server exited");
        }
    }));

    // 5. Policy, secrets, CA; project the CA bundle into the workspace.
    let policy = Arc::new(PolicyEngine::new(PolicyConfig::new(
        opts.allowed_hosts.clone(),
        opts.add_hosts.clone(),
        opts.block_private_ips,
    )));
    let vault = Arc::new(SecretVault::new(opts.secrets));
    let ca = Arc::new(SandboxCa::new(&id).map_err(|e| fail("mint ca", e.into()))?);
    workspace
        .insert_file(CA_WORKSPACE_PATH, 0o444, ca.cert_pem().as_bytes())
        .map_err(|e| fail("project ca", e.into()))?;

    // 6. Transparent proxy on the gateway address.
    let proxy = Proxy::start(
        ProxyConfig::new(
            IpAddr::V4(subnet.gateway()),
            PROXY_HTTP_PORT,
            PROXY_HTTPS_PORT,
        ),
        Arc::clone(&policy),
        Arc::clone(&vault),
        Arc::clone(&ca),
    )
    .await
    .map_err(|e| fail("start proxy", e.into()))?;

    // 7. Firewall redirect for guest web traffic.
    let redirect = RedirectRules::install(&subnet.tap_device(), PROXY_HTTP_PORT, PROXY_HTTPS_PORT)
        .map_err(|e| fail("firewall redirect", e.into()))?;

    // 8. Compose and spawn the VMM.
    let vmm_config = VmmConfig::for_sandbox(
        &config.kernel_image,
        &image.rootfs_path,
        subnet,
        &vsock_uds,
        opts.vcpus,
        opts.mem_size_mib,
    );
    vmm_config
        .write(&record.config_path())
        .map_err(|e| fail("write vmm config", e))?;
    let vmm = VmmProcess::spawn(
        &config.vmm_binary,
        &record.config_path(),
        &record.api_sock(),
        &record.log_path(),
    )
    .await
    .map_err(|e| fail("spawn vmm", e))?;
    lifecycle
        .set_pid(&id, vmm.pid())
        .map_err(|e| fail("record pid", e))?;

    // 9. Wait for the guest ready signal.
    vsock::wait_ready(&ready_listener, config.ready_timeout)
        .await
        .map_err(|e| {
            let _ = lifecycle.set_status(&id, VmStatus::Crashed);
            fail("guest ready", e.into())
        })?;

    // 10. Exec relay and policy control socket for external clients.
    let relay = ExecRelay::start(&record.exec_sock(), vsock_uds.clone())
        .await
        .map_err(|e| fail("exec relay", e))?;
    let control = PolicyControl::start(&record.dir.join("policy.sock"), Arc::clone(&policy))
        .await
        .map_err(|e| fail("policy control", e))?;

    let base_env = base_environment(image.config.as_ref(), &vault, &opts.env);
    tracing::info!(%id, %subnet, image = %opts.image, "sandbox ready");

    Ok(Sandbox {
        exec_sock: record.exec_sock(),
        id,
        lifecycle,
        vsock_uds,
        subnet,
        vmm,
        relay,
        control,
        redirect,
        proxy,
        _vfs_task: vfs_task,
        policy,
        workspace,
        base_env,
        image_config: image.config,
        stop_grace: config.stop_grace,
    })
}

/// Builds the mount table: workspace as default, one provider per mount.
fn build_router(
    workspace: Arc<MemoryProvider>,
    mounts: &[MountSpec],
) -> Result<MountRouter> {
    let mut router = MountRouter::new(workspace as Arc<dyn Provider>);
    for mount in mounts {
        let real = Arc::new(RealFsProvider::new(&mount.host_path)?);
        let provider: Arc<dyn Provider> = if mount.read_only {
            Arc::new(ReadonlyProvider::wrap(real))
        } else {
            real
        };
        router.mount(&mount.guest_path, provider)?;
    }
    Ok(router)
}

/// The environment every exec inherits: image defaults, CA trust paths,
/// secret placeholders, then caller overrides (later wins on conflict).
fn base_environment(
    image_config: Option<&ImageConfig>,
    vault: &SecretVault,
    extra: &[(String, String)],
) -> Vec<(String, String)> {
    let ca_path = format!("{GUEST_VFS_ROOT}{CA_WORKSPACE_PATH}");
    let mut env: Vec<(String, String)> = Vec::new();

    if let Some(config) = image_config {
        for pair in config.env.iter().flatten() {
            if let Some((key, value)) = pair.split_once('=') {
                upsert(&mut env, key, value);
            }
        }
    }
    for key in ["SSL_CERT_FILE", "CURL_CA_BUNDLE", "GIT_SSL_CAINFO"] {
        upsert(&mut env, key, &ca_path);
    }
    for (name, placeholder) in vault.exec_env() {
        upsert(&mut env, &name, &placeholder);
    }
    for (key, value) in extra {
        upsert(&mut env, key, value);
    }
    env
}

fn upsert(env: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(slot) = env.iter_mut().find(|(k, _)| k == key) {
        slot.1 = value.to_owned();
    } else {
        env.push((key.to_owned(), value.to_owned()));
    }
}

/// Copies base environment entries into a request without clobbering
/// caller-set variables.
fn merge_env(req: &mut ExecRequest, base: &[(String, String)]) {
    let env = req.env.get_or_insert_with(HashMap::new);
    for (key, value) in base {
        env.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

/// Resolves when SIGINT or SIGTERM arrives — callers use this to translate
/// signals into an orderly [`Sandbox::stop`] instead of a hard exit.
pub async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
    Ok(())
}
