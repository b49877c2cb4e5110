//! Micro-VM sandbox runtime for untrusted agent workloads.
//!
//! `matchlock` boots short-lived micro-VMs from container images and
//! mediates everything that crosses the boundary: a transparent proxy
//! enforces a host allow-list and injects secrets so plaintext values never
//! enter the guest, selected host paths are projected through a
//! vsock-backed virtual filesystem, and commands run over a framed exec
//! channel.
//!
//! # Quick start
//!
//! ```no_run
//! use matchlock::{Config, Sandbox, SandboxOptions};
//! use matchlock_proto::exec::ExecRequest;
//!
//! # async fn demo() -> matchlock::Result<()> {
//! let config = Config::load()?;
//! let sandbox = Sandbox::start(
//!     &config,
//!     SandboxOptions::new("alpine:latest").allow_host("*.crates.io"),
//! )
//! .await?;
//!
//! let output = sandbox.exec(ExecRequest::new("uname -a")).await?;
//! println!("{}", String::from_utf8_lossy(&output.stdout));
//! sandbox.stop(true).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod control;
mod error;
mod exec;
mod sandbox;
mod state;
mod subnet;
mod vmm;
mod volumes;
mod vsock;

pub use config::Config;
pub use control::{PolicyControl, PolicySnapshot, PolicyUpdate};
pub use error::{Error, Result};
pub use exec::{ExecEvent, ExecOutput, ExecRelay};
pub use matchlock_net::Secret;
pub use matchlock_proto::exec::{ExecRequest, ExecResult};
pub use sandbox::{MountSpec, Sandbox, SandboxOptions, shutdown_signal};
pub use state::{Lifecycle, VmConfig, VmRecord, VmStatus, gen_id};
pub use subnet::{Subnet, SubnetPool};
pub use vmm::{VmmConfig, VmmProcess};
pub use volumes::{VolumeInfo, VolumeStore};
