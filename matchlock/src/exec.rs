//! Exec channel: host client for the guest exec service, plus the relay
//! socket external clients use.
//!
//! One vsock connection carries one execution (see
//! [`matchlock_proto::exec`] for the framing). The relay accepts local Unix
//! socket clients — authenticated by filesystem permissions — and forwards
//! frames transparently to a fresh guest connection each, so separate relay
//! connections are independent executions.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use matchlock_proto::EXEC_PORT;
use matchlock_proto::exec::{self, ExecFrame, ExecRequest, ExecResult};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

use crate::vsock;
use crate::{Error, Result};

/// Streaming event from a running execution.
#[derive(Debug)]
#[non_exhaustive]
pub enum ExecEvent {
    /// A chunk of stdout.
    Stdout(Vec<u8>),
    /// A chunk of stderr.
    Stderr(Vec<u8>),
}

/// Collected output of one execution.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct ExecOutput {
    /// Exit code (`0` = success; non-zero is data, not an error).
    pub exit_code: i32,
    /// Stdout bytes.
    pub stdout: Vec<u8>,
    /// Stderr bytes.
    pub stderr: Vec<u8>,
}

/// Runs a command in the guest, streaming output via `on`.
///
/// When `stdin` is provided it is written and the write side is closed —
/// the guest sees EOF and, per the channel contract, signals the process
/// group once the stream ends. A `deadline` bounds the whole execution;
/// expiry drops the stream, which makes the guest kill the process group.
pub async fn run(
    uds: &Path,
    req: ExecRequest,
    stdin: Option<&[u8]>,
    deadline: Option<Duration>,
    mut on: impl FnMut(ExecEvent),
) -> Result<ExecResult> {
    let stream = vsock::connect_port(uds, EXEC_PORT).await?;
    let (mut reader, mut writer) = stream.into_split();

    exec::send_frame(&mut writer, &ExecFrame::Exec(req)).await?;
    if let Some(data) = stdin {
        for chunk in data.chunks(64 * 1024) {
            exec::send_frame(&mut writer, &ExecFrame::Stdin(chunk.to_vec())).await?;
        }
        writer.shutdown().await?;
    }

    let read_result = async {
        loop {
            match exec::recv_frame(&mut reader).await? {
                ExecFrame::Stdout(data) => on(ExecEvent::Stdout(data)),
                ExecFrame::Stderr(data) => on(ExecEvent::Stderr(data)),
                ExecFrame::ExecResult(result) => return Ok::<_, Error>(result),
                other => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("unexpected frame from guest: 0x{:02x}", other.msg_type()),
                    )));
                }
            }
        }
    };

    match deadline {
        Some(limit) => tokio::time::timeout(limit, read_result)
            .await
            .map_err(|_| Error::Timeout("exec"))?,
        None => read_result.await,
    }
}

/// Runs a command and collects all output.
pub async fn run_collect(
    uds: &Path,
    req: ExecRequest,
    stdin: Option<&[u8]>,
    deadline: Option<Duration>,
) -> Result<ExecOutput> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let result = run(uds, req, stdin, deadline, |event| match event {
        ExecEvent::Stdout(d) => stdout.extend(d),
        ExecEvent::Stderr(d) => stderr.extend(d),
    })
    .await?;

    if let Some(message) = result.error {
        return Err(Error::Io(std::io::Error::other(message)));
    }
    Ok(ExecOutput {
        exit_code: result.exit_code,
        stdout,
        stderr,
    })
}

/// The host-side relay socket under the instance state directory.
#[derive(Debug)]
pub struct ExecRelay {
    socket_path: PathBuf,
    task: JoinHandle<()>,
}

impl ExecRelay {
    /// Binds the relay socket and starts forwarding.
    ///
    /// Each accepted client gets its own guest connection; bytes are copied
    /// both ways without interpretation, so the relay is transparent to the
    /// frame protocol.
    pub async fn start(socket_path: &Path, vsock_uds: PathBuf) -> Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        // Authentication is filesystem permissions: owner only.
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o700))?;

        let task = tokio::spawn(async move {
            loop {
                let Ok((mut client, _addr)) = listener.accept().await else {
                    return;
                };
                let uds = vsock_uds.clone();
                tokio::spawn(async move {
                    match vsock::connect_port(&uds, EXEC_PORT).await {
                        Ok(mut guest) => {
                            let _ = tokio::io::copy_bidirectional(&mut client, &mut guest).await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "exec relay could not reach guest");
                        }
                    }
                });
            }
        });

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            task,
        })
    }

    /// Relay socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stops accepting and removes the socket file.
    pub fn stop(&mut self) {
        self.task.abort();
        std::fs::remove_file(&self.socket_path).ok();
    }
}

impl Drop for ExecRelay {
    fn drop(&mut self) {
        self.stop();
    }
}
