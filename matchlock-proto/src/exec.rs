//! Exec channel framing: stdio multiplex and terminal resize.
//!
//! Every frame is `u8 msg_type || u32 big-endian length || payload`.
//! [`ExecRequest`] and [`ExecResult`] payloads are JSON; `Stdin`, `Stdout`
//! and `Stderr` carry raw bytes; `Resize` packs `u16 rows || u16 cols`,
//! big-endian.
//!
//! One connection carries exactly one execution: the client opens with an
//! `Exec` frame, the service answers with `Stdout`/`Stderr` frames and a
//! terminal `ExecResult`. Closing the client end delivers EOF to the child's
//! stdin; the service then signals the process group and reaps it.

use std::collections::HashMap;
use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_FRAME;

/// Frame tag: start an execution (JSON [`ExecRequest`] payload).
pub const MSG_EXEC: u8 = 0x01;
/// Frame tag: raw stdin bytes for the child process.
pub const MSG_STDIN: u8 = 0x02;
/// Frame tag: raw stdout bytes from the child process.
pub const MSG_STDOUT: u8 = 0x03;
/// Frame tag: raw stderr bytes from the child process.
pub const MSG_STDERR: u8 = 0x04;
/// Frame tag: terminal result (JSON [`ExecResult`] payload).
pub const MSG_EXEC_RESULT: u8 = 0x05;
/// Frame tag: PTY window resize (`u16 rows || u16 cols`, big-endian).
pub const MSG_RESIZE: u8 = 0x06;

/// Parameters for starting a command, sent as the first frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ExecRequest {
    /// Command line to run (interpreted by the guest service).
    pub command: String,
    /// Working directory inside the guest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Extra environment variables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    /// User to run as (name or uid).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Terminal height; a PTY is allocated when rows and cols are present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    /// Terminal width.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
}

impl ExecRequest {
    /// Creates a request for the given command line.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Sets the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Sets the user to run as.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Requests a PTY with the given dimensions.
    #[must_use]
    pub const fn tty(mut self, rows: u16, cols: u16) -> Self {
        self.rows = Some(rows);
        self.cols = Some(cols);
        self
    }
}

/// Terminal frame of every execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ExecResult {
    /// Process exit code (`0` = success). Non-zero is data, not an error.
    pub exit_code: i32,
    /// Diagnostic when the execution itself failed (spawn error, I/O loss).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecResult {
    /// Constructs a result from its fields.
    #[must_use]
    pub const fn new(exit_code: i32, error: Option<String>) -> Self {
        Self { exit_code, error }
    }
}

/// PTY dimensions carried by a `Resize` frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct WindowSize {
    /// Terminal height in rows.
    pub rows: u16,
    /// Terminal width in columns.
    pub cols: u16,
}

impl WindowSize {
    /// Constructs a window size from its fields.
    #[must_use]
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Packs the dimensions as `u16 rows || u16 cols`, big-endian.
    pub fn encode(self) -> [u8; 4] {
        let mut buf = [0u8; 4];
        buf[..2].copy_from_slice(&self.rows.to_be_bytes());
        buf[2..].copy_from_slice(&self.cols.to_be_bytes());
        buf
    }

    /// Decodes a 4-byte big-endian resize payload.
    pub fn decode(payload: &[u8]) -> io::Result<Self> {
        let [r0, r1, c0, c1] = payload else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "resize payload must be exactly 4 bytes",
            ));
        };
        Ok(Self {
            rows: u16::from_be_bytes([*r0, *r1]),
            cols: u16::from_be_bytes([*c0, *c1]),
        })
    }
}

/// A single decoded frame on the exec channel.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExecFrame {
    /// Start an execution.
    Exec(ExecRequest),
    /// Stdin bytes, client → service.
    Stdin(Vec<u8>),
    /// Stdout bytes, service → client.
    Stdout(Vec<u8>),
    /// Stderr bytes, service → client.
    Stderr(Vec<u8>),
    /// Terminal result; the stream ends after this frame.
    ExecResult(ExecResult),
    /// PTY resize, client → service.
    Resize(WindowSize),
}

impl ExecFrame {
    /// Returns the wire tag for this frame.
    pub const fn msg_type(&self) -> u8 {
        match self {
            Self::Exec(_) => MSG_EXEC,
            Self::Stdin(_) => MSG_STDIN,
            Self::Stdout(_) => MSG_STDOUT,
            Self::Stderr(_) => MSG_STDERR,
            Self::ExecResult(_) => MSG_EXEC_RESULT,
            Self::Resize(_) => MSG_RESIZE,
        }
    }

    /// Serializes the frame payload (without the header).
    fn payload(&self) -> io::Result<Vec<u8>> {
        match self {
            Self::Exec(req) => {
                serde_json::to_vec(req).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }
            Self::ExecResult(res) => {
                serde_json::to_vec(res).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }
            Self::Stdin(data) | Self::Stdout(data) | Self::Stderr(data) => Ok(data.clone()),
            Self::Resize(size) => Ok(size.encode().to_vec()),
        }
    }
}

/// Writes one frame: `u8 msg_type || u32 big-endian length || payload`.
pub async fn send_frame(w: &mut (impl AsyncWrite + Unpin), frame: &ExecFrame) -> io::Result<()> {
    let payload = frame.payload()?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds u32::MAX"))?;
    // Pre-assemble the frame to minimize syscalls.
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(frame.msg_type());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&payload);
    w.write_all(&buf).await?;
    w.flush().await
}

/// Reads and decodes one frame.
pub async fn recv_frame(r: &mut (impl AsyncRead + Unpin)) -> io::Result<ExecFrame> {
    let mut hdr = [0u8; 5];
    r.read_exact(&mut hdr).await?;
    let msg_type = hdr[0];
    let len = u32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;

    match msg_type {
        MSG_EXEC => {
            let req = serde_json::from_slice(&payload)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(ExecFrame::Exec(req))
        }
        MSG_STDIN => Ok(ExecFrame::Stdin(payload)),
        MSG_STDOUT => Ok(ExecFrame::Stdout(payload)),
        MSG_STDERR => Ok(ExecFrame::Stderr(payload)),
        MSG_EXEC_RESULT => {
            let res = serde_json::from_slice(&payload)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(ExecFrame::ExecResult(res))
        }
        MSG_RESIZE => Ok(ExecFrame::Resize(WindowSize::decode(&payload)?)),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown exec frame type 0x{other:02x}"),
        )),
    }
}
