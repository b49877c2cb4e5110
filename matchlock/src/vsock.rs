//! Host-side access to the VMM's vsock UDS multiplexer.
//!
//! The VMM exposes one Unix socket per instance. Guest-initiated connections
//! to guest port `N` surface on a host listener bound at `<uds>_<N>`;
//! host-initiated connections open `<uds>` itself and negotiate the target
//! port with a `CONNECT <port>` line, answered by `OK <assigned>`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

/// Host listener path for guest-initiated connections to `port`.
pub fn listener_path(uds: &Path, port: u32) -> PathBuf {
    let mut path = uds.as_os_str().to_owned();
    path.push(format!("_{port}"));
    PathBuf::from(path)
}

/// Binds the host listener for guest-initiated connections to `port`,
/// replacing any stale socket file.
pub fn bind_port(uds: &Path, port: u32) -> io::Result<UnixListener> {
    let path = listener_path(uds, port);
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    UnixListener::bind(&path)
}

/// Opens a host-initiated connection to guest `port` via the multiplexer.
pub async fn connect_port(uds: &Path, port: u32) -> io::Result<UnixStream> {
    let mut stream = UnixStream::connect(uds).await?;
    stream
        .write_all(format!("CONNECT {port}\n").as_bytes())
        .await?;

    // The multiplexer answers with a single `OK <port>\n` line.
    let mut line = Vec::with_capacity(16);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "vsock multiplexer closed during CONNECT",
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized CONNECT response",
            ));
        }
    }

    if line.starts_with(b"OK") {
        Ok(stream)
    } else {
        Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!(
                "vsock CONNECT {port} refused: {}",
                String::from_utf8_lossy(&line)
            ),
        ))
    }
}

/// Waits for the guest ready signal: a bare connect on the ready port.
///
/// The listener must be bound before the VMM spawns so the signal cannot be
/// lost; pass it in from the coordinator.
pub async fn wait_ready(listener: &UnixListener, timeout: Duration) -> io::Result<()> {
    tokio::time::timeout(timeout, listener.accept())
        .await
        .map_err(|_| {
            io::Error::new(io::ErrorKind::TimedOut, "guest ready signal did not arrive")
        })?
        .map(|_| ())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn listener_paths_append_the_port() {
        assert_eq!(
            listener_path(Path::new("/run/vm/vsock.sock"), 5001),
            PathBuf::from("/run/vm/vsock.sock_5001")
        );
    }

    #[tokio::test]
    async fn connect_negotiates_with_the_multiplexer() {
        let dir = tempfile::tempdir().unwrap();
        let uds = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&uds).unwrap();

        // Mock multiplexer: accept, expect CONNECT, grant it.
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 32];
            let n = conn.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"CONNECT 5000\n");
            conn.write_all(b"OK 5000\n").await.unwrap();
            // Keep the stream open until the client is done.
            let _ = conn.read(&mut buf).await;
        });

        let stream = connect_port(&uds, 5000).await.unwrap();
        drop(stream);
    }

    #[tokio::test]
    async fn connect_refusal_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let uds = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&uds).unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 32];
            let _ = conn.read(&mut buf).await.unwrap();
            conn.write_all(b"ERR no listener\n").await.unwrap();
        });

        let err = connect_port(&uds, 9).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn ready_signal_is_a_bare_connect() {
        let dir = tempfile::tempdir().unwrap();
        let uds = dir.path().join("vsock.sock");
        let ready = bind_port(&uds, matchlock_proto::READY_PORT).unwrap();

        let ready_path = listener_path(&uds, matchlock_proto::READY_PORT);
        tokio::spawn(async move {
            let _ = UnixStream::connect(&ready_path).await;
        });

        wait_ready(&ready, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn ready_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let uds = dir.path().join("vsock.sock");
        let ready = bind_port(&uds, matchlock_proto::READY_PORT).unwrap();
        let err = wait_ready(&ready, Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
