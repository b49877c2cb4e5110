//! Serves a [`MountRouter`] to the in-guest FUSE daemon.
//!
//! One accept loop, one task per connection; requests on a connection are
//! processed serially (the guest daemon sends one outstanding request at a
//! time). Provider handles are local to each provider, so the server keeps
//! its own wire-handle table mapping a server-assigned id to
//! `(provider, provider-local handle)` — provider handle reuse can never
//! collide on the wire.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use matchlock_proto::vfs::{self, VfsOp, VfsRequest, VfsResponse};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::UnixListener;

use crate::provider::{Provider, SetAttr, VfsError, VfsResult, mkdir_all};
use crate::router::MountRouter;

/// VFS server for one sandbox instance.
#[derive(Debug, Clone)]
pub struct VfsServer {
    router: Arc<MountRouter>,
}

/// Per-connection table of wire handles.
#[derive(Default)]
struct HandleTable {
    entries: HashMap<u64, (Arc<dyn Provider>, u64)>,
    next: u64,
}

impl HandleTable {
    fn insert(&mut self, provider: Arc<dyn Provider>, inner: u64) -> u64 {
        self.next += 1;
        self.entries.insert(self.next, (provider, inner));
        self.next
    }

    fn get(&self, handle: u64) -> VfsResult<(Arc<dyn Provider>, u64)> {
        self.entries
            .get(&handle)
            .map(|(p, h)| (Arc::clone(p), *h))
            .ok_or(VfsError::BadHandle)
    }

    fn remove(&mut self, handle: u64) -> VfsResult<(Arc<dyn Provider>, u64)> {
        self.entries.remove(&handle).ok_or(VfsError::BadHandle)
    }
}

impl VfsServer {
    /// Creates a server over the given mount table.
    pub fn new(router: Arc<MountRouter>) -> Self {
        Self { router }
    }

    /// Accepts guest connections on `listener` until the task is cancelled.
    pub async fn serve(self, listener: UnixListener) -> io::Result<()> {
        loop {
            let (stream, _addr) = listener.accept().await?;
            let router = Arc::clone(&self.router);
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                if let Err(e) = serve_connection(router, reader, writer).await {
                    tracing::debug!(error = %e, "vfs connection closed with error");
                }
            });
        }
    }

    /// Serves a single already-established stream (used by tests and the
    /// coordinator's in-process wiring).
    pub async fn serve_stream<S>(&self, stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        serve_connection(Arc::clone(&self.router), reader, writer).await
    }
}

/// Request loop for one connection: recv → dispatch → send, strictly ordered.
async fn serve_connection(
    router: Arc<MountRouter>,
    reader: impl AsyncRead + Unpin,
    writer: impl AsyncWrite + Unpin,
) -> io::Result<()> {
    let mut r = BufReader::new(reader);
    let mut w = BufWriter::new(writer);
    let mut handles = HandleTable::default();

    loop {
        let req: VfsRequest = match vfs::recv(&mut r).await {
            Ok(req) => req,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                release_all(&mut handles);
                return Ok(());
            }
            Err(e) => {
                release_all(&mut handles);
                return Err(e);
            }
        };
        let resp = dispatch(&router, &mut handles, &req)
            .unwrap_or_else(|e| VfsResponse::error(e.errno()));
        vfs::send(&mut w, &resp).await?;
    }
}

/// Releases every handle the peer left open (connection teardown).
fn release_all(handles: &mut HandleTable) {
    for (provider, inner) in handles.entries.drain().map(|(_, v)| v) {
        let _ = provider.release(inner);
    }
}

fn dispatch(
    router: &MountRouter,
    handles: &mut HandleTable,
    req: &VfsRequest,
) -> VfsResult<VfsResponse> {
    match req.op {
        VfsOp::Lookup => {
            let (provider, rel) = router.route(req_path(req)?);
            let stat = provider.lookup(&rel)?;
            Ok(VfsResponse::ok().with_stat(stat))
        }
        VfsOp::Getattr => {
            let (provider, rel) = router.route(req_path(req)?);
            let stat = provider.getattr(&rel)?;
            Ok(VfsResponse::ok().with_stat(stat))
        }
        VfsOp::Setattr => {
            let (provider, rel) = router.route(req_path(req)?);
            // The wire record carries size and mode; mtime updates are a
            // host-side concern (SetAttr::mtime) and never cross the wire.
            let attr = SetAttr {
                size: req.size,
                mode: req.mode,
                mtime: None,
            };
            let stat = provider.setattr(&rel, &attr)?;
            Ok(VfsResponse::ok().with_stat(stat))
        }
        VfsOp::Open => {
            let (provider, rel) = router.route(req_path(req)?);
            let inner = provider.open(&rel, req.flags.unwrap_or(0))?;
            let handle = handles.insert(provider, inner);
            Ok(VfsResponse::ok().with_handle(handle))
        }
        VfsOp::Create => {
            let (provider, rel) = router.route(req_path(req)?);
            let inner = provider.create(&rel, req.mode.unwrap_or(0o644))?;
            let handle = handles.insert(provider, inner);
            Ok(VfsResponse::ok().with_handle(handle))
        }
        VfsOp::Release => {
            let (provider, inner) = handles.remove(req_handle(req)?)?;
            provider.release(inner)?;
            Ok(VfsResponse::ok())
        }
        VfsOp::Read => {
            let (provider, inner) = handles.get(req_handle(req)?)?;
            let data = provider.read(inner, req.offset.unwrap_or(0), req.size.unwrap_or(0))?;
            Ok(VfsResponse::ok().with_data(data))
        }
        VfsOp::Write => {
            let (provider, inner) = handles.get(req_handle(req)?)?;
            let data = req.data.as_deref().unwrap_or(&[]);
            let written = provider.write(inner, req.offset.unwrap_or(0), data)?;
            Ok(VfsResponse::ok().with_written(written))
        }
        VfsOp::Mkdir => {
            let (provider, rel) = router.route(req_path(req)?);
            provider.mkdir(&rel, req.mode.unwrap_or(0o755))?;
            Ok(VfsResponse::ok())
        }
        VfsOp::MkdirAll => {
            let (provider, rel) = router.route(req_path(req)?);
            mkdir_all(provider.as_ref(), &rel, req.mode.unwrap_or(0o755))?;
            Ok(VfsResponse::ok())
        }
        VfsOp::Unlink => {
            let (provider, rel) = router.route(req_path(req)?);
            provider.unlink(&rel)?;
            Ok(VfsResponse::ok())
        }
        VfsOp::Rmdir => {
            let (provider, rel) = router.route(req_path(req)?);
            provider.rmdir(&rel)?;
            Ok(VfsResponse::ok())
        }
        VfsOp::Rename => {
            let old = req_path(req)?;
            let new = req
                .new_path
                .as_deref()
                .ok_or_else(|| VfsError::InvalidPath("missing new_path".into()))?;
            let (provider, old_rel, new_rel) = router.route_rename(old, new)?;
            provider.rename(&old_rel, &new_rel)?;
            Ok(VfsResponse::ok())
        }
        VfsOp::Readdir => {
            let (provider, rel) = router.route(req_path(req)?);
            let entries = provider.readdir(&rel)?;
            Ok(VfsResponse::ok().with_entries(entries))
        }
        VfsOp::Fsync => {
            let (provider, inner) = handles.get(req_handle(req)?)?;
            provider.fsync(inner)?;
            Ok(VfsResponse::ok())
        }
        _ => unreachable!("unhandled VfsOp variant"),
    }
}

fn req_path(req: &VfsRequest) -> VfsResult<&str> {
    req.path
        .as_deref()
        .ok_or_else(|| VfsError::InvalidPath("missing path".into()))
}

fn req_handle(req: &VfsRequest) -> VfsResult<u64> {
    req.handle.ok_or(VfsError::BadHandle)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;
    use matchlock_proto::vfs::FileStat;

    async fn call(
        stream: &mut tokio::io::DuplexStream,
        req: VfsRequest,
    ) -> VfsResponse {
        vfs::send(stream, &req).await.unwrap();
        vfs::recv(stream).await.unwrap()
    }

    fn spawn_server(router: MountRouter) -> tokio::io::DuplexStream {
        let (client, server_side) = tokio::io::duplex(1 << 16);
        let server = VfsServer::new(Arc::new(router));
        tokio::spawn(async move {
            let _ = server.serve_stream(server_side).await;
        });
        client
    }

    #[tokio::test]
    async fn create_write_read_over_the_wire() {
        let default = Arc::new(MemoryProvider::new());
        let mut stream = spawn_server(MountRouter::new(default));

        let mut req = VfsRequest::for_path(VfsOp::Create, "/hello.txt");
        req.mode = Some(0o644);
        let resp = call(&mut stream, req).await;
        assert_eq!(resp.err, 0);
        let handle = resp.handle.unwrap();

        let mut req = VfsRequest::new(VfsOp::Write);
        req.handle = Some(handle);
        req.offset = Some(0);
        req.data = Some(b"over the wire".to_vec());
        let resp = call(&mut stream, req).await;
        assert_eq!(resp.err, 0);
        assert_eq!(resp.written, Some(13));

        let mut req = VfsRequest::new(VfsOp::Read);
        req.handle = Some(handle);
        req.offset = Some(0);
        req.size = Some(64);
        let resp = call(&mut stream, req).await;
        assert_eq!(resp.err, 0);
        assert_eq!(resp.data.as_deref(), Some(b"over the wire".as_slice()));

        let mut req = VfsRequest::new(VfsOp::Release);
        req.handle = Some(handle);
        assert_eq!(call(&mut stream, req).await.err, 0);

        let resp = call(
            &mut stream,
            VfsRequest::for_path(VfsOp::Getattr, "/hello.txt"),
        )
        .await;
        assert_eq!(resp.err, 0);
        assert_eq!(
            resp.stat,
            Some(FileStat {
                size: 13,
                mode: 0o644,
                mtime: resp.stat.unwrap().mtime,
                is_dir: false,
            })
        );
    }

    #[tokio::test]
    async fn errors_travel_as_negative_errno() {
        let default = Arc::new(MemoryProvider::new());
        let mut stream = spawn_server(MountRouter::new(default));

        let resp = call(&mut stream, VfsRequest::for_path(VfsOp::Getattr, "/nope")).await;
        assert_eq!(resp.err, -2);

        let mut req = VfsRequest::new(VfsOp::Read);
        req.handle = Some(999);
        let resp = call(&mut stream, req).await;
        assert_eq!(resp.err, -9);
    }

    #[tokio::test]
    async fn routes_across_mounts_and_rejects_cross_mount_rename() {
        let default = Arc::new(MemoryProvider::new());
        let mounted = Arc::new(MemoryProvider::new());
        mounted.insert_file("/inside.txt", 0o644, b"mounted").unwrap();

        let mut router = MountRouter::new(default);
        router.mount("/mnt/data", mounted).unwrap();
        let mut stream = spawn_server(router);

        let resp = call(
            &mut stream,
            VfsRequest::for_path(VfsOp::Getattr, "/mnt/data/inside.txt"),
        )
        .await;
        assert_eq!(resp.err, 0);
        assert_eq!(resp.stat.unwrap().size, 7);

        let mut req = VfsRequest::for_path(VfsOp::Rename, "/mnt/data/inside.txt");
        req.new_path = Some("/outside.txt".into());
        let resp = call(&mut stream, req).await;
        assert_eq!(resp.err, -18);
    }

    #[tokio::test]
    async fn mkdir_all_creates_chain() {
        let default = Arc::new(MemoryProvider::new());
        let mut stream = spawn_server(MountRouter::new(default));

        let mut req = VfsRequest::for_path(VfsOp::MkdirAll, "/a/b/c");
        req.mode = Some(0o755);
        assert_eq!(call(&mut stream, req).await.err, 0);

        let resp = call(&mut stream, VfsRequest::for_path(VfsOp::Readdir, "/a/b")).await;
        assert_eq!(resp.err, 0);
        let entries = resp.entries.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "c");
        assert!(entries[0].is_dir);
    }

    #[tokio::test]
    async fn requests_are_answered_in_order() {
        let default = Arc::new(MemoryProvider::new());
        default.insert_file("/seq", 0o644, b"0123456789").unwrap();
        let mut stream = spawn_server(MountRouter::new(default));

        let resp = call(&mut stream, VfsRequest::for_path(VfsOp::Open, "/seq")).await;
        let handle = resp.handle.unwrap();

        // Fire several reads back-to-back; responses must come back in
        // request order with matching payloads.
        for (offset, expect) in [(0u64, b"01".as_slice()), (4, b"45"), (8, b"89")] {
            let mut req = VfsRequest::new(VfsOp::Read);
            req.handle = Some(handle);
            req.offset = Some(offset);
            req.size = Some(2);
            let resp = call(&mut stream, req).await;
            assert_eq!(resp.data.as_deref(), Some(expect));
        }
    }
}
