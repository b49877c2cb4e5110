//! Runtime policy control socket.
//!
//! A line-oriented Unix socket next to the exec relay: external clients send
//! one JSON object per line (`{"add": [...], "remove": [...]}`) and receive
//! the post-update allow-list back. Updates apply atomically to the running
//! sandbox's policy engine.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use matchlock_net::PolicyEngine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

use crate::Result;

/// One allow-list update request.
#[derive(Debug, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct PolicyUpdate {
    /// Entries to add.
    #[serde(default)]
    pub add: Vec<String>,
    /// Entries to remove (by the normalized text that added them).
    #[serde(default)]
    pub remove: Vec<String>,
}

/// Reply to an update: the allow-list now in force.
#[derive(Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct PolicySnapshot {
    /// Current allow-list entries.
    pub allowed_hosts: Vec<String>,
}

/// The control socket for one sandbox instance.
#[derive(Debug)]
pub struct PolicyControl {
    socket_path: PathBuf,
    task: JoinHandle<()>,
}

impl PolicyControl {
    /// Binds the control socket and starts serving updates.
    pub async fn start(socket_path: &Path, policy: Arc<PolicyEngine>) -> Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o700))?;

        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    return;
                };
                let policy = Arc::clone(&policy);
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, &policy).await {
                        tracing::debug!(error = %e, "policy control session ended");
                    }
                });
            }
        });

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            task,
        })
    }

    /// Control socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stops serving and removes the socket file.
    pub fn stop(&mut self) {
        self.task.abort();
        std::fs::remove_file(&self.socket_path).ok();
    }
}

impl Drop for PolicyControl {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(stream: tokio::net::UnixStream, policy: &PolicyEngine) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let update: PolicyUpdate = match serde_json::from_str(&line) {
            Ok(update) => update,
            Err(e) => {
                let reply = format!("{{\"error\":\"{e}\"}}\n");
                writer.write_all(reply.as_bytes()).await?;
                continue;
            }
        };
        tracing::info!(add = ?update.add, remove = ?update.remove, "allow-list update");
        policy.update(&update.add, &update.remove);

        let snapshot = PolicySnapshot {
            allowed_hosts: policy.allowed_hosts(),
        };
        let mut reply = serde_json::to_vec(&snapshot)?;
        reply.push(b'\n');
        writer.write_all(&reply).await?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use matchlock_net::PolicyConfig;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn updates_apply_to_the_live_policy() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("policy.sock");
        let policy = Arc::new(PolicyEngine::new(
            PolicyConfig::default().with_allowed_hosts(vec!["old.test".into()]),
        ));
        let _control = PolicyControl::start(&sock, Arc::clone(&policy)).await.unwrap();

        let mut client = UnixStream::connect(&sock).await.unwrap();
        client
            .write_all(b"{\"add\":[\"*.new.test\"],\"remove\":[\"old.test\"]}\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        let snapshot: PolicySnapshot = serde_json::from_str(reply.trim()).unwrap();
        assert_eq!(snapshot.allowed_hosts, vec!["*.new.test".to_owned()]);

        assert!(policy.evaluate("api.new.test").is_allowed());
        assert!(!policy.evaluate("old.test").is_allowed());
    }

    #[tokio::test]
    async fn malformed_lines_report_errors_without_closing() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("policy.sock");
        let policy = Arc::new(PolicyEngine::new(PolicyConfig::default()));
        let _control = PolicyControl::start(&sock, Arc::clone(&policy)).await.unwrap();

        let mut client = UnixStream::connect(&sock).await.unwrap();
        client.write_all(b"not json\n").await.unwrap();
        client
            .write_all(b"{\"add\":[\"ok.test\"]}\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        let mut lines = reply.lines();
        assert!(lines.next().unwrap().contains("error"));
        let snapshot: PolicySnapshot = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(snapshot.allowed_hosts, vec!["ok.test".to_owned()]);
        assert!(policy.evaluate("ok.test").is_allowed());
    }
}
