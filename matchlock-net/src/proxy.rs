//! Transparent L7 proxy.
//!
//! Guest TCP to ports 80/443 is redirected here by the firewall rules. Each
//! connection is policy-checked against the intended host (Host header for
//! HTTP, SNI for HTTPS); denials are synthesized locally and audited, allowed
//! traffic gets secret placeholders substituted in the request head and the
//! body spliced unchanged. HTTPS is terminated with a per-host leaf signed by
//! the sandbox CA and re-encrypted towards the real origin.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};

use crate::ca::SandboxCa;
use crate::policy::PolicyEngine;
use crate::secrets::SecretVault;
use crate::{Error, Result};

/// Upper bound on a request head (request line + headers).
const MAX_HEAD: usize = 64 * 1024;

/// Listener addresses for one proxy instance.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct ProxyConfig {
    /// Sandbox-facing interface address to bind.
    pub bind_addr: IpAddr,
    /// Port receiving redirected guest :80 traffic.
    pub http_port: u16,
    /// Port receiving redirected guest :443 traffic.
    pub https_port: u16,
}

impl ProxyConfig {
    /// Constructs a proxy config from its fields.
    #[must_use]
    pub const fn new(bind_addr: IpAddr, http_port: u16, https_port: u16) -> Self {
        Self {
            bind_addr,
            http_port,
            https_port,
        }
    }
}

/// A running per-sandbox proxy. Dropping (or [`Proxy::stop`]) tears down the
/// accept loops.
#[derive(Debug)]
pub struct Proxy {
    http_addr: SocketAddr,
    https_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Proxy {
    /// Binds both listeners and starts the accept loops.
    ///
    /// A bind failure aborts sandbox start, so errors here are fatal to the
    /// caller.
    pub async fn start(
        config: ProxyConfig,
        policy: Arc<PolicyEngine>,
        secrets: Arc<SecretVault>,
        ca: Arc<SandboxCa>,
    ) -> Result<Self> {
        let http = TcpListener::bind((config.bind_addr, config.http_port)).await?;
        let https = TcpListener::bind((config.bind_addr, config.https_port)).await?;
        let http_addr = http.local_addr()?;
        let https_addr = https.local_addr()?;
        let connector = upstream_connector();

        let mut tasks = Vec::with_capacity(2);
        {
            let policy = Arc::clone(&policy);
            let secrets = Arc::clone(&secrets);
            tasks.push(tokio::spawn(async move {
                loop {
                    let Ok((stream, peer)) = http.accept().await else {
                        return;
                    };
                    let policy = Arc::clone(&policy);
                    let secrets = Arc::clone(&secrets);
                    tokio::spawn(async move {
                        if let Err(e) = handle_http(stream, &policy, &secrets).await {
                            tracing::debug!(%peer, error = %e, "http session ended");
                        }
                    });
                }
            }));
        }
        {
            tasks.push(tokio::spawn(async move {
                loop {
                    let Ok((stream, peer)) = https.accept().await else {
                        return;
                    };
                    let policy = Arc::clone(&policy);
                    let secrets = Arc::clone(&secrets);
                    let ca = Arc::clone(&ca);
                    let connector = connector.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_https(stream, &policy, &secrets, &ca, &connector).await
                        {
                            tracing::debug!(%peer, error = %e, "https session ended");
                        }
                    });
                }
            }));
        }

        tracing::info!(%http_addr, %https_addr, "proxy listening");
        Ok(Self {
            http_addr,
            https_addr,
            tasks,
        })
    }

    /// Bound HTTP listener address.
    pub const fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Bound HTTPS listener address.
    pub const fn https_addr(&self) -> SocketAddr {
        self.https_addr
    }

    /// Stops the accept loops; in-flight sessions are aborted with them.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.stop();
    }
}

/// TLS connector for the upstream leg, verifying against the web PKI.
fn upstream_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Plain-HTTP interception path.
async fn handle_http(
    mut stream: TcpStream,
    policy: &PolicyEngine,
    secrets: &SecretVault,
) -> Result<()> {
    let Some(head) = read_head(&mut stream).await? else {
        return Ok(());
    };
    let parsed = parse_head(&head.raw)?;
    let Some((host, port)) = parsed.target_host(80) else {
        tracing::warn!("http request without Host header denied");
        return write_forbidden(&mut stream, "(no host)").await;
    };

    let decision = policy.evaluate(&host);
    if !decision.is_allowed() {
        tracing::warn!(host, "policy denied http egress");
        return write_forbidden(&mut stream, &host).await;
    }
    tracing::debug!(host, ?decision, "http egress allowed");

    let ip = match policy.resolve(&host).await {
        Ok(ip) => ip,
        Err(Error::Denied { host }) => {
            tracing::warn!(host, "policy denied http egress (private address)");
            return write_forbidden(&mut stream, &host).await;
        }
        Err(e) => {
            tracing::warn!(host, error = %e, "upstream resolution failed");
            return write_bad_gateway(&mut stream, &host).await;
        }
    };

    let mut upstream = match TcpStream::connect((ip, port)).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(host, %ip, port, error = %e, "upstream dial failed");
            return write_bad_gateway(&mut stream, &host).await;
        }
    };

    upstream
        .write_all(&rewrite_head(&parsed, &host, secrets))
        .await?;
    if !head.leftover.is_empty() {
        upstream.write_all(&head.leftover).await?;
    }
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
    Ok(())
}

/// HTTPS interception path: SNI peek, policy, terminate, re-encrypt.
async fn handle_https(
    stream: TcpStream,
    policy: &PolicyEngine,
    secrets: &SecretVault,
    ca: &SandboxCa,
    connector: &TlsConnector,
) -> Result<()> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = acceptor.await.map_err(|e| Error::Tls(e.to_string()))?;
    let Some(sni) = start.client_hello().server_name().map(str::to_owned) else {
        tracing::warn!("https connection without SNI dropped");
        return Ok(());
    };

    let decision = policy.evaluate(&sni);
    if !decision.is_allowed() {
        // Close before the handshake completes; the guest sees a TLS error.
        tracing::warn!(host = sni, "policy denied https egress");
        return Ok(());
    }
    tracing::debug!(host = sni, ?decision, "https egress allowed");

    let config = ca.server_config(&sni)?;
    let mut tls = start
        .into_stream(config)
        .await
        .map_err(|e| Error::Tls(e.to_string()))?;

    let ip = match policy.resolve(&sni).await {
        Ok(ip) => ip,
        Err(Error::Denied { host }) => {
            tracing::warn!(host, "policy denied https egress (private address)");
            return write_forbidden(&mut tls, &host).await;
        }
        Err(e) => {
            tracing::warn!(host = sni, error = %e, "upstream resolution failed");
            return write_bad_gateway(&mut tls, &sni).await;
        }
    };

    let upstream_tcp = match TcpStream::connect((ip, 443)).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(host = sni, %ip, error = %e, "upstream dial failed");
            return write_bad_gateway(&mut tls, &sni).await;
        }
    };
    let server_name = ServerName::try_from(sni.clone()).map_err(|e| Error::Tls(e.to_string()))?;
    let mut upstream = match connector.connect(server_name, upstream_tcp).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(host = sni, error = %e, "upstream tls handshake failed");
            return write_bad_gateway(&mut tls, &sni).await;
        }
    };

    // Decrypted inbound side: same head parse + substitution as HTTP.
    let Some(head) = read_head(&mut tls).await? else {
        return Ok(());
    };
    let parsed = parse_head(&head.raw)?;
    upstream
        .write_all(&rewrite_head(&parsed, &sni, secrets))
        .await?;
    if !head.leftover.is_empty() {
        upstream.write_all(&head.leftover).await?;
    }
    let _ = tokio::io::copy_bidirectional(&mut tls, &mut upstream).await;
    Ok(())
}

/// Raw request head plus any body bytes read past the delimiter.
struct Head {
    raw: Vec<u8>,
    leftover: Vec<u8>,
}

/// Reads until the `\r\n\r\n` head delimiter. `None` on immediate EOF.
async fn read_head(stream: &mut (impl AsyncRead + Unpin)) -> Result<Option<Head>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok(Some(Head { raw: buf, leftover }));
        }
        if buf.len() > MAX_HEAD {
            return Err(Error::BadRequest("request head exceeds 64 KiB".into()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(Error::BadRequest("eof inside request head".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parsed request line and headers.
#[derive(Debug, PartialEq, Eq)]
struct ParsedHead {
    request_line: String,
    headers: Vec<(String, String)>,
}

impl ParsedHead {
    /// Intended `(host, port)` from the Host header.
    fn target_host(&self, default_port: u16) -> Option<(String, u16)> {
        let value = self.header("host")?;
        Some(split_host_port(value, default_port))
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn parse_head(raw: &[u8]) -> Result<ParsedHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::BadRequest("request head is not valid UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::BadRequest("empty request".into()))?
        .to_owned();
    if request_line.split(' ').count() != 3 {
        return Err(Error::BadRequest(format!(
            "malformed request line: {request_line}"
        )));
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::BadRequest(format!("malformed header: {line}")))?;
        headers.push((name.trim().to_owned(), value.trim().to_owned()));
    }
    Ok(ParsedHead {
        request_line,
        headers,
    })
}

/// Splits `host[:port]`, tolerating bracketed IPv6 literals.
fn split_host_port(value: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = value.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_owned(), port);
        }
    }
    match value.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !host.is_empty() => {
            (host.to_owned(), port.parse().unwrap_or(default_port))
        }
        _ => (value.to_owned(), default_port),
    }
}

/// Serializes the head for the upstream leg: every header value runs through
/// secret substitution for the target host, and the connection is pinned to
/// close so one connection carries one auditable request.
fn rewrite_head(head: &ParsedHead, host: &str, secrets: &SecretVault) -> Vec<u8> {
    let mut out = String::with_capacity(256);
    out.push_str(&head.request_line);
    out.push_str("\r\n");
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("proxy-connection")
        {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(&secrets.substitute(host, value));
        out.push_str("\r\n");
    }
    out.push_str("Connection: close\r\n\r\n");
    out.into_bytes()
}

async fn write_forbidden(stream: &mut (impl AsyncWrite + Unpin), host: &str) -> Result<()> {
    let body = format!("matchlock: egress to {host} denied by policy\n");
    let resp = format!(
        "HTTP/1.1 403 Forbidden\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(resp.as_bytes()).await?;
    stream.shutdown().await.ok();
    Ok(())
}

async fn write_bad_gateway(stream: &mut (impl AsyncWrite + Unpin), host: &str) -> Result<()> {
    let body = format!("matchlock: upstream {host} unreachable\n");
    let resp = format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(resp.as_bytes()).await?;
    stream.shutdown().await.ok();
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::policy::PolicyConfig;
    use crate::secrets::Secret;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    #[test]
    fn parses_request_head() {
        let raw = b"GET /path HTTP/1.1\r\nHost: api.test:8080\r\nX-Key: abc\r\n\r\n";
        let head = parse_head(raw).unwrap();
        assert_eq!(head.request_line, "GET /path HTTP/1.1");
        assert_eq!(head.target_host(80), Some(("api.test".to_owned(), 8080)));
        assert_eq!(head.header("x-key"), Some("abc"));
        assert!(parse_head(b"garbage\r\n\r\n").is_err());
    }

    #[test]
    fn host_port_split_handles_ipv6() {
        assert_eq!(split_host_port("api.test", 80), ("api.test".into(), 80));
        assert_eq!(split_host_port("api.test:443", 80), ("api.test".into(), 443));
        assert_eq!(split_host_port("[::1]:8080", 80), ("::1".into(), 8080));
        assert_eq!(split_host_port("[::1]", 80), ("::1".into(), 80));
    }

    #[test]
    fn rewrite_substitutes_and_forces_close() {
        let vault = SecretVault::new(vec![Secret::new("KEY", "real", ["api.test"])]);
        let placeholder = vault.exec_env()[0].1.clone();
        let head = ParsedHead {
            request_line: "GET / HTTP/1.1".into(),
            headers: vec![
                ("Host".into(), "api.test".into()),
                ("Authorization".into(), format!("Bearer {placeholder}")),
                ("Connection".into(), "keep-alive".into()),
            ],
        };
        let bytes = rewrite_head(&head, "api.test", &vault);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Authorization: Bearer real"));
        assert!(!text.contains(&placeholder));
        assert!(text.ends_with("Connection: close\r\n\r\n"));
        assert!(!text.contains("keep-alive"));
    }

    async fn start_proxy(policy: PolicyEngine, secrets: SecretVault) -> Proxy {
        Proxy::start(
            ProxyConfig {
                bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                http_port: 0,
                https_port: 0,
            },
            Arc::new(policy),
            Arc::new(secrets),
            Arc::new(SandboxCa::new("test-vm").unwrap()),
        )
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn http_allowed_request_is_forwarded_with_substitution() {
        // Fake upstream capturing the request head.
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        let (tx, rx) = tokio::sync::oneshot::channel::<Vec<u8>>();
        tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.unwrap();
            let head = read_head(&mut conn).await.unwrap().unwrap();
            conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .await
                .unwrap();
            conn.shutdown().await.ok();
            tx.send(head.raw).ok();
        });

        let mut add_hosts = HashMap::new();
        add_hosts.insert("upstream.test".to_owned(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        let policy = PolicyEngine::new(PolicyConfig {
            allowed_hosts: vec!["upstream.test".into()],
            add_hosts,
            block_private_ips: false,
        });
        let secrets =
            SecretVault::new(vec![Secret::new("TOKEN", "real-secret", ["upstream.test"])]);
        let placeholder = secrets.exec_env()[0].1.clone();

        let proxy = start_proxy(policy, secrets).await;
        let mut client = TcpStream::connect(proxy.http_addr()).await.unwrap();
        let request = format!(
            "GET /v1/data HTTP/1.1\r\nHost: upstream.test:{upstream_port}\r\nAuthorization: Bearer {placeholder}\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {response}");
        assert!(response.ends_with("ok"));

        let seen = String::from_utf8(rx.await.unwrap()).unwrap();
        assert!(seen.contains("Authorization: Bearer real-secret"));
        assert!(!seen.contains(&placeholder));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn http_denied_host_gets_403() {
        let policy = PolicyEngine::new(PolicyConfig {
            allowed_hosts: vec!["only.this".into()],
            ..PolicyConfig::default()
        });
        let proxy = start_proxy(policy, SecretVault::default()).await;

        let mut client = TcpStream::connect(proxy.http_addr()).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: blocked.test\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 403 Forbidden"));
        assert!(response.contains("blocked.test"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn https_denied_sni_is_closed_before_handshake() {
        let policy = PolicyEngine::new(PolicyConfig {
            allowed_hosts: vec!["only.this".into()],
            ..PolicyConfig::default()
        });
        let proxy = start_proxy(policy, SecretVault::default()).await;

        // Client trusts nothing in particular; the handshake must fail
        // because the proxy closes on the denied SNI.
        let roots = rustls::RootCertStore::empty();
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let tcp = TcpStream::connect(proxy.https_addr()).await.unwrap();
        let name = ServerName::try_from("denied.test".to_owned()).unwrap();
        assert!(connector.connect(name, tcp).await.is_err());
    }
}
