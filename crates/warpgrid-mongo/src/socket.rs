//! Plain and secure sockets.
//!
//! A [`Socket`] is single-use and moves through a small state machine:
//!
//! ```text
//! Unconnected ──connect()──▶ Connecting ──▶ Connected
//!                                 │
//!                                 └──────▶ Failed   (timeout, refused, handshake)
//! ```
//!
//! The connect timeout bounds the TCP connect and the TLS handshake together.
//! Once connected, the socket is a bidirectional byte stream; when TLS is
//! configured the bytes are encrypted transparently via `tokio-rustls`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::error::{Error, Result};
use crate::tls::TlsContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketState {
    Unconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketState::Unconnected => write!(f, "unconnected"),
            SocketState::Connecting => write!(f, "connecting"),
            SocketState::Connected => write!(f, "connected"),
            SocketState::Failed => write!(f, "failed"),
        }
    }
}

// ── Transport ────────────────────────────────────────────────────────

/// Underlying transport: plain TCP or TLS over TCP.
enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
            Stream::Tls(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.read_exact(buf).await.map(|_| ()),
            Stream::Tls(s) => s.read_exact(buf).await.map(|_| ()),
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.shutdown().await,
            Stream::Tls(s) => s.shutdown().await,
        }
    }
}

// ── Socket ───────────────────────────────────────────────────────────

pub struct Socket {
    host: String,
    port: u16,
    timeout: Duration,
    tls: Option<Arc<TlsContext>>,
    state: SocketState,
    stream: Option<Stream>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .field("state", &self.state)
            .finish()
    }
}

impl Socket {
    pub fn plain(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout,
            tls: None,
            state: SocketState::Unconnected,
            stream: None,
        }
    }

    pub fn secure(host: &str, port: u16, timeout: Duration, tls: Arc<TlsContext>) -> Self {
        Self {
            tls: Some(tls),
            ..Self::plain(host, port, timeout)
        }
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the configured TLS context validates the peer certificate.
    /// Always false for plain sockets. Performs no I/O.
    pub fn verifying_certificate(&self) -> bool {
        self.tls
            .as_ref()
            .is_some_and(|tls| tls.verifying_certificate())
    }

    fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Connect to the target, performing the TLS handshake when configured.
    ///
    /// May only be called once. On any failure the socket moves to
    /// [`SocketState::Failed`] and stays unusable.
    pub async fn connect(&mut self) -> Result<()> {
        if self.state != SocketState::Unconnected {
            return Err(self.state_error("connect may only be attempted on a fresh socket"));
        }
        self.state = SocketState::Connecting;

        let outcome = tokio::time::timeout(self.timeout, self.establish()).await;
        match outcome {
            Ok(Ok(stream)) => {
                self.stream = Some(stream);
                self.state = SocketState::Connected;
                debug!(
                    host = %self.host,
                    port = self.port,
                    tls = self.tls.is_some(),
                    verify = self.verifying_certificate(),
                    "socket connected"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = SocketState::Failed;
                debug!(host = %self.host, port = self.port, error = %e, "socket connect failed");
                Err(e)
            }
            Err(_) => {
                self.state = SocketState::Failed;
                debug!(
                    host = %self.host,
                    port = self.port,
                    timeout = ?self.timeout,
                    "socket connect timed out"
                );
                Err(Error::Timeout {
                    operation: "connect",
                    target: self.target(),
                    after: self.timeout,
                })
            }
        }
    }

    async fn establish(&self) -> Result<Stream> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| Error::io(format!("tcp connect to {}", self.target()), e))?;

        // Disable Nagle's algorithm for request/response exchanges.
        let _ = tcp.set_nodelay(true);

        let Some(tls) = &self.tls else {
            return Ok(Stream::Plain(tcp));
        };

        let server_name = ServerName::try_from(self.host.clone()).map_err(|e| Error::Handshake {
            host: self.host.clone(),
            reason: format!("invalid tls server name: {e}"),
        })?;

        let stream = TlsConnector::from(tls.client_config())
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Handshake {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;

        Ok(Stream::Tls(Box::new(stream)))
    }

    fn state_error(&self, reason: &'static str) -> Error {
        Error::SocketState {
            target: self.target(),
            state: self.state.to_string(),
            reason,
        }
    }

    fn stream(&mut self) -> Result<&mut Stream> {
        if self.state != SocketState::Connected {
            return Err(self.state_error("socket is not connected"));
        }
        let target = self.target();
        self.stream.as_mut().ok_or(Error::SocketState {
            target,
            state: SocketState::Connected.to_string(),
            reason: "socket stream already shut down",
        })
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let target = self.target();
        self.stream()?
            .write_all(buf)
            .await
            .map_err(|e| Error::io(format!("write to {target}"), e))
    }

    /// Fill `buf` completely. A peer close surfaces as
    /// [`Error::ConnectionClosed`].
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let target = self.target();
        self.stream()?.read_exact(buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::ConnectionClosed(target)
            } else {
                Error::io(format!("read from {target}"), e)
            }
        })
    }

    /// Shut the transport down. Further I/O fails.
    pub async fn shutdown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    /// Drop the transport without a graceful shutdown.
    pub fn close(&mut self) {
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::TlsOptions;
    use crate::tls::testing::TestPki;
    use std::net::SocketAddr;
    use std::time::Instant;
    use tokio::net::TcpListener;

    async fn echo(mut stream: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin) {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(echo(stream));
            }
        });
        addr
    }

    async fn spawn_tls_echo_server(config: Arc<rustls::ServerConfig>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(config);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(tls) = acceptor.accept(stream).await {
                        echo(tls).await;
                    }
                });
            }
        });
        addr
    }

    fn context(options: TlsOptions) -> Arc<TlsContext> {
        Arc::new(TlsContext::new(&options).unwrap())
    }

    // ── Plain sockets ───────────────────────────────────────────────

    #[tokio::test]
    async fn plain_connect_and_roundtrip() {
        let addr = spawn_echo_server().await;
        let mut socket = Socket::plain("127.0.0.1", addr.port(), Duration::from_secs(2));
        assert_eq!(socket.state(), SocketState::Unconnected);

        socket.connect().await.unwrap();
        assert_eq!(socket.state(), SocketState::Connected);
        assert!(!socket.is_secure());

        socket.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn socket_is_single_use() {
        let addr = spawn_echo_server().await;
        let mut socket = Socket::plain("127.0.0.1", addr.port(), Duration::from_secs(2));
        socket.connect().await.unwrap();

        let err = socket.connect().await.unwrap_err();
        assert!(matches!(err, Error::SocketState { .. }));
        // The established stream is left untouched.
        assert_eq!(socket.state(), SocketState::Connected);
    }

    #[tokio::test]
    async fn refused_connect_fails_socket() {
        // Bind then drop to obtain a port with no listener.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut socket = Socket::plain("127.0.0.1", port, Duration::from_secs(2));
        let err = socket.connect().await.unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(socket.state(), SocketState::Failed);

        // A failed socket cannot be retried.
        assert!(socket.connect().await.is_err());
    }

    #[tokio::test]
    async fn io_before_connect_is_rejected() {
        let mut socket = Socket::plain("127.0.0.1", 1, Duration::from_secs(1));
        let err = socket.write_all(b"x").await.unwrap_err();
        assert!(matches!(err, Error::SocketState { .. }));
    }

    #[tokio::test]
    async fn peer_close_is_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut socket = Socket::plain("127.0.0.1", addr.port(), Duration::from_secs(2));
        socket.connect().await.unwrap();
        let mut buf = [0u8; 4];
        let err = socket.read_exact(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn shutdown_stops_further_io() {
        let addr = spawn_echo_server().await;
        let mut socket = Socket::plain("127.0.0.1", addr.port(), Duration::from_secs(2));
        socket.connect().await.unwrap();
        socket.shutdown().await;
        assert!(socket.write_all(b"x").await.is_err());
    }

    // ── Secure sockets ──────────────────────────────────────────────

    #[tokio::test]
    async fn verified_handshake_succeeds() {
        let pki = TestPki::new();
        let server_leaf = pki.leaf("server", &["127.0.0.1"]);
        let addr = spawn_tls_echo_server(pki.server_config(&server_leaf, false)).await;

        let ctx = context(TlsOptions {
            ca_cert: Some(pki.ca_path.clone()),
            ..Default::default()
        });
        let mut socket = Socket::secure("127.0.0.1", addr.port(), Duration::from_secs(2), ctx);
        assert!(socket.verifying_certificate());

        socket.connect().await.unwrap();
        assert_eq!(socket.state(), SocketState::Connected);

        socket.write_all(b"encrypted hello").await.unwrap();
        let mut buf = [0u8; 15];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"encrypted hello");
    }

    #[tokio::test]
    async fn hostname_mismatch_fails_handshake() {
        let pki = TestPki::new();
        let server_leaf = pki.leaf("server", &["db.warp.internal"]);
        let addr = spawn_tls_echo_server(pki.server_config(&server_leaf, false)).await;

        let ctx = context(TlsOptions {
            verify: true,
            ca_cert: Some(pki.ca_path.clone()),
            ..Default::default()
        });
        let mut socket = Socket::secure("127.0.0.1", addr.port(), Duration::from_secs(2), ctx);

        let err = socket.connect().await.unwrap_err();
        assert!(
            matches!(&err, Error::Handshake { host, .. } if host == "127.0.0.1"),
            "expected handshake error, got {err:?}"
        );
        assert_eq!(socket.state(), SocketState::Failed);
        assert!(socket.write_all(b"x").await.is_err());
    }

    #[tokio::test]
    async fn untrusted_ca_fails_handshake() {
        let trusted = TestPki::new();
        let other = TestPki::new();
        let server_leaf = other.leaf("server", &["127.0.0.1"]);
        let addr = spawn_tls_echo_server(other.server_config(&server_leaf, false)).await;

        let ctx = context(TlsOptions {
            ca_cert: Some(trusted.ca_path.clone()),
            ..Default::default()
        });
        let mut socket = Socket::secure("127.0.0.1", addr.port(), Duration::from_secs(2), ctx);
        assert!(matches!(socket.connect().await, Err(Error::Handshake { .. })));
        assert_eq!(socket.state(), SocketState::Failed);
    }

    #[tokio::test]
    async fn unverified_handshake_accepts_mismatched_name() {
        let pki = TestPki::new();
        let server_leaf = pki.leaf("server", &["db.warp.internal"]);
        let addr = spawn_tls_echo_server(pki.server_config(&server_leaf, false)).await;

        let ctx = context(TlsOptions::default());
        let mut socket = Socket::secure("127.0.0.1", addr.port(), Duration::from_secs(2), ctx);
        assert!(!socket.verifying_certificate());

        socket.connect().await.unwrap();
        assert_eq!(socket.state(), SocketState::Connected);
    }

    #[tokio::test]
    async fn mutual_tls_presents_client_certificate() {
        let pki = TestPki::new();
        let server_leaf = pki.leaf("server", &["127.0.0.1"]);
        let client_leaf = pki.leaf("client", &["client.warp.local"]);
        let addr = spawn_tls_echo_server(pki.server_config(&server_leaf, true)).await;

        let ctx = context(TlsOptions {
            cert: Some(client_leaf.cert_path.clone()),
            key: Some(client_leaf.key_path.clone()),
            verify: true,
            ca_cert: Some(pki.ca_path.clone()),
        });
        let mut socket = Socket::secure("127.0.0.1", addr.port(), Duration::from_secs(2), ctx);
        socket.connect().await.unwrap();

        socket.write_all(b"mtls").await.unwrap();
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"mtls");
    }

    #[tokio::test]
    async fn unresponsive_peer_times_out_within_margin() {
        // The kernel completes the TCP handshake from the backlog, but nobody
        // ever answers the TLS ClientHello.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let timeout = Duration::from_millis(500);
        let ctx = context(TlsOptions::default());
        let mut socket = Socket::secure("127.0.0.1", addr.port(), timeout, ctx);

        let started = Instant::now();
        let err = socket.connect().await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout(), "expected timeout, got {err:?}");
        assert!(elapsed >= timeout, "failed early after {elapsed:?}");
        assert!(elapsed < timeout + Duration::from_millis(250), "failed late after {elapsed:?}");
        assert_eq!(socket.state(), SocketState::Failed);
        drop(listener);
    }
}
