//! Wire connections and the factory seam the pool creates them through.
//!
//! The pool only sees [`Connection`] and [`ConnectionFactory`]; tests inject
//! mocks, production uses [`SocketConnector`] which opens a [`Socket`] and
//! wraps it in a [`WireConnection`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::address::Address;
use crate::error::{Error, Result};
use crate::message::{HEADER_LENGTH, Message, MessageHeader, Reply};
use crate::options::ServerOptions;
use crate::socket::Socket;
use crate::tls::{TlsContext, TlsOptions};

/// An established, exclusively-owned transport to one server.
#[async_trait]
pub trait Connection: Send + fmt::Debug {
    /// Identifier unique within the factory that created the connection.
    fn id(&self) -> u64;

    /// Write every message, in order, as one contiguous buffer.
    async fn write(&mut self, messages: &[Box<dyn Message>]) -> Result<()>;

    /// Read exactly one reply frame.
    async fn read(&mut self) -> Result<Reply>;

    /// Close the underlying transport.
    fn close(&mut self);

    /// False while a reply to a written message is still unread. Such a
    /// connection cannot start another exchange.
    fn is_reusable(&self) -> bool {
        true
    }
}

/// Factory for creating new connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, address: &Address) -> Result<Box<dyn Connection>>;
}

// ── WireConnection ───────────────────────────────────────────────────

/// A [`Connection`] speaking the framed wire protocol over a [`Socket`].
pub struct WireConnection {
    id: u64,
    address: Address,
    socket: Socket,
    socket_timeout: Duration,
    /// Request id of the last replyable message written, if its reply is
    /// still outstanding.
    awaiting: Option<i32>,
    /// Replies owed by the server and not yet read.
    outstanding: usize,
}

impl fmt::Debug for WireConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireConnection")
            .field("id", &self.id)
            .field("address", &self.address.to_string())
            .field("tls", &self.socket.is_secure())
            .finish()
    }
}

impl WireConnection {
    /// Wrap an already connected socket.
    pub fn new(id: u64, address: Address, socket: Socket, socket_timeout: Duration) -> Self {
        Self {
            id,
            address,
            socket,
            socket_timeout,
            awaiting: None,
            outstanding: 0,
        }
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    fn timeout_error(&self, operation: &'static str) -> Error {
        Error::Timeout {
            operation,
            target: self.address.to_string(),
            after: self.socket_timeout,
        }
    }

    async fn read_frame(&mut self) -> Result<Reply> {
        let mut header = [0u8; HEADER_LENGTH];
        self.socket.read_exact(&mut header).await?;
        let header = MessageHeader::parse(&header);

        let mut body = vec![0u8; header.body_length()?];
        self.socket.read_exact(&mut body).await?;
        Reply::decode(header, &body)
    }
}

#[async_trait]
impl Connection for WireConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn write(&mut self, messages: &[Box<dyn Message>]) -> Result<()> {
        let mut buf = Vec::new();
        for message in messages {
            message.serialize(&mut buf)?;
        }

        match tokio::time::timeout(self.socket_timeout, self.socket.write_all(&buf)).await {
            Ok(result) => result?,
            Err(_) => return Err(self.timeout_error("write")),
        }

        self.awaiting = messages
            .iter()
            .rev()
            .find(|m| m.replyable())
            .map(|m| m.request_id());
        self.outstanding += messages.iter().filter(|m| m.replyable()).count();
        Ok(())
    }

    async fn read(&mut self) -> Result<Reply> {
        let reply = match tokio::time::timeout(self.socket_timeout, self.read_frame()).await {
            Ok(result) => result?,
            Err(_) => return Err(self.timeout_error("read")),
        };
        self.outstanding = self.outstanding.saturating_sub(1);

        if let Some(expected) = self.awaiting.take()
            && reply.header.response_to != expected
        {
            return Err(Error::Protocol(format!(
                "reply answers request {} but {expected} was outstanding",
                reply.header.response_to
            )));
        }
        Ok(reply)
    }

    fn close(&mut self) {
        debug!(id = self.id, address = %self.address, "closing connection");
        self.socket.close();
    }

    fn is_reusable(&self) -> bool {
        self.outstanding == 0
    }
}

// ── SocketConnector ──────────────────────────────────────────────────

/// Factory creating plain or TLS wire connections to a server.
pub struct SocketConnector {
    connect_timeout: Duration,
    socket_timeout: Duration,
    tls: Option<Arc<TlsContext>>,
    next_id: AtomicU64,
}

impl fmt::Debug for SocketConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketConnector")
            .field("connect_timeout", &self.connect_timeout)
            .field("socket_timeout", &self.socket_timeout)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

impl SocketConnector {
    pub fn plain(connect_timeout: Duration, socket_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            socket_timeout,
            tls: None,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn secure(connect_timeout: Duration, socket_timeout: Duration, tls: Arc<TlsContext>) -> Self {
        Self {
            tls: Some(tls),
            ..Self::plain(connect_timeout, socket_timeout)
        }
    }

    /// Build a connector from server options, loading TLS material when
    /// TLS is enabled.
    pub fn from_options(options: &ServerOptions) -> Result<Self> {
        let connector = match TlsOptions::from_options(options) {
            Some(tls) => Self::secure(
                options.connect_timeout(),
                options.socket_timeout(),
                Arc::new(TlsContext::new(&tls)?),
            ),
            None => Self::plain(options.connect_timeout(), options.socket_timeout()),
        };
        Ok(connector)
    }

    pub fn tls(&self) -> Option<&Arc<TlsContext>> {
        self.tls.as_ref()
    }

    fn socket(&self, address: &Address) -> Socket {
        match &self.tls {
            Some(tls) => Socket::secure(
                address.host(),
                address.port(),
                self.connect_timeout,
                Arc::clone(tls),
            ),
            None => Socket::plain(address.host(), address.port(), self.connect_timeout),
        }
    }
}

#[async_trait]
impl ConnectionFactory for SocketConnector {
    async fn connect(&self, address: &Address) -> Result<Box<dyn Connection>> {
        let mut socket = self.socket(address);
        socket.connect().await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            id,
            address = %address,
            tls = socket.is_secure(),
            "established connection"
        );
        Ok(Box::new(WireConnection::new(
            id,
            address.clone(),
            socket,
            self.socket_timeout,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Document, Insert, OpCode, Query, default_status_command};
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Read one framed message, returning its header.
    async fn read_message(stream: &mut TcpStream) -> Option<MessageHeader> {
        let mut header = [0u8; HEADER_LENGTH];
        stream.read_exact(&mut header).await.ok()?;
        let header = MessageHeader::parse(&header);
        let mut body = vec![0u8; header.body_length().ok()?];
        stream.read_exact(&mut body).await.ok()?;
        Some(header)
    }

    /// Answers every query with `{ok: 1, seen: <messages so far>}`.
    async fn spawn_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut seen = 0;
                    while let Some(header) = read_message(&mut stream).await {
                        seen += 1;
                        if header.op_code != OpCode::Query as i32 {
                            continue;
                        }
                        let doc = json!({"ok": 1, "seen": seen});
                        let frame = Reply::encode(header.request_id, &[doc.as_object().unwrap().clone()]).unwrap();
                        if stream.write_all(&frame).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn connector() -> SocketConnector {
        SocketConnector::plain(Duration::from_secs(2), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn status_command_roundtrip() {
        let addr = spawn_server().await;
        let mut conn = connector()
            .connect(&Address::new("127.0.0.1", addr.port()))
            .await
            .unwrap();

        let messages: Vec<Box<dyn Message>> = vec![Box::new(Query::status_command(default_status_command()))];
        conn.write(&messages).await.unwrap();
        let reply = conn.read().await.unwrap();
        assert_eq!(reply.header.response_to, messages[0].request_id());
        assert_eq!(reply.first_document().unwrap().get("ok"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn batch_is_written_in_order() {
        let addr = spawn_server().await;
        let mut conn = connector()
            .connect(&Address::new("127.0.0.1", addr.port()))
            .await
            .unwrap();

        let messages: Vec<Box<dyn Message>> = vec![
            Box::new(Insert::new("app", "users", vec![Document::new()])),
            Box::new(Insert::new("app", "users", vec![Document::new()])),
            Box::new(Query::command("app", default_status_command())),
        ];
        conn.write(&messages).await.unwrap();
        let reply = conn.read().await.unwrap();
        // Both inserts reached the server before the query.
        assert_eq!(reply.first_document().unwrap().get("seen"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn unread_reply_blocks_reuse_until_read() {
        let addr = spawn_server().await;
        let mut conn = connector()
            .connect(&Address::new("127.0.0.1", addr.port()))
            .await
            .unwrap();
        assert!(conn.is_reusable());

        let messages: Vec<Box<dyn Message>> = vec![
            Box::new(Query::command("app", default_status_command())),
            Box::new(Insert::new("app", "users", vec![Document::new()])),
        ];
        conn.write(&messages).await.unwrap();
        assert!(!conn.is_reusable());

        let reply = conn.read().await.unwrap();
        assert_eq!(reply.header.response_to, messages[0].request_id());
        assert!(conn.is_reusable());
    }

    #[tokio::test]
    async fn connection_ids_are_unique() {
        let addr = spawn_server().await;
        let factory = connector();
        let address = Address::new("127.0.0.1", addr.port());
        let a = factory.connect(&address).await.unwrap();
        let b = factory.connect(&address).await.unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn silent_server_times_out_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let factory = SocketConnector::plain(Duration::from_secs(2), Duration::from_millis(200));
        let mut conn = factory
            .connect(&Address::new("127.0.0.1", addr.port()))
            .await
            .unwrap();
        conn.write(&[Box::new(Query::command("admin", default_status_command())) as Box<dyn Message>])
            .await
            .unwrap();

        let err = conn.read().await.unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err:?}");
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn mismatched_reply_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let header = read_message(&mut stream).await.unwrap();
            let frame = Reply::encode(header.request_id + 1000, &[]).unwrap();
            stream.write_all(&frame).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let mut conn = connector()
            .connect(&Address::new("127.0.0.1", addr.port()))
            .await
            .unwrap();
        conn.write(&[Box::new(Query::command("admin", default_status_command())) as Box<dyn Message>])
            .await
            .unwrap();
        assert!(matches!(conn.read().await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn refused_connect_surfaces_io_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = connector()
            .connect(&Address::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[tokio::test]
    async fn closed_connection_rejects_io() {
        let addr = spawn_server().await;
        let mut conn = connector()
            .connect(&Address::new("127.0.0.1", addr.port()))
            .await
            .unwrap();
        conn.close();
        let messages: Vec<Box<dyn Message>> = vec![Box::new(Query::command("admin", Document::new()))];
        assert!(conn.write(&messages).await.is_err());
    }

    #[test]
    fn from_options_selects_transport() {
        let plain = SocketConnector::from_options(&ServerOptions::default()).unwrap();
        assert!(plain.tls().is_none());

        let secure = SocketConnector::from_options(&ServerOptions {
            ssl: Some(true),
            ..Default::default()
        })
        .unwrap();
        assert!(secure.tls().is_some());
        assert!(!secure.tls().unwrap().verifying_certificate());
    }

    #[test]
    fn from_options_propagates_tls_errors() {
        let options = ServerOptions {
            ssl_ca_cert: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        assert!(matches!(SocketConnector::from_options(&options), Err(Error::Tls(_))));
    }
}
