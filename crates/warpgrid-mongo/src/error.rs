//! Error types for the driver core.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for driver core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by sockets, the connection pool, and the server.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// TLS material (certificates, keys, CA bundle) could not be loaded.
    #[error("tls configuration error: {0}")]
    Tls(String),

    #[error("{operation} to {target} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        target: String,
        after: Duration,
    },

    /// TLS negotiation failed or the peer identity did not match the host.
    #[error("tls handshake with {host} failed: {reason}")]
    Handshake { host: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {0} closed by peer")]
    ConnectionClosed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("connection pool exhausted for {address} (waited {waited:?})")]
    PoolExhausted { address: String, waited: Duration },

    #[error("connection pool for {0} is closed")]
    PoolClosed(String),

    #[error("socket {target} is {state}: {reason}")]
    SocketState {
        target: String,
        state: String,
        reason: &'static str,
    },

    #[error("dispatch requires at least one message")]
    EmptyDispatch,
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the error leaves the connection it occurred on unusable.
    ///
    /// The pool discards connections that fail with one of these instead of
    /// returning them to the idle set.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Io { .. }
                | Error::Timeout { .. }
                | Error::Handshake { .. }
                | Error::ConnectionClosed(_)
                | Error::Protocol(_)
                | Error::SocketState { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
