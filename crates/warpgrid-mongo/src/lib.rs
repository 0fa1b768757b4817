//! Server-facing core of the WarpGrid MongoDB driver.
//!
//! A [`Server`] is a thread-safe model of one remote database node. Periodic
//! background status checks keep its description fresh, and wire-protocol
//! messages go out over a pooled transport that may be TLS-secured.
//!
//! # Architecture
//!
//! ```text
//! Server
//!   ├── Address (equality key)
//!   ├── ServerOptions (refresh interval, TLS, pool sizing)
//!   ├── ArcSwap<Description> (replaced whole on every refresh)
//!   ├── Pool ── ConnectionFactory ── WireConnection ── Socket (plain | TLS)
//!   ├── ServerListener (host added / removed, refresh failures)
//!   └── RefreshScheduler (background task, ticks every refresh_interval)
//!         └── Server::refresh() → status command → new Description
//! ```
//!
//! Application code calls [`Server::dispatch`] at any time; the scheduler
//! calls [`Server::refresh`] in the background. Both share the pool, and only
//! refreshes serialize on the server's refresh lock.

pub mod address;
pub mod connection;
pub mod description;
pub mod error;
pub mod events;
pub mod message;
pub mod options;
pub mod pool;
pub mod scheduler;
pub mod server;
pub mod socket;
pub mod tls;

pub use address::Address;
pub use connection::{Connection, ConnectionFactory, SocketConnector, WireConnection};
pub use description::Description;
pub use error::{Error, Result};
pub use events::{HostChanges, NoopListener, ServerListener};
pub use message::{Document, Insert, Message, OpCode, Query, Reply};
pub use options::ServerOptions;
pub use pool::{BoxFuture, Pool, PoolConfig, PoolStats, PooledConnection};
pub use scheduler::{RefreshScheduler, RefreshTarget};
pub use server::{Server, ServerBuilder};
pub use socket::{Socket, SocketState};
pub use tls::{TlsContext, TlsOptions};
