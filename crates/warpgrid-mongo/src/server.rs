//! Live model of one remote database node.
//!
//! A [`Server`] owns the node's connection pool, its current
//! [`Description`], and a [`RefreshScheduler`] that re-issues the status
//! command every `refresh_interval` seconds.
//!
//! ```text
//! Server::new(address, options)
//!   → TLS context + SocketConnector + Pool
//!   → Description::unknown()
//!   → RefreshScheduler::start()        (first tick one interval later)
//!
//! dispatch(messages)  ─┐
//!                      ├─▶ Pool::with_connection ─▶ write all, read reply?
//! refresh()  ─ lock ───┘
//!   → new Description swapped in, listener notified
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::address::Address;
use crate::connection::{ConnectionFactory, SocketConnector};
use crate::description::Description;
use crate::error::{Error, Result};
use crate::events::{self, NoopListener, ServerListener};
use crate::message::{Document, Message, Query, Reply, default_status_command};
use crate::options::ServerOptions;
use crate::pool::{Pool, PoolConfig};
use crate::scheduler::{RefreshScheduler, RefreshTarget};

// ── Builder ──────────────────────────────────────────────────────────

/// Builds a [`Server`] with injected collaborators.
pub struct ServerBuilder {
    address: Address,
    options: ServerOptions,
    factory: Option<Arc<dyn ConnectionFactory>>,
    listener: Arc<dyn ServerListener>,
    status_command: Document,
}

impl ServerBuilder {
    /// Connect through `factory` instead of real sockets.
    pub fn connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ServerListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Selector sent by every refresh. Defaults to `{ "ismaster": 1 }`.
    pub fn status_command(mut self, selector: Document) -> Self {
        self.status_command = selector;
        self
    }

    /// Build the server and start its refresh scheduler.
    ///
    /// Must be called within a tokio runtime. Returns without contacting the
    /// server; the description stays unknown until the first refresh.
    pub fn start(self) -> Result<Server> {
        self.options.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::Config(
                "a server must be started within a tokio runtime".to_string(),
            ));
        }

        let factory = match self.factory {
            Some(factory) => factory,
            None => Arc::new(SocketConnector::from_options(&self.options)?),
        };
        let pool = Pool::new(
            self.address.clone(),
            PoolConfig::from_options(&self.options),
            factory,
        );
        let refresh_interval = self.options.refresh_interval();

        let inner = Arc::new(ServerInner {
            address: self.address,
            options: self.options,
            pool,
            description: ArcSwap::from_pointee(Description::unknown()),
            listener: self.listener,
            status_command: self.status_command,
            refresh_lock: tokio::sync::Mutex::new(()),
            refresh_interval,
        });

        let scheduler = RefreshScheduler::start(
            Arc::downgrade(&inner),
            Duration::from_secs(refresh_interval),
        )?;

        info!(
            address = %inner.address,
            refresh_interval,
            tls = inner.options.ssl_enabled(),
            max_pool_size = inner.pool.max_size(),
            "server started"
        );

        Ok(Server { inner, scheduler })
    }
}

// ── Server ───────────────────────────────────────────────────────────

pub(crate) struct ServerInner {
    address: Address,
    options: ServerOptions,
    pool: Pool,
    /// Replaced whole on every successful refresh.
    description: ArcSwap<Description>,
    listener: Arc<dyn ServerListener>,
    status_command: Document,
    /// Serializes refreshes only; dispatch never takes it.
    refresh_lock: tokio::sync::Mutex<()>,
    refresh_interval: u64,
}

impl ServerInner {
    async fn dispatch(&self, messages: Vec<Box<dyn Message>>) -> Result<Option<Reply>> {
        let expects_reply = match messages.last() {
            Some(last) => last.replyable(),
            None => return Err(Error::EmptyDispatch),
        };

        self.pool
            .with_connection(move |conn| {
                Box::pin(async move {
                    conn.write(&messages).await?;
                    if expects_reply {
                        conn.read().await.map(Some)
                    } else {
                        Ok(None)
                    }
                })
            })
            .await
    }

    async fn refresh(&self) -> Result<Arc<Description>> {
        let _guard = self.refresh_lock.lock().await;

        let started = Instant::now();
        let query = Query::status_command(self.status_command.clone());
        let reply = self
            .dispatch(vec![Box::new(query) as Box<dyn Message>])
            .await?
            .ok_or_else(|| Error::Protocol("status command produced no reply".to_string()))?;
        let round_trip_time = started.elapsed();

        let document = reply
            .documents
            .into_iter()
            .next()
            .ok_or_else(|| Error::Protocol("status reply carried no document".to_string()))?;
        check_ok(&document)?;

        let previous = self.description.load_full();
        let current = Arc::new(Description::from_reply(document, round_trip_time, &previous));
        self.description.store(Arc::clone(&current));

        debug!(
            address = %self.address,
            rtt = ?round_trip_time,
            primary = current.is_primary(),
            "refreshed server description"
        );
        events::notify(self.listener.as_ref(), &self.address, &previous, &current);
        Ok(current)
    }
}

/// Reject replies whose `ok` field is present and not 1.
fn check_ok(document: &Document) -> Result<()> {
    let ok = match document.get("ok") {
        None => return Ok(()),
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64() == Some(1.0),
        Some(_) => false,
    };
    if ok {
        return Ok(());
    }
    let message = document
        .get("errmsg")
        .and_then(Value::as_str)
        .unwrap_or("status command returned ok: 0");
    Err(Error::CommandFailed(message.to_string()))
}

#[async_trait]
impl RefreshTarget for ServerInner {
    fn label(&self) -> String {
        self.address.to_string()
    }

    async fn refresh_once(&self) -> Result<()> {
        self.refresh().await.map(|_| ())
    }

    fn refresh_failed(&self, error: &Error) {
        self.listener.refresh_failed(&self.address, error);
    }
}

/// A remote database node. Equality is by address alone.
///
/// Safe to share between tasks (`Arc<Server>`); dispatch and refresh may
/// run concurrently. Dropping the server stops its scheduler.
pub struct Server {
    inner: Arc<ServerInner>,
    scheduler: RefreshScheduler,
}

impl Server {
    /// Create a server with real sockets and start refreshing it in the
    /// background.
    pub fn new(address: Address, options: ServerOptions) -> Result<Self> {
        Self::builder(address, options).start()
    }

    pub fn builder(address: Address, options: ServerOptions) -> ServerBuilder {
        ServerBuilder {
            address,
            options,
            factory: None,
            listener: Arc::new(NoopListener),
            status_command: default_status_command(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub fn options(&self) -> &ServerOptions {
        &self.inner.options
    }

    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    /// Seconds between background refreshes.
    pub fn refresh_interval(&self) -> u64 {
        self.inner.refresh_interval
    }

    /// Current description. Never blocks; never observes a partial update.
    pub fn description(&self) -> Arc<Description> {
        self.inner.description.load_full()
    }

    /// Issue the status command now and replace the description with the
    /// result. Concurrent refreshes run one at a time. On failure the
    /// previous description stays current.
    pub async fn refresh(&self) -> Result<Arc<Description>> {
        self.inner.refresh().await
    }

    /// Send `messages` in order over one pooled connection.
    ///
    /// Reads exactly one reply when the last message expects one and returns
    /// `None` otherwise. The connection goes back to the pool on every path,
    /// or is discarded if the exchange broke it.
    pub async fn dispatch(&self, messages: Vec<Box<dyn Message>>) -> Result<Option<Reply>> {
        self.inner.dispatch(messages).await
    }

    /// Stop background refreshes. Explicit [`Server::refresh`] still works.
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.inner.address.to_string())
            .field("refresh_interval", &self.inner.refresh_interval)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Server {
    fn eq(&self, other: &Self) -> bool {
        self.inner.address == other.inner.address
    }
}

impl Eq for Server {}
