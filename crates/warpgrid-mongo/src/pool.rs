//! Bounded connection pool for one server.
//!
//! Capacity is a `tokio::sync::Semaphore` with `max_size` permits; a permit
//! is held for as long as a connection is checked out. Idle connections live
//! in a pool-internal `std::sync::Mutex` so the [`PooledConnection`] guard can
//! hand its connection back from `Drop`.
//!
//! ```text
//! checkout()
//!   → wait ≤ wait_queue_timeout for a permit      (PoolExhausted on elapse)
//!     → idle connection available → reuse the most recently returned one
//!     → none idle                → ConnectionFactory::connect()
//! guard dropped
//!   → healthy   → back to idle, permit released
//!   → discarded or owing a reply → closed, evicted, permit released
//! ```

use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::address::Address;
use crate::connection::{Connection, ConnectionFactory};
use crate::error::{Error, Result};
use crate::options::{DEFAULT_MAX_POOL_SIZE, DEFAULT_WAIT_QUEUE_TIMEOUT, ServerOptions};

/// Boxed future returned by [`Pool::with_connection`] callbacks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    /// Maximum connections, idle plus checked out.
    pub max_size: usize,
    /// Maximum time a checkout waits when the pool is exhausted.
    pub wait_queue_timeout: Duration,
    /// Idle connections older than this are reaped. `None` keeps them forever.
    pub max_idle_time: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_POOL_SIZE,
            wait_queue_timeout: Duration::from_secs_f64(DEFAULT_WAIT_QUEUE_TIMEOUT),
            max_idle_time: None,
        }
    }
}

impl PoolConfig {
    pub fn from_options(options: &ServerOptions) -> Self {
        Self {
            max_size: options.max_pool_size(),
            wait_queue_timeout: options.wait_queue_timeout(),
            max_idle_time: options.max_idle_time(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently checked out.
    pub active: usize,
    pub idle: usize,
    /// Open connections (active + idle).
    pub total: usize,
    /// Checkouts that gave up waiting on an exhausted pool.
    pub wait_count: u64,
    /// Connections ever created through the factory.
    pub created: u64,
    /// Connections closed because they were discarded.
    pub discarded: u64,
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    returned_at: Instant,
}

#[derive(Default)]
struct PoolState {
    /// Most recently returned last.
    idle: Vec<IdleConnection>,
    total: usize,
    wait_count: u64,
    created: u64,
    discarded: u64,
}

struct PoolInner {
    address: Address,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    closed: AtomicBool,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        // The state stays consistent across a panicking holder; every update
        // is a single field write.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stale(&self, idle: &IdleConnection) -> bool {
        self.config
            .max_idle_time
            .is_some_and(|max| idle.returned_at.elapsed() >= max)
    }
}

/// Connection pool keyed by one server address. Cheap to clone; clones share
/// the same connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("address", &self.inner.address.to_string())
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Pool {
    pub fn new(address: Address, config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_size));
        Self {
            inner: Arc::new(PoolInner {
                address,
                config,
                factory,
                semaphore,
                state: Mutex::new(PoolState::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub fn max_size(&self) -> usize {
        self.inner.config.max_size
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Check out a connection for exclusive use.
    ///
    /// Waits up to `wait_queue_timeout` for capacity, then reuses the most
    /// recently returned idle connection or creates a new one.
    pub async fn checkout(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(Error::PoolClosed(inner.address.to_string()));
        }

        let wait = inner.config.wait_queue_timeout;
        let permit = match tokio::time::timeout(wait, Arc::clone(&inner.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed(inner.address.to_string())),
            Err(_) => {
                inner.state().wait_count += 1;
                debug!(address = %inner.address, waited = ?wait, "connection pool exhausted");
                return Err(Error::PoolExhausted {
                    address: inner.address.to_string(),
                    waited: wait,
                });
            }
        };

        if let Some(conn) = self.take_idle() {
            debug!(id = conn.id(), address = %inner.address, "reused idle connection from pool");
            return Ok(PooledConnection::new(conn, Arc::clone(inner), permit));
        }

        // Dropping the permit on failure releases the capacity.
        let conn = inner.factory.connect(&inner.address).await?;

        {
            let mut state = inner.state();
            state.total += 1;
            state.created += 1;
        }
        debug!(id = conn.id(), address = %inner.address, "created new connection");
        Ok(PooledConnection::new(conn, Arc::clone(inner), permit))
    }

    /// Pop the most recently returned idle connection, closing stale ones
    /// on the way.
    fn take_idle(&self) -> Option<Box<dyn Connection>> {
        let mut state = self.inner.state();
        while let Some(mut idle) = state.idle.pop() {
            if !self.inner.is_stale(&idle) {
                return Some(idle.conn);
            }
            idle.conn.close();
            state.total = state.total.saturating_sub(1);
            debug!(address = %self.inner.address, "closed stale idle connection");
        }
        None
    }

    /// Run `f` with a checked-out connection.
    ///
    /// The connection is returned to the pool on every exit path. It is
    /// discarded instead when `f` fails with a connection error or when the
    /// returned future is dropped before `f` completes.
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut PooledConnection) -> BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.checkout().await?;
        conn.in_use = true;
        let result = f(&mut conn).await;
        conn.in_use = false;

        if let Err(e) = &result
            && e.is_connection_error()
        {
            debug!(id = conn.id(), address = %self.inner.address, error = %e, "discarding failed connection");
            conn.discard();
        }
        result
    }

    /// Close idle connections that have been idle longer than `max_idle_time`.
    /// Returns the number closed.
    pub fn reap_idle(&self) -> usize {
        let inner = &self.inner;
        if inner.config.max_idle_time.is_none() {
            return 0;
        }

        let mut state = inner.state();
        let (mut stale, fresh): (Vec<_>, Vec<_>) =
            std::mem::take(&mut state.idle).into_iter().partition(|idle| inner.is_stale(idle));
        state.idle = fresh;
        state.total = state.total.saturating_sub(stale.len());

        for idle in &mut stale {
            idle.conn.close();
        }
        if !stale.is_empty() {
            info!(
                address = %inner.address,
                reaped = stale.len(),
                remaining_idle = state.idle.len(),
                "reaped idle connections"
            );
        }
        stale.len()
    }

    /// Close every idle connection. Checked-out connections are unaffected.
    pub fn clear(&self) -> usize {
        let mut state = self.inner.state();
        let idle = std::mem::take(&mut state.idle);
        state.total = state.total.saturating_sub(idle.len());
        drop(state);

        let closed = idle.len();
        for mut idle in idle {
            idle.conn.close();
        }
        if closed > 0 {
            debug!(address = %self.inner.address, closed, "cleared idle connections");
        }
        closed
    }

    /// Reject further checkouts and close idle connections. Connections that
    /// are checked out are closed when returned.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.semaphore.close();
        let closed = self.clear();
        info!(address = %self.inner.address, closed, "connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state();
        PoolStats {
            active: state.total.saturating_sub(state.idle.len()),
            idle: state.idle.len(),
            total: state.total,
            wait_count: state.wait_count,
            created: state.created,
            discarded: state.discarded,
        }
    }
}

// ── PooledConnection ─────────────────────────────────────────────────

/// Exclusive handle to a checked-out connection. Returns the connection to
/// the pool when dropped.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<PoolInner>,
    discarded: bool,
    /// Set while a `with_connection` callback runs; a guard dropped in this
    /// state was cancelled mid-exchange.
    in_use: bool,
    // Declared last: released only after the connection is back in the idle set.
    _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("address", &self.pool.address.to_string())
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn new(conn: Box<dyn Connection>, pool: Arc<PoolInner>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            pool,
            discarded: false,
            in_use: false,
            _permit: permit,
        }
    }

    /// Close the connection instead of returning it to the pool.
    pub fn discard(mut self) {
        self.discarded = true;
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect("pooled connection taken before drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("pooled connection taken before drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let pool = &self.pool;
        let mut state = pool.state();

        if self.discarded || self.in_use || !conn.is_reusable() {
            conn.close();
            state.total = state.total.saturating_sub(1);
            state.discarded += 1;
            debug!(
                id = conn.id(),
                address = %pool.address,
                cancelled = self.in_use,
                reply_owed = !conn.is_reusable(),
                "discarded connection"
            );
        } else if pool.closed.load(Ordering::Acquire) {
            conn.close();
            state.total = state.total.saturating_sub(1);
        } else {
            state.idle.push(IdleConnection {
                conn,
                returned_at: Instant::now(),
            });
        }
    }
}
