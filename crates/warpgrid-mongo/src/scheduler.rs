//! Background task that keeps a server description fresh.
//!
//! The scheduler ticks every `refresh_interval` and asks its target to
//! refresh. The first tick fires one full interval after start, so starting
//! the scheduler never waits on the network. A failed refresh is logged,
//! reported to the target, and the next tick runs as usual.

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Something the scheduler refreshes on every tick.
#[async_trait]
pub trait RefreshTarget: Send + Sync {
    /// Name used in log events.
    fn label(&self) -> String;

    async fn refresh_once(&self) -> Result<()>;

    /// Called after a failed tick.
    fn refresh_failed(&self, _error: &Error) {}
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    failures: AtomicU64,
}

pub struct RefreshScheduler {
    interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .field("ticks", &self.ticks())
            .field("failures", &self.failures())
            .finish()
    }
}

impl RefreshScheduler {
    /// Spawn the refresh loop for `target`. Must be called within a tokio
    /// runtime. Fails with [`Error::Config`] when the first tick would lie
    /// beyond the clock's range.
    ///
    /// Only a weak handle is kept: the loop ends on its own once the target
    /// is dropped.
    pub fn start<T>(target: Weak<T>, interval: Duration) -> Result<Self>
    where
        T: RefreshTarget + 'static,
    {
        // Armed here so the first tick is scheduled before `start` returns.
        let first_tick = Instant::now()
            .checked_add(interval)
            .ok_or_else(|| Error::Config(format!("refresh interval {interval:?} is out of range")))?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let mut ticker = tokio::time::interval_at(first_tick, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let label = target.upgrade().map(|t| t.label()).unwrap_or_default();
        let handle = tokio::spawn(run_refresh_loop(
            target,
            ticker,
            Arc::clone(&counters),
            shutdown_rx,
        ));

        info!(target = %label, ?interval, "refresh scheduler started");

        Ok(Self {
            interval,
            shutdown_tx,
            handle,
            counters,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stop scheduling refreshes. A refresh already running completes; no
    /// further ticks fire. Idempotent.
    pub fn stop(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!(interval = ?self.interval, "refresh scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow() && !self.handle.is_finished()
    }

    /// Ticks that ran a refresh.
    pub fn ticks(&self) -> u64 {
        self.counters.ticks.load(Ordering::Relaxed)
    }

    /// Ticks whose refresh failed.
    pub fn failures(&self) -> u64 {
        self.counters.failures.load(Ordering::Relaxed)
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_refresh_loop<T>(
    target: Weak<T>,
    mut ticker: Interval,
    counters: Arc<Counters>,
    mut shutdown: watch::Receiver<bool>,
) where
    T: RefreshTarget + 'static,
{
    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                debug!("refresh loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                let Some(target) = target.upgrade() else {
                    debug!("refresh target dropped, loop exiting");
                    break;
                };
                counters.ticks.fetch_add(1, Ordering::Relaxed);

                if let Err(e) = target.refresh_once().await {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(target = %target.label(), error = %e, "background refresh failed");
                    target.refresh_failed(&e);
                }
            }
        }
    }
}
