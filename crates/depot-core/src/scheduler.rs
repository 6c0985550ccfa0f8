//! Sync scheduler
//!
//! Two timers feed one flush target:
//! - a trailing-edge debounce: every [`schedule`](SyncScheduler::schedule)
//!   cancels the pending flush and arms a new one, so a burst of writes
//!   produces a single flush after the last write
//! - a periodic full flush, independent of write activity
//!
//! At most one flush runs at a time. Flushes are fire-and-forget: failures
//! are logged and never cancel the next scheduled flush.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::StoreResult;

/// Something the scheduler can flush
#[async_trait]
pub trait Flush: Send + Sync + 'static {
    async fn flush(&self) -> StoreResult<()>;
}

struct Shared {
    target: Weak<dyn Flush>,
    gate: tokio::sync::Mutex<()>,
    flushes: AtomicU64,
}

impl Shared {
    /// Run one flush under the gate; `None` once the target is gone
    async fn run(&self) -> Option<StoreResult<()>> {
        let target = self.target.upgrade()?;
        let _guard = self.gate.lock().await;
        let result = target.flush().await;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Some(result)
    }

    async fn run_logged(&self, reason: &str) {
        match self.run().await {
            Some(Ok(())) => debug!("{} flush complete", reason),
            Some(Err(e)) => warn!("{} flush failed: {}", reason, e),
            None => {}
        }
    }
}

pub struct SyncScheduler {
    shared: Arc<Shared>,
    debounce: Duration,
    interval: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
    periodic: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SyncScheduler {
    pub fn new(target: Weak<dyn Flush>, debounce: Duration, interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                target,
                gate: tokio::sync::Mutex::new(()),
                flushes: AtomicU64::new(0),
            }),
            debounce,
            interval,
            pending: Mutex::new(None),
            periodic: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Arm the periodic flush; calling again while armed does nothing
    pub fn start(&self) {
        if self.is_stopped() {
            return;
        }
        let mut periodic = self.periodic.lock();
        if periodic.is_some() {
            return;
        }

        let shared = self.shared.clone();
        let period = self.interval;
        *periodic = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if shared.target.strong_count() == 0 {
                    break;
                }
                shared.run_logged("Periodic").await;
            }
        }));
        debug!("Periodic flush every {:?}", period);
    }

    /// Flush once the debounce window passes with no further writes
    pub fn schedule(&self) {
        if self.is_stopped() {
            return;
        }
        let shared = self.shared.clone();
        let delay = self.debounce;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Detached so a later re-arm cannot abort a flush in progress
            tokio::spawn(async move { shared.run_logged("Debounced").await });
        });

        if let Some(previous) = self.pending.lock().replace(task) {
            previous.abort();
        }
    }

    /// Flush right away, in the background
    ///
    /// Supersedes a pending debounced flush.
    pub fn flush_soon(&self) {
        if self.is_stopped() {
            return;
        }
        if let Some(previous) = self.pending.lock().take() {
            previous.abort();
        }
        let shared = self.shared.clone();
        tokio::spawn(async move { shared.run_logged("Immediate").await });
    }

    /// Flush now and wait for the result
    ///
    /// Works after [`stop`](Self::stop) too, for the final flush on close.
    pub async fn flush_now(&self) -> StoreResult<()> {
        self.shared.run().await.unwrap_or(Ok(()))
    }

    /// Cancel both timers; safe to call repeatedly
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.pending.lock().take() {
            task.abort();
        }
        if let Some(task) = self.periodic.lock().take() {
            task.abort();
        }
        debug!("Sync scheduler stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Flushes run so far, failed ones included
    pub fn flush_count(&self) -> u64 {
        self.shared.flushes.load(Ordering::SeqCst)
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
