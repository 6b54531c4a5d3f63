//! Shared heartbeat driving periodic work.
//!
//! One heartbeat per core instance broadcasts the current wall-clock time on
//! a fixed interval. Consumers receive ticks on a broadcast channel of
//! capacity 1: a consumer still busy with the previous tick simply misses
//! intermediate ones (`RecvError::Lagged`) instead of queueing overlapping
//! work. This is the single-flight behavior the expiry scan and relay liveness
//! checks rely on.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::types::now_secs;

/// Default tick interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Fixed-interval tick source
pub struct Heartbeat {
    interval: Duration,
    tick_tx: broadcast::Sender<i64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    /// Create a heartbeat with the given interval (not yet ticking)
    pub fn new(interval: Duration) -> Self {
        // Capacity 1: slow consumers lag and skip, they never stack ticks
        let (tick_tx, _) = broadcast::channel(1);
        Self {
            interval,
            tick_tx,
            task: Mutex::new(None),
        }
    }

    /// Subscribe to ticks (each tick carries `now` in epoch seconds)
    pub fn subscribe(&self) -> broadcast::Receiver<i64> {
        self.tick_tx.subscribe()
    }

    /// Start ticking. Idempotent: a second start is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let tick_tx = self.tick_tx.clone();
        let interval = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of tokio's interval fires immediately; skip it
            // so consumers see the configured cadence from the start.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tick_tx.send(now_secs()).is_err() {
                    debug!("no heartbeat listeners, ticking on");
                }
            }
        }));
    }

    /// Stop ticking
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
