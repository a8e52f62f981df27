//! Periodic liveness sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};

use crate::core::scheduler::Scheduler;
use crate::util::clock::now_ms;

/// Runs [`Scheduler::sweep`] on a fixed interval and wakes the dispatch loop
/// when a sweep freed work.
pub struct HeartbeatMonitor {
    scheduler: Arc<Scheduler>,
    interval: Duration,
    wake: Arc<Notify>,
}

impl HeartbeatMonitor {
    /// Create a monitor.
    #[must_use]
    pub const fn new(scheduler: Arc<Scheduler>, interval: Duration, wake: Arc<Notify>) -> Self {
        Self {
            scheduler,
            interval,
            wake,
        }
    }

    /// Sweep until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            "heartbeat monitor started"
        );
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let report = self.scheduler.sweep(now_ms());
                    if report.freed_work() {
                        tracing::info!(
                            reclaimed = report.reclaimed,
                            timed_out = report.timed_out,
                            "sweep returned batches to the queue"
                        );
                        self.wake.notify_one();
                    } else if !report.changes.is_empty() {
                        tracing::debug!(changes = report.changes.len(), "liveness changed");
                    }
                }
            }
        }
        tracing::info!("heartbeat monitor stopped");
    }
}
