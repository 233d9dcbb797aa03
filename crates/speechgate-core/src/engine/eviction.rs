//! Periodic idle-instance eviction.
//!
//! Each tick unloads unreferenced instances whose TTL has run out:
//! - `Never` instances stay resident indefinitely
//! - `Immediate` instances are normally gone on release already; the tick
//!   catches any that finished loading after every waiter left
//! - `After(d)` instances go once they have been idle for `d`

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::pool::{EvictionReport, ModelPool};

/// Background task that scans the pool on a fixed interval
pub struct EvictionScheduler {
    pool: ModelPool,
    interval: Duration,
}

impl EvictionScheduler {
    pub fn new(pool: ModelPool, interval: Duration) -> Self {
        Self { pool, interval }
    }

    /// Run a single eviction pass
    pub async fn run_once(&self) -> EvictionReport {
        let report = self.pool.evict_expired().await;
        for id in &report.evicted {
            info!("Evicted idle model {}", id);
        }
        for (id, reason) in &report.failed {
            error!("Evicted model {} after failed unload: {}", id, reason);
        }
        report
    }

    /// Spawn the scheduler loop. It stops when `shutdown` flips to `true`
    /// or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Eviction scheduler started (interval {:?})", self.interval);

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the immediate first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Eviction scheduler stopping");
                            break;
                        }
                    }

                    _ = ticker.tick() => {
                        let report = self.run_once().await;
                        if report.is_empty() {
                            debug!("Eviction tick: nothing to unload");
                        }
                    }
                }
            }
        })
    }
}
