//! Startup preloading of configured models

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::Result;
use crate::model::{ModelRegistry, Ttl};
use crate::pool::ModelPool;

/// Outcome of a preload run
#[derive(Debug, Default, Clone)]
pub struct PreloadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Warms the pool so first requests skip the cold start
pub struct PreloadCoordinator {
    registry: Arc<ModelRegistry>,
    pool: ModelPool,
    load_timeout: Duration,
}

impl PreloadCoordinator {
    pub fn new(registry: Arc<ModelRegistry>, pool: ModelPool, load_timeout: Duration) -> Self {
        Self {
            registry,
            pool,
            load_timeout,
        }
    }

    /// Acquire and immediately release each model, leaving warm idle
    /// instances. Failures are logged and reported, never fatal.
    pub async fn preload<S: AsRef<str>>(&self, ids: &[S]) -> PreloadReport {
        if ids.is_empty() {
            return PreloadReport::default();
        }
        info!("Preloading {} models", ids.len());

        let results =
            futures::future::join_all(ids.iter().map(|id| self.warm(id.as_ref()))).await;

        let mut report = PreloadReport::default();
        for (id, result) in ids.iter().map(AsRef::as_ref).zip(results) {
            match result {
                Ok(()) => report.loaded.push(id.to_string()),
                Err(e) => {
                    warn!("Preload of {} failed; it will load on first use: {}", id, e);
                    report.failed.push((id.to_string(), e.to_string()));
                }
            }
        }

        info!(
            "Preload finished: {} loaded, {} failed",
            report.loaded.len(),
            report.failed.len()
        );
        report
    }

    async fn warm(&self, id: &str) -> Result<()> {
        let descriptor = self.registry.resolve(id)?;
        if descriptor.ttl == Ttl::Immediate {
            warn!(
                "Preloading {} which has an immediate TTL; it will be unloaded right away",
                id
            );
        }
        let handle = self.pool.acquire(&descriptor, self.load_timeout).await?;
        self.pool.release(handle)
    }
}
