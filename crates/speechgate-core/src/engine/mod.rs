//! Gateway engine: wires the registry, pool, dispatcher, preload and
//! eviction together behind an explicit start/shutdown lifecycle.

mod dispatcher;
mod eviction;
mod language;
mod preload;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::ModelBackend;
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::inference::{InferenceRequest, InferenceResponse};
use crate::model::{CapabilityKind, ModelDescriptor, ModelRegistry};
use crate::pool::{EvictionReport, InstanceSnapshot, ModelPool};

pub use dispatcher::Dispatcher;
pub use eviction::EvictionScheduler;
pub use language::LanguagePolicy;
pub use preload::{PreloadCoordinator, PreloadReport};

/// Registry entry joined with its pool state, for listings
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub id: String,
    pub kind: CapabilityKind,
    pub location: PathBuf,
    pub ttl_secs: i64,
    pub is_default: bool,
    pub instance: Option<InstanceSnapshot>,
}

/// The process-owned gateway
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ModelRegistry>,
    pool: ModelPool,
    dispatcher: Dispatcher,
    shutdown_tx: watch::Sender<bool>,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Build a gateway from validated configuration
    pub fn new(config: GatewayConfig, backend: Arc<dyn ModelBackend>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(ModelRegistry::from_config(&config)?);
        let pool = ModelPool::new(
            backend.clone(),
            config.load_timeout(),
            config.unload_timeout(),
        );
        let languages = LanguagePolicy::new(
            &config.allowed_languages,
            config.effective_default_language(),
        );
        let dispatcher = Dispatcher::new(
            registry.clone(),
            pool.clone(),
            backend,
            languages,
            config.request_timeout(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            registry,
            pool,
            dispatcher,
            shutdown_tx,
            eviction_task: Mutex::new(None),
        })
    }

    /// Preload configured models, then start background eviction
    pub async fn start(&self) -> PreloadReport {
        let report = PreloadCoordinator::new(
            self.registry.clone(),
            self.pool.clone(),
            self.config.load_timeout(),
        )
        .preload(&self.config.preload)
        .await;

        let scheduler = EvictionScheduler::new(self.pool.clone(), self.config.eviction_interval());
        let task = scheduler.spawn(self.shutdown_tx.subscribe());

        let mut guard = self.eviction_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = guard.replace(task) {
            warn!("Gateway started twice; stopping the previous eviction task");
            previous.abort();
        }
        report
    }

    /// Serve a typed inference request
    pub async fn handle(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        self.dispatcher.handle(request).await
    }

    /// Load a model and leave it warm
    pub async fn load(&self, id: &str) -> Result<InstanceSnapshot> {
        let descriptor = self.registry.resolve(id)?;
        let handle = self
            .pool
            .acquire(&descriptor, self.config.load_timeout())
            .await?;
        self.pool.release(handle)?;
        Ok(self
            .pool
            .instance(id)
            .unwrap_or_else(|| unloaded_snapshot(&descriptor)))
    }

    /// Unload an idle model now
    pub async fn unload(&self, id: &str) -> Result<()> {
        self.registry.resolve(id)?;
        self.pool.unload(id).await
    }

    pub fn list_models(&self) -> Vec<ModelStatus> {
        self.registry
            .list()
            .into_iter()
            .map(|descriptor| self.status_of(&descriptor))
            .collect()
    }

    pub fn model_status(&self, id: &str) -> Result<ModelStatus> {
        let descriptor = self.registry.resolve(id)?;
        Ok(self.status_of(&descriptor))
    }

    /// Stop eviction and unload every idle instance
    pub async fn shutdown(&self) -> EvictionReport {
        info!("Shutting down gateway");
        self.shutdown_tx.send_replace(true);

        let task = self
            .eviction_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Eviction task ended abnormally: {}", e);
            }
        }

        let report = self.pool.shutdown().await;
        info!(
            "Gateway stopped: {} unloaded, {} failed, {} busy",
            report.evicted.len(),
            report.failed.len(),
            report.busy.len()
        );
        report
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &ModelPool {
        &self.pool
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn status_of(&self, descriptor: &ModelDescriptor) -> ModelStatus {
        ModelStatus {
            id: descriptor.id.clone(),
            kind: descriptor.kind,
            location: descriptor.location.clone(),
            ttl_secs: descriptor.ttl.as_secs(),
            is_default: self.registry.default_id(descriptor.kind).as_deref()
                == Some(descriptor.id.as_str()),
            instance: self.pool.instance(&descriptor.id),
        }
    }
}

fn unloaded_snapshot(descriptor: &ModelDescriptor) -> InstanceSnapshot {
    InstanceSnapshot {
        id: descriptor.id.clone(),
        kind: descriptor.kind,
        state: crate::pool::InstanceState::Unloaded,
        ref_count: 0,
        generation: 0,
        loaded_secs: None,
        idle_secs: 0,
        ttl: descriptor.ttl,
    }
}
