//! Registry of known models and per-kind defaults

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::model::descriptor::{CapabilityKind, ModelDescriptor};

/// Tracks registered model descriptors. Read-mostly after boot.
#[derive(Default)]
pub struct ModelRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    models: HashMap<String, Arc<ModelDescriptor>>,
    defaults: HashMap<CapabilityKind, String>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry holding every configured model and default
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let registry = Self::new();

        for descriptor in config.descriptors() {
            registry.register(descriptor)?;
        }

        for kind in CapabilityKind::all() {
            if let Some(id) = config.defaults.get(*kind) {
                registry.set_default(*kind, id)?;
            }
        }

        info!(
            "Model registry initialized with {} models",
            registry.read().models.len()
        );
        Ok(registry)
    }

    /// Register a new descriptor. Identifiers are unique.
    pub fn register(&self, descriptor: ModelDescriptor) -> Result<Arc<ModelDescriptor>> {
        let mut inner = self.write();
        if inner.models.contains_key(&descriptor.id) {
            return Err(Error::DuplicateModel(descriptor.id));
        }

        debug!(
            "Registered model {} ({}, ttl={})",
            descriptor.id, descriptor.kind, descriptor.ttl
        );
        let descriptor = Arc::new(descriptor);
        inner
            .models
            .insert(descriptor.id.clone(), descriptor.clone());
        Ok(descriptor)
    }

    /// Look up a descriptor by identifier
    pub fn resolve(&self, id: &str) -> Result<Arc<ModelDescriptor>> {
        self.read()
            .models
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownModel(id.to_string()))
    }

    /// Descriptor used when a request names no model
    pub fn default_for(&self, kind: CapabilityKind) -> Result<Arc<ModelDescriptor>> {
        let inner = self.read();
        inner
            .defaults
            .get(&kind)
            .and_then(|id| inner.models.get(id))
            .cloned()
            .ok_or(Error::NoDefaultConfigured(kind))
    }

    pub fn set_default(&self, kind: CapabilityKind, id: &str) -> Result<()> {
        let mut inner = self.write();
        let descriptor = inner
            .models
            .get(id)
            .ok_or_else(|| Error::UnknownModel(id.to_string()))?;

        if descriptor.kind != kind {
            return Err(Error::KindMismatch {
                model: id.to_string(),
                expected: kind,
                actual: descriptor.kind,
            });
        }

        inner.defaults.insert(kind, id.to_string());
        Ok(())
    }

    /// Identifier of the default model for `kind`, if any
    pub fn default_id(&self, kind: CapabilityKind) -> Option<String> {
        self.read().defaults.get(&kind).cloned()
    }

    /// All descriptors, ordered by identifier
    pub fn list(&self) -> Vec<Arc<ModelDescriptor>> {
        let mut models: Vec<_> = self.read().models.values().cloned().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
