//! Scoped references to pooled instances

use std::sync::Arc;
use tracing::{debug, error};

use super::PoolInner;
use crate::backend::BackendModel;
use crate::model::ModelDescriptor;

/// A counted reference to a Ready instance.
///
/// Hand it back with [`ModelPool::release`](super::ModelPool::release).
/// Dropping it without releasing releases it as well, so a cancelled or
/// failed request never leaks a reference.
pub struct InstanceHandle {
    pool: Arc<PoolInner>,
    descriptor: Arc<ModelDescriptor>,
    generation: u64,
    model: BackendModel,
    released: bool,
}

impl InstanceHandle {
    pub(super) fn new(
        pool: Arc<PoolInner>,
        descriptor: Arc<ModelDescriptor>,
        generation: u64,
        model: BackendModel,
    ) -> Self {
        Self {
            pool,
            descriptor,
            generation,
            model,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &Arc<ModelDescriptor> {
        &self.descriptor
    }

    pub fn model(&self) -> &BackendModel {
        &self.model
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(super) fn mark_released(&mut self) {
        self.released = true;
    }
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("id", &self.descriptor.id)
            .field("generation", &self.generation)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        debug!("Releasing dropped handle for {}", self.descriptor.id);
        if let Err(e) = self.pool.release_reference(&self.descriptor.id, self.generation) {
            error!("Failed to release dropped handle: {}", e);
        }
    }
}

/// A reference reserved on an in-flight load.
///
/// Given back if the waiter stops waiting (timeout or cancellation) before
/// turning it into a handle. The load itself keeps going.
pub(super) struct Reservation {
    pool: Arc<PoolInner>,
    id: String,
    generation: u64,
    armed: bool,
}

impl Reservation {
    pub(super) fn new(pool: Arc<PoolInner>, id: &str, generation: u64) -> Self {
        Self {
            pool,
            id: id.to_string(),
            generation,
            armed: true,
        }
    }

    /// The reference now belongs to a handle, or the slot is gone
    pub(super) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!("Abandoning reservation on {} (gen {})", self.id, self.generation);
        if let Err(e) = self.pool.release_reference(&self.id, self.generation) {
            debug!("Reservation on {} already gone: {}", self.id, e);
        }
    }
}
