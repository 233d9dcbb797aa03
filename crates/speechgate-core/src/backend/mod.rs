//! External model collaborators: loading, unloading and inference

mod daemon;
mod protocol;

use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::inference::{InferenceOutput, InferencePayload};
use crate::model::{CapabilityKind, ModelDescriptor};

pub use daemon::DaemonBackend;
pub use protocol::{DaemonRequest, DaemonResponse, MAX_FRAME_BYTES};

/// Opaque handle to a model loaded by a backend.
///
/// The pool never looks inside; backends downcast to their own type.
#[derive(Clone)]
pub struct BackendModel(Arc<dyn Any + Send + Sync>);

impl BackendModel {
    pub fn new<T: Any + Send + Sync>(model: T) -> Self {
        Self(Arc::new(model))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for BackendModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BackendModel(..)")
    }
}

/// Loads, unloads and runs models on behalf of the gateway
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Load weights for `descriptor`. May download or read from disk.
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<BackendModel>;

    /// Release resources (accelerator memory) held by `model`
    async fn unload(&self, descriptor: &ModelDescriptor, model: BackendModel) -> Result<()>;

    /// Run inference on a loaded model
    async fn infer(
        &self,
        descriptor: &ModelDescriptor,
        model: &BackendModel,
        kind: CapabilityKind,
        language: &str,
        payload: &InferencePayload,
    ) -> Result<InferenceOutput>;
}
