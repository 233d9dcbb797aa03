//! Request dispatcher: policy check, model resolution, acquire, infer, release

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::language::LanguagePolicy;
use crate::backend::ModelBackend;
use crate::error::{Error, Result};
use crate::inference::{InferenceRequest, InferenceResponse};
use crate::model::{ModelDescriptor, ModelRegistry};
use crate::pool::ModelPool;

/// Routes typed inference requests to pooled model instances
pub struct Dispatcher {
    registry: Arc<ModelRegistry>,
    pool: ModelPool,
    backend: Arc<dyn ModelBackend>,
    languages: LanguagePolicy,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ModelRegistry>,
        pool: ModelPool,
        backend: Arc<dyn ModelBackend>,
        languages: LanguagePolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            pool,
            backend,
            languages,
            request_timeout,
        }
    }

    pub fn languages(&self) -> &LanguagePolicy {
        &self.languages
    }

    /// Serve one request end to end, bounded by the request timeout
    pub async fn handle(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        let request_id = request.id;
        tokio::time::timeout(self.request_timeout, self.dispatch(request))
            .await
            .map_err(|_| {
                warn!("Request {} exceeded {:?}", request_id, self.request_timeout);
                Error::Timeout(format!(
                    "request {} exceeded {:?}",
                    request_id, self.request_timeout
                ))
            })?
    }

    /// Which descriptor a request would be served by
    pub fn resolve(&self, request: &InferenceRequest) -> Result<Arc<ModelDescriptor>> {
        let descriptor = match &request.model {
            Some(id) => self.registry.resolve(id)?,
            None => self.registry.default_for(request.kind)?,
        };

        if descriptor.kind != request.kind {
            return Err(Error::KindMismatch {
                model: descriptor.id.clone(),
                expected: request.kind,
                actual: descriptor.kind,
            });
        }
        Ok(descriptor)
    }

    async fn dispatch(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        // Policy first: a rejected language must never cause a load
        let language = self.languages.check(request.language.as_deref()).map_err(|e| {
            warn!("Request {} rejected: {}", request.id, e);
            e
        })?;

        let descriptor = self.resolve(&request)?;

        if !request.payload.fits(request.kind) {
            return Err(Error::InvalidInput(format!(
                "payload does not match a {} request",
                request.kind
            )));
        }
        if request.payload.is_empty() {
            return Err(Error::InvalidInput("payload is empty".to_string()));
        }

        debug!(
            "Request {} -> {} ({}, {})",
            request.id, descriptor.id, request.kind, language
        );

        let handle = self.pool.acquire(&descriptor, self.request_timeout).await?;

        // Outside the pool lock. If this future is dropped mid-inference the
        // handle's destructor releases the reference.
        let result = self
            .backend
            .infer(
                &descriptor,
                handle.model(),
                request.kind,
                &language,
                &request.payload,
            )
            .await;

        self.pool.release(handle)?;

        let output = result.map_err(|e| match e {
            Error::Inference(_) => e,
            other => Error::Inference(other.to_string()),
        })?;

        Ok(InferenceResponse {
            request_id: request.id,
            model: descriptor.id.clone(),
            language,
            output,
        })
    }
}
