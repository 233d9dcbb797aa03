//! Application state management

use speechgate_core::Gateway;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ApiError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    /// Concurrency limiter for inference and lifecycle calls
    pub request_semaphore: Arc<Semaphore>,
    /// Bearer token required on `/v1/*` when set
    pub api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        let server = &gateway.config().server;
        let max_concurrent = server.max_concurrent_requests.max(1);
        let api_key = server
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .map(Arc::from);

        Self {
            request_semaphore: Arc::new(Semaphore::new(max_concurrent)),
            api_key,
            gateway,
        }
    }

    /// Acquire a permit for concurrent request processing
    pub async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, ApiError> {
        self.request_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ApiError::unavailable("server is shutting down"))
    }
}
