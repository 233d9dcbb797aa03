//! Speechgate Core - model lifecycle engine for a speech inference gateway
//!
//! This crate keeps speech models (STT, TTS, VAD) loaded on demand and
//! unloads them again once they sit idle past their time-to-live.
//!
//! # Architecture
//!
//! - A registry of model descriptors with one default per capability kind
//! - A reference-counted instance pool with single-flight loading
//! - A dispatcher that checks language policy before anything is loaded
//! - A background eviction scheduler and startup preloading
//! - A pluggable backend, by default an out-of-process inference daemon
//!
//! # Example
//!
//! ```ignore
//! use speechgate_core::{DaemonBackend, Gateway, GatewayConfig, InferenceRequest};
//!
//! let config = GatewayConfig::load()?;
//! let backend = Arc::new(DaemonBackend::new(&config.backend));
//! let gateway = Gateway::new(config, backend)?;
//! gateway.start().await;
//!
//! let response = gateway
//!     .handle(InferenceRequest::transcribe(wav_bytes).with_language("tr"))
//!     .await?;
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod inference;
pub mod model;
pub mod pool;

#[cfg(test)]
mod testing;

pub use backend::{BackendModel, DaemonBackend, ModelBackend};
pub use config::GatewayConfig;
pub use engine::{
    Dispatcher, EvictionScheduler, Gateway, LanguagePolicy, ModelStatus, PreloadCoordinator,
    PreloadReport,
};
pub use error::{Error, Result};
pub use inference::{
    InferenceOutput, InferencePayload, InferenceRequest, InferenceResponse, SpeechSegment,
};
pub use model::{CapabilityKind, ModelDescriptor, ModelRegistry, Ttl};
pub use pool::{EvictionReport, InstanceHandle, InstanceSnapshot, InstanceState, ModelPool};
