//! Error types for the speechgate core

use thiserror::Error;

use crate::model::CapabilityKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Model already registered: {0}")]
    DuplicateModel(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("No default model configured for {0}")]
    NoDefaultConfigured(CapabilityKind),

    #[error("Model loading failed for {model}: {reason}")]
    ModelLoad { model: String, reason: String },

    #[error("Model unloading failed for {model}: {reason}")]
    ModelUnload { model: String, reason: String },

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Release underflow: {0} has no outstanding references")]
    ReleaseUnderflow(String),

    #[error("Model is busy: {0}")]
    ModelBusy(String),

    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("Model {model} serves {actual}, not {expected}")]
    KindMismatch {
        model: String,
        expected: CapabilityKind,
        actual: CapabilityKind,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
