//! Inference request and output types

mod types;

pub use types::{
    InferenceOutput, InferencePayload, InferenceRequest, InferenceResponse, SpeechSegment,
};
