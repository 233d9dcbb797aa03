//! Typed inference requests and outputs

use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use crate::model::CapabilityKind;

/// Input handed to the inference backend
#[derive(Debug, Clone)]
pub enum InferencePayload {
    /// Encoded audio, for speech-to-text and voice-activity-detection
    Audio {
        data: Bytes,
        sample_rate: Option<u32>,
    },
    /// Text to synthesize
    Text {
        text: String,
        voice: Option<String>,
    },
}

impl InferencePayload {
    pub fn audio(data: impl Into<Bytes>) -> Self {
        Self::Audio {
            data: data.into(),
            sample_rate: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            voice: None,
        }
    }

    /// Whether this payload is the right shape for `kind`
    pub fn fits(&self, kind: CapabilityKind) -> bool {
        matches!(
            (self, kind),
            (Self::Audio { .. }, CapabilityKind::Stt)
                | (Self::Audio { .. }, CapabilityKind::Vad)
                | (Self::Text { .. }, CapabilityKind::Tts)
        )
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Audio { data, .. } => data.is_empty(),
            Self::Text { text, .. } => text.trim().is_empty(),
        }
    }
}

/// A single inference call routed through the gateway
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub id: Uuid,
    pub kind: CapabilityKind,
    /// Falls back to the kind's default model when absent
    pub model: Option<String>,
    /// Falls back to the configured default language when absent
    pub language: Option<String>,
    pub payload: InferencePayload,
}

impl InferenceRequest {
    pub fn new(kind: CapabilityKind, payload: InferencePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            model: None,
            language: None,
            payload,
        }
    }

    pub fn transcribe(audio: impl Into<Bytes>) -> Self {
        Self::new(CapabilityKind::Stt, InferencePayload::audio(audio))
    }

    pub fn synthesize(text: impl Into<String>) -> Self {
        Self::new(CapabilityKind::Tts, InferencePayload::text(text))
    }

    pub fn detect_voice(audio: impl Into<Bytes>) -> Self {
        Self::new(CapabilityKind::Vad, InferencePayload::audio(audio))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// A span of detected speech
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct SpeechSegment {
    pub start_ms: u64,
    pub end_ms: u64,
}

/// Result produced by the inference backend
#[derive(Debug, Clone)]
pub enum InferenceOutput {
    Transcription {
        text: String,
        language: Option<String>,
    },
    Speech {
        audio: Bytes,
        sample_rate: u32,
        format: String,
    },
    VoiceActivity {
        segments: Vec<SpeechSegment>,
    },
}

impl InferenceOutput {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Transcription { .. } => CapabilityKind::Stt,
            Self::Speech { .. } => CapabilityKind::Tts,
            Self::VoiceActivity { .. } => CapabilityKind::Vad,
        }
    }
}

/// Output plus the model that served it
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    pub request_id: Uuid,
    pub model: String,
    pub language: String,
    pub output: InferenceOutput,
}
