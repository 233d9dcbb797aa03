//! Inference endpoints: transcription, speech synthesis, voice activity

use axum::{extract::State, Json};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use speechgate_core::{
    CapabilityKind, InferenceOutput, InferencePayload, InferenceRequest, InferenceResponse,
    SpeechSegment,
};
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

/// Transcription request
#[derive(Debug, Deserialize)]
pub struct TranscriptionRequest {
    pub audio_base64: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct TranscriptionResponse {
    pub id: String,
    pub model: String,
    pub text: String,
    pub language: String,
}

/// Speech synthesis request
#[derive(Debug, Deserialize)]
pub struct SpeechRequest {
    pub input: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SpeechResponse {
    pub id: String,
    pub model: String,
    pub audio_base64: String,
    pub sample_rate: u32,
    pub format: String,
}

/// Voice activity detection request
#[derive(Debug, Deserialize)]
pub struct VadRequest {
    pub audio_base64: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct VadResponse {
    pub id: String,
    pub model: String,
    pub segments: Vec<SpeechSegment>,
}

pub async fn transcriptions(
    State(state): State<AppState>,
    Json(req): Json<TranscriptionRequest>,
) -> Result<Json<TranscriptionResponse>, ApiError> {
    let data = decode_audio(&req.audio_base64)?;
    info!("Transcription request: {} bytes", data.len());

    let payload = InferencePayload::Audio {
        data: data.into(),
        sample_rate: req.sample_rate,
    };
    let request = build_request(CapabilityKind::Stt, payload, req.model, req.language);
    let response = run(&state, request).await?;

    match response.output {
        InferenceOutput::Transcription { text, language } => Ok(Json(TranscriptionResponse {
            id: response.request_id.to_string(),
            model: response.model,
            text,
            language: language.unwrap_or(response.language),
        })),
        other => Err(unexpected_output(CapabilityKind::Stt, &other)),
    }
}

pub async fn speech(
    State(state): State<AppState>,
    Json(req): Json<SpeechRequest>,
) -> Result<Json<SpeechResponse>, ApiError> {
    info!("Speech request: {} chars", req.input.len());

    let payload = InferencePayload::Text {
        text: req.input,
        voice: req.voice,
    };
    let request = build_request(CapabilityKind::Tts, payload, req.model, req.language);
    let response = run(&state, request).await?;

    match response.output {
        InferenceOutput::Speech {
            audio,
            sample_rate,
            format,
        } => Ok(Json(SpeechResponse {
            id: response.request_id.to_string(),
            model: response.model,
            audio_base64: base64::engine::general_purpose::STANDARD.encode(&audio),
            sample_rate,
            format,
        })),
        other => Err(unexpected_output(CapabilityKind::Tts, &other)),
    }
}

pub async fn vad(
    State(state): State<AppState>,
    Json(req): Json<VadRequest>,
) -> Result<Json<VadResponse>, ApiError> {
    let data = decode_audio(&req.audio_base64)?;

    let payload = InferencePayload::Audio {
        data: data.into(),
        sample_rate: req.sample_rate,
    };
    let request = build_request(CapabilityKind::Vad, payload, req.model, req.language);
    let response = run(&state, request).await?;

    match response.output {
        InferenceOutput::VoiceActivity { segments } => Ok(Json(VadResponse {
            id: response.request_id.to_string(),
            model: response.model,
            segments,
        })),
        other => Err(unexpected_output(CapabilityKind::Vad, &other)),
    }
}

fn build_request(
    kind: CapabilityKind,
    payload: InferencePayload,
    model: Option<String>,
    language: Option<String>,
) -> InferenceRequest {
    let mut request = InferenceRequest::new(kind, payload);
    request.model = model;
    request.language = language;
    request
}

async fn run(state: &AppState, request: InferenceRequest) -> Result<InferenceResponse, ApiError> {
    let _permit = state.acquire_permit().await?;
    Ok(state.gateway.handle(request).await?)
}

fn decode_audio(encoded: &str) -> Result<Vec<u8>, ApiError> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| ApiError::bad_request(format!("invalid audio_base64: {}", e)))
}

fn unexpected_output(expected: CapabilityKind, output: &InferenceOutput) -> ApiError {
    ApiError::new(
        axum::http::StatusCode::BAD_GATEWAY,
        format!(
            "backend returned {} output for a {} request",
            output.kind(),
            expected
        ),
    )
}
