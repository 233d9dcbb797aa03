//! Scripted backend for exercising the gateway without real models

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::backend::{BackendModel, ModelBackend};
use crate::error::{Error, Result};
use crate::inference::{InferenceOutput, InferencePayload, SpeechSegment};
use crate::model::{CapabilityKind, ModelDescriptor};

#[derive(Default)]
pub(crate) struct FakeBackend {
    load_delay: Duration,
    unload_delay: Duration,
    infer_delay: Duration,
    failing_loads: HashSet<String>,
    failing_unloads: HashSet<String>,
    failing_infers: HashSet<String>,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    infers: AtomicUsize,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub(crate) fn with_unload_delay(mut self, delay: Duration) -> Self {
        self.unload_delay = delay;
        self
    }

    pub(crate) fn with_infer_delay(mut self, delay: Duration) -> Self {
        self.infer_delay = delay;
        self
    }

    pub(crate) fn failing_loads(mut self, id: &str) -> Self {
        self.failing_loads.insert(id.to_string());
        self
    }

    pub(crate) fn failing_unloads(mut self, id: &str) -> Self {
        self.failing_unloads.insert(id.to_string());
        self
    }

    pub(crate) fn failing_infers(mut self, id: &str) -> Self {
        self.failing_infers.insert(id.to_string());
        self
    }

    pub(crate) fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub(crate) fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub(crate) fn infers(&self) -> usize {
        self.infers.load(Ordering::SeqCst)
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl ModelBackend for FakeBackend {
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<BackendModel> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        pause(self.load_delay).await;
        if self.failing_loads.contains(&descriptor.id) {
            return Err(Error::ModelLoad {
                model: descriptor.id.clone(),
                reason: "weights missing".to_string(),
            });
        }
        Ok(BackendModel::new(descriptor.id.clone()))
    }

    async fn unload(&self, descriptor: &ModelDescriptor, _model: BackendModel) -> Result<()> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        pause(self.unload_delay).await;
        if self.failing_unloads.contains(&descriptor.id) {
            return Err(Error::ModelUnload {
                model: descriptor.id.clone(),
                reason: "device busy".to_string(),
            });
        }
        Ok(())
    }

    async fn infer(
        &self,
        descriptor: &ModelDescriptor,
        model: &BackendModel,
        kind: CapabilityKind,
        language: &str,
        payload: &InferencePayload,
    ) -> Result<InferenceOutput> {
        self.infers.fetch_add(1, Ordering::SeqCst);
        pause(self.infer_delay).await;
        if self.failing_infers.contains(&descriptor.id) {
            return Err(Error::Inference("decoder crashed".to_string()));
        }

        let loaded = model.downcast_ref::<String>().cloned().unwrap_or_default();
        Ok(match (kind, payload) {
            (CapabilityKind::Stt, InferencePayload::Audio { data, .. }) => {
                InferenceOutput::Transcription {
                    text: format!("{loaded}: {} bytes", data.len()),
                    language: Some(language.to_string()),
                }
            }
            (CapabilityKind::Tts, InferencePayload::Text { text, .. }) => InferenceOutput::Speech {
                audio: text.clone().into_bytes().into(),
                sample_rate: 22050,
                format: "wav".to_string(),
            },
            (_, InferencePayload::Audio { data, .. }) => InferenceOutput::VoiceActivity {
                segments: vec![SpeechSegment {
                    start_ms: 0,
                    end_ms: data.len() as u64,
                }],
            },
            (_, InferencePayload::Text { .. }) => {
                return Err(Error::InvalidInput("unexpected payload".to_string()))
            }
        })
    }
}
