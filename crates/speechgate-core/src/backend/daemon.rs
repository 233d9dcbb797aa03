//! Inference daemon backend
//!
//! Talks to a persistent inference process over a Unix socket. The daemon
//! owns the actual weights; this side only tracks which model it asked for.

use async_trait::async_trait;
use base64::Engine as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::protocol::{read_frame, write_frame, DaemonRequest, DaemonResponse};
use super::{BackendModel, ModelBackend};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::inference::{InferenceOutput, InferencePayload};
use crate::model::{CapabilityKind, ModelDescriptor};

const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STARTUP_ATTEMPTS: usize = 100;

/// Handle for a model resident in the daemon
#[derive(Debug, Clone)]
pub struct DaemonModel {
    pub model_id: String,
    pub device: Option<String>,
}

/// Backend that forwards load/unload/infer to the inference daemon
pub struct DaemonBackend {
    socket_path: PathBuf,
    daemon_command: Vec<String>,
    daemon_process: Mutex<Option<Child>>,
    /// Held across the liveness check, spawn and readiness polling so concurrent loads
    /// start at most one daemon
    startup: tokio::sync::Mutex<()>,
}

impl DaemonBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            daemon_command: config.daemon_command.clone(),
            daemon_process: Mutex::new(None),
            startup: tokio::sync::Mutex::new(()),
        }
    }

    /// Start the daemon if it is not reachable and a command is configured
    pub async fn ensure_daemon_running(&self) -> Result<()> {
        if self.send(&DaemonRequest::command("check")).await.is_ok() {
            debug!("Inference daemon already running");
            return Ok(());
        }

        let _startup = self.startup.lock().await;
        // Another caller may have brought it up while we queued
        if self.send(&DaemonRequest::command("check")).await.is_ok() {
            return Ok(());
        }

        let Some((program, args)) = self.daemon_command.split_first() else {
            return Err(Error::Inference(format!(
                "Inference daemon not reachable at {:?} and no daemon_command configured",
                self.socket_path
            )));
        };

        let running = {
            let mut guard = self.daemon_process.lock().unwrap_or_else(|e| e.into_inner());
            matches!(guard.as_mut().map(Child::try_wait), Some(Ok(None)))
        };

        if running {
            debug!("Inference daemon process alive but not answering yet");
        } else {
            info!("Starting inference daemon: {}", program);
            let child = Command::new(program)
                .args(args)
                .arg("--socket")
                .arg(&self.socket_path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn()?;

            let mut guard = self.daemon_process.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Some(child);
        }

        for attempt in 0..STARTUP_ATTEMPTS {
            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
            if let Ok(response) = self.send(&DaemonRequest::command("check")).await {
                info!(
                    "Inference daemon ready (device: {})",
                    response.device.as_deref().unwrap_or("unknown")
                );
                return Ok(());
            }
            if attempt % 20 == 0 {
                debug!("Waiting for inference daemon... ({}/10s)", attempt / 10);
            }
        }

        Err(Error::Inference(
            "Inference daemon failed to start within 10 seconds".to_string(),
        ))
    }

    /// Ask the daemon to exit and reap the child if we started it
    pub async fn stop_daemon(&self) -> Result<()> {
        if let Err(e) = self.send(&DaemonRequest::command("shutdown")).await {
            debug!("Shutdown command not delivered: {}", e);
        }

        let child = self
            .daemon_process
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill inference daemon: {}", e);
            }
        }
        Ok(())
    }

    /// Daemon status, including the models it currently holds
    pub async fn status(&self) -> Result<DaemonResponse> {
        self.call(&DaemonRequest::command("status")).await
    }

    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Inference(format!(
                "Failed to connect to inference daemon at {:?}: {}",
                self.socket_path, e
            ))
        })
    }

    async fn send(&self, request: &DaemonRequest) -> Result<DaemonResponse> {
        let mut stream = self.connect().await?;
        write_frame(&mut stream, request).await?;
        let response: DaemonResponse = read_frame(&mut stream).await?;

        if let Some(error) = &response.error {
            return Err(Error::Inference(error.clone()));
        }
        Ok(response)
    }

    async fn call(&self, request: &DaemonRequest) -> Result<DaemonResponse> {
        self.ensure_daemon_running().await?;
        self.send(request).await
    }
}

#[async_trait]
impl ModelBackend for DaemonBackend {
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<BackendModel> {
        let mut request = DaemonRequest::command("load");
        request.model_id = Some(descriptor.id.clone());
        request.kind = Some(descriptor.kind.to_string());
        request.path = Some(descriptor.location.to_string_lossy().into_owned());

        let response = self.call(&request).await.map_err(|e| Error::ModelLoad {
            model: descriptor.id.clone(),
            reason: e.to_string(),
        })?;

        Ok(BackendModel::new(DaemonModel {
            model_id: descriptor.id.clone(),
            device: response.device,
        }))
    }

    async fn unload(&self, descriptor: &ModelDescriptor, model: BackendModel) -> Result<()> {
        let model_id = model
            .downcast_ref::<DaemonModel>()
            .map(|m| m.model_id.clone())
            .unwrap_or_else(|| descriptor.id.clone());

        let mut request = DaemonRequest::command("unload");
        request.model_id = Some(model_id);

        self.send(&request)
            .await
            .map(|_| ())
            .map_err(|e| Error::ModelUnload {
                model: descriptor.id.clone(),
                reason: e.to_string(),
            })
    }

    async fn infer(
        &self,
        descriptor: &ModelDescriptor,
        model: &BackendModel,
        kind: CapabilityKind,
        language: &str,
        payload: &InferencePayload,
    ) -> Result<InferenceOutput> {
        let model = model.downcast_ref::<DaemonModel>().ok_or_else(|| {
            Error::Inference(format!("{} is not a daemon-loaded model", descriptor.id))
        })?;

        let command = match kind {
            CapabilityKind::Stt => "transcribe",
            CapabilityKind::Tts => "synthesize",
            CapabilityKind::Vad => "detect",
        };
        let mut request = DaemonRequest::command(command);
        request.model_id = Some(model.model_id.clone());
        request.language = Some(language.to_string());

        match payload {
            InferencePayload::Audio { data, sample_rate } => {
                request.audio_base64 = Some(base64::engine::general_purpose::STANDARD.encode(data));
                request.sample_rate = *sample_rate;
            }
            InferencePayload::Text { text, voice } => {
                request.text = Some(text.clone());
                request.voice = voice.clone();
            }
        }

        let response = self.send(&request).await?;
        decode_output(kind, response)
    }
}

fn decode_output(kind: CapabilityKind, response: DaemonResponse) -> Result<InferenceOutput> {
    match kind {
        CapabilityKind::Stt => Ok(InferenceOutput::Transcription {
            text: response
                .transcription
                .ok_or_else(|| Error::Inference("daemon returned no transcription".into()))?,
            language: response.language,
        }),
        CapabilityKind::Tts => {
            let encoded = response
                .audio_base64
                .ok_or_else(|| Error::Inference("daemon returned no audio".into()))?;
            let audio = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| Error::Inference(format!("invalid audio from daemon: {e}")))?;
            Ok(InferenceOutput::Speech {
                audio: audio.into(),
                sample_rate: response.sample_rate.unwrap_or(22050),
                format: response.format.unwrap_or_else(|| "wav".to_string()),
            })
        }
        CapabilityKind::Vad => Ok(InferenceOutput::VoiceActivity {
            segments: response.segments.unwrap_or_default(),
        }),
    }
}
