//! Wire protocol for the inference daemon
//!
//! Each message is a 4-byte big-endian length followed by a JSON body.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::inference::SpeechSegment;

/// Largest frame accepted in either direction
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Request to the inference daemon
#[derive(Debug, Default, Serialize)]
pub struct DaemonRequest {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

impl DaemonRequest {
    pub fn command(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Default::default()
        }
    }
}

/// Response from the inference daemon
#[derive(Debug, Default, Clone, Deserialize)]
pub struct DaemonResponse {
    pub status: Option<String>,
    pub error: Option<String>,
    pub device: Option<String>,
    pub transcription: Option<String>,
    pub language: Option<String>,
    pub audio_base64: Option<String>,
    pub sample_rate: Option<u32>,
    pub format: Option<String>,
    pub segments: Option<Vec<SpeechSegment>>,
    pub loaded_models: Option<Vec<String>>,
}

/// Write one length-prefixed JSON frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(Error::InvalidInput(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_BYTES}",
            body.len()
        )));
    }

    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut length_buf = [0u8; 4];
    reader.read_exact(&mut length_buf).await?;
    let length = u32::from_be_bytes(length_buf) as usize;
    if length > MAX_FRAME_BYTES {
        return Err(Error::InvalidInput(format!(
            "frame of {length} bytes exceeds limit of {MAX_FRAME_BYTES}"
        )));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}
