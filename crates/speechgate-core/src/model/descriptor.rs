//! Model descriptors, capability kinds and idle time-to-live policy

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// Category of inference a model performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    /// Speech-to-text
    Stt,
    /// Text-to-speech
    Tts,
    /// Voice-activity-detection
    Vad,
}

impl CapabilityKind {
    pub fn all() -> &'static [CapabilityKind] {
        &[CapabilityKind::Stt, CapabilityKind::Tts, CapabilityKind::Vad]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Stt => "stt",
            CapabilityKind::Tts => "tts",
            CapabilityKind::Vad => "vad",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stt" | "asr" | "speech-to-text" => Ok(CapabilityKind::Stt),
            "tts" | "speech" | "text-to-speech" => Ok(CapabilityKind::Tts),
            "vad" | "voice-activity-detection" => Ok(CapabilityKind::Vad),
            other => Err(Error::InvalidInput(format!("unknown capability kind '{other}'"))),
        }
    }
}

/// How long an unreferenced instance stays resident.
///
/// Configured as signed seconds: negative keeps the instance forever, zero
/// unloads it as soon as its last reference is released, and a positive value
/// unloads it after that many idle seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Ttl {
    Never,
    Immediate,
    After(Duration),
}

impl Ttl {
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            s if s < 0 => Ttl::Never,
            0 => Ttl::Immediate,
            s => Ttl::After(Duration::from_secs(s as u64)),
        }
    }

    pub fn as_secs(&self) -> i64 {
        match self {
            Ttl::Never => -1,
            Ttl::Immediate => 0,
            Ttl::After(d) => d.as_secs().max(1) as i64,
        }
    }

    /// Whether an instance idle for `idle` has outlived this policy.
    pub fn is_expired(&self, idle: Duration) -> bool {
        match self {
            Ttl::Never => false,
            Ttl::Immediate => true,
            Ttl::After(ttl) => idle >= *ttl,
        }
    }
}

impl TryFrom<i64> for Ttl {
    type Error = std::convert::Infallible;

    fn try_from(secs: i64) -> Result<Self, Self::Error> {
        Ok(Ttl::from_secs(secs))
    }
}

impl From<Ttl> for i64 {
    fn from(ttl: Ttl) -> Self {
        ttl.as_secs()
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ttl::Never => f.write_str("never"),
            Ttl::Immediate => f.write_str("immediate"),
            Ttl::After(d) => write!(f, "{}s", d.as_secs()),
        }
    }
}

/// Immutable description of a registered model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub kind: CapabilityKind,
    /// On-disk or cache location handed to the loading backend
    pub location: PathBuf,
    pub ttl: Ttl,
}

impl ModelDescriptor {
    pub fn new(
        id: impl Into<String>,
        kind: CapabilityKind,
        location: impl Into<PathBuf>,
        ttl: Ttl,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            location: location.into(),
            ttl,
        }
    }
}
