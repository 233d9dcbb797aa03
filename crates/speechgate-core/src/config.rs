//! Configuration types for the speechgate gateway

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::LanguagePolicy;
use crate::error::{Error, Result};
use crate::model::{CapabilityKind, ModelDescriptor, Ttl};

/// Environment variable prefix, e.g. `SPEECHGATE_TTL__STT=600`
pub const ENV_PREFIX: &str = "SPEECHGATE";

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base directory for relative model locations
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Models known to the registry
    #[serde(default = "default_models")]
    pub models: Vec<ModelEntry>,

    /// Model used per kind when a request names none
    #[serde(default = "default_default_models")]
    pub defaults: DefaultModels,

    /// Idle time-to-live per capability kind
    #[serde(default)]
    pub ttl: TtlConfig,

    /// Language tags accepted by the dispatcher
    #[serde(default = "default_allowed_languages")]
    pub allowed_languages: Vec<String>,

    /// Language assumed when a request carries none. Falls back to the first
    /// allowed language.
    #[serde(default)]
    pub default_language: Option<String>,

    /// Models loaded eagerly at startup
    #[serde(default)]
    pub preload: Vec<String>,

    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,

    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,

    #[serde(default = "default_unload_timeout_secs")]
    pub unload_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            models: default_models(),
            defaults: default_default_models(),
            ttl: TtlConfig::default(),
            allowed_languages: default_allowed_languages(),
            default_language: None,
            preload: Vec::new(),
            eviction_interval_secs: default_eviction_interval_secs(),
            load_timeout_secs: default_load_timeout_secs(),
            unload_timeout_secs: default_unload_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            server: ServerConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from an optional TOML file and the environment.
    ///
    /// Sources, later ones overriding earlier ones:
    /// 1. `$SPEECHGATE_CONFIG` (default `speechgate.toml`), if present
    /// 2. `SPEECHGATE_*` environment variables, `__` separating nested keys
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("SPEECHGATE_CONFIG").unwrap_or_else(|_| "speechgate.toml".to_string());

        let builder = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("allowed_languages")
                    .with_list_parse_key("preload")
                    .try_parsing(true),
            );

        let config: GatewayConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: GatewayConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let languages = LanguagePolicy::new(&self.allowed_languages, None);
        if languages.allowed().next().is_none() {
            return Err(Error::Config(
                "allowed_languages must name at least one language".into(),
            ));
        }

        if let Some(language) = &self.default_language {
            if languages.check(Some(language)).is_err() {
                return Err(Error::Config(format!(
                    "default_language '{language}' is not in allowed_languages"
                )));
            }
        }

        for (name, value) in [
            ("eviction_interval_secs", self.eviction_interval_secs),
            ("load_timeout_secs", self.load_timeout_secs),
            ("unload_timeout_secs", self.unload_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than 0")));
            }
        }

        let mut seen = HashSet::new();
        for entry in &self.models {
            if entry.id.trim().is_empty() {
                return Err(Error::Config("model id must not be empty".into()));
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(Error::Config(format!("duplicate model id '{}'", entry.id)));
            }
        }

        for kind in CapabilityKind::all() {
            if let Some(id) = self.defaults.get(*kind) {
                match self.models.iter().find(|m| &m.id == id) {
                    None => {
                        return Err(Error::Config(format!(
                            "defaults.{kind} names unknown model '{id}'"
                        )))
                    }
                    Some(entry) if entry.kind != *kind => {
                        return Err(Error::Config(format!(
                            "defaults.{kind} names '{id}', which is a {} model",
                            entry.kind
                        )))
                    }
                    Some(_) => {}
                }
            }
        }

        for id in &self.preload {
            if !seen.contains(id.as_str()) {
                return Err(Error::Config(format!("preload names unknown model '{id}'")));
            }
        }

        if self.server.max_concurrent_requests == 0 {
            return Err(Error::Config(
                "server.max_concurrent_requests must be greater than 0".into(),
            ));
        }
        if self.server.max_body_bytes == 0 {
            return Err(Error::Config(
                "server.max_body_bytes must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Descriptors for every configured model, with locations resolved
    /// against `models_dir` and TTLs filled from the per-kind policy.
    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        self.models
            .iter()
            .map(|entry| {
                let location = match &entry.location {
                    Some(path) if path.is_absolute() => path.clone(),
                    Some(path) => self.models_dir.join(path),
                    None => self.models_dir.join(dir_name(&entry.id)),
                };
                let ttl = entry
                    .ttl_secs
                    .map(Ttl::from_secs)
                    .unwrap_or_else(|| self.ttl.for_kind(entry.kind));
                ModelDescriptor::new(entry.id.clone(), entry.kind, location, ttl)
            })
            .collect()
    }

    /// Language used for requests that do not name one
    pub fn effective_default_language(&self) -> Option<&str> {
        self.default_language
            .as_deref()
            .or_else(|| self.allowed_languages.first().map(String::as_str))
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn unload_timeout(&self) -> Duration {
        Duration::from_secs(self.unload_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// A model as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub kind: CapabilityKind,
    /// Absolute, or relative to `models_dir`. Defaults to the id.
    #[serde(default)]
    pub location: Option<PathBuf>,
    /// Overrides the per-kind TTL for this model
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

impl ModelEntry {
    pub fn new(id: impl Into<String>, kind: CapabilityKind) -> Self {
        Self {
            id: id.into(),
            kind,
            location: None,
            ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultModels {
    #[serde(default)]
    pub stt: Option<String>,
    #[serde(default)]
    pub tts: Option<String>,
    #[serde(default)]
    pub vad: Option<String>,
}

impl DefaultModels {
    pub fn get(&self, kind: CapabilityKind) -> Option<&String> {
        match kind {
            CapabilityKind::Stt => self.stt.as_ref(),
            CapabilityKind::Tts => self.tts.as_ref(),
            CapabilityKind::Vad => self.vad.as_ref(),
        }
    }
}

/// Idle TTL per capability kind, in signed seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TtlConfig {
    #[serde(default = "default_stt_ttl")]
    pub stt: Ttl,
    #[serde(default = "default_tts_ttl")]
    pub tts: Ttl,
    #[serde(default = "default_vad_ttl")]
    pub vad: Ttl,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            stt: default_stt_ttl(),
            tts: default_tts_ttl(),
            vad: default_vad_ttl(),
        }
    }
}

impl TtlConfig {
    pub fn for_kind(&self, kind: CapabilityKind) -> Ttl {
        match kind {
            CapabilityKind::Stt => self.stt,
            CapabilityKind::Tts => self.tts,
            CapabilityKind::Vad => self.vad,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_cors_enabled")]
    pub cors_enabled: bool,

    /// Bearer token required on the API routes when set
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Request body cap for the audio routes. Base64 inflates audio by 4/3.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: default_cors_enabled(),
            api_key: None,
            max_concurrent_requests: default_max_concurrent_requests(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Inference daemon connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Command started when the daemon socket is missing, e.g.
    /// `["python3", "scripts/speech_daemon.py"]`. The socket path is appended
    /// as `--socket <path>`.
    #[serde(default)]
    pub daemon_command: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            daemon_command: Vec::new(),
        }
    }
}

fn dir_name(id: &str) -> PathBuf {
    Path::new(&id.replace('/', "--")).to_path_buf()
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("speechgate")
        .join("models")
}

fn default_models() -> Vec<ModelEntry> {
    vec![
        ModelEntry::new("faster-whisper-large-v3", CapabilityKind::Stt),
        ModelEntry::new("piper-tr-dfki-medium", CapabilityKind::Tts),
        ModelEntry::new("silero-vad-v5", CapabilityKind::Vad),
    ]
}

fn default_default_models() -> DefaultModels {
    DefaultModels {
        stt: Some("faster-whisper-large-v3".to_string()),
        tts: Some("piper-tr-dfki-medium".to_string()),
        vad: Some("silero-vad-v5".to_string()),
    }
}

fn default_stt_ttl() -> Ttl {
    Ttl::from_secs(300)
}

fn default_tts_ttl() -> Ttl {
    Ttl::Immediate
}

fn default_vad_ttl() -> Ttl {
    Ttl::Never
}

fn default_allowed_languages() -> Vec<String> {
    vec!["tr".to_string(), "en".to_string()]
}

fn default_eviction_interval_secs() -> u64 {
    5
}

fn default_load_timeout_secs() -> u64 {
    600
}

fn default_unload_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_cors_enabled() -> bool {
    true
}

fn default_max_concurrent_requests() -> usize {
    100
}

fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/speechgate_daemon.sock")
}
