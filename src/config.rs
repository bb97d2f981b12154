//! Layered configuration: optional TOML file, environment overrides.
//!
//! Secrets (API keys, endpoint tokens) are read from the environment so
//! they never have to live in a config file; everything else has a default
//! that yields a runnable server with only the local transcription
//! fallback available.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub transcription: TranscriptionConfig,
    pub llm: LlmConfig,
    pub audio: AudioConfig,
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address, e.g. "127.0.0.1:8700".
    pub bind: String,
    /// Allowed CORS origins. Empty means allow any (dev default).
    pub cors_origins: Vec<String>,
}

/// Transcription provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Explicit provider override: "diarize" | "multimodal" | "whisper-api" | "local".
    pub backend: Option<String>,
    /// Diarization service base URL (the only provider with real speaker
    /// separation). Env: `DIARIZATION_ENDPOINT`.
    pub diarization_endpoint: Option<String>,
    /// Bearer token for the diarization service. Env: `DIARIZATION_API_TOKEN`.
    pub diarization_api_token: Option<String>,
    /// Whisper API key (multipart ASR provider). Env: `WHISPER_API_KEY`.
    pub whisper_api_key: Option<String>,
    /// Local whisper.cpp-compatible server URL (last-resort fallback).
    pub local_endpoint: String,
    /// Per-request transcription timeout in seconds.
    pub request_timeout_secs: u64,
}

/// Inference (chat-completion) configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenRouter API key. Env: `OPENROUTER_API_KEY`.
    pub api_key: Option<String>,
    /// Chat-completions endpoint.
    pub api_url: String,
    /// Model used for all real-time inference calls.
    pub realtime_model: String,
    /// Per-request inference timeout in seconds.
    pub request_timeout_secs: u64,
}

/// Audio accumulation thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Minimum seconds between transcription windows.
    pub interval_secs: f64,
    /// Minimum chunks before a window is ready.
    pub min_chunks: u32,
    /// Minimum buffered bytes before a window is ready.
    pub min_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8700".to_string(),
            cors_origins: Vec::new(),
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            backend: None,
            diarization_endpoint: None,
            diarization_api_token: None,
            whisper_api_key: None,
            local_endpoint: "http://127.0.0.1:8080/inference".to_string(),
            request_timeout_secs: 60,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            realtime_model: "google/gemini-2.5-flash-lite".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10.0,
            min_chunks: 8,
            min_bytes: 60_000,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Missing fields use defaults; invalid TOML is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from a file if it exists, otherwise defaults. Env overrides
    /// apply in both cases.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            Some(p) => anyhow::bail!("Config file not found: {}", p.display()),
            None => {
                let mut config = Config::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    /// Environment variables win over file values for secrets and endpoints.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("OPENROUTER_API_KEY") {
            if !v.is_empty() {
                self.llm.api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("WHISPER_API_KEY") {
            if !v.is_empty() {
                self.transcription.whisper_api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("DIARIZATION_ENDPOINT") {
            if !v.is_empty() {
                self.transcription.diarization_endpoint = Some(v);
            }
        }
        if let Ok(v) = std::env::var("DIARIZATION_API_TOKEN") {
            if !v.is_empty() {
                self.transcription.diarization_api_token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("TRANSCRIPTION_BACKEND") {
            if !v.is_empty() {
                self.transcription.backend = Some(v.to_lowercase());
            }
        }
    }
}
