//! Hosted Whisper ASR (Groq-style OpenAI-compatible audio endpoint).
//!
//! Multipart upload, verbose_json response with real segment timestamps.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::TranscriptionConfig;

use super::{TranscriptSegment, TranscriptionProvider};

const WHISPER_URL: &str = "https://api.groq.com/openai/v1/audio/transcriptions";
const WHISPER_MODEL: &str = "whisper-large-v3";

#[derive(Deserialize)]
struct WhisperResponse {
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    #[serde(default)]
    text: String,
}

pub struct WhisperApiProvider {
    http: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
}

impl WhisperApiProvider {
    pub fn new(config: &TranscriptionConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.request_timeout_secs.min(30)))
                .build()
                .unwrap_or_default(),
            api_url: WHISPER_URL.to_string(),
            api_key: config.whisper_api_key.clone(),
        }
    }

    #[cfg(test)]
    fn with_url(mut self, url: String) -> Self {
        self.api_url = url;
        self
    }
}

#[async_trait]
impl TranscriptionProvider for WhisperApiProvider {
    fn name(&self) -> &'static str {
        "whisper-api"
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn transcribe(&self, wav: &[u8], language: &str) -> Vec<TranscriptSegment> {
        let Some(api_key) = &self.api_key else {
            return Vec::new();
        };

        let file_part = reqwest::multipart::Part::bytes(wav.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .unwrap_or_else(|_| {
                reqwest::multipart::Part::bytes(wav.to_vec()).file_name("audio.wav")
            });

        let form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("model", WHISPER_MODEL)
            .text("language", language.to_string())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "segment");

        let response = match self
            .http
            .post(&self.api_url)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await
        {
            Ok(r) => r,
            Err(err) => {
                tracing::error!(%err, "Whisper API request failed");
                return Vec::new();
            }
        };

        if !response.status().is_success() {
            tracing::error!(status = response.status().as_u16(), "Whisper API error");
            return Vec::new();
        }

        let parsed: WhisperResponse = match response.json().await {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(%err, "Whisper API returned unparseable body");
                return Vec::new();
            }
        };

        parsed
            .segments
            .into_iter()
            .filter(|s| !s.text.trim().is_empty())
            .map(|s| TranscriptSegment::new(s.start, s.end, s.text.trim()))
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────
