//! Local whisper.cpp-compatible server, the last-resort fallback.
//!
//! Always reported available so provider selection never comes up empty;
//! if the local server is not actually running, the request fails and the
//! window is skipped like any other provider error.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::audio::wav_duration_secs;
use crate::config::TranscriptionConfig;

use super::{TranscriptSegment, TranscriptionProvider};

#[derive(Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    text: String,
}

pub struct LocalWhisperProvider {
    http: reqwest::Client,
    endpoint: String,
}

impl LocalWhisperProvider {
    pub fn new(config: &TranscriptionConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.request_timeout_secs))
                .build()
                .unwrap_or_default(),
            endpoint: config.local_endpoint.clone(),
        }
    }
}

#[async_trait]
impl TranscriptionProvider for LocalWhisperProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    // Selection floor: there is nothing below this to fall back to.
    fn is_available(&self) -> bool {
        true
    }

    async fn transcribe(&self, wav: &[u8], language: &str) -> Vec<TranscriptSegment> {
        let file_part = match reqwest::multipart::Part::bytes(wav.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
        {
            Ok(p) => p,
            Err(_) => reqwest::multipart::Part::bytes(wav.to_vec()).file_name("audio.wav"),
        };

        let form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("language", language.to_string())
            .text("response_format", "json");

        let response = match self.http.post(&self.endpoint).multipart(form).send().await {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(%err, endpoint = %self.endpoint, "Local transcription server unreachable");
                return Vec::new();
            }
        };

        if !response.status().is_success() {
            tracing::warn!(status = response.status().as_u16(), "Local transcription error");
            return Vec::new();
        }

        let parsed: InferenceResponse = match response.json().await {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(%err, "Local transcription returned unparseable body");
                return Vec::new();
            }
        };

        let text = parsed.text.trim();
        if text.is_empty() {
            return Vec::new();
        }

        // The local server returns one flat text blob; span it over the
        // real duration of the window.
        let duration = wav_duration_secs(wav).unwrap_or(0.0);
        vec![TranscriptSegment::new(0.0, duration, text)]
    }
}

// ── Tests ─────────────────────────────────────────────────────────
