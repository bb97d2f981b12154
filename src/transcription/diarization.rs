//! Dedicated transcription + diarization microservice.
//!
//! The only provider with real speaker separation, so it sits first in
//! the priority order whenever its endpoint is configured.
//!
//! Contract: `POST {endpoint}/transcribe` as multipart form-data with
//! `file`, `language`, and optionally `num_speakers`; optional bearer
//! auth. The response carries segments with speaker labels and
//! per-segment confidence.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::TranscriptionConfig;

use super::{TranscriptSegment, TranscriptionProvider};

#[derive(Deserialize)]
struct DiarizationResponse {
    #[serde(default)]
    segments: Vec<DiarizedSegment>,
    #[serde(default)]
    num_speakers: u32,
    #[serde(default)]
    duration: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiarizedSegment {
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub speaker: String,
    #[serde(default)]
    pub confidence: f64,
}

pub struct DiarizationProvider {
    http: reqwest::Client,
    endpoint: Option<String>,
    api_token: Option<String>,
}

impl DiarizationProvider {
    pub fn new(config: &TranscriptionConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.request_timeout_secs))
                .build()
                .unwrap_or_default(),
            endpoint: config.diarization_endpoint.clone(),
            api_token: config.diarization_api_token.clone(),
        }
    }

    /// Full diarization call; `num_speakers` hints the speaker count when
    /// the caller knows it.
    pub async fn transcribe_with_diarization(
        &self,
        wav: &[u8],
        language: &str,
        num_speakers: Option<u32>,
    ) -> Vec<DiarizedSegment> {
        let Some(endpoint) = &self.endpoint else {
            return Vec::new();
        };

        let file_part = match reqwest::multipart::Part::bytes(wav.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
        {
            Ok(p) => p,
            Err(_) => reqwest::multipart::Part::bytes(wav.to_vec()).file_name("audio.wav"),
        };

        let mut form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("language", language.to_string());
        if let Some(n) = num_speakers {
            form = form.text("num_speakers", n.to_string());
        }

        let url = format!("{}/transcribe", endpoint.trim_end_matches('/'));
        let mut request = self.http.post(&url).multipart(form);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(err) => {
                tracing::error!(%err, %url, "Diarization request failed");
                return Vec::new();
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(300)
                .collect();
            tracing::error!(status, %body, "Diarization API error");
            return Vec::new();
        }

        let parsed: DiarizationResponse = match response.json().await {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(%err, "Diarization returned unparseable body");
                return Vec::new();
            }
        };

        tracing::info!(
            segments = parsed.segments.len(),
            speakers = parsed.num_speakers,
            duration_secs = parsed.duration,
            "Diarized transcription complete"
        );

        parsed
            .segments
            .into_iter()
            .filter(|s| !s.text.trim().is_empty())
            .collect()
    }
}

#[async_trait]
impl TranscriptionProvider for DiarizationProvider {
    fn name(&self) -> &'static str {
        "diarize"
    }

    fn is_available(&self) -> bool {
        self.endpoint.is_some()
    }

    fn supports_diarization(&self) -> bool {
        true
    }

    async fn transcribe(&self, wav: &[u8], language: &str) -> Vec<TranscriptSegment> {
        self.transcribe_with_diarization(wav, language, None)
            .await
            .into_iter()
            .map(|s| TranscriptSegment {
                start: s.start,
                end: s.end,
                text: s.text.trim().to_string(),
                speaker: s.speaker,
            })
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────
