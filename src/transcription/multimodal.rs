//! Transcription through a multimodal chat model (OpenRouter wire format).
//!
//! The cheap default when no dedicated ASR service is configured. The
//! model returns plain text, so segment timing is synthesized: one
//! segment per output line, five seconds apiece. Good enough for the
//! rolling transcript; the Whisper-based providers give real timestamps.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use crate::config::{LlmConfig, TranscriptionConfig};

use super::{TranscriptSegment, TranscriptionProvider};

const TRANSCRIPTION_MODEL: &str = "google/gemini-2.5-flash-lite";

/// Roughly 15 MB of WAV is ~20 MB once base64-encoded, near the request
/// ceiling. The router splits anything bigger.
const MAX_CHUNK_BYTES: usize = 15 * 1024 * 1024;

/// Synthesized length of each text-line segment.
const SYNTH_SEGMENT_SECS: f64 = 5.0;

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

pub struct MultimodalProvider {
    http: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
}

impl MultimodalProvider {
    pub fn new(transcription: &TranscriptionConfig, llm: &LlmConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(transcription.request_timeout_secs))
                .build()
                .unwrap_or_default(),
            api_url: llm.api_url.clone(),
            api_key: llm.api_key.clone(),
        }
    }

    fn language_name(language: &str) -> &str {
        match language {
            "id" => "Bahasa Indonesia",
            "en" => "English",
            "es" => "Spanish",
            "ms" => "Malay",
            "vi" => "Vietnamese",
            "tl" => "Filipino/Tagalog",
            other => other,
        }
    }
}

#[async_trait]
impl TranscriptionProvider for MultimodalProvider {
    fn name(&self) -> &'static str {
        "multimodal"
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn max_payload_bytes(&self) -> Option<usize> {
        Some(MAX_CHUNK_BYTES)
    }

    async fn transcribe(&self, wav: &[u8], language: &str) -> Vec<TranscriptSegment> {
        let Some(api_key) = &self.api_key else {
            return Vec::new();
        };

        let audio_b64 = base64::engine::general_purpose::STANDARD.encode(wav);
        let prompt = format!(
            "Transcribe this audio recording accurately and completely. \
             The primary language is {}. \
             Return ONLY the transcription text, nothing else. \
             Preserve the original language, do not translate. \
             Include all speech, including filler words. \
             If there are multiple speakers, indicate speaker changes with newlines. \
             Do not add timestamps, annotations, or commentary.",
            Self::language_name(language),
        );

        let payload = serde_json::json!({
            "model": TRANSCRIPTION_MODEL,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "input_audio", "input_audio": {"data": audio_b64, "format": "wav"}},
                ],
            }],
            "temperature": 0.0,
            "max_tokens": 16000,
        });

        let response = match self
            .http
            .post(&self.api_url)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(err) => {
                tracing::error!(%err, "Multimodal transcription request failed");
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
            tracing::error!(status, %body, "Multimodal transcription error");
            return Vec::new();
        }

        let parsed: ChatResponse = match response.json().await {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(%err, "Multimodal transcription returned unparseable body");
                return Vec::new();
            }
        };

        let Some(text) = parsed.choices.into_iter().next().map(|c| c.message.content) else {
            return Vec::new();
        };

        let segments: Vec<TranscriptSegment> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .enumerate()
            .map(|(i, line)| {
                let start = i as f64 * SYNTH_SEGMENT_SECS;
                TranscriptSegment::new(start, start + SYNTH_SEGMENT_SECS, line)
            })
            .collect();

        tracing::info!(
            segments = segments.len(),
            chars = text.len(),
            "Multimodal transcription complete"
        );
        segments
    }
}

// ── Tests ─────────────────────────────────────────────────────────
