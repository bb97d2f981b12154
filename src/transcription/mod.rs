//! Transcription providers and the router that picks between them.
//!
//! Four adapters sit behind one trait: a diarization service (the only
//! one with real speaker separation), a multimodal chat model, a hosted
//! Whisper API, and a local whisper.cpp-compatible server as the
//! always-available floor. The [`ProviderRegistry`] is built once at
//! startup; selection is deterministic given configuration.
//!
//! Ordinary provider failures (timeouts, 5xx, unparseable bodies) yield
//! an empty segment list, never an error. A missed window of audio is
//! acceptable; a stalled pipeline is not.

mod diarization;
mod local;
mod multimodal;
mod whisper_api;

pub use diarization::DiarizationProvider;
pub use local::LocalWhisperProvider;
pub use multimodal::MultimodalProvider;
pub use whisper_api::WhisperApiProvider;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::audio::split_wav;
use crate::config::Config;

// ── Types ─────────────────────────────────────────────────────────

/// One transcribed span of audio. `speaker` is empty unless the provider
/// supports diarization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub speaker: String,
}

impl TranscriptSegment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            speaker: String::new(),
        }
    }
}

/// A speech-to-text backend. Input is always a normalized WAV payload.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the provider can run given its configuration (keys,
    /// endpoints). Checked at selection time, not per request.
    fn is_available(&self) -> bool;

    fn supports_diarization(&self) -> bool {
        false
    }

    /// Largest WAV payload the provider accepts in one request. The
    /// router splits anything bigger and re-offsets the timestamps.
    fn max_payload_bytes(&self) -> Option<usize> {
        None
    }

    /// Transcribe one WAV payload. Empty on failure.
    async fn transcribe(&self, wav: &[u8], language: &str) -> Vec<TranscriptSegment>;
}

/// Provider availability snapshot, for /health and the CLI check.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: &'static str,
    pub available: bool,
    pub diarization: bool,
}

// ── Registry ──────────────────────────────────────────────────────

/// Holds every configured provider in priority order.
///
/// Priority: explicit override (if available), then diarization, then
/// multimodal, then the Whisper API, then the local server. The local
/// provider reports itself always available, so selection never comes
/// up empty.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn TranscriptionProvider>>,
    backend_override: Option<String>,
}

impl ProviderRegistry {
    pub fn from_config(config: &Config) -> Self {
        let providers: Vec<Arc<dyn TranscriptionProvider>> = vec![
            Arc::new(DiarizationProvider::new(&config.transcription)),
            Arc::new(MultimodalProvider::new(&config.transcription, &config.llm)),
            Arc::new(WhisperApiProvider::new(&config.transcription)),
            Arc::new(LocalWhisperProvider::new(&config.transcription)),
        ];
        Self {
            providers,
            backend_override: config.transcription.backend.clone(),
        }
    }

    /// Build from explicit providers; used by tests and embedders.
    pub fn new(
        providers: Vec<Arc<dyn TranscriptionProvider>>,
        backend_override: Option<String>,
    ) -> Self {
        Self {
            providers,
            backend_override,
        }
    }

    /// Pick the provider for the next request.
    pub fn select(&self) -> Option<Arc<dyn TranscriptionProvider>> {
        if let Some(wanted) = &self.backend_override {
            match self.providers.iter().find(|p| p.name() == wanted) {
                Some(p) if p.is_available() => return Some(p.clone()),
                Some(_) => {
                    tracing::warn!(backend = %wanted, "Requested provider is not available, falling back")
                }
                None => tracing::warn!(backend = %wanted, "Unknown provider override, falling back"),
            }
        }
        self.providers.iter().find(|p| p.is_available()).cloned()
    }

    pub fn status(&self) -> Vec<ProviderStatus> {
        self.providers
            .iter()
            .map(|p| ProviderStatus {
                name: p.name(),
                available: p.is_available(),
                diarization: p.supports_diarization(),
            })
            .collect()
    }

    pub fn selected_name(&self) -> Option<&'static str> {
        self.select().map(|p| p.name())
    }

    /// Transcribe one normalized WAV window through the selected provider,
    /// splitting oversized payloads and re-offsetting their timestamps.
    pub async fn transcribe(&self, wav: &[u8], language: &str) -> Vec<TranscriptSegment> {
        let Some(provider) = self.select() else {
            tracing::error!("No transcription provider available");
            return Vec::new();
        };

        tracing::info!(backend = provider.name(), bytes = wav.len(), "Transcribing audio window");

        match provider.max_payload_bytes() {
            Some(max) if wav.len() > max => {
                self.transcribe_chunked(provider, wav, language, max).await
            }
            _ => provider.transcribe(wav, language).await,
        }
    }

    async fn transcribe_chunked(
        &self,
        provider: Arc<dyn TranscriptionProvider>,
        wav: &[u8],
        language: &str,
        max_bytes: usize,
    ) -> Vec<TranscriptSegment> {
        let chunks = split_wav(wav, max_bytes);
        tracing::info!(
            backend = provider.name(),
            chunks = chunks.len(),
            "Payload over provider limit, transcribing in chunks"
        );

        let mut all_segments = Vec::new();
        let mut offset_secs = 0.0;
        for chunk in &chunks {
            let segments = provider.transcribe(&chunk.wav, language).await;
            all_segments.extend(segments.into_iter().map(|mut s| {
                s.start += offset_secs;
                s.end += offset_secs;
                s
            }));
            offset_secs += chunk.duration_secs;
        }
        all_segments
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wrap_pcm_as_wav;

    struct FakeProvider {
        name: &'static str,
        available: bool,
        max_bytes: Option<usize>,
    }

    #[async_trait]
    impl TranscriptionProvider for FakeProvider {
        fn name(&self) -> &'static str {
            self.name
        }
        fn is_available(&self) -> bool {
            self.available
        }
        fn max_payload_bytes(&self) -> Option<usize> {
            self.max_bytes
        }
        async fn transcribe(&self, _wav: &[u8], _language: &str) -> Vec<TranscriptSegment> {
            vec![TranscriptSegment::new(0.0, 1.0, format!("from {}", self.name))]
        }
    }

    fn fake(name: &'static str, available: bool) -> Arc<dyn TranscriptionProvider> {
        Arc::new(FakeProvider {
            name,
            available,
            max_bytes: None,
        })
    }

    #[test]
    fn selection_follows_priority_order() {
        let registry = ProviderRegistry::new(
            vec![fake("diarize", false), fake("multimodal", true), fake("whisper-api", true)],
            None,
        );
        assert_eq!(registry.selected_name(), Some("multimodal"));
    }

    #[test]
    fn selection_is_deterministic() {
        let registry = ProviderRegistry::new(
            vec![fake("diarize", true), fake("multimodal", true), fake("local", true)],
            None,
        );
        for _ in 0..10 {
            assert_eq!(registry.selected_name(), Some("diarize"));
        }
    }

    #[test]
    fn available_override_wins() {
        let registry = ProviderRegistry::new(
            vec![fake("diarize", true), fake("local", true)],
            Some("local".to_string()),
        );
        assert_eq!(registry.selected_name(), Some("local"));
    }

    #[test]
    fn unavailable_override_falls_back() {
        let registry = ProviderRegistry::new(
            vec![fake("diarize", false), fake("multimodal", true)],
            Some("diarize".to_string()),
        );
        assert_eq!(registry.selected_name(), Some("multimodal"));
    }

    #[test]
    fn unknown_override_falls_back() {
        let registry =
            ProviderRegistry::new(vec![fake("local", true)], Some("nonsense".to_string()));
        assert_eq!(registry.selected_name(), Some("local"));
    }

    #[test]
    fn no_available_provider_selects_nothing() {
        let registry = ProviderRegistry::new(vec![fake("diarize", false)], None);
        assert!(registry.select().is_none());
    }

    #[tokio::test]
    async fn oversized_payload_is_chunked_with_offsets() {
        // 10 seconds of PCM, provider limit forces several chunks
        let wav = wrap_pcm_as_wav(&vec![0u8; 320_000]);
        let provider = Arc::new(FakeProvider {
            name: "multimodal",
            available: true,
            max_bytes: Some(100_000),
        });
        let registry = ProviderRegistry::new(vec![provider], None);

        let segments = registry.transcribe(&wav, "en").await;
        assert!(segments.len() >= 3);

        // Every chunk's fake segment spans [offset, offset+1); offsets
        // must be strictly increasing by the chunk durations.
        for pair in segments.windows(2) {
            assert!(pair[1].start > pair[0].start);
        }
        assert!((segments[0].start - 0.0).abs() < 0.001);
        let last = segments.last().unwrap();
        assert!(last.start > 5.0, "last chunk offset should be well into the clip");
    }

    #[test]
    fn registry_from_config_has_local_floor() {
        let registry = ProviderRegistry::from_config(&Config::default());
        // No keys or endpoints configured: only the local floor is available
        assert_eq!(registry.selected_name(), Some("local"));
        let status = registry.status();
        assert_eq!(status.len(), 4);
        assert!(status.iter().any(|s| s.name == "diarize" && s.diarization));
    }
}
