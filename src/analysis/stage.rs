//! Stage detection: which phase of the playbook the call is currently in.
//!
//! Content-based inference with two safety nets: hysteresis toward the
//! previous stage on low confidence, and a deterministic time-based
//! fallback when inference fails entirely. The detector must never flap
//! between stages on a noisy window.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm::{parse_json_response, ChatModel, ChatOptions};
use crate::playbook::StageDefinition;

/// Below this many transcript characters, content inference is pointless.
const MIN_CONTEXT_CHARS: usize = 100;

/// Inference results under this confidence do not move the stage.
const MIN_CONFIDENCE: f64 = 0.6;

/// Grace period after a stage's expected end before it counts as very late.
const LATE_GRACE_SECS: u64 = 120;

#[derive(Deserialize)]
struct StageReply {
    #[serde(default)]
    stage_id: String,
    #[serde(default)]
    confidence: f64,
}

pub struct StageDetector {
    model: Arc<dyn ChatModel>,
}

impl StageDetector {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Detect the current stage id.
    ///
    /// Always returns a stage id from `stages` (empty string only when
    /// `stages` itself is empty).
    pub async fn detect(
        &self,
        transcript: &str,
        stages: &[StageDefinition],
        elapsed_secs: u64,
        previous_stage_id: Option<&str>,
        language: &str,
    ) -> String {
        let Some(first) = stages.first() else {
            return String::new();
        };

        // Too little context to infer from; stay where we are.
        if transcript.trim().chars().count() < MIN_CONTEXT_CHARS {
            return previous_stage_id.unwrap_or(&first.id).to_string();
        }

        match self
            .infer(transcript, stages, elapsed_secs, language)
            .await
        {
            Some((stage_id, confidence)) => {
                if confidence >= MIN_CONFIDENCE {
                    return stage_id;
                }
                if let Some(previous) = previous_stage_id {
                    tracing::debug!(
                        candidate = %stage_id,
                        confidence,
                        "Low-confidence stage detection, keeping previous stage"
                    );
                    return previous.to_string();
                }
                time_based_fallback(stages, elapsed_secs)
            }
            None => {
                tracing::warn!(elapsed_secs, "Stage inference failed, using time-based fallback");
                time_based_fallback(stages, elapsed_secs)
            }
        }
    }

    /// One inference round. Returns `(stage_id, confidence)`; an id the
    /// playbook does not know maps to the first stage at 0.5 confidence.
    async fn infer(
        &self,
        transcript: &str,
        stages: &[StageDefinition],
        elapsed_secs: u64,
        language: &str,
    ) -> Option<(String, f64)> {
        let stage_descs: Vec<String> = stages
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                let mut items_text: String = stage
                    .items
                    .iter()
                    .take(3)
                    .map(|it| format!("- {}", it.content))
                    .collect::<Vec<_>>()
                    .join("\n");
                if stage.items.len() > 3 {
                    items_text.push_str(&format!("\n- ...and {} more", stage.items.len() - 3));
                }
                let t0 = stage.start_offset_secs / 60;
                let t1 = (stage.start_offset_secs + stage.duration_secs) / 60;
                format!(
                    "{}. **{}** (recommended: {}-{} min)\n   {}",
                    i + 1,
                    stage.name,
                    t0,
                    t1,
                    items_text
                )
            })
            .collect();

        let prompt = format!(
            "Analyzing a sales call (language: {language}) to determine the current stage.\n\n\
             Elapsed: {}m {}s (reference only)\n\n\
             Recent conversation:\n{transcript}\n\n\
             Stages:\n{}\n\n\
             Based on CONTENT (not just time), which stage? Be confident, avoid jitter.\n\n\
             Return JSON: {{\"stage_id\": \"...\", \"confidence\": 0.0-1.0, \"reasoning\": \"...\"}}\n",
            elapsed_secs / 60,
            elapsed_secs % 60,
            stage_descs.join("\n"),
        );

        let raw = self
            .model
            .complete(
                &prompt,
                ChatOptions {
                    temperature: 0.2,
                    max_tokens: 200,
                },
            )
            .await
            .ok()?;

        let reply: StageReply = parse_json_response(&raw)?;
        if !stages.iter().any(|s| s.id == reply.stage_id) {
            return Some((stages[0].id.clone(), 0.5));
        }
        Some((reply.stage_id, reply.confidence))
    }
}

/// Latest stage whose expected start offset has already passed.
fn time_based_fallback(stages: &[StageDefinition], elapsed_secs: u64) -> String {
    stages
        .iter()
        .rev()
        .find(|s| elapsed_secs >= s.start_offset_secs)
        .or_else(|| stages.first())
        .map(|s| s.id.clone())
        .unwrap_or_default()
}

// ── Timing status ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingState {
    NotStarted,
    OnTime,
    SlightlyLate,
    VeryLate,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimingStatus {
    pub state: TimingState,
    pub message: String,
}

/// Where the call is relative to a stage's expected time window.
pub fn timing_status(stage_id: &str, elapsed_secs: u64, stages: &[StageDefinition]) -> TimingStatus {
    let Some(stage) = stages.iter().find(|s| s.id == stage_id) else {
        return TimingStatus {
            state: TimingState::Unknown,
            message: "Stage not found".to_string(),
        };
    };

    let start = stage.start_offset_secs;
    let end = start + stage.duration_secs;

    if elapsed_secs < start {
        TimingStatus {
            state: TimingState::NotStarted,
            message: format!("Starts in {} min", (start - elapsed_secs) / 60),
        }
    } else if elapsed_secs <= end {
        TimingStatus {
            state: TimingState::OnTime,
            message: "On track".to_string(),
        }
    } else if elapsed_secs <= end + LATE_GRACE_SECS {
        TimingStatus {
            state: TimingState::SlightlyLate,
            message: "Slightly behind".to_string(),
        }
    } else {
        TimingStatus {
            state: TimingState::VeryLate,
            message: format!("{} min behind", (elapsed_secs - end) / 60),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{FailingModel, ScriptedModel};
    use crate::playbook::default_stages;

    const LONG_TRANSCRIPT: &str = "So tell me about your child, what grade are they in \
        right now and what do they enjoy doing after school? We want to understand their \
        interests before the assessment.";

    fn detector(replies: &[&str]) -> StageDetector {
        StageDetector::new(Arc::new(ScriptedModel::new(replies)))
    }

    #[tokio::test]
    async fn empty_stages_yield_empty_id() {
        let d = detector(&[]);
        assert_eq!(d.detect("anything", &[], 100, None, "en").await, "");
    }

    #[tokio::test]
    async fn short_transcript_prefers_previous_stage() {
        let stages = default_stages();
        let d = detector(&[]);
        let id = d.detect("hello", &stages, 700, Some("profiling"), "en").await;
        assert_eq!(id, "profiling");
        // Without a previous stage, the first stage wins regardless of elapsed time
        let d = detector(&[]);
        let id = d.detect("hello", &stages, 700, None, "en").await;
        assert_eq!(id, "greeting");
    }

    #[tokio::test]
    async fn confident_detection_is_accepted() {
        let stages = default_stages();
        let d = detector(&[r#"{"stage_id": "diagnostic", "confidence": 0.85}"#]);
        let id = d.detect(LONG_TRANSCRIPT, &stages, 300, Some("profiling"), "en").await;
        assert_eq!(id, "diagnostic");
    }

    #[tokio::test]
    async fn low_confidence_keeps_previous_stage() {
        let stages = default_stages();
        let d = detector(&[r#"{"stage_id": "negotiation", "confidence": 0.4}"#]);
        let id = d.detect(LONG_TRANSCRIPT, &stages, 300, Some("profiling"), "en").await;
        assert_eq!(id, "profiling");
    }

    #[tokio::test]
    async fn low_confidence_without_previous_uses_time_fallback() {
        let stages = default_stages();
        let d = detector(&[r#"{"stage_id": "negotiation", "confidence": 0.4}"#]);
        // 200s elapsed: profiling starts at 180s
        let id = d.detect(LONG_TRANSCRIPT, &stages, 200, None, "en").await;
        assert_eq!(id, "profiling");
    }

    #[tokio::test]
    async fn unknown_stage_id_maps_to_first_at_half_confidence() {
        let stages = default_stages();
        // 0.5 is below threshold, previous stage wins
        let d = detector(&[r#"{"stage_id": "made_up", "confidence": 0.99}"#]);
        let id = d.detect(LONG_TRANSCRIPT, &stages, 300, Some("profiling"), "en").await;
        assert_eq!(id, "profiling");
    }

    #[tokio::test]
    async fn inference_failure_uses_time_fallback() {
        let stages = default_stages();
        let d = StageDetector::new(Arc::new(FailingModel));
        assert_eq!(d.detect(LONG_TRANSCRIPT, &stages, 200, Some("greeting"), "en").await, "profiling");
        assert_eq!(d.detect(LONG_TRANSCRIPT, &stages, 0, None, "en").await, "greeting");
        assert_eq!(d.detect(LONG_TRANSCRIPT, &stages, 5_000, None, "en").await, "negotiation");
    }

    #[tokio::test]
    async fn unparseable_reply_uses_time_fallback() {
        let stages = default_stages();
        let d = detector(&["I think they are probably negotiating now"]);
        let id = d.detect(LONG_TRANSCRIPT, &stages, 650, Some("profiling"), "en").await;
        assert_eq!(id, "diagnostic");
    }

    #[test]
    fn timing_states() {
        let stages = default_stages();

        // profiling: 180..600
        assert_eq!(timing_status("profiling", 60, &stages).state, TimingState::NotStarted);
        assert_eq!(timing_status("profiling", 180, &stages).state, TimingState::OnTime);
        assert_eq!(timing_status("profiling", 600, &stages).state, TimingState::OnTime);
        assert_eq!(timing_status("profiling", 601, &stages).state, TimingState::SlightlyLate);
        assert_eq!(timing_status("profiling", 720, &stages).state, TimingState::SlightlyLate);
        assert_eq!(timing_status("profiling", 721, &stages).state, TimingState::VeryLate);
        assert_eq!(timing_status("missing", 0, &stages).state, TimingState::Unknown);
    }

    #[test]
    fn very_late_message_counts_minutes() {
        let stages = default_stages();
        let status = timing_status("greeting", 180 + 300, &stages);
        assert_eq!(status.state, TimingState::VeryLate);
        assert_eq!(status.message, "5 min behind");
    }
}
