//! Real-time coaching tips.
//!
//! One short, actionable tip per analysis window, built from the pending
//! checklist items of the current stage, the pre-call brief, the client
//! card so far, and the tail of the conversation. No tip is always a
//! valid answer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm::{parse_json_response, ChatModel, ChatOptions};
use crate::playbook::StageDefinition;

const MIN_CONTEXT_CHARS: usize = 100;
const MIN_TIP_CHARS: usize = 5;
const CONVERSATION_TAIL_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TipCategory {
    Suggestion,
    Warning,
    Transition,
    Info,
}

impl TipCategory {
    /// Unknown categories degrade to the mildest one.
    fn parse(raw: &str) -> Self {
        match raw {
            "warning" => Self::Warning,
            "transition" => Self::Transition,
            "info" => Self::Info,
            _ => Self::Suggestion,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoachingTip {
    pub tip: String,
    pub category: TipCategory,
}

#[derive(Deserialize)]
struct TipReply {
    #[serde(default)]
    tip: String,
    #[serde(default)]
    category: String,
}

pub struct CoachingAdvisor {
    model: Arc<dyn ChatModel>,
}

impl CoachingAdvisor {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Generate a tip for the current moment, or nothing.
    #[allow(clippy::too_many_arguments)]
    pub async fn advise(
        &self,
        transcript: &str,
        current_stage: Option<&StageDefinition>,
        completed_items: &HashSet<String>,
        pre_call_brief: &HashMap<String, String>,
        client_card: &HashMap<String, String>,
        language: &str,
    ) -> Option<CoachingTip> {
        if transcript.trim().chars().count() < MIN_CONTEXT_CHARS {
            return None;
        }

        let pending: Vec<&str> = current_stage
            .map(|stage| {
                stage
                    .items
                    .iter()
                    .filter(|item| !completed_items.contains(&item.id))
                    .map(|item| item.content.as_str())
                    .collect()
            })
            .unwrap_or_default();

        let pending_block = if pending.is_empty() {
            "(all done)".to_string()
        } else {
            pending
                .iter()
                .map(|p| format!("- {p}"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let prompt = format!(
            "You are a real-time sales coach for a trial class call (language: {language}).\n\n\
             Current stage: {}\n\n\
             Pending checklist items:\n{pending_block}\n\n\
             Pre-call briefing:\n{}\n\n\
             Client info extracted so far:\n{}\n\n\
             Recent conversation:\n{}\n\n\
             Generate ONE short, actionable coaching tip (max 2 sentences).\n\
             Focus on the most impactful thing the rep should do right now.\n\n\
             Return JSON: {{\"tip\": \"...\", \"category\": \"suggestion|warning|transition|info\"}}\n",
            current_stage.map(|s| s.name.as_str()).unwrap_or("Unknown"),
            summarize(pre_call_brief),
            summarize(client_card),
            tail_chars(transcript, CONVERSATION_TAIL_CHARS),
        );

        let raw = self
            .model
            .complete(
                &prompt,
                ChatOptions {
                    temperature: 0.4,
                    max_tokens: 150,
                },
            )
            .await
            .ok()?;

        let reply: TipReply = parse_json_response(&raw)?;
        let tip = reply.tip.trim();
        if tip.chars().count() <= MIN_TIP_CHARS {
            return None;
        }

        Some(CoachingTip {
            tip: tip.to_string(),
            category: TipCategory::parse(&reply.category),
        })
    }
}

fn summarize(entries: &HashMap<String, String>) -> String {
    let mut lines: Vec<String> = entries
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("- {k}: {v}"))
        .collect();
    if lines.is_empty() {
        return "(none)".to_string();
    }
    lines.sort();
    lines.join("\n")
}

/// Last `n` characters of a string, on a char boundary.
fn tail_chars(s: &str, n: usize) -> &str {
    match s.char_indices().rev().nth(n.saturating_sub(1)) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

// ── Tests ─────────────────────────────────────────────────────────
