//! Wire types for the coach and ingest WebSocket protocols.
//!
//! Outbound payloads use camelCase keys; inbound commands are tagged
//! snake_case objects. The same snapshot shape serves both the initial
//! message on coach connect and every subsequent update.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::coaching::CoachingTip;
use crate::analysis::stage::{timing_status, TimingState};
use crate::playbook::ItemKind;
use crate::session::CallSession;

// ── Inbound commands ──────────────────────────────────────────────

/// Commands a client may send on either socket.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    SetLanguage { language: String },
    ManualToggleItem { item_id: String },
    UpdateClientCard { field_id: String, value: String },
}

// ── Outbound events ───────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoachEvent {
    Initial(CoachSnapshot),
    Update(CoachSnapshot),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoachSnapshot {
    pub generated_at: DateTime<Utc>,
    pub call_elapsed_seconds: u64,
    pub stage_elapsed_seconds: u64,
    pub current_stage_id: Option<String>,
    pub stages: Vec<StagePayload>,
    pub client_card: HashMap<String, CardPayload>,
    pub transcript_preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coaching_tip: Option<CoachingTip>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagePayload {
    pub id: String,
    pub name: String,
    pub start_offset_seconds: u64,
    pub duration_seconds: u64,
    pub items: Vec<ItemPayload>,
    pub is_current: bool,
    pub timing_status: TimingState,
    pub timing_message: String,
}

#[derive(Debug, Serialize)]
pub struct ItemPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub content: String,
    pub completed: bool,
    pub evidence: String,
}

#[derive(Debug, Serialize)]
pub struct CardPayload {
    pub value: String,
    pub evidence: String,
    pub confidence: f64,
    pub label: String,
}

impl CoachSnapshot {
    /// Assemble the full view of a session for broadcast.
    ///
    /// `fresh_tip` is attached only when this round of analysis actually
    /// produced one; stale tips are not re-sent.
    pub fn from_session(session: &CallSession, fresh_tip: Option<CoachingTip>) -> Self {
        let elapsed = session.elapsed_secs() as u64;
        let stages = &session.config.stages;

        let stage_payloads = stages
            .iter()
            .map(|stage| {
                let timing = timing_status(&stage.id, elapsed, stages);
                StagePayload {
                    id: stage.id.clone(),
                    name: stage.name.clone(),
                    start_offset_seconds: stage.start_offset_secs,
                    duration_seconds: stage.duration_secs,
                    items: stage
                        .items
                        .iter()
                        .map(|item| {
                            let state = session.item_state(&item.id);
                            ItemPayload {
                                id: item.id.clone(),
                                kind: item.kind,
                                content: item.content.clone(),
                                completed: state.is_some_and(|s| s.completed),
                                evidence: state.map(|s| s.evidence.clone()).unwrap_or_default(),
                            }
                        })
                        .collect(),
                    is_current: session.current_stage_id.as_deref() == Some(&stage.id),
                    timing_status: timing.state,
                    timing_message: timing.message,
                }
            })
            .collect();

        let client_card = session
            .card()
            .iter()
            .map(|(id, entry)| {
                (
                    id.clone(),
                    CardPayload {
                        value: entry.value.clone(),
                        evidence: entry.evidence.clone(),
                        confidence: entry.confidence,
                        label: entry.label.clone(),
                    },
                )
            })
            .collect();

        Self {
            generated_at: Utc::now(),
            call_elapsed_seconds: elapsed,
            stage_elapsed_seconds: session.stage_elapsed_secs() as u64,
            current_stage_id: session.current_stage_id.clone(),
            stages: stage_payloads,
            client_card,
            transcript_preview: session.transcript_preview().to_string(),
            coaching_tip: fresh_tip,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────
