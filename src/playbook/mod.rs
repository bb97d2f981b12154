//! Playbook definitions: call stages, checklist items, and client-card
//! field specs.
//!
//! A playbook describes the shape a sales call should take. The built-in
//! default covers a trial-class sales call; external stores can supply
//! per-team playbooks through [`PlaybookStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ── Types ─────────────────────────────────────────────────────────

/// How a checklist item is fulfilled: something the rep must state, or a
/// topic that must be discussed with the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Say,
    Discuss,
}

/// Keyword gate evaluated before any inference call: at least one required
/// substring must appear, and no forbidden substring may appear.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SemanticKeywords {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub forbidden: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: String,
    pub kind: ItemKind,
    /// Short instruction shown to the rep.
    pub content: String,
    /// Longer description fed to inference as context.
    pub description: String,
    pub keywords: SemanticKeywords,
}

/// One stage of the call, with its expected timing window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub id: String,
    pub name: String,
    /// Seconds from call start at which this stage is expected to begin.
    pub start_offset_secs: u64,
    /// Expected stage length in seconds.
    pub duration_secs: u64,
    pub items: Vec<ChecklistItem>,
}

/// A field of the client card the extractor tries to fill during the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCardFieldSpec {
    pub id: String,
    pub label: String,
    /// Extraction hint, e.g. "Games, activities, subjects".
    pub hint: String,
    pub multiline: bool,
    pub category: String,
}

/// Everything a call session needs from its playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// BCP-47-ish language tag for transcription and inference ("id", "en", ...).
    pub language: String,
    pub stages: Vec<StageDefinition>,
    pub client_card_fields: Vec<ClientCardFieldSpec>,
    /// Known facts about the lead before the call starts, fed to the
    /// coaching advisor as context.
    #[serde(default)]
    pub pre_call_brief: HashMap<String, String>,
}

impl CallConfig {
    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn first_stage(&self) -> Option<&StageDefinition> {
        self.stages.first()
    }

    /// Latest stage whose expected start offset has already passed.
    pub fn stage_for_elapsed(&self, elapsed_secs: f64) -> Option<&StageDefinition> {
        self.stages
            .iter()
            .filter(|s| (s.start_offset_secs as f64) <= elapsed_secs)
            .next_back()
            .or_else(|| self.first_stage())
    }
}

// ── Store seam ────────────────────────────────────────────────────

/// Source of per-call playbook configuration.
///
/// The built-in [`StaticPlaybookStore`] serves the default playbook for
/// every call; deployments with per-team playbooks implement this against
/// their own storage.
#[async_trait]
pub trait PlaybookStore: Send + Sync {
    async fn call_config(&self, call_id: &str) -> anyhow::Result<CallConfig>;
}

/// Serves one fixed playbook for all calls.
pub struct StaticPlaybookStore {
    config: CallConfig,
}

impl StaticPlaybookStore {
    pub fn new(config: CallConfig) -> Self {
        Self { config }
    }
}

impl Default for StaticPlaybookStore {
    fn default() -> Self {
        Self::new(default_call_config())
    }
}

#[async_trait]
impl PlaybookStore for StaticPlaybookStore {
    async fn call_config(&self, _call_id: &str) -> anyhow::Result<CallConfig> {
        Ok(self.config.clone())
    }
}

// ── Default playbook ──────────────────────────────────────────────

fn item(
    id: &str,
    kind: ItemKind,
    content: &str,
    description: &str,
    required: &[&str],
    forbidden: &[&str],
) -> ChecklistItem {
    ChecklistItem {
        id: id.to_string(),
        kind,
        content: content.to_string(),
        description: description.to_string(),
        keywords: SemanticKeywords {
            required: required.iter().map(|s| s.to_string()).collect(),
            forbidden: forbidden.iter().map(|s| s.to_string()).collect(),
        },
    }
}

fn field(id: &str, label: &str, hint: &str, multiline: bool, category: &str) -> ClientCardFieldSpec {
    ClientCardFieldSpec {
        id: id.to_string(),
        label: label.to_string(),
        hint: hint.to_string(),
        multiline,
        category: category.to_string(),
    }
}

/// The built-in trial-class sales playbook.
pub fn default_call_config() -> CallConfig {
    CallConfig {
        language: "id".to_string(),
        stages: default_stages(),
        client_card_fields: default_client_card_fields(),
        pre_call_brief: HashMap::new(),
    }
}

pub fn default_stages() -> Vec<StageDefinition> {
    use ItemKind::{Discuss, Say};

    vec![
        StageDefinition {
            id: "greeting".to_string(),
            name: "Greeting & Preparation".to_string(),
            start_offset_secs: 0,
            duration_secs: 180,
            items: vec![
                item(
                    "open_greet",
                    Say,
                    "Greet warmly and introduce yourself",
                    "Warm greeting, introduce yourself and the school.",
                    &["hello", "hi", "good morning", "my name"],
                    &["later"],
                ),
                item(
                    "confirm_names",
                    Say,
                    "Confirm parent and child names",
                    "Verify both names.",
                    &["name", "child", "parent", "mom", "dad"],
                    &["later"],
                ),
                item(
                    "explain_agenda",
                    Say,
                    "Explain session agenda",
                    "Outline the session steps.",
                    &["agenda", "steps", "first", "then", "session"],
                    &["later"],
                ),
            ],
        },
        StageDefinition {
            id: "profiling".to_string(),
            name: "Profiling".to_string(),
            start_offset_secs: 180,
            duration_secs: 420,
            items: vec![
                item(
                    "ask_age",
                    Discuss,
                    "Ask age and grade level",
                    "Confirm child's age and school grade.",
                    &["age", "grade", "years old", "school"],
                    &["later"],
                ),
                item(
                    "ask_interests",
                    Discuss,
                    "Explore interests and hobbies",
                    "Find out what the child enjoys.",
                    &["like", "enjoy", "hobby", "game", "favorite"],
                    &["later"],
                ),
                item(
                    "ask_parent_goals",
                    Discuss,
                    "Understand parent goals",
                    "What does the parent hope to achieve?",
                    &["hope", "goal", "want", "expect"],
                    &["later"],
                ),
            ],
        },
        StageDefinition {
            id: "diagnostic".to_string(),
            name: "Diagnostic & Assessment".to_string(),
            start_offset_secs: 600,
            duration_secs: 600,
            items: vec![
                item(
                    "intro_diagnostic",
                    Say,
                    "Introduce the assessment activity",
                    "Introduce the assessment with enthusiasm.",
                    &["try", "activity", "assessment", "fun"],
                    &[],
                ),
                item(
                    "run_assessment",
                    Discuss,
                    "Run age-appropriate assessment",
                    "Conduct a suitable assessment.",
                    &["try", "answer", "click", "step"],
                    &[],
                ),
                item(
                    "explain_results",
                    Say,
                    "Explain assessment results",
                    "Share findings with the parent.",
                    &["results", "score", "great", "well"],
                    &["later"],
                ),
            ],
        },
        StageDefinition {
            id: "presentation".to_string(),
            name: "Program Presentation".to_string(),
            start_offset_secs: 1200,
            duration_secs: 600,
            items: vec![
                item(
                    "present_program",
                    Say,
                    "Present recommended program",
                    "Present the best-fit program.",
                    &["program", "course", "curriculum", "class"],
                    &["later"],
                ),
                item(
                    "share_success",
                    Say,
                    "Share student success stories",
                    "Mention relevant success stories.",
                    &["student", "success", "achieved", "learned"],
                    &[],
                ),
                item(
                    "connect_needs",
                    Say,
                    "Connect to child's needs",
                    "Link the program to the child's profile.",
                    &["fit", "match", "need", "child"],
                    &[],
                ),
            ],
        },
        StageDefinition {
            id: "negotiation".to_string(),
            name: "Negotiation & Closing".to_string(),
            start_offset_secs: 1800,
            duration_secs: 600,
            items: vec![
                item(
                    "present_pricing",
                    Say,
                    "Present pricing and packages",
                    "Show pricing clearly.",
                    &["price", "cost", "package", "investment"],
                    &["expensive", "cheap"],
                ),
                item(
                    "handle_objections",
                    Discuss,
                    "Handle objections with empathy",
                    "Address concerns empathetically.",
                    &["concern", "worry", "hesitate", "think"],
                    &["can't"],
                ),
                item(
                    "close_call",
                    Say,
                    "Close professionally",
                    "End the call professionally.",
                    &["thank", "follow up", "next step"],
                    &[],
                ),
            ],
        },
    ]
}

pub fn default_client_card_fields() -> Vec<ClientCardFieldSpec> {
    vec![
        field("child_name", "Child's Name", "Name and age", false, "child_info"),
        field("child_interests", "Interests", "Games, activities, subjects", true, "child_info"),
        field("child_experience", "Prior Experience", "Coding or tech experience", true, "child_info"),
        field("parent_goal", "Parent's Goal", "What parent wants", true, "parent_info"),
        field("learning_motivation", "Motivation", "Why enrolling now", true, "parent_info"),
        field("main_pain_point", "Pain Point", "Primary concern", true, "needs"),
        field("desired_outcome", "Desired Outcome", "Success criteria", true, "needs"),
        field("objections", "Objections", "Concerns raised", true, "concerns"),
        field("budget_constraint", "Budget", "Budget situation", false, "concerns"),
        field("schedule_constraint", "Schedule", "Available times", false, "concerns"),
    ]
}

// ── Tests ─────────────────────────────────────────────────────────
