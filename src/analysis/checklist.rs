//! Checklist item validation.
//!
//! The expensive part is inference, so the pipeline is guard-heavy:
//! cheap local checks run first, a primary completion inference runs only
//! when the keywords allow it, and anything the primary pass accepts must
//! still survive a local evidence screen plus a second, stricter
//! verification pass. False positives are worse than misses here; a rep
//! who sees an item tick off that never happened stops trusting the tool.

use std::sync::Arc;

use serde::Deserialize;

use crate::llm::{parse_json_response, ChatModel, ChatOptions};
use crate::playbook::{ChecklistItem, ItemKind, SemanticKeywords};

const MIN_CONTEXT_CHARS: usize = 30;
const MIN_CONFIDENCE: f64 = 0.7;
const MIN_EVIDENCE_CHARS: usize = 10;
const MIN_EVIDENCE_WORDS: usize = 3;

/// Evidence consisting solely of one of these is filler, never proof.
const FILLER_PHRASES: &[&str] = &[
    "oke", "ok", "baik", "ya", "halo", "hai",
    "selamat pagi", "selamat siang", "selamat datang",
    "terima kasih", "sama-sama", "silakan", "gimana", "apa kabar",
];

/// Self-introduction openers; valid evidence only for greeting items.
const INTRODUCTION_OPENERS: &[&str] = &[
    "nama saya", "saya adalah", "perkenalkan",
    "kenalkan", "mr.", "ms.", "tutor", "teacher", "guru",
];

/// Items whose content mentions one of these may legitimately cite an
/// introduction as evidence.
const GREETING_ACTION_WORDS: &[&str] = &["greet", "introduce", "perkenalkan", "salam"];

/// Which gate decided the outcome. Logged for tuning the guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    ContextTooShort,
    KeywordPrefilter,
    NotCompleted,
    LowConfidence,
    EvidenceTooShort,
    EvidenceRejected,
    InferenceFailed,
    Accepted,
}

#[derive(Debug, Clone)]
pub struct ItemCheck {
    pub completed: bool,
    pub confidence: f64,
    pub evidence: String,
    pub outcome: CheckOutcome,
}

impl ItemCheck {
    fn rejected(outcome: CheckOutcome, confidence: f64) -> Self {
        Self {
            completed: false,
            confidence,
            evidence: String::new(),
            outcome,
        }
    }
}

#[derive(Deserialize)]
struct CompletionReply {
    #[serde(default)]
    completed: bool,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    evidence: String,
    #[serde(default)]
    reasoning: String,
}

#[derive(Deserialize)]
struct ValidationReply {
    #[serde(default)]
    is_valid: bool,
}

pub struct ChecklistValidator {
    model: Arc<dyn ChatModel>,
}

impl ChecklistValidator {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Run the full guard pipeline for one item against a transcript window.
    pub async fn check(&self, item: &ChecklistItem, transcript: &str, language: &str) -> ItemCheck {
        if transcript.trim().chars().count() < MIN_CONTEXT_CHARS {
            return ItemCheck::rejected(CheckOutcome::ContextTooShort, 0.0);
        }

        if !keyword_prefilter(transcript, &item.keywords) {
            return ItemCheck::rejected(CheckOutcome::KeywordPrefilter, 0.0);
        }

        let reply = match self.primary_inference(item, transcript, language).await {
            Some(reply) => reply,
            None => {
                tracing::warn!(item_id = %item.id, "Checklist inference failed");
                return ItemCheck::rejected(CheckOutcome::InferenceFailed, 0.0);
            }
        };

        if !reply.completed {
            return ItemCheck::rejected(CheckOutcome::NotCompleted, reply.confidence);
        }
        if reply.confidence < MIN_CONFIDENCE {
            return ItemCheck::rejected(CheckOutcome::LowConfidence, reply.confidence);
        }
        if reply.evidence.trim().chars().count() < MIN_EVIDENCE_CHARS {
            return ItemCheck::rejected(CheckOutcome::EvidenceTooShort, reply.confidence);
        }

        if !self.validate_evidence(item, &reply).await {
            tracing::debug!(item_id = %item.id, evidence = %reply.evidence, "Evidence rejected on verification");
            return ItemCheck::rejected(CheckOutcome::EvidenceRejected, reply.confidence);
        }

        ItemCheck {
            completed: true,
            confidence: reply.confidence,
            evidence: reply.evidence.trim().to_string(),
            outcome: CheckOutcome::Accepted,
        }
    }

    async fn primary_inference(
        &self,
        item: &ChecklistItem,
        transcript: &str,
        language: &str,
    ) -> Option<CompletionReply> {
        let type_block = match item.kind {
            ItemKind::Discuss => {
                "TYPE: DISCUSS/ASK. Find a QUESTION about the topic, or an ANSWER that proves \
                 the question was asked.\n\
                 GOOD: a direct question, or a client answer that only makes sense as a reply.\n\
                 BAD: a vague statement touching the topic with no question."
            }
            ItemKind::Say => {
                "TYPE: SAY/EXPLAIN. Find the rep STATING or EXPLAINING the content.\n\
                 GOOD: a clear statement or explanation by the rep.\n\
                 BAD: the rep asking whether the client wants to hear about it."
            }
        };

        let prompt = format!(
            "You are a STRICT quality checker analyzing a sales call (language: {language}).\n\n\
             TASK: Check if this action was completed:\n\
             Action: \"{}\"\n\n\
             ADDITIONAL CONTEXT: {}\n\n\
             Recent conversation:\n{transcript}\n\n\
             {type_block}\n\n\
             CRITICAL VALIDATION RULES:\n\
             1. Evidence must be a DIRECT QUOTE from the conversation\n\
             2. Evidence must CLEARLY show the action was done\n\
             3. Generic filler (\"oke\", \"baik\", \"ya\") is NEVER valid evidence\n\
             4. Promises to do it later are NOT completion\n\
             5. If even 20% unsure, completed=false\n\n\
             CONFIDENCE: 90-100% perfect, 70-89% good, 50-69% weak, <50% not done.\n\n\
             Return ONLY valid JSON:\n\
             {{\n  \"completed\": true/false,\n  \"confidence\": 0.0-1.0,\n  \
             \"evidence\": \"exact quote (empty if not completed)\",\n  \"reasoning\": \"why\"\n}}\n",
            item.content, item.description,
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
        parse_json_response(&raw)
    }

    /// Local evidence screen plus a second, stricter inference pass.
    async fn validate_evidence(&self, item: &ChecklistItem, reply: &CompletionReply) -> bool {
        let evidence = reply.evidence.trim();
        if evidence.chars().count() < 5 {
            return false;
        }

        let ev_lower = evidence.to_lowercase();

        // Introductions only prove greeting-type items.
        if INTRODUCTION_OPENERS.iter().any(|p| ev_lower.contains(p)) {
            let action_lower = item.content.to_lowercase();
            if !GREETING_ACTION_WORDS.iter().any(|w| action_lower.contains(w)) {
                return false;
            }
        }

        if FILLER_PHRASES
            .iter()
            .any(|p| ev_lower == *p || ev_lower == format!("{p}."))
        {
            return false;
        }

        if evidence.split_whitespace().count() < MIN_EVIDENCE_WORDS {
            return false;
        }

        let type_check = match item.kind {
            ItemKind::Discuss => {
                "DISCUSS/ASK: evidence must show a QUESTION or an ANSWER implying the question."
            }
            ItemKind::Say => "SAY/EXPLAIN: evidence must show the rep STATING or EXPLAINING.",
        };

        let prompt = format!(
            "STRICT evidence validator for a sales call checklist.\n\n\
             ACTION: \"{}\"\n\
             EVIDENCE: \"{evidence}\"\n\
             REASONING: \"{}\"\n\n\
             {type_check}\n\n\
             Checks: 1) actual content, 2) semantic match, 3) specific enough, 4) matches type.\n\
             BE EXTREMELY STRICT. Return ONLY JSON: {{\"is_valid\": true/false, \"explanation\": \"...\"}}\n",
            item.content, reply.reasoning,
        );

        let Ok(raw) = self
            .model
            .complete(
                &prompt,
                ChatOptions {
                    temperature: 0.05,
                    max_tokens: 150,
                },
            )
            .await
        else {
            return false;
        };

        parse_json_response::<ValidationReply>(&raw)
            .map(|r| r.is_valid)
            .unwrap_or(false)
    }
}

/// At least one required substring must appear (case-insensitive) and no
/// forbidden substring may appear. Runs before any inference call.
fn keyword_prefilter(transcript: &str, keywords: &SemanticKeywords) -> bool {
    let text = transcript.to_lowercase();

    if !keywords.required.is_empty()
        && !keywords
            .required
            .iter()
            .any(|kw| text.contains(&kw.to_lowercase()))
    {
        return false;
    }

    if keywords
        .forbidden
        .iter()
        .any(|kw| text.contains(&kw.to_lowercase()))
    {
        return false;
    }

    true
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{FailingModel, ScriptedModel};

    fn sample_item() -> ChecklistItem {
        ChecklistItem {
            id: "ask_age".to_string(),
            kind: ItemKind::Discuss,
            content: "Ask age and grade level".to_string(),
            description: "Confirm child's age and school grade.".to_string(),
            keywords: SemanticKeywords {
                required: vec!["age".to_string(), "grade".to_string()],
                forbidden: vec!["later".to_string()],
            },
        }
    }

    const TRANSCRIPT: &str =
        "Rep: And how old is your son, what grade is he in? Parent: He just turned nine, \
         fourth grade at the public school nearby.";

    fn validator(replies: &[&str]) -> (ChecklistValidator, Arc<ScriptedModel>) {
        let model = Arc::new(ScriptedModel::new(replies));
        (ChecklistValidator::new(model.clone()), model)
    }

    #[tokio::test]
    async fn short_context_skips_inference() {
        let (v, model) = validator(&[]);
        let check = v.check(&sample_item(), "hi there", "en").await;
        assert_eq!(check.outcome, CheckOutcome::ContextTooShort);
        assert!(!check.completed);
        assert_eq!(model.calls_made(), 0);
    }

    #[tokio::test]
    async fn missing_required_keyword_skips_inference() {
        let (v, model) = validator(&[]);
        let transcript = "Rep: thanks for joining today, the weather is lovely where you are?";
        let check = v.check(&sample_item(), transcript, "en").await;
        assert_eq!(check.outcome, CheckOutcome::KeywordPrefilter);
        assert_eq!(model.calls_made(), 0);
    }

    #[tokio::test]
    async fn forbidden_keyword_skips_inference() {
        let (v, model) = validator(&[]);
        let transcript = "Rep: we can talk about his age and grade later if you prefer.";
        let check = v.check(&sample_item(), transcript, "en").await;
        assert_eq!(check.outcome, CheckOutcome::KeywordPrefilter);
        assert_eq!(model.calls_made(), 0);
    }

    #[tokio::test]
    async fn accepted_after_both_inference_passes() {
        let (v, model) = validator(&[
            r#"{"completed": true, "confidence": 0.9,
                "evidence": "And how old is your son, what grade is he in?",
                "reasoning": "direct question about age"}"#,
            r#"{"is_valid": true, "explanation": "clear question"}"#,
        ]);
        let check = v.check(&sample_item(), TRANSCRIPT, "en").await;
        assert_eq!(check.outcome, CheckOutcome::Accepted);
        assert!(check.completed);
        assert!((check.confidence - 0.9).abs() < f64::EPSILON);
        assert!(check.evidence.contains("how old"));
        assert_eq!(model.calls_made(), 2);
    }

    #[tokio::test]
    async fn not_completed_passes_through() {
        let (v, model) = validator(&[r#"{"completed": false, "confidence": 0.3, "evidence": ""}"#]);
        let check = v.check(&sample_item(), TRANSCRIPT, "en").await;
        assert_eq!(check.outcome, CheckOutcome::NotCompleted);
        assert!(!check.completed);
        assert_eq!(model.calls_made(), 1);
    }

    #[tokio::test]
    async fn low_confidence_completion_is_rejected() {
        let (v, model) = validator(&[r#"{"completed": true, "confidence": 0.65,
            "evidence": "And how old is your son, what grade is he in?"}"#]);
        let check = v.check(&sample_item(), TRANSCRIPT, "en").await;
        assert_eq!(check.outcome, CheckOutcome::LowConfidence);
        assert!(!check.completed);
        // No second verification call for something already rejected
        assert_eq!(model.calls_made(), 1);
    }

    #[tokio::test]
    async fn short_evidence_is_rejected() {
        let (v, _) = validator(&[r#"{"completed": true, "confidence": 0.95, "evidence": "umur?"}"#]);
        let check = v.check(&sample_item(), TRANSCRIPT, "en").await;
        assert_eq!(check.outcome, CheckOutcome::EvidenceTooShort);
    }

    #[tokio::test]
    async fn filler_evidence_fails_locally_without_second_call() {
        let (v, model) = validator(&[
            r#"{"completed": true, "confidence": 0.9, "evidence": "terima kasih"}"#,
        ]);
        let check = v.check(&sample_item(), TRANSCRIPT, "en").await;
        assert_eq!(check.outcome, CheckOutcome::EvidenceRejected);
        assert_eq!(model.calls_made(), 1);
    }

    #[tokio::test]
    async fn introduction_evidence_rejected_for_non_greeting_item() {
        let (v, model) = validator(&[
            r#"{"completed": true, "confidence": 0.9,
                "evidence": "nama saya Pak Budi, tutor coding untuk anak"}"#,
        ]);
        let check = v.check(&sample_item(), TRANSCRIPT, "en").await;
        assert_eq!(check.outcome, CheckOutcome::EvidenceRejected);
        assert_eq!(model.calls_made(), 1);
    }

    #[tokio::test]
    async fn introduction_evidence_allowed_for_greeting_item() {
        let item = ChecklistItem {
            id: "open_greet".to_string(),
            kind: ItemKind::Say,
            content: "Greet warmly and introduce yourself".to_string(),
            description: String::new(),
            keywords: SemanticKeywords::default(),
        };
        let (v, _) = validator(&[
            r#"{"completed": true, "confidence": 0.9,
                "evidence": "halo, nama saya Pak Budi dari sekolah coding"}"#,
            r#"{"is_valid": true}"#,
        ]);
        let transcript = "Rep: halo, nama saya Pak Budi dari sekolah coding, senang bertemu.";
        let check = v.check(&item, transcript, "id").await;
        assert_eq!(check.outcome, CheckOutcome::Accepted);
    }

    #[tokio::test]
    async fn second_pass_rejection_wins() {
        let (v, _) = validator(&[
            r#"{"completed": true, "confidence": 0.9,
                "evidence": "And how old is your son, what grade is he in?"}"#,
            r#"{"is_valid": false, "explanation": "not specific"}"#,
        ]);
        let check = v.check(&sample_item(), TRANSCRIPT, "en").await;
        assert_eq!(check.outcome, CheckOutcome::EvidenceRejected);
        assert!(!check.completed);
    }

    #[tokio::test]
    async fn inference_failure_is_not_completion() {
        let v = ChecklistValidator::new(Arc::new(FailingModel));
        let check = v.check(&sample_item(), TRANSCRIPT, "en").await;
        assert_eq!(check.outcome, CheckOutcome::InferenceFailed);
        assert!(!check.completed);
    }

    #[test]
    fn prefilter_with_empty_keywords_passes() {
        assert!(keyword_prefilter("anything at all", &SemanticKeywords::default()));
    }

    #[test]
    fn prefilter_is_case_insensitive() {
        let keywords = SemanticKeywords {
            required: vec!["AGE".to_string()],
            forbidden: vec![],
        };
        assert!(keyword_prefilter("what is his age?", &keywords));
    }
}
