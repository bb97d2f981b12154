//! Client-card field extraction.
//!
//! One inference call proposes values for every still-unfilled field; a
//! post-filter chain then drops placeholders, low-confidence guesses, and
//! anything whose evidence does not hold up. Fields already filled are
//! never overwritten.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::llm::{parse_json_response, ChatModel, ChatOptions};
use crate::playbook::ClientCardFieldSpec;

const MIN_CONTEXT_CHARS: usize = 200;
const MIN_CONFIDENCE: f64 = 0.7;
const MIN_EVIDENCE_CHARS: usize = 10;
const MIN_VALUE_CHARS: usize = 5;

/// Values the model hallucinates when it has nothing.
const PLACEHOLDER_VALUES: &[&str] = &[
    "tidak disebutkan", "not mentioned", "unknown",
    "tidak ada", "tidak jelas", "belum disebutkan",
    "n/a", "na", "-", "none",
];

/// Placeholder fragments; substring match catches spelling variants.
const PLACEHOLDER_FRAGMENTS: &[&str] = &["tidak di", "not men", "belum di"];

/// Evidence opening with one of these is greeting chatter, not client info.
const INVALID_EVIDENCE_STARTS: &[&str] = &[
    "oke,", "ok,", "baik,", "ya,", "halo,", "hai,",
    "selamat pagi", "selamat siang", "selamat datang", "terima kasih",
];

/// A field value that survived extraction and every filter.
#[derive(Debug, Clone)]
pub struct FieldUpdate {
    pub value: String,
    pub evidence: String,
    pub confidence: f64,
    pub label: String,
}

#[derive(Deserialize)]
struct ExtractedField {
    #[serde(default)]
    value: String,
    #[serde(default)]
    evidence: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

#[derive(Deserialize)]
struct ValidationReply {
    #[serde(default)]
    is_valid: bool,
}

pub struct ClientCardExtractor {
    model: Arc<dyn ChatModel>,
}

impl ClientCardExtractor {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Extract new field values from a transcript window.
    ///
    /// `current_values` holds already-filled fields; those are skipped.
    /// Returns only fields that pass every filter.
    pub async fn extract(
        &self,
        transcript: &str,
        current_values: &HashMap<String, String>,
        fields: &[ClientCardFieldSpec],
        language: &str,
    ) -> HashMap<String, FieldUpdate> {
        if transcript.trim().chars().count() < MIN_CONTEXT_CHARS {
            return HashMap::new();
        }

        let field_descs: Vec<String> = fields
            .iter()
            .map(|f| format!("- {} ({}): {}", f.id, f.label, f.hint))
            .collect();

        let prompt = format!(
            "You are analyzing a sales call (language: {language}) to extract client information.\n\n\
             Conversation:\n{transcript}\n\n\
             Extract information for these fields (only if clearly mentioned):\n{}\n\n\
             RULES:\n\
             1. Only extract if CONFIDENT and EXPLICITLY mentioned\n\
             2. Keep extractions brief (1-2 sentences max)\n\
             3. If not mentioned, DO NOT INCLUDE the field\n\
             4. Respond in English regardless of conversation language\n\
             5. Evidence MUST be a direct quote\n\
             6. NEVER use placeholder values like \"Not mentioned\", \"Unknown\", \"N/A\"\n\
             7. If unsure, SKIP the field\n\n\
             Return ONLY valid JSON:\n\
             {{\n  \"field_id\": {{\n    \"value\": \"extracted text\",\n    \
             \"evidence\": \"direct quote\",\n    \"confidence\": 0.0-1.0\n  }}\n}}\n\
             If nothing found, return: {{}}\n",
            field_descs.join("\n"),
        );

        let raw = match self
            .model
            .complete(
                &prompt,
                ChatOptions {
                    temperature: 0.3,
                    max_tokens: 800,
                },
            )
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(%err, "Client card extraction failed");
                return HashMap::new();
            }
        };

        let Some(proposed) = parse_json_response::<HashMap<String, serde_json::Value>>(&raw)
        else {
            return HashMap::new();
        };

        let labels: HashMap<&str, &str> = fields
            .iter()
            .map(|f| (f.id.as_str(), f.label.as_str()))
            .collect();

        let mut updates = HashMap::new();
        for (field_id, payload) in proposed {
            if current_values.get(&field_id).is_some_and(|v| !v.is_empty()) {
                continue;
            }

            // Bare strings are tolerated but carry no evidence, so the
            // evidence filter below drops them.
            let extracted = if payload.is_object() {
                match serde_json::from_value::<ExtractedField>(payload) {
                    Ok(f) => f,
                    Err(_) => continue,
                }
            } else {
                ExtractedField {
                    value: payload.as_str().map(str::to_string).unwrap_or_else(|| payload.to_string()),
                    evidence: String::new(),
                    confidence: 1.0,
                }
            };

            let value = extracted.value.trim();
            let evidence = extracted.evidence.trim();
            let v_lower = value.to_lowercase();

            if PLACEHOLDER_VALUES.contains(&v_lower.as_str())
                || PLACEHOLDER_FRAGMENTS.iter().any(|p| v_lower.contains(p))
            {
                continue;
            }
            if value.chars().count() <= MIN_VALUE_CHARS {
                continue;
            }
            if extracted.confidence < MIN_CONFIDENCE {
                continue;
            }
            if evidence.chars().count() < MIN_EVIDENCE_CHARS {
                continue;
            }

            let label = labels
                .get(field_id.as_str())
                .copied()
                .unwrap_or(field_id.as_str())
                .to_string();
            if !self.validate_field_evidence(&label, value, evidence).await {
                tracing::debug!(%field_id, %value, "Field evidence rejected on verification");
                continue;
            }

            updates.insert(
                field_id,
                FieldUpdate {
                    value: value.to_string(),
                    evidence: evidence.to_string(),
                    confidence: extracted.confidence,
                    label,
                },
            );
        }

        updates
    }

    /// Local evidence screen plus a strict verification inference.
    async fn validate_field_evidence(&self, label: &str, value: &str, evidence: &str) -> bool {
        if evidence.chars().count() < 5 {
            return false;
        }

        let ev_lower = evidence.to_lowercase();
        if INVALID_EVIDENCE_STARTS.iter().any(|s| ev_lower.starts_with(s)) {
            return false;
        }
        if evidence.split_whitespace().count() < 3 {
            return false;
        }

        // Short values (names, amounts) must literally appear in evidence.
        let v_lower = value.to_lowercase();
        if value.split_whitespace().count() <= 3 && value.chars().count() > 3 {
            let any_word_present = v_lower.split_whitespace().any(|w| ev_lower.contains(w));
            if !any_word_present {
                return false;
            }
        }

        let prompt = format!(
            "STRICT validator for client info extraction.\n\n\
             FIELD: {label}\n\
             VALUE: \"{value}\"\n\
             EVIDENCE: \"{evidence}\"\n\n\
             Is the evidence about the CLIENT and does it clearly prove the value?\n\
             BE STRICT. Return JSON: {{\"is_valid\": true/false, \"explanation\": \"...\"}}\n"
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

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{FailingModel, ScriptedModel};
    use crate::playbook::default_client_card_fields;

    fn long_transcript() -> String {
        "Rep: So tell me about your son. Parent: His name is Kevin, he is nine years old \
         and he absolutely loves Minecraft and Roblox, plays every afternoon after school. \
         We are hoping he learns something more productive with all that screen time, maybe \
         some real coding skills he can use later."
            .to_string()
    }

    fn extractor(replies: &[&str]) -> (ClientCardExtractor, Arc<ScriptedModel>) {
        let model = Arc::new(ScriptedModel::new(replies));
        (ClientCardExtractor::new(model.clone()), model)
    }

    #[tokio::test]
    async fn short_transcript_skips_extraction() {
        let (e, model) = extractor(&[]);
        let updates = e
            .extract("short", &HashMap::new(), &default_client_card_fields(), "en")
            .await;
        assert!(updates.is_empty());
        assert_eq!(model.calls_made(), 0);
    }

    #[tokio::test]
    async fn extracts_validated_fields() {
        let (e, _) = extractor(&[
            r#"{"child_interests": {"value": "Minecraft and Roblox",
                "evidence": "he absolutely loves Minecraft and Roblox, plays every afternoon",
                "confidence": 0.9}}"#,
            r#"{"is_valid": true}"#,
        ]);
        let updates = e
            .extract(&long_transcript(), &HashMap::new(), &default_client_card_fields(), "en")
            .await;
        let update = updates.get("child_interests").unwrap();
        assert_eq!(update.value, "Minecraft and Roblox");
        assert_eq!(update.label, "Interests");
        assert!((update.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn already_filled_fields_are_skipped() {
        let (e, model) = extractor(&[
            r#"{"child_interests": {"value": "Minecraft and Roblox",
                "evidence": "he absolutely loves Minecraft and Roblox", "confidence": 0.9}}"#,
        ]);
        let mut current = HashMap::new();
        current.insert("child_interests".to_string(), "Scratch".to_string());
        let updates = e
            .extract(&long_transcript(), &current, &default_client_card_fields(), "en")
            .await;
        assert!(updates.is_empty());
        // Only the extraction call, no verification for a skipped field
        assert_eq!(model.calls_made(), 1);
    }

    #[tokio::test]
    async fn placeholder_values_are_dropped() {
        for value in ["Not mentioned", "unknown", "tidak disebutkan", "N/A", "belum disebutkan"] {
            let reply = format!(
                r#"{{"budget_constraint": {{"value": "{value}",
                    "evidence": "some long enough evidence quote here", "confidence": 0.95}}}}"#
            );
            let (e, _) = extractor(&[&reply]);
            let updates = e
                .extract(&long_transcript(), &HashMap::new(), &default_client_card_fields(), "en")
                .await;
            assert!(updates.is_empty(), "placeholder {value:?} must be dropped");
        }
    }

    #[tokio::test]
    async fn low_confidence_and_short_values_are_dropped() {
        let (e, _) = extractor(&[r#"{
            "child_name": {"value": "Kevin", "evidence": "His name is Kevin, he is nine", "confidence": 0.5},
            "parent_goal": {"value": "skill", "evidence": "hoping he learns something productive", "confidence": 0.9}
        }"#]);
        let updates = e
            .extract(&long_transcript(), &HashMap::new(), &default_client_card_fields(), "en")
            .await;
        // child_name: confidence 0.5 < 0.7; parent_goal: value too short
        assert!(updates.is_empty());
    }

    #[tokio::test]
    async fn bare_string_payload_lacks_evidence_and_is_dropped() {
        let (e, model) = extractor(&[r#"{"child_interests": "Minecraft and Roblox"}"#]);
        let updates = e
            .extract(&long_transcript(), &HashMap::new(), &default_client_card_fields(), "en")
            .await;
        assert!(updates.is_empty());
        assert_eq!(model.calls_made(), 1);
    }

    #[tokio::test]
    async fn greeting_evidence_is_rejected_locally() {
        let (e, model) = extractor(&[r#"{"child_interests": {
            "value": "Minecraft and Roblox",
            "evidence": "selamat pagi bu, terima kasih sudah bergabung",
            "confidence": 0.9}}"#]);
        let updates = e
            .extract(&long_transcript(), &HashMap::new(), &default_client_card_fields(), "en")
            .await;
        assert!(updates.is_empty());
        assert_eq!(model.calls_made(), 1);
    }

    #[tokio::test]
    async fn short_value_must_appear_in_evidence() {
        // "Kevin" (one word, > 3 chars) never appears in the cited evidence
        let (e, model) = extractor(&[r#"{"child_name": {
            "value": "Kevin years",
            "evidence": "the boy is nine and loves playing games after school",
            "confidence": 0.9}}"#]);
        let updates = e
            .extract(&long_transcript(), &HashMap::new(), &default_client_card_fields(), "en")
            .await;
        assert!(updates.is_empty());
        assert_eq!(model.calls_made(), 1);
    }

    #[tokio::test]
    async fn verification_rejection_drops_the_field() {
        let (e, _) = extractor(&[
            r#"{"child_interests": {"value": "Minecraft and Roblox",
                "evidence": "he absolutely loves Minecraft and Roblox", "confidence": 0.9}}"#,
            r#"{"is_valid": false, "explanation": "evidence is about the rep"}"#,
        ]);
        let updates = e
            .extract(&long_transcript(), &HashMap::new(), &default_client_card_fields(), "en")
            .await;
        assert!(updates.is_empty());
    }

    #[tokio::test]
    async fn inference_failure_yields_no_updates() {
        let e = ClientCardExtractor::new(Arc::new(FailingModel));
        let updates = e
            .extract(&long_transcript(), &HashMap::new(), &default_client_card_fields(), "en")
            .await;
        assert!(updates.is_empty());
    }
}
