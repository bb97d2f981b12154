//! Chat-completion client used by every analysis component.
//!
//! The [`ChatModel`] trait is the seam: analysis code depends on it, the
//! production implementation is [`OpenRouterClient`], and tests substitute
//! scripted fakes. All inference responses are parsed into typed structs
//! via [`parse_json_response`]; anything malformed degrades to "no result"
//! rather than an error that could stall the pipeline.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;

// ── Errors ────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("no inference API key configured")]
    MissingApiKey,

    #[error("inference request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("inference API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("inference response missing assistant content")]
    MalformedResponse,
}

// ── Trait seam ────────────────────────────────────────────────────

/// Parameters for a single completion call.
#[derive(Debug, Clone, Copy)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.5,
            max_tokens: 500,
        }
    }
}

/// A model that answers a single-user-message prompt with text.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, prompt: &str, options: ChatOptions) -> Result<String, LlmError>;
}

// ── OpenRouter client ─────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Production chat-completions client (OpenRouter wire format).
pub struct OpenRouterClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config.api_key.clone().ok_or(LlmError::MissingApiKey)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            api_key,
            model: config.realtime_model.clone(),
        })
    }
}

#[async_trait]
impl ChatModel for OpenRouterClient {
    async fn complete(&self, prompt: &str, options: ChatOptions) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(500).collect();
            tracing::error!(status = status.as_u16(), %body, "Inference API error");
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(LlmError::MalformedResponse)?;

        Ok(strip_markdown_fences(&content).to_string())
    }
}

// ── Response post-processing ──────────────────────────────────────

/// Models often wrap JSON answers in markdown code fences. Return the
/// fenced body when present, the trimmed input otherwise.
pub fn strip_markdown_fences(content: &str) -> &str {
    let fenced = if let Some(after) = content.split_once("```json") {
        after.1
    } else if let Some(after) = content.split_once("```") {
        after.1
    } else {
        return content.trim();
    };
    match fenced.split_once("```") {
        Some((body, _)) => body.trim(),
        None => fenced.trim(),
    }
}

/// Parse an inference reply into a typed struct. Malformed output yields
/// `None`, never an error; callers treat it as "model produced nothing".
pub fn parse_json_response<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let cleaned = strip_markdown_fences(raw);
    match serde_json::from_str(cleaned) {
        Ok(value) => Some(value),
        Err(err) => {
            let snippet: String = cleaned.chars().take(120).collect();
            tracing::debug!(%err, %snippet, "Discarding unparseable inference reply");
            None
        }
    }
}

// ── Test doubles ──────────────────────────────────────────────────

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted replies in order and records every prompt.
    /// Errors once the script is exhausted.
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<String>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        pub fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn calls_made(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, prompt: &str, _options: ChatOptions) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(LlmError::MalformedResponse)
        }
    }

    /// Always fails, as if the inference API were unreachable.
    pub struct FailingModel;

    #[async_trait]
    impl ChatModel for FailingModel {
        async fn complete(&self, _prompt: &str, _options: ChatOptions) -> Result<String, LlmError> {
            Err(LlmError::Status {
                status: 503,
                body: "unavailable".to_string(),
            })
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────
