//! Per-window call analysis: stage detection, checklist validation,
//! client-card extraction, and coaching tips.
//!
//! Every component takes a [`crate::llm::ChatModel`] and degrades to a
//! neutral result (previous stage, no completion, no update, no tip) when
//! inference fails or produces something unusable. A bad model answer must
//! never corrupt call state.

pub mod checklist;
pub mod client_card;
pub mod coaching;
pub mod stage;
