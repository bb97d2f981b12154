//! callcoach: real-time sales-call coaching pipeline.
//!
//! Ingests live call audio over WebSocket, transcribes it through a
//! prioritized set of providers, tracks progress against a playbook
//! (stages + checklist items), extracts a structured client card, and
//! broadcasts coaching updates to every connected viewer of the call.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod gateway;
pub mod llm;
pub mod playbook;
pub mod session;
pub mod transcription;
