//! Per-call session state and the registry that owns it.
//!
//! One [`CallSession`] exists per call id, shared between the ingest
//! pipeline (the only automated writer) and every coach viewer. All
//! mutation goes through one `tokio::sync::Mutex` per session; the
//! registry itself is another mutex around the id map so concurrent
//! connects for the same call id converge on a single session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::analysis::coaching::CoachingTip;
use crate::playbook::{CallConfig, PlaybookStore};
use crate::transcription::TranscriptSegment;

/// Rolling transcript keeps at most this many words.
const MAX_TRANSCRIPT_WORDS: usize = 1_000;

/// Minimum seconds between inference checks of the same checklist item.
const ITEM_COOLDOWN_SECS: f64 = 30.0;

/// Outbound queue depth per viewer. A viewer this far behind is dead.
const VIEWER_QUEUE_DEPTH: usize = 32;

// Transcript window sizes, in characters, for each consumer.
const STAGE_WINDOW_CHARS: usize = 2_000;
const CHECKLIST_WINDOW_CHARS: usize = 1_500;
const CARD_WINDOW_CHARS: usize = 1_000;
const COACHING_WINDOW_CHARS: usize = 500;
const PREVIEW_CHARS: usize = 300;

// ── Session state ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ItemState {
    pub completed: bool,
    pub evidence: String,
    /// Set by a rep clicking the item, bypassing evidence rules.
    pub manual: bool,
    last_checked_secs: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CardEntry {
    pub value: String,
    pub evidence: String,
    pub confidence: f64,
    pub label: String,
    pub manual: bool,
}

pub struct CallSession {
    pub call_id: String,
    pub config: CallConfig,
    pub language: String,
    pub is_recording: bool,
    pub current_stage_id: Option<String>,
    pub last_tip: Option<CoachingTip>,
    started_at: Instant,
    stage_entered_secs: f64,
    transcript: String,
    items: HashMap<String, ItemState>,
    used_evidence: HashSet<String>,
    card: HashMap<String, CardEntry>,
    viewers: HashMap<Uuid, mpsc::Sender<String>>,
}

impl CallSession {
    pub fn new(call_id: impl Into<String>, config: CallConfig) -> Self {
        let language = config.language.clone();
        Self {
            call_id: call_id.into(),
            config,
            language,
            is_recording: false,
            current_stage_id: None,
            last_tip: None,
            started_at: Instant::now(),
            stage_entered_secs: 0.0,
            transcript: String::new(),
            items: HashMap::new(),
            used_evidence: HashSet::new(),
            card: HashMap::new(),
            viewers: HashMap::new(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn stage_elapsed_secs(&self) -> f64 {
        (self.elapsed_secs() - self.stage_entered_secs).max(0.0)
    }

    // ── Transcript ────────────────────────────────────────────────

    /// Append transcribed segments and trim the rolling transcript.
    pub fn append_segments(&mut self, segments: &[TranscriptSegment]) {
        for segment in segments {
            let text = segment.text.trim();
            if text.is_empty() {
                continue;
            }
            if !self.transcript.is_empty() {
                self.transcript.push(' ');
            }
            if !segment.speaker.is_empty() {
                self.transcript.push_str(&format!("[{}] ", segment.speaker));
            }
            self.transcript.push_str(text);
        }

        let words: Vec<&str> = self.transcript.split_whitespace().collect();
        if words.len() > MAX_TRANSCRIPT_WORDS {
            self.transcript = words[words.len() - MAX_TRANSCRIPT_WORDS..].join(" ");
        }
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn stage_window(&self) -> &str {
        tail_chars(&self.transcript, STAGE_WINDOW_CHARS)
    }

    pub fn checklist_window(&self) -> &str {
        tail_chars(&self.transcript, CHECKLIST_WINDOW_CHARS)
    }

    pub fn card_window(&self) -> &str {
        tail_chars(&self.transcript, CARD_WINDOW_CHARS)
    }

    pub fn coaching_window(&self) -> &str {
        tail_chars(&self.transcript, COACHING_WINDOW_CHARS)
    }

    pub fn transcript_preview(&self) -> &str {
        tail_chars(&self.transcript, PREVIEW_CHARS)
    }

    // ── Stage ─────────────────────────────────────────────────────

    /// Record a stage change; a repeat of the current stage is a no-op.
    pub fn set_stage(&mut self, stage_id: &str) {
        if self.current_stage_id.as_deref() == Some(stage_id) {
            return;
        }
        tracing::info!(call_id = %self.call_id, stage = %stage_id, "Stage change");
        self.current_stage_id = Some(stage_id.to_string());
        self.stage_entered_secs = self.elapsed_secs();
    }

    // ── Checklist ─────────────────────────────────────────────────

    pub fn is_item_completed(&self, item_id: &str) -> bool {
        self.items.get(item_id).is_some_and(|s| s.completed)
    }

    pub fn completed_item_ids(&self) -> HashSet<String> {
        self.items
            .iter()
            .filter(|(_, s)| s.completed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn item_state(&self, item_id: &str) -> Option<&ItemState> {
        self.items.get(item_id)
    }

    /// Whether the ingest pipeline should spend an inference round on this
    /// item now. Completed items never re-check; pending items honor a
    /// per-item cooldown.
    pub fn should_check_item(&self, item_id: &str) -> bool {
        match self.items.get(item_id) {
            Some(state) if state.completed => false,
            Some(state) => match state.last_checked_secs {
                Some(at) => self.elapsed_secs() - at >= ITEM_COOLDOWN_SECS,
                None => true,
            },
            None => true,
        }
    }

    pub fn mark_item_checked(&mut self, item_id: &str) {
        let elapsed = self.elapsed_secs();
        self.items.entry(item_id.to_string()).or_default().last_checked_secs = Some(elapsed);
    }

    /// Complete an item with evidence. Returns false when the same
    /// evidence already completed another item; one quote cannot prove
    /// two different actions.
    pub fn complete_item(&mut self, item_id: &str, evidence: &str) -> bool {
        if self.is_item_completed(item_id) {
            return true;
        }

        let normalized = evidence.trim().to_lowercase();
        if !normalized.is_empty() && !self.used_evidence.insert(normalized) {
            tracing::debug!(call_id = %self.call_id, item_id, "Duplicate evidence rejected");
            return false;
        }

        let state = self.items.entry(item_id.to_string()).or_default();
        state.completed = true;
        state.evidence = evidence.trim().to_string();
        state.manual = false;
        true
    }

    /// Rep clicked the item: flip completion without evidence rules.
    pub fn toggle_item_manual(&mut self, item_id: &str) -> bool {
        let state = self.items.entry(item_id.to_string()).or_default();
        state.completed = !state.completed;
        state.manual = true;
        state.evidence.clear();
        state.completed
    }

    // ── Client card ───────────────────────────────────────────────

    pub fn card_values(&self) -> HashMap<String, String> {
        self.card
            .iter()
            .map(|(id, e)| (id.clone(), e.value.clone()))
            .collect()
    }

    pub fn card(&self) -> &HashMap<String, CardEntry> {
        &self.card
    }

    /// Write-once: extracted values never overwrite an existing entry.
    pub fn apply_card_update(
        &mut self,
        field_id: &str,
        value: String,
        evidence: String,
        confidence: f64,
        label: String,
    ) -> bool {
        if self.card.contains_key(field_id) {
            return false;
        }
        self.card.insert(
            field_id.to_string(),
            CardEntry {
                value,
                evidence,
                confidence,
                label,
                manual: false,
            },
        );
        true
    }

    /// Manual edits from the coach view always win.
    pub fn set_card_field_manual(&mut self, field_id: &str, value: String) {
        let label = self
            .config
            .client_card_fields
            .iter()
            .find(|f| f.id == field_id)
            .map(|f| f.label.clone())
            .unwrap_or_else(|| field_id.to_string());
        self.card.insert(
            field_id.to_string(),
            CardEntry {
                value,
                evidence: String::new(),
                confidence: 1.0,
                label,
                manual: true,
            },
        );
    }

    // ── Viewers / broadcast ───────────────────────────────────────

    /// Register a coach viewer; returns its key and the receiving end the
    /// socket forwarder drains.
    pub fn add_viewer(&mut self) -> (Uuid, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(VIEWER_QUEUE_DEPTH);
        let key = Uuid::new_v4();
        self.viewers.insert(key, tx);
        (key, rx)
    }

    pub fn remove_viewer(&mut self, key: &Uuid) {
        self.viewers.remove(key);
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Fan a serialized payload out to every viewer. Viewers whose queue
    /// is full or closed are dropped; membership heals itself.
    pub fn broadcast(&mut self, payload: &str) {
        let mut dead = Vec::new();
        for (key, tx) in &self.viewers {
            if tx.try_send(payload.to_string()).is_err() {
                dead.push(*key);
            }
        }
        for key in dead {
            tracing::debug!(call_id = %self.call_id, viewer = %key, "Dropping unresponsive viewer");
            self.viewers.remove(&key);
        }
    }

    #[cfg(test)]
    fn advance_clock(&mut self, secs: f64) {
        self.started_at -= std::time::Duration::from_secs_f64(secs);
    }
}

/// Last `n` characters on a char boundary.
fn tail_chars(s: &str, n: usize) -> &str {
    match s.char_indices().rev().nth(n.saturating_sub(1)) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

// ── Registry ──────────────────────────────────────────────────────

pub type SharedSession = Arc<Mutex<CallSession>>;

/// All live sessions, keyed by call id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<String, SharedSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create the session for a call. Concurrent calls for the
    /// same id always converge on one session; the playbook is fetched
    /// only for the call that actually creates it.
    pub async fn get_or_create(
        &self,
        call_id: &str,
        store: &dyn PlaybookStore,
    ) -> anyhow::Result<SharedSession> {
        let mut map = self.inner.lock().await;
        if let Some(session) = map.get(call_id) {
            return Ok(session.clone());
        }
        let config = store.call_config(call_id).await?;
        let session = Arc::new(Mutex::new(CallSession::new(call_id, config)));
        map.insert(call_id.to_string(), session.clone());
        tracing::info!(%call_id, "Created call session");
        Ok(session)
    }

    pub async fn get(&self, call_id: &str) -> Option<SharedSession> {
        self.inner.lock().await.get(call_id).cloned()
    }

    pub async fn remove(&self, call_id: &str) {
        self.inner.lock().await.remove(call_id);
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::{default_call_config, StaticPlaybookStore};

    fn session() -> CallSession {
        CallSession::new("call-1", default_call_config())
    }

    fn seg(text: &str) -> TranscriptSegment {
        TranscriptSegment::new(0.0, 1.0, text)
    }

    #[test]
    fn transcript_trims_to_word_limit() {
        let mut s = session();
        let long: String = (0..1200).map(|i| format!("w{i} ")).collect();
        s.append_segments(&[seg(&long)]);

        let words: Vec<&str> = s.transcript().split_whitespace().collect();
        assert_eq!(words.len(), MAX_TRANSCRIPT_WORDS);
        assert_eq!(words[0], "w200");
        assert_eq!(*words.last().unwrap(), "w1199");
    }

    #[test]
    fn speaker_labels_are_inlined() {
        let mut s = session();
        let mut labeled = seg("how old is he?");
        labeled.speaker = "Speaker 1".to_string();
        s.append_segments(&[labeled, seg("nine years old")]);
        assert_eq!(s.transcript(), "[Speaker 1] how old is he? nine years old");
    }

    #[test]
    fn windows_are_suffixes_of_each_other() {
        let mut s = session();
        let long: String = "word ".repeat(900);
        s.append_segments(&[seg(&long)]);

        assert!(s.stage_window().len() >= s.checklist_window().len());
        assert!(s.checklist_window().ends_with(s.card_window()));
        assert!(s.card_window().ends_with(s.coaching_window()));
        assert!(s.coaching_window().ends_with(s.transcript_preview()));
        assert!(s.stage_window().chars().count() <= 2_000);
    }

    #[test]
    fn stage_change_resets_stage_clock() {
        let mut s = session();
        s.advance_clock(100.0);
        s.set_stage("profiling");
        assert!(s.stage_elapsed_secs() < 1.0);
        assert_eq!(s.current_stage_id.as_deref(), Some("profiling"));

        // Re-setting the same stage keeps the clock
        let before = s.stage_elapsed_secs();
        s.set_stage("profiling");
        assert!(s.stage_elapsed_secs() >= before);
    }

    #[test]
    fn completed_items_are_never_rechecked() {
        let mut s = session();
        assert!(s.should_check_item("ask_age"));
        assert!(s.complete_item("ask_age", "how old is your son, what grade?"));
        assert!(!s.should_check_item("ask_age"));
        assert!(s.is_item_completed("ask_age"));
    }

    #[test]
    fn cooldown_blocks_rapid_rechecks() {
        let mut s = session();
        s.mark_item_checked("ask_age");
        assert!(!s.should_check_item("ask_age"));
        s.advance_clock(ITEM_COOLDOWN_SECS + 1.0);
        assert!(s.should_check_item("ask_age"));
    }

    #[test]
    fn duplicate_evidence_cannot_complete_two_items() {
        let mut s = session();
        let quote = "And how old is your son, what grade is he in?";
        assert!(s.complete_item("ask_age", quote));
        // Same quote, different casing and padding
        assert!(!s.complete_item("ask_interests", &format!("  {}  ", quote.to_uppercase())));
        assert!(!s.is_item_completed("ask_interests"));
    }

    #[test]
    fn manual_toggle_flips_and_clears_evidence() {
        let mut s = session();
        s.complete_item("ask_age", "some perfectly good evidence");
        assert!(!s.toggle_item_manual("ask_age"));
        assert!(!s.is_item_completed("ask_age"));
        assert!(s.toggle_item_manual("ask_age"));
        let state = s.item_state("ask_age").unwrap();
        assert!(state.manual);
        assert!(state.evidence.is_empty());
    }

    #[test]
    fn card_is_write_once_for_extraction() {
        let mut s = session();
        assert!(s.apply_card_update("child_name", "Kevin, 9".into(), "his name is Kevin".into(), 0.9, "Child's Name".into()));
        assert!(!s.apply_card_update("child_name", "Bob".into(), "x".into(), 0.9, "Child's Name".into()));
        assert_eq!(s.card()["child_name"].value, "Kevin, 9");

        // Manual edits overwrite
        s.set_card_field_manual("child_name", "Kevin Tan, 9".into());
        let entry = &s.card()["child_name"];
        assert_eq!(entry.value, "Kevin Tan, 9");
        assert!(entry.manual);
        assert_eq!(entry.label, "Child's Name");
    }

    #[tokio::test]
    async fn broadcast_drops_dead_viewers() {
        let mut s = session();
        let (_key_a, mut rx_a) = s.add_viewer();
        let (_key_b, rx_b) = s.add_viewer();
        assert_eq!(s.viewer_count(), 2);

        drop(rx_b); // viewer b went away without unregistering
        s.broadcast("{\"type\":\"update\"}");

        assert_eq!(s.viewer_count(), 1);
        assert_eq!(rx_a.recv().await.unwrap(), "{\"type\":\"update\"}");
    }

    #[tokio::test]
    async fn registry_get_or_create_is_idempotent() {
        let registry = SessionRegistry::new();
        let store = StaticPlaybookStore::default();

        let a = registry.get_or_create("call-7", &store).await.unwrap();
        let b = registry.get_or_create("call-7", &store).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.active_count().await, 1);

        registry.remove("call-7").await;
        assert_eq!(registry.active_count().await, 0);
        assert!(registry.get("call-7").await.is_none());
    }

    #[tokio::test]
    async fn concurrent_creates_converge() {
        let registry = SessionRegistry::new();
        let store = Arc::new(StaticPlaybookStore::default());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create("same-call", store.as_ref()).await.unwrap()
            }));
        }

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }
        for s in &sessions[1..] {
            assert!(Arc::ptr_eq(&sessions[0], s));
        }
        assert_eq!(registry.active_count().await, 1);
    }
}
