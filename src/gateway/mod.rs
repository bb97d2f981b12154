//! HTTP/WebSocket gateway.
//!
//! Two sockets per call: `/ws/call/{call_id}/ingest` receives audio
//! chunks from the recorder and drives the analysis pipeline;
//! `/ws/call/{call_id}/coach` streams state snapshots to any number of
//! viewers. Analysis runs outside the session lock so viewer commands
//! stay responsive while inference is in flight.

pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderValue;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::audio::{normalize_to_wav, AudioAccumulator};
use crate::config::{AudioConfig, Config};
use crate::llm::{ChatModel, OpenRouterClient};
use crate::playbook::{CallConfig, PlaybookStore, StaticPlaybookStore};
use crate::session::{CallSession, SessionRegistry, SharedSession};
use crate::transcription::ProviderRegistry;

use crate::analysis::checklist::ChecklistValidator;
use crate::analysis::client_card::ClientCardExtractor;
use crate::analysis::coaching::{CoachingAdvisor, CoachingTip};
use crate::analysis::stage::StageDetector;

use wire::{CoachEvent, CoachSnapshot, Command};

const REQUEST_BODY_LIMIT: usize = 2 * 1024 * 1024;
const HTTP_TIMEOUT_SECS: u64 = 10;

/// The inference-backed analysis passes, built once at startup.
///
/// Absent entirely when no inference key is configured; the gateway then
/// runs in transcript-only mode with time-based stage tracking.
pub struct Analyzers {
    pub stage: StageDetector,
    pub checklist: ChecklistValidator,
    pub card: ClientCardExtractor,
    pub coaching: CoachingAdvisor,
}

impl Analyzers {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            stage: StageDetector::new(model.clone()),
            checklist: ChecklistValidator::new(model.clone()),
            card: ClientCardExtractor::new(model.clone()),
            coaching: CoachingAdvisor::new(model),
        }
    }
}

pub struct AppState {
    pub sessions: SessionRegistry,
    pub providers: Arc<ProviderRegistry>,
    pub playbooks: Arc<dyn PlaybookStore>,
    pub analyzers: Option<Arc<Analyzers>>,
    pub audio: AudioConfig,
}

impl AppState {
    pub fn from_config(config: &Config) -> Self {
        let analyzers = match OpenRouterClient::new(&config.llm) {
            Ok(client) => {
                let model: Arc<dyn ChatModel> = Arc::new(client);
                Some(Arc::new(Analyzers::new(model)))
            }
            Err(err) => {
                tracing::warn!(%err, "Inference disabled; running transcript-only");
                None
            }
        };

        Self {
            sessions: SessionRegistry::new(),
            providers: Arc::new(ProviderRegistry::from_config(config)),
            playbooks: Arc::new(StaticPlaybookStore::default()),
            analyzers,
            audio: config.audio.clone(),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    let cors = if cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route(
            "/health",
            get(health).layer(TimeoutLayer::new(Duration::from_secs(HTTP_TIMEOUT_SECS))),
        )
        .route("/ws/call/{call_id}/ingest", get(ws_ingest))
        .route("/ws/call/{call_id}/coach", get(ws_coach))
        .layer(RequestBodyLimitLayer::new(REQUEST_BODY_LIMIT))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": state.sessions.active_count().await,
        "transcription_backend": state.providers.selected_name(),
    }))
}

// ── Ingest socket ─────────────────────────────────────────────────

async fn ws_ingest(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_ingest(state, call_id, socket))
}

async fn handle_ingest(state: Arc<AppState>, call_id: String, mut socket: WebSocket) {
    let session = match state.sessions.get_or_create(&call_id, state.playbooks.as_ref()).await {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(%call_id, %err, "Failed to open session for ingest");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    {
        let mut s = session.lock().await;
        s.is_recording = true;
        if s.current_stage_id.is_none() {
            if let Some(first) = s.config.first_stage().map(|st| st.id.clone()) {
                s.set_stage(&first);
            }
        }
    }
    tracing::info!(%call_id, "Ingest connected");

    let mut accumulator = AudioAccumulator::new(&state.audio);

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Binary(chunk) => {
                if accumulator.add_chunk(&chunk) {
                    let window = accumulator.data().to_vec();
                    accumulator.clear();
                    process_window(&state, &session, &window).await;
                }
            }
            Message::Text(text) => apply_command(&session, text.as_str()).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Flush whatever is buffered so the tail of the call is not lost.
    if accumulator.has_data() {
        let window = accumulator.data().to_vec();
        process_window(&state, &session, &window).await;
    }

    session.lock().await.is_recording = false;
    tracing::info!(%call_id, "Ingest disconnected");
}

/// One full analysis round for an accumulated audio window.
///
/// The session lock is held only to snapshot inputs and apply results;
/// every network call happens unlocked.
async fn process_window(state: &Arc<AppState>, session: &SharedSession, window: &[u8]) {
    let Some(wav) = normalize_to_wav(window).await else {
        tracing::debug!("Window rejected as silence or unconvertible");
        return;
    };

    let language = session.lock().await.language.clone();
    let segments = state.providers.transcribe(&wav, &language).await;
    if segments.is_empty() {
        return;
    }

    let (config, elapsed, previous_stage, stage_text) = {
        let mut s = session.lock().await;
        s.append_segments(&segments);
        (
            s.config.clone(),
            s.elapsed_secs() as u64,
            s.current_stage_id.clone(),
            s.stage_window().to_string(),
        )
    };

    let detected = match &state.analyzers {
        Some(analyzers) => {
            analyzers
                .stage
                .detect(&stage_text, &config.stages, elapsed, previous_stage.as_deref(), &language)
                .await
        }
        None => config
            .stage_for_elapsed(elapsed as f64)
            .map(|st| st.id.clone())
            .unwrap_or_default(),
    };
    if !detected.is_empty() {
        session.lock().await.set_stage(&detected);
    }

    let mut fresh_tip = None;
    if let Some(analyzers) = &state.analyzers {
        run_checklist(analyzers, session, &config, &language).await;
        run_card_extraction(analyzers, session, &config, &language).await;
        fresh_tip = run_coaching(analyzers, session, &config, &detected, &language).await;
    }

    let mut s = session.lock().await;
    if let Some(tip) = &fresh_tip {
        s.last_tip = Some(tip.clone());
    }
    broadcast_snapshot(&mut s, fresh_tip);
}

async fn run_checklist(
    analyzers: &Analyzers,
    session: &SharedSession,
    config: &CallConfig,
    language: &str,
) {
    let (candidates, transcript) = {
        let mut s = session.lock().await;
        let mut pending = Vec::new();
        for stage in &config.stages {
            for item in &stage.items {
                if s.should_check_item(&item.id) {
                    s.mark_item_checked(&item.id);
                    pending.push(item.clone());
                }
            }
        }
        (pending, s.checklist_window().to_string())
    };

    for item in &candidates {
        let check = analyzers.checklist.check(item, &transcript, language).await;
        if check.completed {
            let accepted = session.lock().await.complete_item(&item.id, &check.evidence);
            if accepted {
                tracing::info!(item = %item.id, confidence = check.confidence, "Checklist item completed");
            }
        }
    }
}

async fn run_card_extraction(
    analyzers: &Analyzers,
    session: &SharedSession,
    config: &CallConfig,
    language: &str,
) {
    let (current_values, transcript) = {
        let s = session.lock().await;
        (s.card_values(), s.card_window().to_string())
    };

    let updates = analyzers
        .card
        .extract(&transcript, &current_values, &config.client_card_fields, language)
        .await;
    if updates.is_empty() {
        return;
    }

    let mut s = session.lock().await;
    for (field_id, update) in updates {
        if s.apply_card_update(&field_id, update.value, update.evidence, update.confidence, update.label)
        {
            tracing::info!(field = %field_id, "Client card field filled");
        }
    }
}

async fn run_coaching(
    analyzers: &Analyzers,
    session: &SharedSession,
    config: &CallConfig,
    current_stage_id: &str,
    language: &str,
) -> Option<CoachingTip> {
    let (transcript, completed, card_summary) = {
        let s = session.lock().await;
        (s.coaching_window().to_string(), s.completed_item_ids(), s.card_values())
    };

    analyzers
        .coaching
        .advise(
            &transcript,
            config.stage(current_stage_id),
            &completed,
            &config.pre_call_brief,
            &card_summary,
            language,
        )
        .await
}

// ── Coach socket ──────────────────────────────────────────────────

async fn ws_coach(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_coach(state, call_id, socket))
}

async fn handle_coach(state: Arc<AppState>, call_id: String, socket: WebSocket) {
    let session = match state.sessions.get_or_create(&call_id, state.playbooks.as_ref()).await {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(%call_id, %err, "Failed to open session for coach");
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    let (viewer_key, mut updates) = {
        let mut s = session.lock().await;
        let pair = s.add_viewer();
        tracing::info!(%call_id, viewers = s.viewer_count(), "Coach connected");
        pair
    };

    // Full state straight to this viewer before any broadcasts arrive.
    let initial = {
        let s = session.lock().await;
        serde_json::to_string(&CoachEvent::Initial(CoachSnapshot::from_session(&s, None)))
    };
    let sent = match initial {
        Ok(payload) => sink.send(Message::Text(payload.into())).await.is_ok(),
        Err(err) => {
            tracing::error!(%err, "Failed to serialize initial snapshot");
            false
        }
    };
    if !sent {
        session.lock().await.remove_viewer(&viewer_key);
        return;
    }

    // Drain the viewer queue into the socket until either side closes.
    let forward = tokio::spawn(async move {
        while let Some(payload) = updates.recv().await {
            if sink.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => apply_command(&session, text.as_str()).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    session.lock().await.remove_viewer(&viewer_key);
    forward.abort();
    tracing::info!(%call_id, "Coach disconnected");
}

// ── Commands ──────────────────────────────────────────────────────

async fn apply_command(session: &SharedSession, raw: &str) {
    let command: Command = match serde_json::from_str(raw) {
        Ok(c) => c,
        Err(err) => {
            tracing::debug!(%err, "Ignoring unrecognized command");
            return;
        }
    };

    let mut s = session.lock().await;
    match command {
        Command::SetLanguage { language } => {
            tracing::info!(call_id = %s.call_id, %language, "Language changed");
            s.language = language;
        }
        Command::ManualToggleItem { item_id } => {
            let completed = s.toggle_item_manual(&item_id);
            tracing::info!(call_id = %s.call_id, %item_id, completed, "Manual item toggle");
            broadcast_snapshot(&mut s, None);
        }
        Command::UpdateClientCard { field_id, value } => {
            s.set_card_field_manual(&field_id, value);
            tracing::info!(call_id = %s.call_id, %field_id, "Manual card edit");
            broadcast_snapshot(&mut s, None);
        }
    }
}

fn broadcast_snapshot(session: &mut CallSession, fresh_tip: Option<CoachingTip>) {
    let event = CoachEvent::Update(CoachSnapshot::from_session(session, fresh_tip));
    match serde_json::to_string(&event) {
        Ok(payload) => session.broadcast(&payload),
        Err(err) => tracing::error!(%err, "Failed to serialize update"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::from_config(&Config::default()))
    }

    #[tokio::test]
    async fn health_reports_version_and_sessions() {
        let state = test_state();
        state
            .sessions
            .get_or_create("call-1", state.playbooks.as_ref())
            .await
            .unwrap();
        let app = router(state, &[]);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["active_sessions"], 1);
        assert_eq!(body["transcription_backend"], "local");
    }

    #[tokio::test]
    async fn no_api_key_means_no_analyzers() {
        let state = test_state();
        assert!(state.analyzers.is_none());
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let app = router(test_state(), &["http://localhost:3000".to_string()]);
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn commands_mutate_session_and_broadcast() {
        let state = test_state();
        let session = state
            .sessions
            .get_or_create("call-cmd", state.playbooks.as_ref())
            .await
            .unwrap();

        let mut rx = {
            let mut s = session.lock().await;
            let (_, rx) = s.add_viewer();
            rx
        };

        apply_command(&session, r#"{"type": "set_language", "language": "en"}"#).await;
        assert_eq!(session.lock().await.language, "en");

        apply_command(&session, r#"{"type": "manual_toggle_item", "item_id": "ask_age"}"#).await;
        assert!(session.lock().await.is_item_completed("ask_age"));

        let payload = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["type"], "update");

        // Garbage is ignored without touching session state
        apply_command(&session, "not json").await;
        assert_eq!(session.lock().await.language, "en");
    }

    #[tokio::test]
    async fn manual_card_edit_broadcasts_value() {
        let state = test_state();
        let session = state
            .sessions
            .get_or_create("call-card", state.playbooks.as_ref())
            .await
            .unwrap();
        let mut rx = {
            let mut s = session.lock().await;
            let (_, rx) = s.add_viewer();
            rx
        };

        apply_command(
            &session,
            r#"{"type": "update_client_card", "field_id": "child_name", "value": "Kevin, 9"}"#,
        )
        .await;

        let payload = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["clientCard"]["child_name"]["value"], "Kevin, 9");
    }
}
