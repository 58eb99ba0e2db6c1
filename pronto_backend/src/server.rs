use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::character::{CharacterProfile, ProfileSummary};
use crate::error::ChatError;
use crate::runtime::BackendRuntime;
use crate::session::{SessionEvent, SessionSnapshot, TurnOutcome};

#[derive(Clone)]
pub struct ServerState {
    pub runtime: Arc<BackendRuntime>,
    pub auth: BackendAuthConfig,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    collaborator: String,
    characters: usize,
    sessions: usize,
}

#[derive(Debug, Default, Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    character_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    content: String,
}

#[derive(Debug, Serialize)]
struct CloseSessionResponse {
    closed: bool,
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    session_id: Option<String>,
}

pub async fn serve_backend(
    runtime: BackendRuntime,
    event_rx: flume::Receiver<SessionEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("PRONTO_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid PRONTO_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let runtime = Arc::new(runtime);
    if runtime.spawn_idle_sweeper().is_none() {
        tracing::info!("Idle session eviction disabled");
    }

    let state = Arc::new(ServerState {
        runtime,
        auth,
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Pronto backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/characters", get(list_characters))
        .route("/characters/:id", get(get_character))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session).delete(close_session))
        .route("/sessions/:id/messages", post(send_message))
        .route("/sessions/:id/reset", post(reset_session))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<SessionEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_session_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_session_event(event: SessionEvent) -> ApiEventEnvelope {
    let session_id = event.session_id().to_string();
    let payload = match &event {
        SessionEvent::MessageAppended { message, .. } => {
            serde_json::json!({ "message": message })
        }
        SessionEvent::TurnFailed {
            error_kind, error, ..
        } => serde_json::json!({ "error_kind": error_kind, "error": error }),
        SessionEvent::FollowUpArmed { fires_in_ms, .. } => {
            serde_json::json!({ "fires_in_ms": fires_in_ms })
        }
        SessionEvent::Ended { reason, .. } => serde_json::json!({ "reason": reason }),
        SessionEvent::Reset { .. } => serde_json::json!({}),
    };
    ApiEventEnvelope {
        event_type: event.event_type().to_string(),
        emitted_at: Utc::now(),
        session_id: Some(session_id),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("PRONTO_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("PRONTO_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "PRONTO_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid PRONTO_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    let engine = &state.runtime.engine;
    Json(HealthResponse {
        status: "ok",
        collaborator: engine.collaborator_name().to_string(),
        characters: engine.store().len(),
        sessions: state.runtime.sessions.len().await,
    })
}

async fn list_characters(State(state): State<Arc<ServerState>>) -> Json<Vec<ProfileSummary>> {
    Json(state.runtime.engine.store().list())
}

async fn get_character(
    State(state): State<Arc<ServerState>>,
    Path(character_id): Path<String>,
) -> Result<Json<CharacterProfile>, (StatusCode, String)> {
    state
        .runtime
        .engine
        .store()
        .get(&character_id)
        .map(|profile| Json(profile.as_ref().clone()))
        .ok_or_else(|| chat_error(ChatError::ProfileNotFound(character_id)))
}

async fn create_session(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<SessionSnapshot>, (StatusCode, String)> {
    let character_id = body
        .character_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| state.runtime.config.default_character.clone());
    let session = state
        .runtime
        .start_session(&character_id)
        .await
        .map_err(chat_error)?;
    Ok(Json(session.snapshot().await))
}

async fn get_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, (StatusCode, String)> {
    let session = state.runtime.session(&session_id).await.map_err(chat_error)?;
    Ok(Json(session.snapshot().await))
}

async fn close_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<Json<CloseSessionResponse>, (StatusCode, String)> {
    state
        .runtime
        .end_session(&session_id)
        .await
        .map_err(chat_error)?;
    Ok(Json(CloseSessionResponse { closed: true }))
}

async fn send_message(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> Result<Json<TurnOutcome>, (StatusCode, String)> {
    let session = state.runtime.session(&session_id).await.map_err(chat_error)?;
    session
        .submit_user_message(&body.content)
        .await
        .map(Json)
        .map_err(chat_error)
}

async fn reset_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, (StatusCode, String)> {
    let session = state.runtime.session(&session_id).await.map_err(chat_error)?;
    Ok(Json(session.reset().await))
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, query.session_id, socket))
}

async fn handle_events_socket(
    state: Arc<ServerState>,
    session_filter: Option<String>,
    mut socket: WebSocket,
) {
    let mut rx = state.ws_events.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !wants_event(session_filter.as_deref(), &event) {
                            continue;
                        }
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Websocket client lagged; skipped {} event(s)", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn wants_event(session_filter: Option<&str>, event: &ApiEventEnvelope) -> bool {
    match session_filter {
        Some(wanted) => event.session_id.as_deref() == Some(wanted),
        None => true,
    }
}

fn chat_error(error: ChatError) -> (StatusCode, String) {
    let status = match &error {
        ChatError::ProfileNotFound(_) | ChatError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        ChatError::EmptyInput => StatusCode::BAD_REQUEST,
        ChatError::SessionEnded => StatusCode::GONE,
        ChatError::RequestInFlight => StatusCode::CONFLICT,
        ChatError::MalformedResponse(_) | ChatError::ReasoningUnavailable(_) => {
            StatusCode::BAD_GATEWAY
        }
    };
    (status, format!("{}: {}", error.kind(), error))
}
