use anyhow::{Context, Result};
use flume::Sender;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header as ws_header;
use tokio_tungstenite::tungstenite::http::HeaderValue as WsHeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use pronto_backend::character::ProfileSummary;
use pronto_backend::server::ApiEventEnvelope;
use pronto_backend::session::message::Message;
use pronto_backend::session::{EndReason, SessionSnapshot, TurnOutcome};

/// Session events as the terminal client cares about them.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendEvent {
    MessageAppended(Message),
    TurnFailed { error: String },
    FollowUpArmed { fires_in_ms: u64 },
    Ended(EndReason),
    Reset,
}

#[derive(Debug, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub collaborator: String,
    pub characters: usize,
    pub sessions: usize,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn from_env() -> Self {
        let base = std::env::var("PRONTO_BACKEND_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8787".to_string());
        let token = std::env::var("PRONTO_BACKEND_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self::new(base, token)
    }

    pub fn new(base_url: String, token: Option<String>) -> Self {
        let normalized_base = normalize_base_url(&base_url);
        let ws_url = normalize_ws_url(&normalized_base);

        Self {
            http: reqwest::Client::new(),
            base_url: normalized_base,
            ws_url,
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        let response = self.request(reqwest::Method::GET, "/v1/health").send().await?;
        expect_success(response, "GET /v1/health")
            .await?
            .json::<HealthStatus>()
            .await
            .context("Failed to decode health response")
    }

    pub async fn list_characters(&self) -> Result<Vec<ProfileSummary>> {
        let response = self
            .request(reqwest::Method::GET, "/v1/characters")
            .send()
            .await?;
        expect_success(response, "GET /v1/characters")
            .await?
            .json::<Vec<ProfileSummary>>()
            .await
            .context("Failed to decode character list")
    }

    pub async fn create_session(&self, character_id: Option<&str>) -> Result<SessionSnapshot> {
        #[derive(Serialize)]
        struct CreateSessionRequest<'a> {
            character_id: Option<&'a str>,
        }

        let response = self
            .request(reqwest::Method::POST, "/v1/sessions")
            .json(&CreateSessionRequest { character_id })
            .send()
            .await?;
        expect_success(response, "POST /v1/sessions")
            .await?
            .json::<SessionSnapshot>()
            .await
            .context("Failed to decode new session")
    }

    pub async fn send_message(&self, session_id: &str, content: &str) -> Result<TurnOutcome> {
        #[derive(Serialize)]
        struct SendMessageRequest<'a> {
            content: &'a str,
        }

        let path = format!("/v1/sessions/{}/messages", session_id);
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&SendMessageRequest { content })
            .send()
            .await?;
        expect_success(response, &format!("POST {}", path))
            .await?
            .json::<TurnOutcome>()
            .await
            .context("Failed to decode turn outcome")
    }

    pub async fn reset_session(&self, session_id: &str) -> Result<SessionSnapshot> {
        let path = format!("/v1/sessions/{}/reset", session_id);
        let response = self.request(reqwest::Method::POST, &path).send().await?;
        expect_success(response, &format!("POST {}", path))
            .await?
            .json::<SessionSnapshot>()
            .await
            .context("Failed to decode reset session")
    }

    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let path = format!("/v1/sessions/{}", session_id);
        let response = self.request(reqwest::Method::DELETE, &path).send().await?;
        expect_success(response, &format!("DELETE {}", path)).await?;
        Ok(())
    }

    /// Forward this session's pushed events to `tx`, reconnecting until the
    /// receiver goes away.
    pub async fn stream_events_forever(self, session_id: String, tx: Sender<FrontendEvent>) {
        loop {
            match self.stream_events_once(&session_id, &tx).await {
                Ok(()) => {
                    tracing::info!("Event stream disconnected; reconnecting in 2s");
                }
                Err(error) => {
                    tracing::warn!("Event stream failed: {}; reconnecting in 2s", error);
                }
            }
            if tx.is_disconnected() {
                return;
            }
            sleep(Duration::from_secs(2)).await;
        }
    }

    async fn stream_events_once(&self, session_id: &str, tx: &Sender<FrontendEvent>) -> Result<()> {
        let ws_endpoint = format!("{}/v1/ws/events?session_id={}", self.ws_url, session_id);
        let mut request = ws_endpoint
            .into_client_request()
            .context("Invalid websocket endpoint URL")?;

        if let Some(token) = self.token.as_deref() {
            let value = WsHeaderValue::from_str(&format!("Bearer {}", token))
                .context("Invalid bearer token for websocket auth")?;
            request
                .headers_mut()
                .insert(ws_header::AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request)
            .await
            .context("Failed to connect websocket event stream")?;
        let (_write, mut read) = stream.split();

        while let Some(message) = read.next().await {
            let text = match message.context("Websocket read error")? {
                WsMessage::Text(text) => text.to_string(),
                WsMessage::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                WsMessage::Close(_) => return Ok(()),
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            };
            if let Some(event) = parse_event_envelope(&text, session_id)? {
                if tx.send(event).is_err() {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

/// Turn a non-2xx response into an error carrying the backend's message.
async fn expect_success(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if body.trim().is_empty() {
        anyhow::bail!("{} failed: {}", what, status);
    }
    anyhow::bail!("{}", body.trim())
}

fn parse_event_envelope(text: &str, session_id: &str) -> Result<Option<FrontendEvent>> {
    let envelope: ApiEventEnvelope =
        serde_json::from_str(text).context("Failed to decode API event envelope")?;
    if envelope.session_id.as_deref() != Some(session_id) {
        return Ok(None);
    }
    Ok(map_event(envelope))
}

fn map_event(envelope: ApiEventEnvelope) -> Option<FrontendEvent> {
    let payload = envelope.payload;
    match envelope.event_type.as_str() {
        "message_appended" => serde_json::from_value(payload.get("message")?.clone())
            .ok()
            .map(FrontendEvent::MessageAppended),
        "turn_failed" => Some(FrontendEvent::TurnFailed {
            error: payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        }),
        "follow_up_armed" => Some(FrontendEvent::FollowUpArmed {
            fires_in_ms: payload.get("fires_in_ms").and_then(Value::as_u64)?,
        }),
        "ended" => serde_json::from_value(payload.get("reason")?.clone())
            .ok()
            .map(FrontendEvent::Ended),
        "reset" => Some(FrontendEvent::Reset),
        _ => None,
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "http://127.0.0.1:8787".to_string()
    } else {
        trimmed.to_string()
    }
}

fn normalize_ws_url(base_http_url: &str) -> String {
    if let Some(rest) = base_http_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_http_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base_http_url)
    }
}
