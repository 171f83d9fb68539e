use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{routing::{delete, get, post}, Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::{net::SocketAddr, sync::Arc};

use crate::error::{ChatError, Result};
use crate::models::{FragmentStream, GeminiProvider};
use crate::proxy::ConversationProxy;
use crate::session::ChatMessage;
use crate::settings::ChatConfig;
use crate::sse::DONE_SENTINEL;

/// `proxy` is `None` when no credential was configured; chat routes then answer 500.
#[derive(Clone, Default)]
pub struct AppState {
    pub proxy: Option<Arc<ConversationProxy>>,
}

impl AppState {
    pub fn new(proxy: Arc<ConversationProxy>) -> Self {
        Self { proxy: Some(proxy) }
    }

    pub fn from_env() -> Self {
        match GeminiProvider::from_env() {
            Ok(provider) => {
                tracing::info!(base_url = %provider.base_url, "gemini backend configured");
                Self::new(Arc::new(ConversationProxy::new(Arc::new(provider))))
            }
            Err(e) => {
                tracing::warn!(error = %e, "GOOGLE_API_KEY not set; chat requests will fail");
                Self::default()
            }
        }
    }

    fn proxy(&self) -> Result<&Arc<ConversationProxy>> {
        self.proxy
            .as_ref()
            .ok_or_else(|| ChatError::Configuration("API key not configured".into()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    pub messages: Option<Vec<ChatMessage>>,
    pub config: Option<ChatConfig>,
    pub session_id: Option<String>,
}

/// A request that passed validation: prior history, the new user text, and config.
#[derive(Debug)]
struct ChatTurn {
    session_id: String,
    prior: Vec<ChatMessage>,
    latest: String,
    config: ChatConfig,
}

impl ChatRequestBody {
    fn validate(self) -> Result<ChatTurn> {
        let mut messages = match self.messages {
            Some(m) if !m.is_empty() => m,
            _ => return Err(ChatError::Validation("Invalid messages format".into())),
        };
        let config = match self.config {
            Some(c) if !c.model.trim().is_empty() => c,
            _ => return Err(ChatError::Validation("Invalid configuration".into())),
        };
        let session_id = match self.session_id {
            Some(s) if !s.trim().is_empty() => s,
            _ => return Err(ChatError::Validation("Session ID is required".into())),
        };
        let latest = messages.pop().map(|m| m.content).unwrap_or_default();
        Ok(ChatTurn { session_id, prior: messages, latest, config })
    }
}

fn parse_body(payload: std::result::Result<Json<ChatRequestBody>, JsonRejection>) -> Result<ChatTurn> {
    let Json(body) = payload.map_err(|e| ChatError::Validation(e.body_text()))?;
    body.validate()
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub response: String,
}

async fn status() -> Json<serde_json::Value> {
    Json(json!({ "status": "running" }))
}

async fn chat(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ChatRequestBody>, JsonRejection>,
) -> Result<Json<CompletionResponse>> {
    let turn = parse_body(payload)?;
    let proxy = state.proxy()?;
    metrics::counter!("chat_requests_total", "mode" => "unary").increment(1);
    proxy.get_or_create_handle(&turn.session_id, &turn.prior, &turn.config).await;
    let response = proxy.send(&turn.session_id, &turn.latest).await?;
    tracing::debug!(session_id = %turn.session_id, chars = response.len(), "completion sent");
    Ok(Json(CompletionResponse { response }))
}

async fn chat_stream(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ChatRequestBody>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let turn = parse_body(payload)?;
    let proxy = state.proxy()?;
    metrics::counter!("chat_requests_total", "mode" => "stream").increment(1);
    proxy.get_or_create_handle(&turn.session_id, &turn.prior, &turn.config).await;
    // Anything failing up to here is still a plain JSON error response.
    let fragments = proxy.send_stream(&turn.session_id, &turn.latest).await?;
    tracing::debug!(session_id = %turn.session_id, "stream opened");
    Ok(Sse::new(sse_events(turn.session_id, fragments)).keep_alive(KeepAlive::default()))
}

/// `data: {"text": ...}` per fragment, then `data: [DONE]`. A backend failure emits
/// one `event: error` and ends the stream without the sentinel.
fn sse_events(
    session_id: String,
    fragments: FragmentStream,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    futures::stream::unfold(Some((fragments, session_id)), |state| async move {
        let Some((mut fragments, session_id)) = state else {
            return None;
        };
        let event = match fragments.next().await {
            Some(Ok(text)) => {
                metrics::counter!("chat_stream_fragments_total").increment(1);
                let event = Event::default().data(json!({ "text": text }).to_string());
                return Some((Ok::<_, Infallible>(event), Some((fragments, session_id))));
            }
            Some(Err(e)) => {
                tracing::error!(%session_id, error = %e, "stream error");
                Event::default()
                    .event("error")
                    .data(json!({ "error": "Failed to process streaming chat request" }).to_string())
            }
            None => {
                tracing::debug!(%session_id, "stream complete");
                Event::default().data(DONE_SENTINEL)
            }
        };
        Some((Ok(event), None))
    })
}

async fn clear_handle(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let cleared = state.proxy()?.clear(&session_id).await;
    tracing::info!(%session_id, cleared, "chat handle cleared");
    Ok(Json(json!({ "cleared": cleared })))
}

async fn clear_all_handles(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let cleared = state.proxy()?.clear_all().await;
    tracing::info!(cleared, "all chat handles cleared");
    Ok(Json(json!({ "cleared": cleared })))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", get(status).post(chat))
        .route("/chat/stream", post(chat_stream))
        .route("/chat/sessions", delete(clear_all_handles))
        .route("/chat/sessions/:id", delete(clear_handle))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
