//! Drives one conversational turn and reconciles the session tree with the
//! token stream coming back from the proxy.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::session::{ChatMessage, Message, MessagePatch, NewMessage, Role};
use crate::settings::ChatConfig;
use crate::sse::SseFrame;
use crate::tree::SharedTree;

pub const ERROR_MESSAGE: &str = "Sorry, there was an error processing your request.";

/// Body of `POST /chat` and `POST /chat/stream`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRequest {
    pub session_id: String,
    pub messages: Vec<ChatMessage>,
    pub config: ChatConfig,
}

/// One `data:` payload of the stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextChunk {
    pub text: String,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_stream(&self, req: &OutboundRequest) -> Result<BoxStream<'static, Result<SseFrame>>>;
    async fn complete(&self, req: &OutboundRequest) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Started { session_id: Uuid, message_id: Uuid },
    Fragment { session_id: Uuid, message_id: Uuid, text: String },
    Completed { session_id: Uuid, message_id: Uuid },
    Failed { session_id: Uuid, message_id: Uuid, error: String },
}

impl TurnEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            TurnEvent::Started { session_id, .. }
            | TurnEvent::Fragment { session_id, .. }
            | TurnEvent::Completed { session_id, .. }
            | TurnEvent::Failed { session_id, .. } => *session_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnReport {
    pub user_message_id: Uuid,
    pub assistant_message_id: Uuid,
    pub outcome: TurnOutcome,
}

#[derive(Clone)]
pub struct Pipeline {
    tree: SharedTree,
    transport: Arc<dyn ChatTransport>,
    events: broadcast::Sender<TurnEvent>,
}

struct PendingTurn {
    session_id: Uuid,
    user_message_id: Uuid,
    assistant_message_id: Uuid,
    request: OutboundRequest,
}

impl Pipeline {
    pub fn new(tree: SharedTree, transport: Arc<dyn ChatTransport>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { tree, transport, events }
    }

    pub fn tree(&self) -> &SharedTree {
        &self.tree
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TurnEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Appends the user turn and the loading placeholder, and builds the outbound
    /// request from the history as it was before this turn.
    async fn begin(&self, session_id: Uuid, text: &str) -> Result<PendingTurn> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::Validation("message must not be empty".into()));
        }
        let mut tree = self.tree.write().await;
        let session = tree.get(session_id).ok_or(ChatError::SessionNotFound(session_id))?;
        if session.in_flight() {
            return Err(ChatError::TurnInProgress(session_id));
        }
        let mut messages: Vec<ChatMessage> = session
            .messages
            .iter()
            .filter(|m| !m.is_loading)
            .map(Message::to_wire)
            .collect();
        messages.push(ChatMessage { role: Role::User, content: text.to_string() });
        let config = session.agent_config.to_chat_config();

        let user_message_id = tree.add_message(session_id, NewMessage::user(text))?;
        let assistant_message_id = tree.add_message(session_id, NewMessage::assistant_placeholder())?;
        drop(tree);

        tracing::info!(%session_id, history = messages.len(), model = %config.model, "turn started");
        metrics::counter!("chat_turns_started_total").increment(1);
        self.emit(TurnEvent::Started { session_id, message_id: assistant_message_id });
        Ok(PendingTurn {
            session_id,
            user_message_id,
            assistant_message_id,
            request: OutboundRequest { session_id: session_id.to_string(), messages, config },
        })
    }

    async fn finish(&self, turn: &PendingTurn, result: Result<()>) -> TurnReport {
        let (session_id, message_id) = (turn.session_id, turn.assistant_message_id);
        let outcome = match result {
            Ok(()) => {
                self.tree.write().await.update_message(
                    session_id,
                    message_id,
                    MessagePatch { is_loading: Some(false), is_streaming: Some(false), ..Default::default() },
                );
                tracing::info!(%session_id, %message_id, "turn completed");
                self.emit(TurnEvent::Completed { session_id, message_id });
                TurnOutcome::Completed
            }
            Err(e) => {
                tracing::warn!(%session_id, %message_id, error = %e, "turn failed");
                self.tree.write().await.update_message(
                    session_id,
                    message_id,
                    MessagePatch {
                        content: Some(ERROR_MESSAGE.to_string()),
                        is_loading: Some(false),
                        is_streaming: Some(false),
                    },
                );
                self.emit(TurnEvent::Failed { session_id, message_id, error: e.to_string() });
                TurnOutcome::Failed
            }
        };
        let label = match outcome {
            TurnOutcome::Completed => "completed",
            TurnOutcome::Failed => "failed",
        };
        metrics::counter!("chat_turns_total", "outcome" => label).increment(1);
        TurnReport {
            user_message_id: turn.user_message_id,
            assistant_message_id: message_id,
            outcome,
        }
    }

    /// Runs a streamed turn to completion. Errors are returned only when the turn
    /// could not start; once the placeholder exists, failures end up in its content.
    pub async fn run_turn(&self, session_id: Uuid, text: &str) -> Result<TurnReport> {
        let turn = self.begin(session_id, text).await?;
        let result = self.stream_into(&turn).await;
        Ok(self.finish(&turn, result).await)
    }

    /// Same protocol as [`Pipeline::run_turn`] over the non-streaming endpoint: the
    /// whole reply lands in one step.
    pub async fn run_turn_unary(&self, session_id: Uuid, text: &str) -> Result<TurnReport> {
        let turn = self.begin(session_id, text).await?;
        let result = match self.transport.complete(&turn.request).await {
            Ok(reply) => {
                self.tree.write().await.update_message(
                    session_id,
                    turn.assistant_message_id,
                    MessagePatch { content: Some(reply.clone()), is_loading: Some(false), ..Default::default() },
                );
                self.emit(TurnEvent::Fragment { session_id, message_id: turn.assistant_message_id, text: reply });
                Ok(())
            }
            Err(e) => Err(e),
        };
        Ok(self.finish(&turn, result).await)
    }

    async fn stream_into(&self, turn: &PendingTurn) -> Result<()> {
        let (session_id, message_id) = (turn.session_id, turn.assistant_message_id);
        let mut frames = self.transport.open_stream(&turn.request).await?;
        let mut started = false;
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            if frame.is_error() {
                return Err(ChatError::StreamFailure(frame.data));
            }
            if frame.is_done() {
                return Ok(());
            }
            if !started {
                started = true;
                self.tree.write().await.update_message(
                    session_id,
                    message_id,
                    MessagePatch { is_loading: Some(false), is_streaming: Some(true), ..Default::default() },
                );
            }
            let chunk = match parse_chunk(&frame) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!(%session_id, error = %e, "skipping stream chunk");
                    continue;
                }
            };
            if chunk.text.is_empty() {
                continue;
            }
            self.tree.write().await.append_to_message(session_id, message_id, &chunk.text);
            self.emit(TurnEvent::Fragment { session_id, message_id, text: chunk.text });
        }
        Err(ChatError::StreamFailure("stream ended before completion".into()))
    }
}

fn parse_chunk(frame: &SseFrame) -> Result<TextChunk> {
    serde_json::from_str(&frame.data).map_err(|e| ChatError::StreamChunkParse(format!("{e}: {}", frame.data)))
}
