use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Configuration(String),
    #[error("no chat handle initialized for session {0}")]
    SessionNotInitialized(String),
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error("session {0} already has a turn in flight")]
    TurnInProgress(Uuid),
    #[error("malformed stream chunk: {0}")]
    StreamChunkParse(String),
    #[error("stream failed: {0}")]
    StreamFailure(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ChatError::TurnInProgress(_) => StatusCode::CONFLICT,
            ChatError::Configuration(_)
            | ChatError::SessionNotInitialized(_)
            | ChatError::StreamChunkParse(_)
            | ChatError::StreamFailure(_)
            | ChatError::Backend(_)
            | ChatError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text shown to HTTP callers. Backend details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            ChatError::Validation(m) | ChatError::Configuration(m) => m.clone(),
            ChatError::SessionNotFound(_) | ChatError::TurnInProgress(_) => self.to_string(),
            _ => "Failed to process chat request".to_string(),
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "chat request failed");
        } else {
            tracing::debug!(error = %self, "chat request rejected");
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}
