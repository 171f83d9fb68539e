use crate::settings::AgentConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_loading: bool,
    pub is_streaming: bool,
}

impl Message {
    pub fn new(new: NewMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: new.role,
            content: new.content,
            created_at: Utc::now(),
            is_loading: new.is_loading,
            is_streaming: false,
        }
    }

    pub fn in_flight(&self) -> bool {
        self.is_loading || self.is_streaming
    }

    pub fn apply_patch(&mut self, patch: MessagePatch) {
        if let Some(content) = patch.content { self.content = content; }
        if let Some(loading) = patch.is_loading { self.is_loading = loading; }
        if let Some(streaming) = patch.is_streaming { self.is_streaming = streaming; }
    }

    pub fn to_wire(&self) -> ChatMessage {
        ChatMessage { role: self.role, content: self.content.clone() }
    }
}

/// Input to `SessionTree::add_message`; id and timestamp are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub content: String,
    pub role: Role,
    pub is_loading: bool,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { content: content.into(), role: Role::User, is_loading: false }
    }

    pub fn assistant_placeholder() -> Self {
        Self { content: String::new(), role: Role::Assistant, is_loading: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub is_loading: Option<bool>,
    pub is_streaming: Option<bool>,
}

/// Role + content, the shape messages take on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSession {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub agent_config: AgentConfig,
    pub messages: Vec<Message>,
    pub children: Vec<Uuid>,
}

impl ChatSession {
    pub fn new(parent_id: Option<Uuid>, agent_config: AgentConfig, messages: Vec<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id,
            created_at: Utc::now(),
            agent_config,
            messages,
            children: Vec::new(),
        }
    }

    pub fn message(&self, id: Uuid) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.id == id)
    }

    /// In-flight messages are almost always at the tail, so search from the back.
    pub(crate) fn message_mut(&mut self, id: Uuid) -> Option<&mut Message> {
        self.messages.iter_mut().rev().find(|m| m.id == id)
    }

    pub fn in_flight(&self) -> bool {
        self.messages.iter().any(Message::in_flight)
    }

    pub fn streaming_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_streaming).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_lowercase() {
        let m = ChatMessage { role: Role::Assistant, content: "hi".into() };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["role"], "assistant");
        let back: ChatMessage = serde_json::from_str(r#"{"role":"system","content":"x"}"#).unwrap();
        assert_eq!(back.role, Role::System);
        assert!(serde_json::from_str::<ChatMessage>(r#"{"role":"model","content":"x"}"#).is_err());
    }

    #[test]
    fn patch_leaves_unspecified_fields() {
        let mut m = Message::new(NewMessage::assistant_placeholder());
        m.apply_patch(MessagePatch { is_loading: Some(false), is_streaming: Some(true), ..Default::default() });
        assert!(!m.is_loading);
        assert!(m.is_streaming);
        assert!(m.content.is_empty());
        assert!(m.in_flight());
    }
}
