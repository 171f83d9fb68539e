//! In-memory session tree.
//!
//! Sessions live behind `Arc` and are mutated through `Arc::make_mut`, so a
//! [`SessionTree::snapshot`] taken by a reader is never affected by later writes:
//! the first write after a snapshot copies the touched session, and every other
//! session stays shared.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::session::{ChatSession, Message, MessagePatch, NewMessage};
use crate::settings::{AgentConfig, AgentConfigPatch};

pub const NEW_ROOT_NAME: &str = "New Chat";

pub type SharedTree = Arc<RwLock<SessionTree>>;

#[derive(Debug, Clone)]
pub struct SessionTree {
    sessions: HashMap<Uuid, Arc<ChatSession>>,
    /// Creation order; gives roots and listings a stable order.
    order: Vec<Uuid>,
    active: Uuid,
}

impl SessionTree {
    /// A tree holding a single root session with the default config, which is active.
    pub fn new() -> Self {
        let root = ChatSession::new(None, AgentConfig::default(), Vec::new());
        let id = root.id;
        let mut sessions = HashMap::new();
        sessions.insert(id, Arc::new(root));
        Self { sessions, order: vec![id], active: id }
    }

    pub fn shared(self) -> SharedTree {
        Arc::new(RwLock::new(self))
    }

    pub fn snapshot(&self) -> SessionTree {
        self.clone()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&ChatSession> {
        self.sessions.get(&id).map(|s| s.as_ref())
    }

    pub fn active_id(&self) -> Uuid {
        self.active
    }

    pub fn active(&self) -> &ChatSession {
        // `active` always keys an existing session; see `set_active`.
        &self.sessions[&self.active]
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut ChatSession> {
        self.sessions.get_mut(&id).map(Arc::make_mut)
    }

    pub fn set_active(&mut self, id: Uuid) -> Result<()> {
        if !self.sessions.contains_key(&id) {
            return Err(ChatError::SessionNotFound(id));
        }
        self.active = id;
        Ok(())
    }

    /// Creates a root (`parent_id == None`) or a branch of `parent_id`.
    ///
    /// A branch receives a deep copy of the parent's messages as they are right now,
    /// with transient loading/streaming flags cleared, and a default config named
    /// after the parent.
    pub fn create_session(&mut self, parent_id: Option<Uuid>) -> Result<Uuid> {
        let (messages, config) = match parent_id {
            Some(pid) => {
                let parent = self.get(pid).ok_or(ChatError::SessionNotFound(pid))?;
                let messages = parent
                    .messages
                    .iter()
                    .cloned()
                    .map(|mut m| {
                        m.is_loading = false;
                        m.is_streaming = false;
                        m
                    })
                    .collect();
                let name = format!("Branch of {}", parent.agent_config.name);
                (messages, AgentConfig::named(name))
            }
            None => (Vec::new(), AgentConfig::named(NEW_ROOT_NAME)),
        };

        let session = ChatSession::new(parent_id, config, messages);
        let id = session.id;
        if let Some(pid) = parent_id {
            if let Some(parent) = self.get_mut(pid) {
                parent.children.push(id);
            }
        }
        self.sessions.insert(id, Arc::new(session));
        self.order.push(id);
        tracing::debug!(session_id = %id, parent_id = ?parent_id, "session created");
        Ok(id)
    }

    pub fn split_chat(&mut self, session_id: Uuid) -> Result<Uuid> {
        self.create_session(Some(session_id))
    }

    pub fn update_agent_config(&mut self, session_id: Uuid, patch: AgentConfigPatch) -> Result<()> {
        let session = self
            .get_mut(session_id)
            .ok_or(ChatError::SessionNotFound(session_id))?;
        session.agent_config.apply_patch(patch)
    }

    pub fn add_message(&mut self, session_id: Uuid, message: NewMessage) -> Result<Uuid> {
        let session = self
            .get_mut(session_id)
            .ok_or(ChatError::SessionNotFound(session_id))?;
        let message = Message::new(message);
        let id = message.id;
        session.messages.push(message);
        Ok(id)
    }

    /// Merges `patch` into the message in place. Returns `false` without touching
    /// anything if the session or message is missing, or if the patch would make a
    /// second message in the session stream at once.
    pub fn update_message(&mut self, session_id: Uuid, message_id: Uuid, patch: MessagePatch) -> bool {
        let Some(current) = self.get(session_id) else { return false };
        if current.message(message_id).is_none() {
            return false;
        }
        if patch.is_streaming == Some(true)
            && current.messages.iter().any(|m| m.is_streaming && m.id != message_id)
        {
            tracing::warn!(%session_id, %message_id, "refusing second streaming message in session");
            return false;
        }
        match self.get_mut(session_id).and_then(|s| s.message_mut(message_id)) {
            Some(message) => {
                message.apply_patch(patch);
                true
            }
            None => false,
        }
    }

    /// Streaming primitive: concatenates `fragment` onto the message's content.
    pub fn append_to_message(&mut self, session_id: Uuid, message_id: Uuid, fragment: &str) -> bool {
        let exists = self
            .get(session_id)
            .is_some_and(|s| s.message(message_id).is_some());
        if !exists {
            return false;
        }
        match self.get_mut(session_id).and_then(|s| s.message_mut(message_id)) {
            Some(message) => {
                message.content.push_str(fragment);
                true
            }
            None => false,
        }
    }

    /// True while any message in the session is loading or streaming.
    pub fn in_flight(&self, session_id: Uuid) -> bool {
        self.get(session_id).is_some_and(ChatSession::in_flight)
    }

    pub fn children(&self, id: Uuid) -> &[Uuid] {
        self.get(id).map(|s| s.children.as_slice()).unwrap_or(&[])
    }

    pub fn roots(&self) -> Vec<Uuid> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.get(*id).is_some_and(|s| s.parent_id.is_none()))
            .collect()
    }

    /// Parent chain from `id` (exclusive) up to its root (inclusive).
    pub fn ancestors(&self, id: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut cursor = self.get(id).and_then(|s| s.parent_id);
        while let Some(pid) = cursor {
            // a chain longer than the tree means a cycle
            if out.len() >= self.sessions.len() {
                break;
            }
            out.push(pid);
            cursor = self.get(pid).and_then(|s| s.parent_id);
        }
        out
    }

    /// Depth-first pre-order over every tree in the forest, roots in creation order.
    pub fn walk(&self) -> Vec<(usize, &ChatSession)> {
        let mut out = Vec::with_capacity(self.sessions.len());
        let mut stack: Vec<(usize, Uuid)> = self.roots().into_iter().rev().map(|id| (0, id)).collect();
        while let Some((depth, id)) = stack.pop() {
            let Some(session) = self.get(id) else { continue };
            out.push((depth, session));
            stack.extend(session.children.iter().rev().map(|c| (depth + 1, *c)));
        }
        out
    }

    /// Resolves a session from a unique prefix of its id.
    pub fn find_by_prefix(&self, prefix: &str) -> Result<Uuid> {
        if let Ok(id) = Uuid::parse_str(prefix) {
            return self.get(id).map(|s| s.id).ok_or(ChatError::SessionNotFound(id));
        }
        let prefix = prefix.to_ascii_lowercase();
        let mut hits = self
            .order
            .iter()
            .filter(|id| !prefix.is_empty() && id.to_string().starts_with(&prefix));
        match (hits.next(), hits.next()) {
            (Some(id), None) => Ok(*id),
            (Some(_), Some(_)) => Err(ChatError::Validation(format!("session prefix '{prefix}' is ambiguous"))),
            _ => Err(ChatError::Validation(format!("no session matches '{prefix}'"))),
        }
    }

    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        if !self.sessions.contains_key(&self.active) {
            return Err(format!("active session {} does not exist", self.active));
        }
        for (id, session) in &self.sessions {
            if session.id != *id {
                return Err(format!("session keyed {id} carries id {}", session.id));
            }
            if let Some(pid) = session.parent_id {
                let parent = self
                    .get(pid)
                    .ok_or_else(|| format!("session {id} has missing parent {pid}"))?;
                if !parent.children.contains(id) {
                    return Err(format!("parent {pid} does not list child {id}"));
                }
            }
            for child in &session.children {
                match self.get(*child) {
                    Some(c) if c.parent_id == Some(*id) => {}
                    _ => return Err(format!("session {id} lists {child} which is not its child")),
                }
            }
            if self.ancestors(*id).len() >= self.sessions.len() {
                return Err(format!("cycle through session {id}"));
            }
            if session.streaming_count() > 1 {
                return Err(format!("session {id} has more than one streaming message"));
            }
        }
        Ok(())
    }
}

impl Default for SessionTree {
    fn default() -> Self {
        Self::new()
    }
}
