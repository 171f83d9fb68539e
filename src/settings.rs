use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChatError, Result};

pub const DEFAULT_AGENT_NAME: &str = "AI Assistant";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful AI assistant.";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = 0.0..=2.0;

/// Per-session agent configuration. Owned by exactly one session; branching copies it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub id: Uuid,
    pub name: String,
    pub system_instruction: String,
    pub model: String,
    pub temperature: f32,
}

impl AgentConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn apply_patch(&mut self, patch: AgentConfigPatch) -> Result<()> {
        patch.validate()?;
        if let Some(name) = patch.name { self.name = name; }
        if let Some(si) = patch.system_instruction { self.system_instruction = si; }
        if let Some(model) = patch.model { self.model = model; }
        if let Some(t) = patch.temperature { self.temperature = t; }
        Ok(())
    }

    pub fn to_chat_config(&self) -> ChatConfig {
        ChatConfig {
            model: self.model.clone(),
            temperature: Some(self.temperature),
            system_instruction: Some(self.system_instruction.clone()),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: DEFAULT_AGENT_NAME.into(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.into(),
            model: DEFAULT_MODEL.into(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentConfigPatch {
    pub name: Option<String>,
    pub system_instruction: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

impl AgentConfigPatch {
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self.temperature {
            if !TEMPERATURE_RANGE.contains(&t) {
                return Err(ChatError::Validation(format!("temperature {t} outside [0, 2]")));
            }
        }
        if self.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return Err(ChatError::Validation("model must not be empty".into()));
        }
        Ok(())
    }
}

/// Model configuration as it travels over the wire to the proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChatConfig {
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
}

/// What a provider handle is actually built with.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveSettings {
    pub model: String,
    pub temperature: f32,
    pub system_instruction: Option<String>,
}

/// Request values win; otherwise fall back to process defaults. An explicit `0.0`
/// temperature is honored.
pub fn resolve_effective_settings(request: &ChatConfig) -> EffectiveSettings {
    let model = Some(request.model.trim())
        .filter(|m| !m.is_empty())
        .unwrap_or(DEFAULT_MODEL)
        .to_string();
    let temperature = request.temperature.unwrap_or(DEFAULT_TEMPERATURE);
    let system_instruction = request
        .system_instruction
        .clone()
        .filter(|s| !s.trim().is_empty());
    EffectiveSettings { model, temperature, system_instruction }
}
