use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{ChatError, Result};
use crate::session::{ChatMessage, Role};
use crate::settings::{resolve_effective_settings, ChatConfig, EffectiveSettings};
use crate::sse::decode_stream;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub type FragmentStream = BoxStream<'static, Result<String>>;

/// Speaker vocabulary on the provider side: there is no assistant, only the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderTurn {
    pub role: ProviderRole,
    pub text: String,
}

/// Everything a provider needs to open a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleSeed {
    pub history: Vec<ProviderTurn>,
    pub settings: EffectiveSettings,
}

impl HandleSeed {
    /// `assistant` turns become `model` turns. System messages are not turns; their
    /// text is folded into the system instruction.
    pub fn from_messages(prior: &[ChatMessage], config: &ChatConfig) -> Self {
        let mut settings = resolve_effective_settings(config);
        let mut history = Vec::with_capacity(prior.len());
        let mut system_extra = Vec::new();
        for m in prior {
            match m.role {
                Role::User => history.push(ProviderTurn { role: ProviderRole::User, text: m.content.clone() }),
                Role::Assistant => history.push(ProviderTurn { role: ProviderRole::Model, text: m.content.clone() }),
                Role::System => system_extra.push(m.content.as_str()),
            }
        }
        if !system_extra.is_empty() {
            let mut parts: Vec<&str> = settings.system_instruction.as_deref().into_iter().collect();
            parts.extend(system_extra);
            settings.system_instruction = Some(parts.join("\n\n"));
        }
        Self { history, settings }
    }
}

/// A live provider-side conversation. Implementations keep their own history.
#[async_trait]
pub trait ChatHandle: Send + Sync {
    async fn send(&self, text: &str) -> Result<String>;
    async fn send_stream(&self, text: &str) -> Result<FragmentStream>;
}

pub trait ChatProvider: Send + Sync {
    fn create_handle(&self, seed: HandleSeed) -> Arc<dyn ChatHandle>;
}

#[derive(Clone)]
pub struct GeminiProvider {
    client: reqwest::Client,
    pub base_url: String,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into(), api_key: api_key.into() }
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GOOGLE_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ChatError::Configuration("API key not configured".into()))?;
        let base_url = std::env::var("GEMINI_BASE_URL").unwrap_or_else(|_| DEFAULT_GEMINI_BASE_URL.into());
        Ok(Self::new(base_url, api_key))
    }
}

impl ChatProvider for GeminiProvider {
    fn create_handle(&self, seed: HandleSeed) -> Arc<dyn ChatHandle> {
        let history = seed.history.into_iter().map(GeminiContent::from).collect();
        Arc::new(GeminiChat {
            client: self.client.clone(),
            base_url: self.base_url.trim_end_matches('/').to_string(),
            api_key: self.api_key.clone(),
            settings: seed.settings,
            history: Arc::new(Mutex::new(history)),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<ProviderRole>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

impl GeminiContent {
    fn turn(role: ProviderRole, text: &str) -> Self {
        Self { role: Some(role), parts: vec![GeminiPart { text: text.to_string() }] }
    }

    fn text(&self) -> String {
        self.parts.iter().map(|p| p.text.as_str()).collect()
    }
}

impl From<ProviderTurn> for GeminiContent {
    fn from(t: ProviderTurn) -> Self {
        Self { role: Some(t.role), parts: vec![GeminiPart { text: t.text }] }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    contents: &'a [GeminiContent],
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

impl GeminiResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(GeminiContent::text)
            .unwrap_or_default()
    }
}

struct GeminiChat {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    settings: EffectiveSettings,
    history: Arc<Mutex<Vec<GeminiContent>>>,
}

impl GeminiChat {
    fn request_body<'a>(&self, contents: &'a [GeminiContent]) -> GeminiRequest<'a> {
        GeminiRequest {
            contents,
            system_instruction: self.settings.system_instruction.as_ref().map(|si| GeminiContent {
                role: None,
                parts: vec![GeminiPart { text: si.clone() }],
            }),
            generation_config: GenerationConfig { temperature: self.settings.temperature },
        }
    }

    async fn post(&self, action: &str, contents: &[GeminiContent]) -> Result<reqwest::Response> {
        let url = format!("{}/models/{}:{}", self.base_url, self.settings.model, action);
        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request_body(contents))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ChatError::Backend(format!("gemini {action} failed: {status} {body}")));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatHandle for GeminiChat {
    async fn send(&self, text: &str) -> Result<String> {
        let mut history = self.history.lock().await;
        let mut contents = history.clone();
        contents.push(GeminiContent::turn(ProviderRole::User, text));
        let resp = self.post("generateContent", &contents).await?;
        let v: GeminiResponse = resp.json().await?;
        let reply = v.text();
        contents.push(GeminiContent::turn(ProviderRole::Model, &reply));
        *history = contents;
        Ok(reply)
    }

    async fn send_stream(&self, text: &str) -> Result<FragmentStream> {
        // Held until the reply is recorded, so turns on one handle never interleave.
        let mut history = self.history.clone().lock_owned().await;
        let mut contents = history.clone();
        contents.push(GeminiContent::turn(ProviderRole::User, text));
        let resp = self.post("streamGenerateContent?alt=sse", &contents).await?;
        let model = self.settings.model.clone();

        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        tokio::spawn(async move {
            let mut frames = Box::pin(decode_stream(resp.bytes_stream()));
            let mut reply = String::new();
            while let Some(frame) = frames.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(%model, error = %e, "gemini stream interrupted");
                        let _ = tx.send(Err(ChatError::StreamFailure(e.to_string()))).await;
                        return;
                    }
                };
                let parsed: GeminiResponse = match serde_json::from_str(&frame.data) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(%model, error = %e, "skipping malformed gemini chunk");
                        continue;
                    }
                };
                let fragment = parsed.text();
                if fragment.is_empty() {
                    continue;
                }
                reply.push_str(&fragment);
                if tx.send(Ok(fragment)).await.is_err() {
                    tracing::debug!(%model, "stream consumer went away");
                    return;
                }
            }
            contents.push(GeminiContent::turn(ProviderRole::Model, &reply));
            *history = contents;
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}
