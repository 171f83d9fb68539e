//! Per-session cache of provider chat handles.
//!
//! A handle is built once, from the history and config supplied on the first
//! request for a session, and reused afterwards. Later config changes do not reach
//! an existing handle until it is cleared.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{ChatError, Result};
use crate::models::{ChatHandle, ChatProvider, FragmentStream, HandleSeed};
use crate::session::ChatMessage;
use crate::settings::ChatConfig;

pub struct ConversationProxy {
    provider: Arc<dyn ChatProvider>,
    handles: Mutex<HashMap<String, Arc<dyn ChatHandle>>>,
}

impl ConversationProxy {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self { provider, handles: Mutex::new(HashMap::new()) }
    }

    /// Returns the cached handle for `session_id`, creating it from `prior` and
    /// `config` if there is none. Lookup and insert happen under one lock, so two
    /// concurrent first requests for a session share a single handle.
    pub async fn get_or_create_handle(
        &self,
        session_id: &str,
        prior: &[ChatMessage],
        config: &ChatConfig,
    ) -> Arc<dyn ChatHandle> {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(session_id) {
            return handle.clone();
        }
        let seed = HandleSeed::from_messages(prior, config);
        tracing::info!(%session_id, model = %seed.settings.model, history = seed.history.len(), "creating chat handle");
        let handle = self.provider.create_handle(seed);
        handles.insert(session_id.to_string(), handle.clone());
        handle
    }

    async fn handle(&self, session_id: &str) -> Result<Arc<dyn ChatHandle>> {
        self.handles
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ChatError::SessionNotInitialized(session_id.to_string()))
    }

    pub async fn send(&self, session_id: &str, text: &str) -> Result<String> {
        let handle = self.handle(session_id).await?;
        handle.send(text).await
    }

    pub async fn send_stream(&self, session_id: &str, text: &str) -> Result<FragmentStream> {
        let handle = self.handle(session_id).await?;
        handle.send_stream(text).await
    }

    pub async fn clear(&self, session_id: &str) -> bool {
        self.handles.lock().await.remove(session_id).is_some()
    }

    pub async fn clear_all(&self) -> usize {
        let mut handles = self.handles.lock().await;
        let n = handles.len();
        handles.clear();
        n
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.handles.lock().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Echoes the settings it was built with; streams a fixed script.
    pub struct EchoHandle {
        pub seed: HandleSeed,
        pub script: Vec<Result<String>>,
        pub sent: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatHandle for EchoHandle {
        async fn send(&self, text: &str) -> Result<String> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(format!("[{} t={}] {}", self.seed.settings.model, self.seed.settings.temperature, text))
        }

        async fn send_stream(&self, text: &str) -> Result<FragmentStream> {
            self.sent.lock().unwrap().push(text.to_string());
            let items: Vec<Result<String>> = self
                .script
                .iter()
                .map(|r| match r {
                    Ok(s) => Ok(s.clone()),
                    Err(e) => Err(ChatError::Backend(e.to_string())),
                })
                .collect();
            Ok(futures::stream::iter(items).boxed())
        }
    }

    #[derive(Default)]
    pub struct EchoProvider {
        pub created: AtomicUsize,
        pub script: Vec<Result<String>>,
        pub seeds: StdMutex<Vec<HandleSeed>>,
    }

    impl EchoProvider {
        pub fn scripted(script: Vec<Result<String>>) -> Self {
            Self { script, ..Default::default() }
        }
    }

    impl ChatProvider for EchoProvider {
        fn create_handle(&self, seed: HandleSeed) -> Arc<dyn ChatHandle> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.seeds.lock().unwrap().push(seed.clone());
            let script = self
                .script
                .iter()
                .map(|r| match r {
                    Ok(s) => Ok(s.clone()),
                    Err(e) => Err(ChatError::Backend(e.to_string())),
                })
                .collect();
            Arc::new(EchoHandle { seed, script, sent: StdMutex::new(Vec::new()) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::EchoProvider;
    use super::*;
    use crate::models::ProviderRole;
    use crate::session::Role;
    use futures::StreamExt;
    use std::sync::atomic::Ordering;

    fn cfg(model: &str, temperature: f32) -> ChatConfig {
        ChatConfig { model: model.into(), temperature: Some(temperature), system_instruction: None }
    }

    #[tokio::test]
    async fn send_requires_initialized_handle() {
        let proxy = ConversationProxy::new(Arc::new(EchoProvider::default()));
        assert!(matches!(proxy.send("s1", "hi").await, Err(ChatError::SessionNotInitialized(id)) if id == "s1"));
        assert!(matches!(proxy.send_stream("s1", "hi").await, Err(ChatError::SessionNotInitialized(_))));
    }

    #[tokio::test]
    async fn handle_is_created_once_per_session() {
        let provider = Arc::new(EchoProvider::default());
        let proxy = ConversationProxy::new(provider.clone());
        let prior = vec![
            ChatMessage { role: Role::User, content: "q".into() },
            ChatMessage { role: Role::Assistant, content: "a".into() },
        ];
        proxy.get_or_create_handle("s1", &prior, &cfg("m", 0.5)).await;
        proxy.get_or_create_handle("s1", &[], &cfg("m", 0.5)).await;
        proxy.get_or_create_handle("s2", &[], &cfg("m", 0.5)).await;
        assert_eq!(provider.created.load(Ordering::SeqCst), 2);
        assert_eq!(proxy.len().await, 2);

        let seeds = provider.seeds.lock().unwrap();
        assert_eq!(seeds[0].history[1].role, ProviderRole::Model);
        assert_eq!(seeds[0].history[1].text, "a");
    }

    #[tokio::test]
    async fn config_change_after_first_use_is_ignored_until_cleared() {
        let proxy = ConversationProxy::new(Arc::new(EchoProvider::default()));
        proxy.get_or_create_handle("s", &[], &cfg("model-a", 0.2)).await;
        assert_eq!(proxy.send("s", "x").await.unwrap(), "[model-a t=0.2] x");

        // new config, same session: the cached handle still wins
        proxy.get_or_create_handle("s", &[], &cfg("model-b", 1.0)).await;
        assert_eq!(proxy.send("s", "x").await.unwrap(), "[model-a t=0.2] x");

        assert!(proxy.clear("s").await);
        assert!(!proxy.clear("s").await);
        proxy.get_or_create_handle("s", &[], &cfg("model-b", 1.0)).await;
        assert_eq!(proxy.send("s", "x").await.unwrap(), "[model-b t=1] x");
    }

    #[tokio::test]
    async fn concurrent_first_use_shares_one_handle() {
        let provider = Arc::new(EchoProvider::default());
        let proxy = Arc::new(ConversationProxy::new(provider.clone()));
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let proxy = proxy.clone();
                tokio::spawn(async move { proxy.get_or_create_handle("same", &[], &cfg(&format!("m{i}"), 0.7)).await })
            })
            .collect();
        let mut handles = Vec::new();
        for t in tasks {
            handles.push(t.await.unwrap());
        }
        assert_eq!(provider.created.load(Ordering::SeqCst), 1);
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn clear_all_evicts_everything() {
        let proxy = ConversationProxy::new(Arc::new(EchoProvider::default()));
        for id in ["a", "b", "c"] {
            proxy.get_or_create_handle(id, &[], &ChatConfig::default()).await;
        }
        assert_eq!(proxy.clear_all().await, 3);
        assert!(!proxy.contains("a").await);
        assert!(matches!(proxy.send("a", "x").await, Err(ChatError::SessionNotInitialized(_))));
    }

    #[tokio::test]
    async fn send_stream_goes_through_cached_handle() {
        let provider = Arc::new(EchoProvider::scripted(vec![Ok("Hel".into()), Ok("lo".into())]));
        let proxy = ConversationProxy::new(provider);
        proxy.get_or_create_handle("s", &[], &ChatConfig::default()).await;
        let out: Vec<String> = proxy
            .send_stream("s", "go")
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out.concat(), "Hello");
    }
}
