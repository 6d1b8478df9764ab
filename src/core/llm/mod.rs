pub mod error;
pub mod generic_provider;
pub mod normalizer;
pub mod registry;
pub mod sse;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use error::LlmError;
pub use generic_provider::GenericProvider;
pub use normalizer::{ChunkStream, TextStream, collect_text, normalize};
pub use registry::{ProviderDef, ProviderRegistry};

pub const DEFAULT_TEMPERATURE: f32 = 0.2;
pub const DEFAULT_MAX_RETRIES: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Per-call options. Unset fields fall back to the provider's model and the crate defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamConfig {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_retries: Option<u32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    pub model: String,
    pub temperature: f32,
    pub max_retries: u32,
    pub max_tokens: Option<u32>,
}

impl StreamConfig {
    pub fn resolve(&self, provider: &str, default_model: &str) -> Result<StreamOptions, LlmError> {
        let temperature = self.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(LlmError::configuration(
                provider,
                format!("temperature {} is outside 0.0..=2.0", temperature),
            ));
        }
        let model = self
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(default_model);
        if model.is_empty() {
            return Err(LlmError::configuration(provider, "no model configured"));
        }
        Ok(StreamOptions {
            model: model.to_string(),
            temperature,
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            max_tokens: self.max_tokens,
        })
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    fn default_model(&self) -> &str;

    /// Opens the provider-native chunk stream. Returns an empty stream if `cancel` fires first.
    async fn open_chunks(
        &self,
        messages: &[ChatMessage],
        options: &StreamOptions,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, LlmError>;

    /// Streams text deltas for a conversation. Options are validated before any I/O.
    async fn stream_messages(
        &self,
        messages: &[ChatMessage],
        config: &StreamConfig,
        cancel: Option<CancellationToken>,
    ) -> Result<TextStream, LlmError> {
        if messages.is_empty() {
            return Err(LlmError::configuration(
                self.provider_id(),
                "a call needs at least one message",
            ));
        }
        let options = config.resolve(self.provider_id(), self.default_model())?;
        let cancel = cancel.unwrap_or_default();
        let chunks = self.open_chunks(messages, &options, &cancel).await?;
        Ok(normalize(chunks, cancel))
    }

    async fn stream(
        &self,
        prompt: &str,
        config: &StreamConfig,
        cancel: Option<CancellationToken>,
    ) -> Result<TextStream, LlmError> {
        self.stream_messages(&[ChatMessage::user(prompt)], config, cancel)
            .await
    }
}

pub struct LlmManager {
    providers: Vec<Box<dyn LlmProvider>>,
    selected_provider: Option<String>,
    selected_model: Option<String>,
}

impl Default for LlmManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmManager {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            selected_provider: None,
            selected_model: None,
        }
    }

    pub fn register_provider(&mut self, provider: Box<dyn LlmProvider>) {
        info!("Registered LLM Provider: {}", provider.provider_id());
        self.providers.push(provider);
    }

    pub fn set_active(&mut self, provider_id: &str, model_id: Option<String>) {
        info!("Setting active LLM: {} ({:?})", provider_id, model_id);
        self.selected_provider = Some(provider_id.to_string());
        self.selected_model = model_id;
    }

    pub fn get_provider(&self, id: &str) -> Option<&dyn LlmProvider> {
        self.providers
            .iter()
            .find(|p| p.provider_id() == id)
            .map(|p| p.as_ref())
    }

    pub fn list_providers(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.provider_id()).collect()
    }

    pub fn get_active_info(&self) -> (Option<&String>, Option<&String>) {
        (self.selected_provider.as_ref(), self.selected_model.as_ref())
    }

    /// Streams through the active provider. The selected model applies unless `config` names one.
    pub async fn stream_with_selected(
        &self,
        messages: &[ChatMessage],
        config: &StreamConfig,
        cancel: Option<CancellationToken>,
    ) -> Result<TextStream, LlmError> {
        let provider_id = self.selected_provider.as_deref().ok_or_else(|| {
            LlmError::configuration("manager", "no LLM provider selected")
        })?;
        let provider = self.get_provider(provider_id).ok_or_else(|| {
            LlmError::configuration(provider_id, "selected provider is not registered")
        })?;

        let mut config = config.clone();
        if config.model.is_none() {
            config.model = self.selected_model.clone();
        }
        provider.stream_messages(messages, &config, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::normalizer::ProviderChunk;
    use futures_util::stream;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};

    /// Replays canned chunks and records the options it was opened with.
    struct ScriptedProvider {
        chunks: Vec<Value>,
        seen: Arc<Mutex<Vec<StreamOptions>>>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn provider_id(&self) -> &str {
            "scripted"
        }

        fn default_model(&self) -> &str {
            "scripted-1"
        }

        async fn open_chunks(
            &self,
            _messages: &[ChatMessage],
            options: &StreamOptions,
            _cancel: &CancellationToken,
        ) -> Result<ChunkStream, LlmError> {
            self.seen.lock().unwrap().push(options.clone());
            let chunks: Vec<Result<ProviderChunk, LlmError>> = self
                .chunks
                .iter()
                .cloned()
                .map(|c| Ok(ProviderChunk::new(c)))
                .collect();
            Ok(Box::pin(stream::iter(chunks)))
        }
    }

    fn scripted(chunks: Vec<Value>) -> (ScriptedProvider, Arc<Mutex<Vec<StreamOptions>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            ScriptedProvider {
                chunks,
                seen: seen.clone(),
            },
            seen,
        )
    }

    #[test]
    fn config_defaults_apply() {
        let opts = StreamConfig::default().resolve("p", "m").unwrap();
        assert_eq!(opts.model, "m");
        assert_eq!(opts.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(opts.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(opts.max_tokens, None);
    }

    #[test]
    fn config_rejects_out_of_range_temperature() {
        let config = StreamConfig {
            temperature: Some(3.5),
            ..Default::default()
        };
        assert!(matches!(
            config.resolve("p", "m"),
            Err(LlmError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn stream_normalizes_all_chunk_shapes() {
        let (provider, _) = scripted(vec![
            json!("a"),
            json!([{ "text": "b" }, "c"]),
            json!({ "text": "d" }),
            json!({ "other": 1 }),
        ]);
        let text = provider
            .stream("hi", &StreamConfig::default(), None)
            .await
            .unwrap();
        assert_eq!(collect_text(text).await.unwrap(), "abcd");
    }

    #[tokio::test]
    async fn empty_conversation_fails_before_opening() {
        let (provider, seen) = scripted(vec![]);
        let result = provider
            .stream_messages(&[], &StreamConfig::default(), None)
            .await;
        assert!(matches!(result, Err(LlmError::Configuration { .. })));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn manager_routes_to_the_selected_provider_and_model() {
        let (provider, seen) = scripted(vec![json!("ok")]);
        let mut manager = LlmManager::new();
        manager.register_provider(Box::new(provider));

        let unselected = manager
            .stream_with_selected(&[ChatMessage::user("x")], &StreamConfig::default(), None)
            .await;
        assert!(matches!(unselected, Err(LlmError::Configuration { .. })));

        manager.set_active("scripted", Some("scripted-2".into()));
        assert_eq!(manager.list_providers(), vec!["scripted"]);
        let text = manager
            .stream_with_selected(&[ChatMessage::user("x")], &StreamConfig::default(), None)
            .await
            .unwrap();
        assert_eq!(collect_text(text).await.unwrap(), "ok");
        assert_eq!(seen.lock().unwrap()[0].model, "scripted-2");
    }
}
