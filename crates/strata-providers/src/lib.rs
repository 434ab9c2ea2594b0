use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use strata_types::{ModelInfo, ProviderInfo, StopReason, TokenUsage, ToolSchema};

mod anthropic;
mod openai;
mod sse;

use anthropic::AnthropicProvider;
use openai::OpenAICompatibleProvider;

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: None,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Concatenated text blocks, ignoring tool blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallDelta {
        id: String,
        args_delta: String,
    },
    ToolCallEnd {
        id: String,
    },
    Done {
        stop_reason: StopReason,
        usage: Option<TokenUsage>,
    },
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

/// One model turn request: system prompt, tool catalog and the running
/// conversation, including earlier tool results.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    pub model_override: Option<String>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;
    async fn stream(&self, turn: TurnRequest, cancel: CancellationToken) -> anyhow::Result<ChunkStream>;
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<Vec<Arc<dyn Provider>>>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            providers: Arc::new(build_providers(&settings)),
            default_provider: settings.default_provider,
        }
    }

    /// Registry over explicit provider instances; the first one is the
    /// default unless `default_provider` names another.
    pub fn with_providers(
        providers: Vec<Arc<dyn Provider>>,
        default_provider: Option<String>,
    ) -> Self {
        Self {
            providers: Arc::new(providers),
            default_provider,
        }
    }

    pub fn list(&self) -> Vec<ProviderInfo> {
        self.providers.iter().map(|p| p.info()).collect()
    }

    pub async fn stream_for_provider(
        &self,
        provider_id: Option<&str>,
        turn: TurnRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let provider = self.select_provider(provider_id)?;
        tracing::debug!(
            provider = %provider.info().id,
            messages = turn.messages.len(),
            tools = turn.tools.len(),
            "streaming model turn"
        );
        provider.stream(turn, cancel).await
    }

    fn select_provider(&self, provider_id: Option<&str>) -> anyhow::Result<Arc<dyn Provider>> {
        if let Some(id) = provider_id {
            if let Some(provider) = self.providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            let available = self.providers.iter().map(|p| p.info().id).collect::<Vec<_>>();
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        };

        if let Some(default_id) = self.default_provider.as_deref() {
            if let Some(provider) = self.providers.iter().find(|p| p.info().id == default_id) {
                return Ok(provider.clone());
            }
        };

        let Some(provider) = self.providers.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(provider.clone())
    }
}

/// OpenAI-compatible endpoints: id, display name, default base URL, default
/// model, whether an API key is sent.
const OPENAI_COMPATIBLE: [(&str, &str, &str, &str, bool); 6] = [
    ("ollama", "Ollama", "http://127.0.0.1:11434/v1", "llama3.1:8b", false),
    ("openai", "OpenAI", "https://api.openai.com/v1", "gpt-4o-mini", true),
    (
        "openrouter",
        "OpenRouter",
        "https://openrouter.ai/api/v1",
        "openai/gpt-4o-mini",
        true,
    ),
    (
        "groq",
        "Groq",
        "https://api.groq.com/openai/v1",
        "llama-3.1-8b-instant",
        true,
    ),
    (
        "mistral",
        "Mistral",
        "https://api.mistral.ai/v1",
        "mistral-small-latest",
        true,
    ),
    (
        "together",
        "Together",
        "https://api.together.xyz/v1",
        "meta-llama/Llama-3.1-8B-Instruct-Turbo",
        true,
    ),
];

fn build_providers(settings: &ProviderSettings) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    if let Some(entry) = settings.providers.get("anthropic") {
        providers.push(Arc::new(AnthropicProvider::new(
            resolve_api_key("anthropic", entry),
            entry
                .url
                .as_deref()
                .map(sse::normalize_plain_base)
                .unwrap_or_else(|| "https://api.anthropic.com/v1".to_string()),
            entry
                .default_model
                .clone()
                .unwrap_or_else(|| "claude-3-5-sonnet-latest".to_string()),
            settings.max_tokens,
        )));
    }

    for (id, name, default_url, default_model, use_api_key) in OPENAI_COMPATIBLE {
        let Some(entry) = settings.providers.get(id) else {
            continue;
        };
        providers.push(Arc::new(OpenAICompatibleProvider::new(
            id,
            name,
            sse::normalize_base(entry.url.as_deref().unwrap_or(default_url)),
            if use_api_key {
                resolve_api_key(id, entry)
            } else {
                None
            },
            entry
                .default_model
                .clone()
                .unwrap_or_else(|| default_model.to_string()),
            settings.max_tokens,
        )));
    }

    if providers.is_empty() {
        providers.push(Arc::new(LocalEchoProvider));
    }

    providers
}

fn resolve_api_key(id: &str, entry: &ProviderConfig) -> Option<String> {
    entry
        .api_key
        .as_deref()
        .filter(|key| !is_placeholder_api_key(key))
        .map(|key| key.to_string())
        .or_else(|| env_api_key_for_provider(id))
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

pub fn provider_api_key_env(id: &str) -> Option<&'static str> {
    match id {
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        "together" => Some("TOGETHER_API_KEY"),
        _ => None,
    }
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = provider_api_key_env(id)?;
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Fallback when nothing is configured: echoes the conversation back and
/// never requests tools.
struct LocalEchoProvider;

#[async_trait]
impl Provider for LocalEchoProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "local".to_string(),
            name: "Local Echo".to_string(),
            models: vec![ModelInfo {
                id: "echo-1".to_string(),
                display_name: "Echo Model".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn stream(&self, turn: TurnRequest, _cancel: CancellationToken) -> anyhow::Result<ChunkStream> {
        let prompt = turn
            .messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.text()))
            .collect::<Vec<_>>()
            .join("\n");
        let stream = futures::stream::iter(vec![
            Ok(StreamChunk::TextDelta(format!("Echo: {prompt}"))),
            Ok(StreamChunk::Done {
                stop_reason: StopReason::EndTurn,
                usage: None,
            }),
        ]);
        Ok(Box::pin(stream))
    }
}

fn model_or_default<'a>(model_override: Option<&'a str>, default_model: &'a str) -> &'a str {
    model_override
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(default_model)
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn settings(
        provider_ids: &[&str],
        default_provider: Option<&str>,
    ) -> ProviderSettings {
        let mut providers = HashMap::new();
        for id in provider_ids {
            providers.insert(
                (*id).to_string(),
                ProviderConfig {
                    api_key: Some("sk-test".to_string()),
                    url: None,
                    default_model: Some(format!("{id}-model")),
                },
            );
        }
        ProviderSettings {
            providers,
            default_provider: default_provider.map(|s| s.to_string()),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    #[test]
    fn explicit_provider_wins_over_default_provider() {
        let registry = ProviderRegistry::new(settings(&["openai", "anthropic"], Some("openai")));
        let provider = registry
            .select_provider(Some("anthropic"))
            .expect("provider");
        assert_eq!(provider.info().id, "anthropic");
    }

    #[test]
    fn uses_default_provider_when_explicit_provider_missing() {
        let registry =
            ProviderRegistry::new(settings(&["openai", "openrouter"], Some("openrouter")));
        let provider = registry.select_provider(None).expect("provider");
        assert_eq!(provider.info().id, "openrouter");
    }

    #[test]
    fn anthropic_is_first_when_default_missing() {
        let registry = ProviderRegistry::new(settings(&["openai", "anthropic"], Some("cohere")));
        let provider = registry.select_provider(None).expect("provider");
        assert_eq!(provider.info().id, "anthropic");
    }

    #[test]
    fn explicit_unknown_provider_errors() {
        let registry = ProviderRegistry::new(settings(&["openai"], None));
        let err = registry
            .select_provider(Some("openia"))
            .err()
            .expect("expected error");
        assert!(err.to_string().contains("provider `openia` is not configured"));
    }

    #[tokio::test]
    async fn falls_back_to_local_echo_when_nothing_configured() {
        let registry = ProviderRegistry::new(ProviderSettings::default());
        let turn = TurnRequest {
            system: "sys".to_string(),
            messages: vec![ChatMessage::user_text("hello")],
            tools: Vec::new(),
            model_override: None,
        };
        let mut stream = registry
            .stream_for_provider(None, turn, CancellationToken::new())
            .await
            .expect("stream");
        let first = stream.next().await.expect("chunk").expect("ok");
        assert_eq!(first, StreamChunk::TextDelta("Echo: user: hello".to_string()));
        let last = stream.next().await.expect("chunk").expect("ok");
        assert!(matches!(
            last,
            StreamChunk::Done {
                stop_reason: StopReason::EndTurn,
                ..
            }
        ));
    }

    #[test]
    fn truncate_for_error_respects_char_boundaries() {
        assert_eq!(truncate_for_error("abc", 10), "abc");
        assert_eq!(truncate_for_error("héllo", 2), "h...");
    }
}
