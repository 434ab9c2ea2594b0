use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use strata_providers::{ProviderConfig, ProviderSettings, DEFAULT_MAX_TOKENS};

use crate::MAX_ITERATIONS;

pub const CONFIG_FILE_NAME: &str = "strata.json";
pub const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: MAX_ITERATIONS,
            max_tokens: DEFAULT_MAX_TOKENS,
            model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interpreter for automation scripts. Without one, automation runs are
    /// recorded as failed.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: None,
            args: Vec::new(),
            timeout_ms: DEFAULT_SCRIPT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub automations: AutomationConfig,
}

impl From<&AppConfig> for ProviderSettings {
    fn from(value: &AppConfig) -> Self {
        Self {
            providers: value.providers.clone(),
            default_provider: value.default_provider.clone(),
            max_tokens: value.agent.max_tokens,
        }
    }
}

fn default_max_iterations() -> usize {
    MAX_ITERATIONS
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    DEFAULT_SCRIPT_TIMEOUT_MS
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    cli: Value,
}

/// Effective configuration from three JSON layers merged in order:
/// config file, environment, command line. The file is only ever read.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        Self::with_env(path, cli_overrides, |key| std::env::var(key).ok()).await
    }

    /// Like [`ConfigStore::new`] with an explicit environment lookup.
    pub async fn with_env(
        path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = read_json_file(&path).await?;
        let layers = ConfigLayers {
            file,
            env: env_layer(&lookup),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        let mut config = match serde_json::from_value::<AppConfig>(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("invalid configuration, using defaults: {err}");
                AppConfig::default()
            }
        };
        config.agent.max_iterations = config.agent.max_iterations.clamp(1, MAX_ITERATIONS);
        config
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    /// Per-layer view with provider keys masked, for diagnostics.
    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        let mut out = json!({
            "file": layers.file,
            "env": layers.env,
            "cli": layers.cli
        });
        if let Some(map) = out.as_object_mut() {
            for layer in map.values_mut() {
                mask_secrets(layer);
            }
        }
        out
    }

    /// Replaces the command-line layer, e.g. after a reload.
    pub async fn set_cli_overrides(&self, overrides: Value) {
        self.layers.write().await.cli = overrides;
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) if value.is_object() => Ok(value),
        Ok(_) | Err(_) => {
            tracing::warn!(path = %path.display(), "ignoring unreadable config file");
            Ok(empty_object())
        }
    }
}

fn mask_secrets(value: &mut Value) {
    let Some(providers) = value
        .get_mut("providers")
        .and_then(|v| v.as_object_mut())
    else {
        return;
    };
    for cfg in providers.values_mut().filter_map(|v| v.as_object_mut()) {
        for key in ["api_key", "apiKey"] {
            if let Some(secret) = cfg.get_mut(key) {
                let masked = secret
                    .as_str()
                    .map(strata_observability::redact_text)
                    .unwrap_or_default();
                *secret = Value::String(masked);
            }
        }
    }
}

fn env_layer(lookup: &impl Fn(&str) -> Option<String>) -> Value {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let mut root = empty_object();

    if let Some(provider) = get("STRATA_PROVIDER") {
        deep_merge(&mut root, &json!({ "default_provider": provider.trim() }));
    }
    if let Some(model) = get("STRATA_MODEL") {
        deep_merge(&mut root, &json!({ "agent": { "model": model.trim() } }));
    }
    if let Some(max) = get("STRATA_MAX_ITERATIONS").and_then(|v| v.trim().parse::<usize>().ok()) {
        deep_merge(&mut root, &json!({ "agent": { "max_iterations": max } }));
    }

    for (provider, key_env) in [
        ("anthropic", "ANTHROPIC_API_KEY"),
        ("openai", "OPENAI_API_KEY"),
        ("openrouter", "OPENROUTER_API_KEY"),
        ("groq", "GROQ_API_KEY"),
    ] {
        if let Some(api_key) = get(key_env) {
            deep_merge(
                &mut root,
                &json!({ "providers": { provider: { "api_key": api_key } } }),
            );
        }
    }
    if let Some(url) = get("OLLAMA_URL") {
        deep_merge(&mut root, &json!({ "providers": { "ollama": { "url": url } } }));
    }

    if let Some(enabled) = get("STRATA_AUTOMATIONS_ENABLED").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "automations": { "enabled": enabled } }));
    }
    if let Some(command) = get("STRATA_SANDBOX_COMMAND") {
        let mut parts = command.split_whitespace().map(str::to_string);
        if let Some(program) = parts.next() {
            let args = parts.collect::<Vec<_>>();
            deep_merge(
                &mut root,
                &json!({ "automations": { "command": program, "args": args } }),
            );
        }
    }
    if let Some(timeout) =
        get("STRATA_SANDBOX_TIMEOUT_MS").and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "automations": { "timeout_ms": timeout } }));
    }

    root
}

pub fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Objects merge key by key; any other overlay value replaces the base.
/// Nulls in the overlay are skipped.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
