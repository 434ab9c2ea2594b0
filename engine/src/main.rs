use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use strata_core::{
    AppConfig, ChatRequest, ConfigStore, CONFIG_FILE_NAME, DEFAULT_ENGINE_HOST,
    DEFAULT_ENGINE_PORT,
};
use strata_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use strata_server::{serve, AppState};
use strata_types::{App, InputMessage, InputRole};

const SUPPORTED_PROVIDER_IDS: [&str; 7] = [
    "anthropic",
    "openai",
    "openrouter",
    "ollama",
    "groq",
    "mistral",
    "together",
];

const CLI_USER: &str = "cli";

#[derive(Parser, Debug)]
#[command(name = "strata-engine")]
#[command(about = "Schema-building agent and automation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct RuntimeArgs {
    #[arg(long, env = "STRATA_STATE_DIR")]
    state_dir: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API.
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_ENGINE_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Run one chat request against a fresh in-memory app and print the
    /// event stream as JSON lines.
    Run {
        prompt: String,
        #[arg(long, default_value = "Scratch")]
        app_name: String,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Print the tool catalog.
    Tools {
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            runtime,
        } => {
            let state_dir = resolve_state_dir(runtime.state_dir.clone());
            let (_log_guard, log_info) = init_process_logging(
                ProcessKind::Engine,
                &canonical_logs_dir_from_root(&state_dir),
                14,
            )?;
            info!("engine logging initialized: {:?}", log_info);
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let config = load_config(&state_dir, &runtime).await?;
            log_startup(&state_dir, &addr, &config);
            serve(addr, AppState::in_memory(&config)).await?;
        }
        Command::Run {
            prompt,
            app_name,
            runtime,
        } => {
            let state_dir = resolve_state_dir(runtime.state_dir.clone());
            let (_log_guard, _) = init_process_logging(
                ProcessKind::Engine,
                &canonical_logs_dir_from_root(&state_dir),
                14,
            )?;
            let config = load_config(&state_dir, &runtime).await?;
            let state = AppState::in_memory(&config);
            let stop = CancellationToken::new();
            let listener = state
                .dispatcher
                .clone()
                .map(|dispatcher| dispatcher.spawn(&state.event_bus, stop.clone()));
            let app = state
                .store
                .insert_app(App::new(app_name, CLI_USER))
                .await?;
            let request = ChatRequest {
                app_id: app.id,
                user_id: CLI_USER.to_string(),
                messages: vec![InputMessage {
                    role: InputRole::User,
                    content: prompt,
                }],
                provider: None,
                model: None,
            };
            let mut events = state
                .orchestrator
                .stream_chat(request, CancellationToken::new());
            while let Some(event) = events.next().await {
                println!("{}", serde_json::to_string(&event)?);
            }
            // Automations started by the last tool calls finish before exit.
            stop.cancel();
            if let Some(listener) = listener {
                listener.await?;
            }
        }
        Command::Tools { runtime } => {
            let state_dir = resolve_state_dir(runtime.state_dir.clone());
            let config = load_config(&state_dir, &runtime).await?;
            let state = AppState::in_memory(&config);
            let catalog = state.tools.list();
            println!("{}", serde_json::to_string_pretty(&catalog)?);
        }
    }

    Ok(())
}

async fn load_config(state_dir: &Path, runtime: &RuntimeArgs) -> anyhow::Result<AppConfig> {
    let path = runtime
        .config
        .clone()
        .unwrap_or_else(|| state_dir.join(CONFIG_FILE_NAME));
    let overrides = build_cli_overrides(
        runtime.api_key.clone(),
        runtime.provider.clone(),
        runtime.model.clone(),
    )?;
    let store = ConfigStore::new(&path, overrides).await?;
    Ok(store.get().await)
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Option<Value>> {
    let provider = normalize_and_validate_provider(provider)?;
    if api_key.is_none() && provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let mut root = Map::new();
    if let Some(p) = &provider {
        root.insert("default_provider".to_string(), Value::String(p.clone()));
    }
    if let Some(m) = model.filter(|m| !m.trim().is_empty()) {
        root.insert("agent".to_string(), json!({ "model": m }));
    }
    // A bare --api-key belongs to the selected provider, else anthropic.
    if let Some(key) = api_key {
        let target = provider.as_deref().unwrap_or("anthropic");
        let mut providers = Map::new();
        providers.insert(target.to_string(), json!({ "api_key": key }));
        root.insert("providers".to_string(), Value::Object(providers));
    }
    Ok(Some(Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn resolve_state_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag.filter(|d| !d.as_os_str().is_empty()) {
        return dir;
    }
    dirs::data_dir()
        .map(|dir| dir.join("strata"))
        .unwrap_or_else(|| PathBuf::from(".strata"))
}

fn log_startup(state_dir: &Path, addr: &SocketAddr, config: &AppConfig) {
    let detail = format!(
        "addr={} state_dir={} providers={} automations={}",
        addr,
        state_dir.display(),
        config.providers.len(),
        config.automations.enabled
    );
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            status: Some("starting"),
            detail: Some(&detail),
            ..ObservabilityEvent::new("engine.startup", "engine.main")
        },
    );
    info!("starting strata-engine on http://{addr}");
}
