use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use strata_core::{
    AgentOrchestrator, AppConfig, AutomationDispatcher, CommandScriptEngine, EventBus,
    ScriptEngine, ScriptSandboxRunner, UnavailableScriptEngine,
};
use strata_providers::{ProviderRegistry, ProviderSettings};
use strata_store::{MemoryStore, Store};
use strata_tools::ToolRegistry;

mod http;

pub use http::{app_router, serve};

/// Request header carrying the caller's user id. Used for tenancy only.
pub const USER_HEADER: &str = "x-strata-user";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub event_bus: EventBus,
    pub tools: ToolRegistry,
    pub providers: ProviderRegistry,
    pub orchestrator: AgentOrchestrator,
    pub dispatcher: Option<Arc<AutomationDispatcher>>,
    pub started_at_ms: u64,
}

impl AppState {
    /// Wires store, bus, tools, providers and the automation pipeline from
    /// the effective configuration.
    pub fn from_config(config: &AppConfig, store: Arc<dyn Store>) -> Self {
        let event_bus = EventBus::new();
        let tools = ToolRegistry::new(store.clone(), Arc::new(event_bus.clone()));
        let providers = ProviderRegistry::new(ProviderSettings::from(config));
        let orchestrator = AgentOrchestrator::new(store.clone(), tools.clone(), providers.clone())
            .with_max_iterations(config.agent.max_iterations)
            .with_default_model(config.agent.model.clone());

        let dispatcher = config.automations.enabled.then(|| {
            let engine: Arc<dyn ScriptEngine> = match config.automations.command.as_deref() {
                Some(command) if !command.trim().is_empty() => Arc::new(CommandScriptEngine::new(
                    command.trim(),
                    config.automations.args.clone(),
                    Duration::from_millis(config.automations.timeout_ms.max(1)),
                )),
                _ => {
                    tracing::warn!("automations enabled without an interpreter; runs will fail");
                    Arc::new(UnavailableScriptEngine)
                }
            };
            let runner = ScriptSandboxRunner::new(engine, store.clone(), Arc::new(event_bus.clone()));
            Arc::new(AutomationDispatcher::new(store.clone(), Arc::new(runner)))
        });

        Self {
            store,
            event_bus,
            tools,
            providers,
            orchestrator,
            dispatcher,
            started_at_ms: now_ms(),
        }
    }

    pub fn in_memory(config: &AppConfig) -> Self {
        Self::from_config(config, Arc::new(MemoryStore::new()))
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
