use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use strata_observability::{emit_event, ObservabilityEvent, ProcessKind};
use strata_store::Store;
use strata_types::{Automation, AutomationFilter, RecordEvent};

use crate::{panic_error, EventBus, SandboxRunner};

/// Routes record events to the enabled automations of the same app, type and
/// trigger. Each match runs in its own task so one failure never blocks the
/// others.
pub struct AutomationDispatcher {
    store: Arc<dyn Store>,
    runner: Arc<dyn SandboxRunner>,
}

impl AutomationDispatcher {
    pub fn new(store: Arc<dyn Store>, runner: Arc<dyn SandboxRunner>) -> Self {
        Self { store, runner }
    }

    /// Starts one runner task per matching automation and returns their
    /// handles. Events raised by automations are ignored.
    pub async fn handle_event(&self, event: RecordEvent) -> anyhow::Result<Vec<JoinHandle<()>>> {
        Ok(self
            .prepare(event)
            .await?
            .into_iter()
            .map(tokio::spawn)
            .collect())
    }

    /// Listens on `bus` until it closes or `stop` fires. On stop, events
    /// already queued are still dispatched and every started automation is
    /// awaited before the task ends. Subscribes before spawning so no event
    /// published after this call returns is missed.
    pub fn spawn(self: Arc<Self>, bus: &EventBus, stop: CancellationToken) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            let mut running = JoinSet::new();
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(event) => self.dispatch_into(event, &mut running).await,
                        Err(RecvError::Lagged(skipped)) => report_lag(skipped),
                        Err(RecvError::Closed) => break,
                    },
                    _ = stop.cancelled() => {
                        loop {
                            match rx.try_recv() {
                                Ok(event) => self.dispatch_into(event, &mut running).await,
                                Err(TryRecvError::Lagged(skipped)) => report_lag(skipped),
                                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                            }
                        }
                        break;
                    }
                }
                while running.try_join_next().is_some() {}
            }
            while running.join_next().await.is_some() {}
        })
    }

    async fn dispatch_into(&self, event: RecordEvent, running: &mut JoinSet<()>) {
        match self.prepare(event).await {
            Ok(tasks) => {
                for task in tasks {
                    running.spawn(task);
                }
            }
            Err(err) => tracing::warn!("automation lookup failed: {err:#}"),
        }
    }

    async fn prepare(
        &self,
        event: RecordEvent,
    ) -> anyhow::Result<Vec<BoxFuture<'static, ()>>> {
        if event.triggered_by_automation {
            return Ok(Vec::new());
        }
        let filter = AutomationFilter {
            app_id: event.app_id.clone(),
            type_id: event.type_id.clone(),
            trigger: event.kind.into(),
            enabled_only: true,
        };
        let matches = self.store.find_automations(&filter).await?;
        if matches.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(
            app_id = %event.app_id,
            record_id = %event.record_id,
            matches = matches.len(),
            "dispatching record event"
        );

        let event = Arc::new(event);
        Ok(matches
            .into_iter()
            .map(|automation| run_one(self.runner.clone(), automation, event.clone()).boxed())
            .collect())
    }
}

async fn run_one(runner: Arc<dyn SandboxRunner>, automation: Automation, event: Arc<RecordEvent>) {
    let result = AssertUnwindSafe(runner.run_automation(&automation, &event))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(panic_error(panic)));
    match result {
        Ok(()) => emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                app_id: Some(&automation.app_id),
                automation_id: Some(&automation.id),
                record_id: Some(&event.record_id),
                status: Some("success"),
                ..ObservabilityEvent::new("automation.succeeded", "automation.dispatch")
            },
        ),
        Err(err) => {
            let detail = format!("{err:#}");
            emit_event(
                Level::WARN,
                ProcessKind::Engine,
                ObservabilityEvent {
                    app_id: Some(&automation.app_id),
                    automation_id: Some(&automation.id),
                    record_id: Some(&event.record_id),
                    status: Some("failed"),
                    error_code: Some("AUTOMATION_FAILED"),
                    detail: Some(&detail),
                    ..ObservabilityEvent::new("automation.failed", "automation.dispatch")
                },
            );
        }
    }
}

fn report_lag(skipped: u64) {
    let detail = format!("skipped {skipped} record events");
    emit_event(
        Level::WARN,
        ProcessKind::Engine,
        ObservabilityEvent {
            status: Some("lagged"),
            detail: Some(&detail),
            ..ObservabilityEvent::new("automation.lagged", "automation.dispatch")
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    use crate::{ScriptEngine, ScriptInput, ScriptOutput, ScriptSandboxRunner};
    use strata_store::MemoryStore;
    use strata_tools::{ToolContext, ToolRegistry};
    use strata_types::{
        App, Automation, AutomationTrigger, Record, RecordData, RunStatus, SchemaType,
    };

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<(String, RecordEvent)>>,
    }

    #[async_trait]
    impl SandboxRunner for RecordingRunner {
        async fn run_automation(&self, automation: &Automation, event: &RecordEvent) -> anyhow::Result<()> {
            self.calls
                .lock()
                .await
                .push((automation.id.clone(), event.clone()));
            Ok(())
        }
    }

    /// Fails scripts whose code is `fail`.
    struct CodeSwitchEngine;

    #[async_trait]
    impl ScriptEngine for CodeSwitchEngine {
        async fn execute(&self, script: &str, _input: &ScriptInput) -> anyhow::Result<ScriptOutput> {
            if script == "fail" {
                anyhow::bail!("boom");
            }
            Ok(ScriptOutput::default())
        }
    }

    async fn seeded(store: &MemoryStore) -> (App, SchemaType) {
        let app = store.insert_app(App::new("crm", "u1")).await.expect("app");
        let ty = store
            .insert_type(SchemaType::new(&app.id, "Contact", 0))
            .await
            .expect("type");
        (app, ty)
    }

    async fn automation(
        store: &MemoryStore,
        app_id: &str,
        type_id: Option<&str>,
        trigger: AutomationTrigger,
        code: &str,
    ) -> Automation {
        store
            .insert_automation(Automation::new(
                app_id,
                type_id.map(str::to_string),
                code,
                trigger,
                code,
                "u1",
            ))
            .await
            .expect("automation")
    }

    fn created_event(app_id: &str, type_id: &str) -> RecordEvent {
        let record = Record::new(type_id, RecordData::new(), "u1");
        RecordEvent::created(app_id, &record, "u1")
    }

    async fn join_all(handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            handle.await.expect("task");
        }
    }

    #[tokio::test]
    async fn invokes_runner_once_per_matching_automation() {
        let store = Arc::new(MemoryStore::new());
        let (app, ty) = seeded(&store).await;
        let first = automation(&store, &app.id, Some(&ty.id), AutomationTrigger::RecordCreated, "a").await;
        let second = automation(&store, &app.id, Some(&ty.id), AutomationTrigger::RecordCreated, "b").await;
        automation(&store, &app.id, None, AutomationTrigger::RecordCreated, "app-wide").await;
        automation(&store, &app.id, Some(&ty.id), AutomationTrigger::RecordUpdated, "c").await;
        automation(&store, &app.id, Some(&ty.id), AutomationTrigger::Manual, "d").await;

        let runner = Arc::new(RecordingRunner::default());
        let dispatcher = AutomationDispatcher::new(store.clone(), runner.clone());
        let handles = dispatcher
            .handle_event(created_event(&app.id, &ty.id))
            .await
            .expect("dispatch");
        assert_eq!(handles.len(), 2);
        join_all(handles).await;

        let mut ids: Vec<String> = runner.calls.lock().await.iter().map(|(id, _)| id.clone()).collect();
        ids.sort();
        let mut expected = vec![first.id, second.id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn automation_events_are_never_dispatched() {
        let store = Arc::new(MemoryStore::new());
        let (app, ty) = seeded(&store).await;
        automation(&store, &app.id, Some(&ty.id), AutomationTrigger::RecordCreated, "a").await;
        let runner = Arc::new(RecordingRunner::default());
        let dispatcher = AutomationDispatcher::new(store.clone(), runner.clone());

        let handles = dispatcher
            .handle_event(created_event(&app.id, &ty.id).from_automation())
            .await
            .expect("dispatch");
        assert!(handles.is_empty());
        assert!(runner.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn disabled_and_foreign_automations_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let (app, ty) = seeded(&store).await;
        let other_app = store.insert_app(App::new("other", "u2")).await.expect("app");
        let other_type = store
            .insert_type(SchemaType::new(&app.id, "Deal", 1))
            .await
            .expect("type");
        let disabled = automation(&store, &app.id, Some(&ty.id), AutomationTrigger::RecordCreated, "a").await;
        store
            .update_automation(
                &disabled.id,
                strata_types::AutomationPatch {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .expect("disable");
        automation(&store, &other_app.id, None, AutomationTrigger::RecordCreated, "b").await;
        automation(&store, &app.id, Some(&other_type.id), AutomationTrigger::RecordCreated, "c").await;

        let runner = Arc::new(RecordingRunner::default());
        let dispatcher = AutomationDispatcher::new(store.clone(), runner.clone());
        let handles = dispatcher
            .handle_event(created_event(&app.id, &ty.id))
            .await
            .expect("dispatch");
        assert!(handles.is_empty());
    }

    #[tokio::test]
    async fn one_failure_does_not_block_siblings() {
        let store = Arc::new(MemoryStore::new());
        let (app, ty) = seeded(&store).await;
        let failing = automation(&store, &app.id, Some(&ty.id), AutomationTrigger::RecordCreated, "fail").await;
        let passing = automation(&store, &app.id, Some(&ty.id), AutomationTrigger::RecordCreated, "ok").await;

        let bus = EventBus::new();
        let runner = Arc::new(ScriptSandboxRunner::new(
            Arc::new(CodeSwitchEngine),
            store.clone(),
            Arc::new(bus.clone()),
        ));
        let dispatcher = AutomationDispatcher::new(store.clone(), runner);
        let handles = dispatcher
            .handle_event(created_event(&app.id, &ty.id))
            .await
            .expect("dispatch");
        join_all(handles).await;

        let failed = store.list_automation_runs(&failing.id).await.expect("runs");
        let succeeded = store.list_automation_runs(&passing.id).await.expect("runs");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, RunStatus::Failed);
        assert_eq!(failed[0].error.as_deref(), Some("boom"));
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].status, RunStatus::Success);
    }

    struct PanickingRunner;

    #[async_trait]
    impl SandboxRunner for PanickingRunner {
        async fn run_automation(&self, _automation: &Automation, _event: &RecordEvent) -> anyhow::Result<()> {
            panic!("runner crashed");
        }
    }

    struct PanickingEngine;

    #[async_trait]
    impl ScriptEngine for PanickingEngine {
        async fn execute(&self, _script: &str, _input: &ScriptInput) -> anyhow::Result<ScriptOutput> {
            let empty: Vec<ScriptOutput> = Vec::new();
            Ok(empty[3].clone())
        }
    }

    #[tokio::test]
    async fn panicking_runners_are_contained() {
        let store = Arc::new(MemoryStore::new());
        let (app, ty) = seeded(&store).await;
        let target = automation(&store, &app.id, Some(&ty.id), AutomationTrigger::RecordCreated, "a").await;

        let dispatcher = AutomationDispatcher::new(store.clone(), Arc::new(PanickingRunner));
        let handles = dispatcher
            .handle_event(created_event(&app.id, &ty.id))
            .await
            .expect("dispatch");
        assert_eq!(handles.len(), 1);
        join_all(handles).await;

        let runner = Arc::new(ScriptSandboxRunner::new(
            Arc::new(PanickingEngine),
            store.clone(),
            Arc::new(EventBus::new()),
        ));
        let dispatcher = AutomationDispatcher::new(store.clone(), runner);
        let handles = dispatcher
            .handle_event(created_event(&app.id, &ty.id))
            .await
            .expect("dispatch");
        join_all(handles).await;

        let runs = store.list_automation_runs(&target.id).await.expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0]
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("automation panicked")));
    }

    #[tokio::test]
    async fn failing_automation_does_not_fail_the_record_write() {
        let store = Arc::new(MemoryStore::new());
        let (app, ty) = seeded(&store).await;
        let failing = automation(&store, &app.id, Some(&ty.id), AutomationTrigger::RecordCreated, "fail").await;
        let passing = automation(&store, &app.id, Some(&ty.id), AutomationTrigger::RecordCreated, "ok").await;

        let bus = EventBus::new();
        let runner = Arc::new(ScriptSandboxRunner::new(
            Arc::new(CodeSwitchEngine),
            store.clone(),
            Arc::new(bus.clone()),
        ));
        let listener = Arc::new(AutomationDispatcher::new(store.clone(), runner))
            .spawn(&bus, CancellationToken::new());
        let registry = ToolRegistry::new(store.clone(), Arc::new(bus.clone()));
        let ctx = ToolContext::new(&app.id, "u1");

        let created = registry
            .execute("create_record", json!({"type_id": ty.id, "data": {}}), &ctx)
            .await;
        assert!(created.success, "{:?}", created.error);
        assert!(created.error.is_none());

        let mut failed = Vec::new();
        let mut succeeded = Vec::new();
        for _ in 0..50 {
            failed = store.list_automation_runs(&failing.id).await.expect("runs");
            succeeded = store.list_automation_runs(&passing.id).await.expect("runs");
            if !failed.is_empty() && !succeeded.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, RunStatus::Failed);
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].status, RunStatus::Success);
        assert_eq!(store.count_records(&ty.id).await.expect("count"), 1);

        listener.abort();
    }

    /// Finishes each run only after a short delay.
    #[derive(Default)]
    struct SlowRunner {
        finished: AtomicUsize,
    }

    #[async_trait]
    impl SandboxRunner for SlowRunner {
        async fn run_automation(&self, _automation: &Automation, _event: &RecordEvent) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn stopping_the_listener_drains_queued_events_and_running_automations() {
        let store = Arc::new(MemoryStore::new());
        let (app, ty) = seeded(&store).await;
        automation(&store, &app.id, Some(&ty.id), AutomationTrigger::RecordCreated, "a").await;
        automation(&store, &app.id, Some(&ty.id), AutomationTrigger::RecordCreated, "b").await;

        let bus = EventBus::new();
        let runner = Arc::new(SlowRunner::default());
        let stop = CancellationToken::new();
        let listener = Arc::new(AutomationDispatcher::new(store.clone(), runner.clone()))
            .spawn(&bus, stop.clone());

        bus.publish(created_event(&app.id, &ty.id));
        stop.cancel();
        listener.await.expect("listener");

        assert_eq!(runner.finished.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn record_tool_mutations_reach_automations_through_the_bus() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new();
        let runner = Arc::new(RecordingRunner::default());
        let dispatcher = Arc::new(AutomationDispatcher::new(store.clone(), runner.clone()));
        let listener = dispatcher.spawn(&bus, CancellationToken::new());

        let registry = ToolRegistry::new(store.clone(), Arc::new(bus.clone()));
        let app = store.insert_app(App::new("crm", "u1")).await.expect("app");
        let ctx = ToolContext::new(&app.id, "u1");

        let created = registry
            .execute("create_type", json!({"name": "Contact"}), &ctx)
            .await;
        assert!(created.success, "{:?}", created.error);
        let type_id = created.result.as_ref().expect("result")["id"]
            .as_str()
            .expect("id")
            .to_string();
        let field = registry
            .execute(
                "create_field",
                json!({"type_id": type_id, "name": "Name", "type": "text"}),
                &ctx,
            )
            .await;
        assert!(field.success, "{:?}", field.error);
        let automation = registry
            .execute(
                "create_automation",
                json!({
                    "type_id": type_id,
                    "name": "Welcome",
                    "trigger": "record_created",
                    "code": "log('hi')"
                }),
                &ctx,
            )
            .await;
        assert!(automation.success, "{:?}", automation.error);
        let record = registry
            .execute(
                "create_record",
                json!({"type_id": type_id, "data": {"Name": "Ada"}}),
                &ctx,
            )
            .await;
        assert!(record.success, "{:?}", record.error);

        let mut seen = Vec::new();
        for _ in 0..50 {
            seen = runner.calls.lock().await.clone();
            if !seen.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.len(), 1);
        let (_, event) = &seen[0];
        let stored = store.list_records(&type_id, 0, 10).await.expect("records");
        assert_eq!(stored.len(), 1);
        assert_eq!(event.type_id, type_id);
        assert_eq!(event.record_id, stored[0].id);
        assert_eq!(event.record, stored[0].data);
        assert!(!event.triggered_by_automation);

        drop(registry);
        listener.abort();
    }
}
