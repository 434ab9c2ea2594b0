use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use strata_store::Store;
use strata_tools::{conform_record_data, DataMode, RecordEventSink};
use strata_types::{
    Automation, AutomationRun, Record, RecordData, RecordEvent, RecordEventKind, RunLogEntry,
    RunStatus,
};

/// What the dispatcher invokes for each matched automation.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run_automation(&self, automation: &Automation, event: &RecordEvent) -> anyhow::Result<()>;
}

/// Read-only snapshot handed to a script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptInput {
    pub automation_id: String,
    pub automation_name: String,
    pub event: RecordEventKind,
    pub app_id: String,
    pub type_id: String,
    pub record_id: String,
    pub record: RecordData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_record: Option<RecordData>,
    pub user_id: String,
}

impl ScriptInput {
    pub fn from_event(automation: &Automation, event: &RecordEvent) -> Self {
        Self {
            automation_id: automation.id.clone(),
            automation_name: automation.name.clone(),
            event: event.kind,
            app_id: event.app_id.clone(),
            type_id: event.type_id.clone(),
            record_id: event.record_id.clone(),
            record: event.record.clone(),
            previous_record: event.previous_record.clone(),
            user_id: event.user_id.clone(),
        }
    }
}

/// Mutation queued by a script; applied only if the script succeeds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScriptAction {
    CreateRecord {
        #[serde(rename = "typeId", alias = "type_id")]
        type_id: String,
        #[serde(default)]
        data: RecordData,
    },
    UpdateRecord {
        #[serde(rename = "typeId", alias = "type_id")]
        type_id: String,
        #[serde(rename = "recordId", alias = "record_id")]
        record_id: String,
        #[serde(default)]
        data: RecordData,
    },
    DeleteRecord {
        #[serde(rename = "typeId", alias = "type_id")]
        type_id: String,
        #[serde(rename = "recordId", alias = "record_id")]
        record_id: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScriptOutput {
    #[serde(default)]
    pub logs: Vec<RunLogEntry>,
    #[serde(default)]
    pub actions: Vec<ScriptAction>,
}

/// Interprets automation scripts. Interpretation itself lives outside the
/// core; implementations only translate between script and snapshot.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    async fn execute(&self, script: &str, input: &ScriptInput) -> anyhow::Result<ScriptOutput>;
}

/// Applies script actions inside the automation's app and publishes the
/// resulting events with the cycle guard set.
#[derive(Clone)]
pub struct ScriptHost {
    store: Arc<dyn Store>,
    events: Arc<dyn RecordEventSink>,
}

impl ScriptHost {
    pub fn new(store: Arc<dyn Store>, events: Arc<dyn RecordEventSink>) -> Self {
        Self { store, events }
    }

    /// Applies actions in order and stops at the first failure. Actions
    /// applied before the failure stay committed and keep their log entries.
    pub async fn apply(
        &self,
        app_id: &str,
        user_id: &str,
        actions: Vec<ScriptAction>,
        logs: &mut Vec<RunLogEntry>,
    ) -> anyhow::Result<()> {
        for action in actions {
            let event = self.apply_one(app_id, user_id, action).await?;
            logs.push(RunLogEntry {
                level: "info".to_string(),
                message: format!("{} {}", event.kind.as_str(), event.record_id),
                data: None,
            });
            self.events.publish(event.from_automation());
        }
        Ok(())
    }

    async fn apply_one(
        &self,
        app_id: &str,
        user_id: &str,
        action: ScriptAction,
    ) -> anyhow::Result<RecordEvent> {
        match action {
            ScriptAction::CreateRecord { type_id, data } => {
                self.require_type(app_id, &type_id).await?;
                let fields = self.store.list_fields(&type_id).await?;
                let data = conform_record_data(Value::Object(data), &fields, DataMode::Create)?;
                let record = self
                    .store
                    .insert_record(Record::new(&type_id, data, user_id))
                    .await?;
                Ok(RecordEvent::created(app_id, &record, user_id))
            }
            ScriptAction::UpdateRecord {
                type_id,
                record_id,
                data,
            } => {
                let current = self.require_record(app_id, &type_id, &record_id).await?;
                let fields = self.store.list_fields(&type_id).await?;
                let patch = conform_record_data(Value::Object(data), &fields, DataMode::Update)?;
                let previous = current.data.clone();
                let mut merged = current.data;
                merged.extend(patch);
                let updated = self.store.update_record(&current.id, merged).await?;
                Ok(RecordEvent::updated(app_id, &updated, previous, user_id))
            }
            ScriptAction::DeleteRecord { type_id, record_id } => {
                let current = self.require_record(app_id, &type_id, &record_id).await?;
                let deleted = self.store.delete_record(&current.id).await?;
                Ok(RecordEvent::deleted(app_id, &deleted, user_id))
            }
        }
    }

    async fn require_type(&self, app_id: &str, type_id: &str) -> anyhow::Result<()> {
        if self.store.get_type(app_id, type_id).await?.is_none() {
            anyhow::bail!("Type not found: {type_id}");
        }
        Ok(())
    }

    async fn require_record(
        &self,
        app_id: &str,
        type_id: &str,
        record_id: &str,
    ) -> anyhow::Result<Record> {
        self.require_type(app_id, type_id).await?;
        self.store
            .get_record(type_id, record_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Record not found: {record_id}"))
    }
}

/// Runs the script through a [`ScriptEngine`], applies its actions and
/// appends exactly one [`AutomationRun`] per invocation.
pub struct ScriptSandboxRunner {
    engine: Arc<dyn ScriptEngine>,
    host: ScriptHost,
    store: Arc<dyn Store>,
}

impl ScriptSandboxRunner {
    pub fn new(
        engine: Arc<dyn ScriptEngine>,
        store: Arc<dyn Store>,
        events: Arc<dyn RecordEventSink>,
    ) -> Self {
        Self {
            engine,
            host: ScriptHost::new(store.clone(), events),
            store,
        }
    }
}

impl ScriptSandboxRunner {
    async fn execute(
        &self,
        automation: &Automation,
        event: &RecordEvent,
        logs: &mut Vec<RunLogEntry>,
    ) -> anyhow::Result<()> {
        let input = ScriptInput::from_event(automation, event);
        let output = self.engine.execute(&automation.code, &input).await?;
        logs.extend(output.logs);
        self.host
            .apply(&automation.app_id, &event.user_id, output.actions, logs)
            .await
    }
}

#[async_trait]
impl SandboxRunner for ScriptSandboxRunner {
    async fn run_automation(&self, automation: &Automation, event: &RecordEvent) -> anyhow::Result<()> {
        let started = Instant::now();
        let mut run = AutomationRun::new(&automation.id, event.kind.into());
        run.record_id = Some(event.record_id.clone());

        let outcome = AssertUnwindSafe(self.execute(automation, event, &mut run.logs))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panic_error(panic)));

        run.duration_ms = started.elapsed().as_millis() as u64;
        if let Err(err) = &outcome {
            run.status = RunStatus::Failed;
            run.error = Some(format!("{err:#}"));
        }
        self.store
            .insert_automation_run(run)
            .await
            .context("failed to record automation run")?;
        outcome
    }
}

/// Turns a caught panic payload into an error carrying its message.
pub fn panic_error(panic: Box<dyn Any + Send>) -> anyhow::Error {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    anyhow::anyhow!("automation panicked: {message}")
}

/// Runs scripts through an external interpreter process.
///
/// The child gets `{"script": ..., "input": ...}` on stdin and answers with
/// JSON lines on stdout: `{"type":"log","level":..,"message":..}` or
/// `{"type":"action","action":"create_record",...}`. Other stdout lines are
/// kept as info logs.
#[derive(Debug, Clone)]
pub struct CommandScriptEngine {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandScriptEngine {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl ScriptEngine for CommandScriptEngine {
    async fn execute(&self, script: &str, input: &ScriptInput) -> anyhow::Result<ScriptOutput> {
        let payload = serde_json::to_vec(&json!({"script": script, "input": input}))?;
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start script command `{}`", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&payload).await {
                    tracing::debug!("script stdin closed early: {err}");
                }
            });
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("script timed out after {} ms", self.timeout.as_millis()),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "script exited with {}: {}",
                output.status,
                truncate(stderr.trim(), 2_000)
            );
        }
        parse_script_stdout(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Used when no interpreter is configured; every run is recorded as failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableScriptEngine;

#[async_trait]
impl ScriptEngine for UnavailableScriptEngine {
    async fn execute(&self, _script: &str, _input: &ScriptInput) -> anyhow::Result<ScriptOutput> {
        anyhow::bail!("no automation interpreter configured (set automations.command)")
    }
}

pub fn parse_script_stdout(stdout: &str) -> anyhow::Result<ScriptOutput> {
    let mut out = ScriptOutput::default();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            out.logs.push(RunLogEntry {
                level: "info".to_string(),
                message: line.to_string(),
                data: None,
            });
            continue;
        };
        match value.get("type").and_then(|v| v.as_str()) {
            Some("log") => out.logs.push(serde_json::from_value(value)?),
            Some("action") => out.actions.push(
                serde_json::from_value(value).context("script emitted an invalid action")?,
            ),
            other => tracing::debug!(kind = ?other, "ignoring script output line"),
        }
    }
    Ok(out)
}

fn truncate(input: &str, max_len: usize) -> &str {
    if input.len() <= max_len {
        return input;
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventBus;
    use strata_store::MemoryStore;
    use strata_types::{App, AutomationTrigger, Field, FieldKind, SchemaType};

    struct FixedEngine(anyhow::Result<ScriptOutput>);

    #[async_trait]
    impl ScriptEngine for FixedEngine {
        async fn execute(&self, _script: &str, _input: &ScriptInput) -> anyhow::Result<ScriptOutput> {
            match &self.0 {
                Ok(output) => Ok(output.clone()),
                Err(err) => Err(anyhow::anyhow!("{err}")),
            }
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        bus: EventBus,
        automation: Automation,
        event: RecordEvent,
        type_id: String,
        field_id: String,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let app = store.insert_app(App::new("crm", "u1")).await.expect("app");
        let contact = store
            .insert_type(SchemaType::new(&app.id, "Contact", 0))
            .await
            .expect("type");
        let field = store
            .insert_field(Field::new(&contact.id, "Name", FieldKind::Text, 0))
            .await
            .expect("field");
        let automation = store
            .insert_automation(Automation::new(
                &app.id,
                Some(contact.id.clone()),
                "copy",
                AutomationTrigger::RecordCreated,
                "createRecord(...)",
                "u1",
            ))
            .await
            .expect("automation");
        let mut data = RecordData::new();
        data.insert(field.id.clone(), json!("Ada"));
        let record = store
            .insert_record(Record::new(&contact.id, data, "u1"))
            .await
            .expect("record");
        Fixture {
            event: RecordEvent::created(&app.id, &record, "u1"),
            store,
            bus: EventBus::new(),
            automation,
            type_id: contact.id,
            field_id: field.id,
        }
    }

    fn runner(fx: &Fixture, engine: FixedEngine) -> ScriptSandboxRunner {
        ScriptSandboxRunner::new(Arc::new(engine), fx.store.clone(), Arc::new(fx.bus.clone()))
    }

    #[tokio::test]
    async fn successful_script_applies_actions_with_cycle_guard() {
        let fx = fixture().await;
        let mut rx = fx.bus.subscribe();
        let output = ScriptOutput {
            logs: vec![RunLogEntry {
                level: "info".to_string(),
                message: "copying".to_string(),
                data: None,
            }],
            actions: vec![ScriptAction::CreateRecord {
                type_id: fx.type_id.clone(),
                data: serde_json::from_value(json!({"Name": "Copy"})).expect("data"),
            }],
        };
        runner(&fx, FixedEngine(Ok(output)))
            .run_automation(&fx.automation, &fx.event)
            .await
            .expect("run");

        let published = rx.recv().await.expect("event");
        assert!(published.triggered_by_automation);
        assert_eq!(published.record.get(&fx.field_id), Some(&json!("Copy")));
        assert_eq!(fx.store.count_records(&fx.type_id).await.expect("count"), 2);

        let runs = fx
            .store
            .list_automation_runs(&fx.automation.id)
            .await
            .expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].record_id.as_deref(), Some(fx.event.record_id.as_str()));
        assert_eq!(runs[0].logs[0].message, "copying");
        assert_eq!(runs[0].logs.len(), 2);
    }

    #[tokio::test]
    async fn failed_script_applies_nothing_and_records_failure() {
        let fx = fixture().await;
        let err = runner(&fx, FixedEngine(Err(anyhow::anyhow!("ReferenceError: x"))))
            .run_automation(&fx.automation, &fx.event)
            .await
            .expect_err("script failure");
        assert!(err.to_string().contains("ReferenceError"));
        assert_eq!(fx.store.count_records(&fx.type_id).await.expect("count"), 1);

        let runs = fx
            .store
            .list_automation_runs(&fx.automation.id)
            .await
            .expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].error.as_deref(), Some("ReferenceError: x"));
    }

    #[tokio::test]
    async fn actions_cannot_reach_other_apps() {
        let fx = fixture().await;
        let other = fx
            .store
            .insert_app(App::new("other", "u2"))
            .await
            .expect("app");
        let foreign = fx
            .store
            .insert_type(SchemaType::new(&other.id, "Secret", 0))
            .await
            .expect("type");
        let output = ScriptOutput {
            logs: Vec::new(),
            actions: vec![ScriptAction::CreateRecord {
                type_id: foreign.id.clone(),
                data: RecordData::new(),
            }],
        };
        let err = runner(&fx, FixedEngine(Ok(output)))
            .run_automation(&fx.automation, &fx.event)
            .await
            .expect_err("scoped");
        assert!(err.to_string().starts_with("Type not found"));
        assert_eq!(fx.store.count_records(&foreign.id).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn partial_actions_keep_their_logs_on_failure() {
        let fx = fixture().await;
        let output = ScriptOutput {
            logs: Vec::new(),
            actions: vec![
                ScriptAction::CreateRecord {
                    type_id: fx.type_id.clone(),
                    data: serde_json::from_value(json!({"Name": "Copy"})).expect("data"),
                },
                ScriptAction::DeleteRecord {
                    type_id: fx.type_id.clone(),
                    record_id: "missing".to_string(),
                },
            ],
        };
        let err = runner(&fx, FixedEngine(Ok(output)))
            .run_automation(&fx.automation, &fx.event)
            .await
            .expect_err("second action fails");
        assert_eq!(err.to_string(), "Record not found: missing");
        assert_eq!(fx.store.count_records(&fx.type_id).await.expect("count"), 2);

        let runs = fx
            .store
            .list_automation_runs(&fx.automation.id)
            .await
            .expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].logs.len(), 1);
        assert!(runs[0].logs[0].message.starts_with("record_created "));
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
    async fn panicking_engine_records_a_failed_run() {
        let fx = fixture().await;
        let runner = ScriptSandboxRunner::new(
            Arc::new(PanickingEngine),
            fx.store.clone(),
            Arc::new(fx.bus.clone()),
        );
        let err = runner
            .run_automation(&fx.automation, &fx.event)
            .await
            .expect_err("panic becomes an error");
        assert!(err.to_string().starts_with("automation panicked: index out of bounds"));

        let runs = fx
            .store
            .list_automation_runs(&fx.automation.id)
            .await
            .expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("index out of bounds")));
    }

    #[test]
    fn stdout_lines_become_logs_and_actions() {
        let stdout = r#"
{"type":"log","level":"warn","message":"missing email"}
plain text line
{"type":"action","action":"update_record","typeId":"t1","recordId":"r1","data":{"f1":"x"}}
"#;
        let out = parse_script_stdout(stdout).expect("parse");
        assert_eq!(out.logs.len(), 2);
        assert_eq!(out.logs[0].level, "warn");
        assert_eq!(out.logs[1].message, "plain text line");
        assert!(matches!(
            &out.actions[0],
            ScriptAction::UpdateRecord { type_id, record_id, .. } if type_id == "t1" && record_id == "r1"
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_engine_reads_json_lines() {
        let fx = fixture().await;
        let engine = CommandScriptEngine::new(
            "sh",
            vec![
                "-c".to_string(),
                r#"cat >/dev/null; echo '{"type":"log","level":"info","message":"hello"}'"#.to_string(),
            ],
            Duration::from_secs(5),
        );
        let out = engine
            .execute("ignored", &ScriptInput::from_event(&fx.automation, &fx.event))
            .await
            .expect("run");
        assert_eq!(out.logs[0].message, "hello");
        assert!(out.actions.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_engine_reports_exit_status_and_timeout() {
        let fx = fixture().await;
        let input = ScriptInput::from_event(&fx.automation, &fx.event);
        let failing = CommandScriptEngine::new(
            "sh",
            vec!["-c".to_string(), "cat >/dev/null; echo boom >&2; exit 3".to_string()],
            Duration::from_secs(5),
        );
        let err = failing.execute("x", &input).await.expect_err("exit");
        assert!(err.to_string().contains("boom"));

        let slow = CommandScriptEngine::new(
            "sh",
            vec!["-c".to_string(), "sleep 5".to_string()],
            Duration::from_millis(100),
        );
        let err = slow.execute("x", &input).await.expect_err("timeout");
        assert_eq!(err.to_string(), "script timed out after 100 ms");
    }
}
