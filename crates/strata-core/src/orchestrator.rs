use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use strata_observability::{emit_event, ObservabilityEvent, ProcessKind};
use strata_providers::{ChatMessage, ChatRole, ContentBlock, ProviderRegistry, StreamChunk, TurnRequest};
use strata_store::Store;
use strata_tools::{load_schema, validate_tool_schemas, ToolContext, ToolRegistry};
use strata_types::{
    ChatStreamEvent, ChatStreamEventKind, InputMessage, InputRole, StopReason, ToolResult,
};

use crate::build_system_prompt;

pub const MAX_ITERATIONS: usize = 25;
const STREAM_BUFFER: usize = 256;

/// One chat turn from a client, scoped to an app the user owns.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub app_id: String,
    pub user_id: String,
    pub messages: Vec<InputMessage>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// Drives the bounded model/tool loop for chat requests and streams the
/// protocol events back to the caller.
#[derive(Clone)]
pub struct AgentOrchestrator {
    store: Arc<dyn Store>,
    tools: ToolRegistry,
    providers: ProviderRegistry,
    max_iterations: usize,
    default_model: Option<String>,
}

#[derive(Default)]
struct PendingCall {
    name: String,
    args: String,
}

struct QueuedCall {
    id: String,
    name: String,
    input: Result<Value, String>,
}

/// Assigns event ids and remembers when the receiver has gone away.
struct Emitter {
    tx: mpsc::Sender<ChatStreamEvent>,
    next_id: u64,
    closed: bool,
}

impl Emitter {
    fn new(tx: mpsc::Sender<ChatStreamEvent>) -> Self {
        Self {
            tx,
            next_id: 1,
            closed: false,
        }
    }

    async fn emit(&mut self, kind: ChatStreamEventKind) -> bool {
        if self.closed {
            return false;
        }
        let event = ChatStreamEvent {
            id: self.next_id,
            kind,
        };
        if self.tx.send(event).await.is_err() {
            self.closed = true;
            return false;
        }
        self.next_id += 1;
        true
    }
}

impl AgentOrchestrator {
    pub fn new(store: Arc<dyn Store>, tools: ToolRegistry, providers: ProviderRegistry) -> Self {
        Self {
            store,
            tools,
            providers,
            max_iterations: MAX_ITERATIONS,
            default_model: None,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.clamp(1, MAX_ITERATIONS);
        self
    }

    pub fn with_default_model(mut self, model: Option<String>) -> Self {
        self.default_model = model.filter(|m| !m.trim().is_empty());
        self
    }

    /// Spawns the loop and returns its event stream. Dropping the stream
    /// stops the loop after the tool currently running.
    pub fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> ReceiverStream<ChatStreamEvent> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_chat(request, tx, cancel).await;
        });
        ReceiverStream::new(rx)
    }

    /// Runs one request to completion. Failures are reported as a single
    /// `error` event; `message_done` is always the last event sent.
    pub async fn run_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<ChatStreamEvent>,
        cancel: CancellationToken,
    ) {
        let correlation_id = Uuid::new_v4().to_string();
        let mut emitter = Emitter::new(tx);
        if let Err(err) = self
            .drive(&request, &correlation_id, &mut emitter, &cancel)
            .await
        {
            let error = format!("{err:#}");
            tracing::warn!(app_id = %request.app_id, "chat request failed: {error}");
            emitter.emit(ChatStreamEventKind::Error { error }).await;
        }
        emitter.emit(ChatStreamEventKind::MessageDone {}).await;
    }

    async fn drive(
        &self,
        request: &ChatRequest,
        correlation_id: &str,
        emitter: &mut Emitter,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let app = self
            .store
            .get_app(&request.app_id)
            .await?
            .filter(|app| app.owner_id == request.user_id)
            .context("App not found")?;
        let types = load_schema(self.store.as_ref(), &app.id).await?;
        let system = build_system_prompt(&app.name, &types);
        let tool_schemas = self.tools.list();
        validate_tool_schemas(&tool_schemas)?;

        let mut messages = request
            .messages
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| match m.role {
                InputRole::User => ChatMessage::user_text(&m.content),
                InputRole::Assistant => ChatMessage::assistant_text(&m.content),
            })
            .collect::<Vec<_>>();
        if messages.is_empty() {
            anyhow::bail!("messages must contain at least one non-empty message");
        }

        let provider_hint = request.provider.as_deref();
        let model = request.model.clone().or_else(|| self.default_model.clone());
        let ctx = ToolContext::new(&app.id, &request.user_id);

        for iteration in 0..self.max_iterations {
            if cancel.is_cancelled() || emitter.closed {
                return Ok(());
            }
            let iteration_detail = format!("iteration {}", iteration + 1);
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    correlation_id: Some(correlation_id),
                    app_id: Some(&app.id),
                    user_id: Some(&request.user_id),
                    provider_id: provider_hint,
                    status: Some("start"),
                    detail: Some(&iteration_detail),
                    ..ObservabilityEvent::new("provider.call.start", "agent.loop")
                },
            );

            let turn = TurnRequest {
                system: system.clone(),
                messages: messages.clone(),
                tools: tool_schemas.clone(),
                model_override: model.clone(),
            };
            let mut stream = self
                .providers
                .stream_for_provider(provider_hint, turn, cancel.clone())
                .await
                .inspect_err(|err| {
                    self.provider_error(correlation_id, &app.id, provider_hint, err)
                })?;

            let mut completion = String::new();
            let mut pending: HashMap<String, PendingCall> = HashMap::new();
            let mut pending_order: Vec<String> = Vec::new();
            let mut queued: Vec<QueuedCall> = Vec::new();
            let mut stop_reason = None;
            let mut first_byte = true;

            while let Some(chunk) = stream.next().await {
                let chunk = chunk.inspect_err(|err| {
                    self.provider_error(correlation_id, &app.id, provider_hint, err)
                })?;
                if first_byte {
                    first_byte = false;
                    emit_event(
                        Level::INFO,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            correlation_id: Some(correlation_id),
                            app_id: Some(&app.id),
                            provider_id: provider_hint,
                            status: Some("streaming"),
                            ..ObservabilityEvent::new("provider.call.first_byte", "agent.loop")
                        },
                    );
                }
                match chunk {
                    StreamChunk::TextDelta(delta) => {
                        if delta.is_empty() {
                            continue;
                        }
                        completion.push_str(&delta);
                        emitter
                            .emit(ChatStreamEventKind::TextDelta { text: delta })
                            .await;
                    }
                    StreamChunk::ReasoningDelta(_) => {}
                    StreamChunk::ToolCallStart { id, name } => {
                        if !pending.contains_key(&id) {
                            pending_order.push(id.clone());
                        }
                        let entry = pending.entry(id).or_default();
                        if entry.name.is_empty() {
                            entry.name = name;
                        }
                    }
                    StreamChunk::ToolCallDelta { id, args_delta } => {
                        if !pending.contains_key(&id) {
                            pending_order.push(id.clone());
                        }
                        pending.entry(id).or_default().args.push_str(&args_delta);
                    }
                    StreamChunk::ToolCallEnd { id } => {
                        if let Some(call) = pending.remove(&id) {
                            if let Some(call) = queue_call(id, call, emitter).await {
                                queued.push(call);
                            }
                        }
                    }
                    StreamChunk::Done {
                        stop_reason: reason,
                        usage,
                    } => {
                        if let Some(usage) = usage {
                            tracing::debug!(
                                prompt_tokens = usage.prompt_tokens,
                                completion_tokens = usage.completion_tokens,
                                "model turn usage"
                            );
                        }
                        stop_reason = Some(reason);
                        break;
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
            for id in pending_order {
                if let Some(call) = pending.remove(&id) {
                    if let Some(call) = queue_call(id, call, emitter).await {
                        queued.push(call);
                    }
                }
            }

            let mut assistant = Vec::new();
            if !completion.is_empty() {
                assistant.push(ContentBlock::Text { text: completion });
            }
            for call in &queued {
                assistant.push(ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone().unwrap_or_else(|_| json!({})),
                });
            }
            if !assistant.is_empty() {
                messages.push(ChatMessage {
                    role: ChatRole::Assistant,
                    content: assistant,
                });
            }

            let stop_label = stop_reason
                .as_ref()
                .map(|r| format!("{r:?}"))
                .unwrap_or_else(|| "stream_end".to_string());
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    correlation_id: Some(correlation_id),
                    app_id: Some(&app.id),
                    provider_id: provider_hint,
                    status: Some("ok"),
                    detail: Some(&stop_label),
                    ..ObservabilityEvent::new("provider.call.finish", "agent.loop")
                },
            );

            if queued.is_empty() || stop_reason == Some(StopReason::EndTurn) {
                return Ok(());
            }

            let mut results = Vec::new();
            for call in queued {
                if cancel.is_cancelled() || emitter.closed {
                    break;
                }
                let result = match call.input {
                    Ok(args) => self.tools.execute(&call.name, args, &ctx).await,
                    Err(message) => ToolResult::failed(message),
                };
                emit_event(
                    if result.success { Level::INFO } else { Level::WARN },
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        correlation_id: Some(correlation_id),
                        app_id: Some(&app.id),
                        user_id: Some(&request.user_id),
                        tool_name: Some(&call.name),
                        status: Some(if result.success { "ok" } else { "failed" }),
                        detail: result.error.as_deref(),
                        ..ObservabilityEvent::new("tool.call.finish", "agent.loop")
                    },
                );
                results.push(ContentBlock::ToolResult {
                    tool_use_id: call.id.clone(),
                    content: result.to_model_content(),
                    is_error: !result.success,
                });
                emitter
                    .emit(ChatStreamEventKind::ToolResult {
                        tool_use_id: call.id,
                        name: call.name,
                        success: result.success,
                        result: result.result,
                        error: result.error,
                    })
                    .await;
            }
            if cancel.is_cancelled() || emitter.closed {
                return Ok(());
            }
            messages.push(ChatMessage {
                role: ChatRole::User,
                content: results,
            });
        }

        let detail = format!("stopped after {} iterations", self.max_iterations);
        emit_event(
            Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent {
                correlation_id: Some(correlation_id),
                app_id: Some(&app.id),
                status: Some("iteration_limit"),
                detail: Some(&detail),
                ..ObservabilityEvent::new("agent.loop.limit", "agent.loop")
            },
        );
        Ok(())
    }

    fn provider_error(
        &self,
        correlation_id: &str,
        app_id: &str,
        provider_id: Option<&str>,
        err: &anyhow::Error,
    ) {
        let detail = truncate_text(&format!("{err:#}"), 500);
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent {
                correlation_id: Some(correlation_id),
                app_id: Some(app_id),
                provider_id,
                status: Some("failed"),
                error_code: Some("PROVIDER_ERROR"),
                detail: Some(&detail),
                ..ObservabilityEvent::new("provider.call.error", "agent.loop")
            },
        );
    }
}

/// Parses the accumulated arguments and announces the call. Calls that never
/// received a name are dropped.
async fn queue_call(id: String, call: PendingCall, emitter: &mut Emitter) -> Option<QueuedCall> {
    let name = call.name.trim().to_string();
    if name.is_empty() {
        tracing::debug!(tool_use_id = %id, "dropping unnamed tool call");
        return None;
    }
    let input = parse_tool_args(&name, &call.args);
    let announced = match &input {
        Ok(value) => value.clone(),
        Err(_) => Value::String(call.args.clone()),
    };
    emitter
        .emit(ChatStreamEventKind::ToolUseStart {
            tool_use_id: id.clone(),
            name: name.clone(),
            input: announced,
        })
        .await;
    Some(QueuedCall { id, name, input })
}

fn parse_tool_args(name: &str, raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str::<Value>(raw)
        .map_err(|err| format!("Invalid arguments for {name}: malformed JSON ({err})"))
}

fn truncate_text(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}
