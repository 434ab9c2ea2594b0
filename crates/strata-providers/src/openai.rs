use std::collections::BTreeMap;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use strata_types::{ModelInfo, ProviderInfo, StopReason};

use crate::sse::{drain_sse_payloads, extract_error_message, extract_usage};
use crate::{
    model_or_default, provider_api_key_env, truncate_for_error, ChatMessage, ChatRole,
    ChunkStream, ContentBlock, Provider, StreamChunk, TurnRequest,
};

pub(crate) struct OpenAICompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    max_tokens: u32,
    client: Client,
}

impl OpenAICompatibleProvider {
    pub(crate) fn new(
        id: &str,
        name: &str,
        base_url: String,
        api_key: Option<String>,
        default_model: String,
        max_tokens: u32,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            base_url,
            api_key,
            default_model,
            max_tokens,
            client: Client::new(),
        }
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(body);
        if self.id == "openrouter" {
            req = req
                .header("HTTP-Referer", "https://strata.local")
                .header("X-Title", "Strata");
        }
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        req
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                display_name: self.default_model.clone(),
                context_window: 128_000,
            }],
        }
    }

    async fn stream(&self, turn: TurnRequest, cancel: CancellationToken) -> anyhow::Result<ChunkStream> {
        let model = model_or_default(turn.model_override.as_deref(), &self.default_model);
        let wire_tools = turn
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "messages": openai_messages(&turn.system, &turn.messages),
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !wire_tools.is_empty() {
            body["tools"] = Value::Array(wire_tools);
            body["tool_choice"] = json!("auto");
        }

        let resp = self.request(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            if status.as_u16() == 401 {
                anyhow::bail!(
                    "provider authentication failed ({}) for `{}`. Verify the API key (set `{}`) and retry.",
                    status,
                    self.id,
                    provider_api_key_env(&self.id).unwrap_or("the provider api key")
                );
            }
            anyhow::bail!(
                "provider stream request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = Vec::new();
            let mut state = OpenAIStreamState::default();
            'frames: while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    state.done = true;
                    yield StreamChunk::Done {
                        stop_reason: StopReason::Cancelled,
                        usage: None,
                    };
                    break;
                }
                let chunk = chunk?;
                for payload in drain_sse_payloads(&mut buffer, &chunk) {
                    if payload == "[DONE]" {
                        break 'frames;
                    }
                    let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                        continue;
                    };
                    for out in state.on_chunk(&value)? {
                        yield out;
                    }
                }
            }
            for out in state.finish() {
                yield out;
            }
        };
        Ok(Box::pin(stream))
    }
}

/// OpenAI streams tool calls keyed by `index`; the id only arrives on the
/// first fragment. Tool calls are closed when the choice finishes.
#[derive(Default)]
pub(crate) struct OpenAIStreamState {
    calls: BTreeMap<u64, String>,
    stop_reason: Option<StopReason>,
    usage: Option<strata_types::TokenUsage>,
    done: bool,
}

impl OpenAIStreamState {
    pub(crate) fn on_chunk(&mut self, value: &Value) -> anyhow::Result<Vec<StreamChunk>> {
        if let Some(detail) = extract_error_message(value) {
            anyhow::bail!(detail);
        }
        if let Some(usage) = extract_usage(value) {
            self.usage = Some(usage);
        }
        let mut out = Vec::new();
        let Some(choices) = value.get("choices").and_then(|v| v.as_array()) else {
            return Ok(out);
        };
        for choice in choices {
            let delta = choice.get("delta").cloned().unwrap_or_default();
            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    out.push(StreamChunk::TextDelta(text.to_string()));
                }
            }
            if let Some(reasoning) = delta.get("reasoning").and_then(|v| v.as_str()) {
                if !reasoning.is_empty() {
                    out.push(StreamChunk::ReasoningDelta(reasoning.to_string()));
                }
            }
            for call in delta
                .get("tool_calls")
                .and_then(|v| v.as_array())
                .map(|v| v.as_slice())
                .unwrap_or_default()
            {
                let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let function = call.get("function").cloned().unwrap_or_default();
                if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                    if !self.calls.contains_key(&index) && !id.is_empty() {
                        let name = function
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        self.calls.insert(index, id.to_string());
                        out.push(StreamChunk::ToolCallStart {
                            id: id.to_string(),
                            name,
                        });
                    }
                }
                let args = function
                    .get("arguments")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if let (Some(id), false) = (self.calls.get(&index), args.is_empty()) {
                    out.push(StreamChunk::ToolCallDelta {
                        id: id.clone(),
                        args_delta: args.to_string(),
                    });
                }
            }
            if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                if !reason.is_empty() {
                    let mut stop_reason = StopReason::from_wire(reason);
                    // Some servers finish tool-calling turns with "stop".
                    if stop_reason == StopReason::EndTurn && !self.calls.is_empty() {
                        stop_reason = StopReason::ToolUse;
                    }
                    self.stop_reason = Some(stop_reason);
                    out.extend(self.close_calls());
                }
            }
        }
        Ok(out)
    }

    /// Closes dangling tool calls and reports the turn end, at most once.
    pub(crate) fn finish(&mut self) -> Vec<StreamChunk> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let open_calls = !self.calls.is_empty();
        let mut out = self.close_calls();
        let fallback = if open_calls {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        };
        out.push(StreamChunk::Done {
            stop_reason: self.stop_reason.take().unwrap_or(fallback),
            usage: self.usage.take(),
        });
        out
    }

    fn close_calls(&mut self) -> Vec<StreamChunk> {
        std::mem::take(&mut self.calls)
            .into_values()
            .map(|id| StreamChunk::ToolCallEnd { id })
            .collect()
    }
}

pub(crate) fn openai_messages(system: &str, messages: &[ChatMessage]) -> Vec<Value> {
    let mut wire = vec![json!({"role": "system", "content": system})];
    for message in messages {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut tool_results = Vec::new();
        for block in &message.content {
            match block {
                ContentBlock::Text { text: t } => text.push_str(t),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": input.to_string()},
                })),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => tool_results.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                })),
            }
        }
        match message.role {
            ChatRole::Assistant => {
                let mut entry = json!({"role": "assistant", "content": text});
                if !tool_calls.is_empty() {
                    entry["tool_calls"] = Value::Array(tool_calls);
                }
                wire.push(entry);
            }
            ChatRole::User => {
                wire.extend(tool_results);
                if !text.is_empty() {
                    wire.push(json!({"role": "user", "content": text}));
                }
            }
        }
    }
    wire
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_calls_are_tracked_by_index() {
        let mut state = OpenAIStreamState::default();
        let mut chunks = Vec::new();
        let frames = [
            json!({"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","type":"function","function":{"name":"list_types","arguments":""}}]}}]}),
            json!({"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{}"}}]}}]}),
            json!({"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"create_type","arguments":"{\"name\""}}]}}]}),
            json!({"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"arguments":":\"Deal\"}"}}]}}]}),
            json!({"choices":[{"delta":{},"finish_reason":"tool_calls"}]}),
        ];
        for frame in &frames {
            chunks.extend(state.on_chunk(frame).expect("chunk"));
        }
        chunks.extend(state.finish());
        let call = |id: &str| id.to_string();
        assert_eq!(
            chunks,
            vec![
                StreamChunk::ToolCallStart {
                    id: call("call_a"),
                    name: "list_types".to_string()
                },
                StreamChunk::ToolCallDelta {
                    id: call("call_a"),
                    args_delta: "{}".to_string()
                },
                StreamChunk::ToolCallStart {
                    id: call("call_b"),
                    name: "create_type".to_string()
                },
                StreamChunk::ToolCallDelta {
                    id: call("call_b"),
                    args_delta: "{\"name\"".to_string()
                },
                StreamChunk::ToolCallDelta {
                    id: call("call_b"),
                    args_delta: ":\"Deal\"}".to_string()
                },
                StreamChunk::ToolCallEnd { id: call("call_a") },
                StreamChunk::ToolCallEnd { id: call("call_b") },
                StreamChunk::Done {
                    stop_reason: StopReason::ToolUse,
                    usage: None
                },
            ]
        );
    }

    #[test]
    fn stream_ending_with_open_calls_reports_tool_use() {
        let mut state = OpenAIStreamState::default();
        let frame = json!({"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"list_types","arguments":"{}"}}]}}]});
        let mut chunks = state.on_chunk(&frame).expect("chunk");
        chunks.extend(state.finish());
        assert_eq!(chunks[2], StreamChunk::ToolCallEnd { id: "call_a".to_string() });
        assert_eq!(
            chunks[3],
            StreamChunk::Done {
                stop_reason: StopReason::ToolUse,
                usage: None
            }
        );

        let mut text_only = OpenAIStreamState::default();
        text_only
            .on_chunk(&json!({"choices":[{"delta":{"content":"hi"}}]}))
            .expect("chunk");
        assert!(matches!(
            text_only.finish().last(),
            Some(StreamChunk::Done {
                stop_reason: StopReason::EndTurn,
                ..
            })
        ));
    }

    #[test]
    fn error_payload_fails_the_stream() {
        let mut state = OpenAIStreamState::default();
        let err = state
            .on_chunk(&json!({"error": {"message": "rate limited"}}))
            .expect_err("error");
        assert_eq!(err.to_string(), "rate limited");
    }

    #[test]
    fn tool_results_become_tool_role_messages() {
        let messages = vec![
            ChatMessage::user_text("add a Deal type"),
            ChatMessage {
                role: ChatRole::Assistant,
                content: vec![ContentBlock::ToolUse {
                    id: "call_1".to_string(),
                    name: "create_type".to_string(),
                    input: json!({"name": "Deal"}),
                }],
            },
            ChatMessage {
                role: ChatRole::User,
                content: vec![ContentBlock::ToolResult {
                    tool_use_id: "call_1".to_string(),
                    content: "{\"id\":\"t1\"}".to_string(),
                    is_error: false,
                }],
            },
        ];
        let wire = openai_messages("system prompt", &messages);
        assert_eq!(wire.len(), 4);
        assert_eq!(wire[0]["role"], json!("system"));
        assert_eq!(wire[1]["content"], json!("add a Deal type"));
        assert_eq!(
            wire[2]["tool_calls"][0]["function"]["arguments"],
            json!("{\"name\":\"Deal\"}")
        );
        assert_eq!(wire[3]["role"], json!("tool"));
        assert_eq!(wire[3]["tool_call_id"], json!("call_1"));
    }
}
