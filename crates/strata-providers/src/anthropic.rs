use std::collections::HashMap;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use strata_types::{ModelInfo, ProviderInfo, StopReason, TokenUsage};

use crate::sse::{drain_sse_payloads, extract_error_message, extract_usage};
use crate::{
    model_or_default, truncate_for_error, ChatMessage, ChunkStream, ContentBlock, Provider,
    StreamChunk, TurnRequest,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub(crate) struct AnthropicProvider {
    api_key: Option<String>,
    base_url: String,
    default_model: String,
    max_tokens: u32,
    client: Client,
}

impl AnthropicProvider {
    pub(crate) fn new(
        api_key: Option<String>,
        base_url: String,
        default_model: String,
        max_tokens: u32,
    ) -> Self {
        Self {
            api_key,
            base_url,
            default_model,
            max_tokens,
            client: Client::new(),
        }
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        req
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "anthropic".to_string(),
            name: "Anthropic".to_string(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                display_name: self.default_model.clone(),
                context_window: 200_000,
            }],
        }
    }

    async fn stream(&self, turn: TurnRequest, cancel: CancellationToken) -> anyhow::Result<ChunkStream> {
        let model = model_or_default(turn.model_override.as_deref(), &self.default_model);
        let mut body = json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "stream": true,
            "system": turn.system,
            "messages": anthropic_messages(&turn.messages),
        });
        if !turn.tools.is_empty() {
            body["tools"] = Value::Array(
                turn.tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "name": tool.name,
                            "description": tool.description,
                            "input_schema": tool.input_schema,
                        })
                    })
                    .collect(),
            );
        }

        let resp = self.request(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "anthropic stream request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = Vec::new();
            let mut state = AnthropicStreamState::default();
            'frames: while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done {
                        stop_reason: StopReason::Cancelled,
                        usage: None,
                    };
                    break;
                }
                let chunk = chunk?;
                for payload in drain_sse_payloads(&mut buffer, &chunk) {
                    let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                        continue;
                    };
                    for out in state.on_event(&value)? {
                        let done = matches!(out, StreamChunk::Done { .. });
                        yield out;
                        if done {
                            break 'frames;
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Tracks tool-use blocks by content index across an Anthropic event stream.
#[derive(Default)]
pub(crate) struct AnthropicStreamState {
    tool_ids: HashMap<u64, String>,
    stop_reason: Option<StopReason>,
    usage: Option<TokenUsage>,
}

impl AnthropicStreamState {
    pub(crate) fn on_event(&mut self, value: &Value) -> anyhow::Result<Vec<StreamChunk>> {
        let index = value.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
        let mut out = Vec::new();
        match value.get("type").and_then(|v| v.as_str()).unwrap_or_default() {
            "content_block_start" => {
                let block = value.get("content_block").cloned().unwrap_or_default();
                if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                    let id = block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let name = block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    self.tool_ids.insert(index, id.clone());
                    out.push(StreamChunk::ToolCallStart { id, name });
                }
            }
            "content_block_delta" => {
                let delta = value.get("delta").cloned().unwrap_or_default();
                match delta.get("type").and_then(|v| v.as_str()).unwrap_or_default() {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                out.push(StreamChunk::TextDelta(text.to_string()));
                            }
                        }
                    }
                    "thinking_delta" => {
                        if let Some(thinking) = delta.get("thinking").and_then(|v| v.as_str()) {
                            out.push(StreamChunk::ReasoningDelta(thinking.to_string()));
                        }
                    }
                    "input_json_delta" => {
                        let partial = delta
                            .get("partial_json")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default();
                        if let Some(id) = self.tool_ids.get(&index) {
                            if !partial.is_empty() {
                                out.push(StreamChunk::ToolCallDelta {
                                    id: id.clone(),
                                    args_delta: partial.to_string(),
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(id) = self.tool_ids.remove(&index) {
                    out.push(StreamChunk::ToolCallEnd { id });
                }
            }
            "message_delta" => {
                if let Some(reason) = value
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|v| v.as_str())
                {
                    self.stop_reason = Some(StopReason::from_wire(reason));
                }
                if let Some(usage) = extract_usage(value) {
                    self.usage = Some(usage);
                }
            }
            "message_stop" => {
                out.push(StreamChunk::Done {
                    stop_reason: self.stop_reason.take().unwrap_or(StopReason::EndTurn),
                    usage: self.usage.take(),
                });
            }
            "error" => {
                let detail = extract_error_message(value)
                    .unwrap_or_else(|| "anthropic stream error".to_string());
                anyhow::bail!(detail);
            }
            _ => {}
        }
        Ok(out)
    }
}

pub(crate) fn anthropic_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| {
            let content = message
                .content
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                    ContentBlock::ToolUse { id, name, input } => {
                        json!({"type": "tool_use", "id": id, "name": name, "input": input})
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": content,
                        "is_error": is_error,
                    }),
                })
                .collect::<Vec<_>>();
            json!({"role": message.role.as_str(), "content": content})
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatRole;

    #[test]
    fn tool_use_blocks_stream_as_start_delta_end() {
        let mut state = AnthropicStreamState::default();
        let events = [
            json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}),
            json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Creating."}}),
            json!({"type":"content_block_stop","index":0}),
            json!({"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"create_type","input":{}}}),
            json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"name\":"}}),
            json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"Contact\"}"}}),
            json!({"type":"content_block_stop","index":1}),
            json!({"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":12}}),
            json!({"type":"message_stop"}),
        ];
        let mut chunks = Vec::new();
        for event in &events {
            chunks.extend(state.on_event(event).expect("event"));
        }
        assert_eq!(
            chunks[..5],
            [
                StreamChunk::TextDelta("Creating.".to_string()),
                StreamChunk::ToolCallStart {
                    id: "toolu_1".to_string(),
                    name: "create_type".to_string()
                },
                StreamChunk::ToolCallDelta {
                    id: "toolu_1".to_string(),
                    args_delta: "{\"name\":".to_string()
                },
                StreamChunk::ToolCallDelta {
                    id: "toolu_1".to_string(),
                    args_delta: "\"Contact\"}".to_string()
                },
                StreamChunk::ToolCallEnd {
                    id: "toolu_1".to_string()
                },
            ]
        );
        match &chunks[5] {
            StreamChunk::Done { stop_reason, usage } => {
                assert_eq!(stop_reason, &StopReason::ToolUse);
                assert_eq!(usage.as_ref().map(|u| u.completion_tokens), Some(12));
            }
            other => panic!("unexpected chunk {other:?}"),
        }
    }

    #[test]
    fn error_events_fail_the_stream() {
        let mut state = AnthropicStreamState::default();
        let err = state
            .on_event(&json!({"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}))
            .expect_err("error");
        assert_eq!(err.to_string(), "Overloaded");
    }

    #[test]
    fn wire_messages_carry_tool_blocks() {
        let messages = vec![
            ChatMessage {
                role: ChatRole::Assistant,
                content: vec![ContentBlock::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "list_types".to_string(),
                    input: json!({}),
                }],
            },
            ChatMessage {
                role: ChatRole::User,
                content: vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_1".to_string(),
                    content: "{\"types\":[]}".to_string(),
                    is_error: false,
                }],
            },
        ];
        let wire = anthropic_messages(&messages);
        assert_eq!(wire[0]["role"], json!("assistant"));
        assert_eq!(wire[0]["content"][0]["type"], json!("tool_use"));
        assert_eq!(wire[1]["content"][0]["tool_use_id"], json!("toolu_1"));
        assert_eq!(wire[1]["content"][0]["is_error"], json!(false));
    }
}
