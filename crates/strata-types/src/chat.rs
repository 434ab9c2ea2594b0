use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One frame of the streamed chat protocol. `id` increases by one per event
/// within a request; `message_done` is always the last frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatStreamEvent {
    pub id: u64,
    #[serde(flatten)]
    pub kind: ChatStreamEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatStreamEventKind {
    TextDelta {
        text: String,
    },
    ToolUseStart {
        tool_use_id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        name: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        error: String,
    },
    MessageDone {},
}

impl ChatStreamEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChatStreamEventKind::TextDelta { .. } => "text_delta",
            ChatStreamEventKind::ToolUseStart { .. } => "tool_use_start",
            ChatStreamEventKind::ToolResult { .. } => "tool_result",
            ChatStreamEventKind::Error { .. } => "error",
            ChatStreamEventKind::MessageDone {} => "message_done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, ChatStreamEventKind::MessageDone {})
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputRole {
    User,
    Assistant,
}

/// Plain-text conversation turn as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputMessage {
    pub role: InputRole,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_events_flatten_type_tag() {
        let event = ChatStreamEvent {
            id: 3,
            kind: ChatStreamEventKind::ToolResult {
                tool_use_id: "tu_1".to_string(),
                name: "create_type".to_string(),
                success: false,
                result: None,
                error: Some("Type not found".to_string()),
            },
        };
        let value = serde_json::to_value(&event).expect("encode");
        assert_eq!(
            value,
            json!({
                "id": 3,
                "type": "tool_result",
                "tool_use_id": "tu_1",
                "name": "create_type",
                "success": false,
                "error": "Type not found"
            })
        );
        let done = serde_json::to_value(ChatStreamEvent {
            id: 4,
            kind: ChatStreamEventKind::MessageDone {},
        })
        .expect("encode");
        assert_eq!(done, json!({"id": 4, "type": "message_done"}));
    }
}
