//! Anthropic Messages data models

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Messages API request
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClaudeRequest {
    /// Model name
    #[serde(default)]
    pub model: String,
    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Message list
    pub messages: Vec<ClaudeMessage>,
    /// System prompt: plain string or block list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<ClaudeSystemPrompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ClaudeTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

fn default_max_tokens() -> u32 {
    4096
}

/// System prompt: Anthropic accepts both a string and a list of text blocks
/// (the list form carries cache-control breakpoints).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaudeSystemPrompt {
    Text(String),
    Blocks(Vec<serde_json::Value>),
}

impl ClaudeSystemPrompt {
    pub fn extract_text(&self) -> String {
        match self {
            ClaudeSystemPrompt::Text(text) => text.clone(),
            ClaudeSystemPrompt::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()).map(String::from))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeMessage {
    /// Role (user/assistant)
    pub role: String,
    /// Message content
    pub content: ClaudeContent,
}

/// Content: plain text or structured blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaudeContent {
    Text(String),
    Blocks(Vec<ClaudeContentBlock>),
}

/// Content block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClaudeContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ClaudeImageSource },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<ClaudeToolResultContent>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

/// Tool result payload: string or nested blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaudeToolResultContent {
    Text(String),
    Blocks(Vec<serde_json::Value>),
}

impl ClaudeToolResultContent {
    pub fn extract_text(&self) -> String {
        match self {
            ClaudeToolResultContent::Text(text) => text.clone(),
            ClaudeToolResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()).map(String::from))
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Image source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Tool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// Messages API response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: String,
    pub content: Vec<ClaudeContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: ClaudeUsage,
}

/// Usage statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaudeUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
}

/// Streaming event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClaudeStreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: ClaudeStreamMessage },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: u32,
        content_block: ClaudeContentBlock,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: u32, delta: ClaudeContentDelta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: u32 },
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: ClaudeMessageDelta,
        #[serde(default)]
        usage: ClaudeUsage,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "error")]
    Error { error: ClaudeError },
}

impl ClaudeStreamEvent {
    /// Render as an SSE frame (Anthropic streams use named events)
    pub fn to_sse(&self) -> String {
        let name = match self {
            ClaudeStreamEvent::MessageStart { .. } => "message_start",
            ClaudeStreamEvent::ContentBlockStart { .. } => "content_block_start",
            ClaudeStreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            ClaudeStreamEvent::ContentBlockStop { .. } => "content_block_stop",
            ClaudeStreamEvent::MessageDelta { .. } => "message_delta",
            ClaudeStreamEvent::MessageStop => "message_stop",
            ClaudeStreamEvent::Ping => "ping",
            ClaudeStreamEvent::Error { .. } => "error",
        };
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", name, data)
    }
}

/// Skeleton message inside `message_start`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeStreamMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub role: String,
    pub content: Vec<serde_json::Value>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: ClaudeUsage,
}

/// Content delta
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClaudeContentDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
}

/// Message delta
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeMessageDelta {
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
}

/// Error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeErrorResponse {
    #[serde(rename = "type")]
    pub error_type: String,
    pub error: ClaudeError,
}

impl ClaudeContent {
    /// Extract text content
    pub fn extract_text(&self) -> String {
        match self {
            ClaudeContent::Text(text) => text.clone(),
            ClaudeContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ClaudeContentBlock::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_with_tool_blocks() {
        let json = r#"{
            "model": "claude-sonnet-4",
            "max_tokens": 1024,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Paris"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "18C"}
                ]}
            ]
        }"#;
        let request: ClaudeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.messages.len(), 2);
        match &request.messages[0].content {
            ClaudeContent::Blocks(blocks) => match &blocks[0] {
                ClaudeContentBlock::ToolUse { id, name, .. } => {
                    assert_eq!(id, "toolu_1");
                    assert_eq!(name, "get_weather");
                }
                other => panic!("unexpected block: {:?}", other),
            },
            _ => panic!("expected blocks"),
        }
    }

    #[test]
    fn test_system_prompt_forms() {
        let text: ClaudeSystemPrompt = serde_json::from_str(r#""be brief""#).unwrap();
        assert_eq!(text.extract_text(), "be brief");

        let blocks: ClaudeSystemPrompt =
            serde_json::from_str(r#"[{"type": "text", "text": "be brief"}]"#).unwrap();
        assert_eq!(blocks.extract_text(), "be brief");
    }

    #[test]
    fn test_stream_event_sse_rendering() {
        let event = ClaudeStreamEvent::ContentBlockDelta {
            index: 0,
            delta: ClaudeContentDelta::TextDelta { text: "hi".to_string() },
        };
        let sse = event.to_sse();
        assert!(sse.starts_with("event: content_block_delta\n"));
        assert!(sse.contains("\"text_delta\""));
        assert!(sse.ends_with("\n\n"));
    }

    #[test]
    fn test_content_text_extraction() {
        let blocks_content = ClaudeContent::Blocks(vec![
            ClaudeContentBlock::Text { text: "Hello ".to_string() },
            ClaudeContentBlock::Text { text: "world".to_string() },
        ]);
        assert_eq!(blocks_content.extract_text(), "Hello world");
    }
}
