//! Streaming response translation
//!
//! Parses the upstream SSE stream, converts it chunk-by-chunk into the
//! client's wire format, tallies usage from provider-specific final events
//! and emits the client format's terminator when the upstream closes.
//!
//! The pipeline pulls exactly one upstream chunk per downstream demand; the
//! only buffered state is the per-request translation state.

use crate::models::claude::ClaudeStreamEvent;
use crate::models::openai::{
    OpenAIFunctionCall, OpenAIStreamDelta, OpenAIStreamResponse, OpenAIStreamToolCall, OpenAIUsage,
};
use crate::models::WireFormat;
use crate::providers::ByteStream;
use crate::services::usage::TokenCounts;
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// SSE parsing
// ---------------------------------------------------------------------------

/// One parsed SSE event
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// `event:` line, when present (Anthropic names its events)
    pub event: Option<String>,
    /// Concatenated `data:` payload
    pub data: String,
}

/// Incremental SSE frame parser
///
/// Frames may be split across reads; bytes are buffered until a blank line
/// terminates the event. Malformed lines are skipped, the stream continues.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed decoded text, draining every complete event
    pub fn feed(&mut self, text: &str) -> Vec<SseEvent> {
        self.buffer.push_str(text);
        let mut events = Vec::new();

        while let Some(boundary) = find_event_boundary(&self.buffer) {
            let block = self.buffer[..boundary.start].to_string();
            self.buffer.drain(..boundary.end);
            if let Some(event) = parse_event_block(&block) {
                events.push(event);
            }
        }
        events
    }
}

struct Boundary {
    start: usize, // length of the event block
    end: usize,   // length including the separator
}

fn find_event_boundary(buffer: &str) -> Option<Boundary> {
    let lf = buffer.find("\n\n").map(|i| Boundary { start: i, end: i + 2 });
    let crlf = buffer.find("\r\n\r\n").map(|i| Boundary { start: i, end: i + 4 });
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.start < b.start { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_event_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data_lines = Vec::new();
    for line in block.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
        // Comment and unknown lines are skipped
    }
    if data_lines.is_empty() && event.is_none() {
        return None;
    }
    Some(SseEvent { event, data: data_lines.join("\n") })
}

// ---------------------------------------------------------------------------
// Usage extraction
// ---------------------------------------------------------------------------

/// Absorb usage fields from a streaming payload of the given format
pub fn absorb_usage(format: WireFormat, payload: &Value, tally: &mut TokenCounts) {
    match format {
        WireFormat::Openai | WireFormat::Kiro | WireFormat::Copilot | WireFormat::Qwen
        | WireFormat::Iflow => {
            if let Some(usage) = payload.get("usage").filter(|u| !u.is_null()) {
                absorb_openai_usage(usage, tally);
            }
        }
        WireFormat::Claude => {
            // message_start carries input tokens, message_delta output tokens
            let usage = payload
                .get("usage")
                .or_else(|| payload.get("message").and_then(|m| m.get("usage")));
            if let Some(usage) = usage {
                if let Some(input) = usage.get("input_tokens").and_then(Value::as_u64) {
                    tally.prompt = tally.prompt.max(input);
                }
                if let Some(output) = usage.get("output_tokens").and_then(Value::as_u64) {
                    tally.completion = tally.completion.max(output);
                }
                if let Some(cached) =
                    usage.get("cache_read_input_tokens").and_then(Value::as_u64)
                {
                    tally.cached = tally.cached.max(cached);
                }
                if let Some(creation) =
                    usage.get("cache_creation_input_tokens").and_then(Value::as_u64)
                {
                    tally.cache_creation = tally.cache_creation.max(creation);
                }
            }
        }
        WireFormat::Gemini | WireFormat::Antigravity => {
            let metadata = payload
                .get("usageMetadata")
                .or_else(|| payload.get("response").and_then(|r| r.get("usageMetadata")));
            if let Some(metadata) = metadata {
                if let Some(prompt) = metadata.get("promptTokenCount").and_then(Value::as_u64) {
                    tally.prompt = tally.prompt.max(prompt);
                }
                if let Some(completion) =
                    metadata.get("candidatesTokenCount").and_then(Value::as_u64)
                {
                    tally.completion = tally.completion.max(completion);
                }
                if let Some(cached) =
                    metadata.get("cachedContentTokenCount").and_then(Value::as_u64)
                {
                    tally.cached = tally.cached.max(cached);
                }
                if let Some(thoughts) =
                    metadata.get("thoughtsTokenCount").and_then(Value::as_u64)
                {
                    tally.reasoning = tally.reasoning.max(thoughts);
                }
            }
        }
        WireFormat::OpenaiResponses => {
            let usage = payload
                .get("response")
                .and_then(|r| r.get("usage"))
                .or_else(|| payload.get("usage"));
            if let Some(usage) = usage {
                if let Some(input) = usage.get("input_tokens").and_then(Value::as_u64) {
                    tally.prompt = tally.prompt.max(input);
                }
                if let Some(output) = usage.get("output_tokens").and_then(Value::as_u64) {
                    tally.completion = tally.completion.max(output);
                }
                if let Some(cached) = usage
                    .get("input_tokens_details")
                    .and_then(|d| d.get("cached_tokens"))
                    .and_then(Value::as_u64)
                {
                    tally.cached = tally.cached.max(cached);
                }
                if let Some(reasoning) = usage
                    .get("output_tokens_details")
                    .and_then(|d| d.get("reasoning_tokens"))
                    .and_then(Value::as_u64)
                {
                    tally.reasoning = tally.reasoning.max(reasoning);
                }
            }
        }
    }
}

fn absorb_openai_usage(usage: &Value, tally: &mut TokenCounts) {
    if let Some(prompt) = usage.get("prompt_tokens").and_then(Value::as_u64) {
        tally.prompt = tally.prompt.max(prompt);
    }
    if let Some(completion) = usage.get("completion_tokens").and_then(Value::as_u64) {
        tally.completion = tally.completion.max(completion);
    }
    if let Some(cached) = usage
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(Value::as_u64)
    {
        tally.cached = tally.cached.max(cached);
    }
    if let Some(reasoning) = usage
        .get("completion_tokens_details")
        .and_then(|d| d.get("reasoning_tokens"))
        .and_then(Value::as_u64)
    {
        tally.reasoning = tally.reasoning.max(reasoning);
    }
}

/// Extract usage from a non-streaming response body
pub fn extract_usage(format: WireFormat, body: &Value) -> TokenCounts {
    let mut tally = TokenCounts::default();
    absorb_usage(format, body, &mut tally);
    tally
}

// ---------------------------------------------------------------------------
// Normalized deltas
// ---------------------------------------------------------------------------

// Internal chunk representation; every source format normalizes to this and
// every target format renders from it.
#[derive(Debug, Clone, PartialEq)]
enum Delta {
    Role,
    Text(String),
    ToolStart { index: u32, id: String, name: String },
    ToolArgs { index: u32, fragment: String },
    Finish { reason: String },
}

#[derive(Debug, Default)]
struct Normalizer {
    // claude content-block index → tool index
    block_tools: HashMap<u32, u32>,
    // responses output index → tool index
    item_tools: HashMap<u64, u32>,
    next_tool_index: u32,
    saw_tool_call: bool,
    pending_stop_reason: Option<String>,
}

impl Normalizer {
    fn allocate_tool(&mut self) -> u32 {
        let index = self.next_tool_index;
        self.next_tool_index += 1;
        self.saw_tool_call = true;
        index
    }

    fn normalize(
        &mut self,
        format: WireFormat,
        event: &SseEvent,
        payload: &Value,
        tool_name_map: &HashMap<String, String>,
    ) -> Vec<Delta> {
        match format {
            WireFormat::Claude => self.normalize_claude(event, payload, tool_name_map),
            WireFormat::Gemini | WireFormat::Antigravity => {
                self.normalize_gemini(payload, tool_name_map)
            }
            WireFormat::OpenaiResponses => self.normalize_responses(payload, tool_name_map),
            _ => self.normalize_openai(payload, tool_name_map),
        }
    }

    fn normalize_openai(
        &mut self,
        payload: &Value,
        tool_name_map: &HashMap<String, String>,
    ) -> Vec<Delta> {
        let mut deltas = Vec::new();
        let Some(choice) = payload.get("choices").and_then(|c| c.get(0)) else {
            return deltas;
        };
        let delta = choice.get("delta").cloned().unwrap_or(Value::Null);

        if delta.get("role").and_then(Value::as_str).is_some() {
            deltas.push(Delta::Role);
        }
        if let Some(content) = delta.get("content").and_then(Value::as_str) {
            if !content.is_empty() {
                deltas.push(Delta::Text(content.to_string()));
            }
        }
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    self.saw_tool_call = true;
                    self.next_tool_index = self.next_tool_index.max(index + 1);
                    let raw_name = call
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    deltas.push(Delta::ToolStart {
                        index,
                        id: id.to_string(),
                        name: restore_name(raw_name, tool_name_map),
                    });
                }
                if let Some(arguments) = call
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(Value::as_str)
                {
                    if !arguments.is_empty() {
                        deltas
                            .push(Delta::ToolArgs { index, fragment: arguments.to_string() });
                    }
                }
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            deltas.push(Delta::Finish { reason: reason.to_string() });
        }
        deltas
    }

    fn normalize_claude(
        &mut self,
        event: &SseEvent,
        payload: &Value,
        tool_name_map: &HashMap<String, String>,
    ) -> Vec<Delta> {
        let event_type = event
            .event
            .as_deref()
            .or_else(|| payload.get("type").and_then(Value::as_str))
            .unwrap_or_default();
        match event_type {
            "message_start" => vec![Delta::Role],
            "content_block_start" => {
                let block_index =
                    payload.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
                let block = payload.get("content_block").cloned().unwrap_or(Value::Null);
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    let tool_index = self.allocate_tool();
                    self.block_tools.insert(block_index, tool_index);
                    vec![Delta::ToolStart {
                        index: tool_index,
                        id: block.get("id").and_then(Value::as_str).unwrap_or_default().into(),
                        name: restore_name(
                            block.get("name").and_then(Value::as_str).unwrap_or_default(),
                            tool_name_map,
                        ),
                    }]
                } else {
                    Vec::new()
                }
            }
            "content_block_delta" => {
                let block_index =
                    payload.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
                let delta = payload.get("delta").cloned().unwrap_or(Value::Null);
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => delta
                        .get("text")
                        .and_then(Value::as_str)
                        .map(|text| vec![Delta::Text(text.to_string())])
                        .unwrap_or_default(),
                    Some("input_json_delta") => {
                        let Some(tool_index) = self.block_tools.get(&block_index).copied() else {
                            return Vec::new();
                        };
                        delta
                            .get("partial_json")
                            .and_then(Value::as_str)
                            .filter(|fragment| !fragment.is_empty())
                            .map(|fragment| {
                                vec![Delta::ToolArgs {
                                    index: tool_index,
                                    fragment: fragment.to_string(),
                                }]
                            })
                            .unwrap_or_default()
                    }
                    _ => Vec::new(),
                }
            }
            "message_delta" => {
                if let Some(reason) =
                    payload.get("delta").and_then(|d| d.get("stop_reason")).and_then(Value::as_str)
                {
                    self.pending_stop_reason = Some(claude_stop_to_openai(reason).to_string());
                }
                Vec::new()
            }
            "message_stop" => {
                let reason = self
                    .pending_stop_reason
                    .take()
                    .unwrap_or_else(|| if self.saw_tool_call { "tool_calls" } else { "stop" }.into());
                vec![Delta::Finish { reason }]
            }
            _ => Vec::new(),
        }
    }

    fn normalize_gemini(
        &mut self,
        payload: &Value,
        tool_name_map: &HashMap<String, String>,
    ) -> Vec<Delta> {
        let mut deltas = Vec::new();
        // CLI-style upstreams wrap chunks in {"response": {...}}
        let chunk = payload.get("response").unwrap_or(payload);
        let Some(candidate) = chunk.get("candidates").and_then(|c| c.get(0)) else {
            return deltas;
        };

        if let Some(parts) =
            candidate.get("content").and_then(|c| c.get("parts")).and_then(Value::as_array)
        {
            for part in parts {
                if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                    continue;
                }
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        deltas.push(Delta::Text(text.to_string()));
                    }
                } else if let Some(call) = part.get("functionCall") {
                    let index = self.allocate_tool();
                    let id = call
                        .get("id")
                        .and_then(Value::as_str)
                        .map(String::from)
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                    deltas.push(Delta::ToolStart {
                        index,
                        id,
                        name: restore_name(
                            call.get("name").and_then(Value::as_str).unwrap_or_default(),
                            tool_name_map,
                        ),
                    });
                    let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                    deltas.push(Delta::ToolArgs { index, fragment: args.to_string() });
                }
            }
        }

        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
            let reason = if self.saw_tool_call {
                "tool_calls".to_string()
            } else {
                gemini_finish_to_openai(reason).to_string()
            };
            deltas.push(Delta::Finish { reason });
        }
        deltas
    }

    fn normalize_responses(
        &mut self,
        payload: &Value,
        tool_name_map: &HashMap<String, String>,
    ) -> Vec<Delta> {
        match payload.get("type").and_then(Value::as_str).unwrap_or_default() {
            "response.output_text.delta" => payload
                .get("delta")
                .and_then(Value::as_str)
                .filter(|text| !text.is_empty())
                .map(|text| vec![Delta::Text(text.to_string())])
                .unwrap_or_default(),
            "response.output_item.added" => {
                let item = payload.get("item").cloned().unwrap_or(Value::Null);
                if item.get("type").and_then(Value::as_str) != Some("function_call") {
                    return Vec::new();
                }
                let output_index =
                    payload.get("output_index").and_then(Value::as_u64).unwrap_or(0);
                let tool_index = self.allocate_tool();
                self.item_tools.insert(output_index, tool_index);
                vec![Delta::ToolStart {
                    index: tool_index,
                    id: item
                        .get("call_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: restore_name(
                        item.get("name").and_then(Value::as_str).unwrap_or_default(),
                        tool_name_map,
                    ),
                }]
            }
            "response.function_call_arguments.delta" => {
                let output_index =
                    payload.get("output_index").and_then(Value::as_u64).unwrap_or(0);
                let Some(tool_index) = self.item_tools.get(&output_index).copied() else {
                    return Vec::new();
                };
                payload
                    .get("delta")
                    .and_then(Value::as_str)
                    .filter(|fragment| !fragment.is_empty())
                    .map(|fragment| {
                        vec![Delta::ToolArgs { index: tool_index, fragment: fragment.to_string() }]
                    })
                    .unwrap_or_default()
            }
            "response.completed" | "response.done" | "response.incomplete" => {
                let reason = if self.saw_tool_call { "tool_calls" } else { "stop" };
                vec![Delta::Finish { reason: reason.to_string() }]
            }
            _ => Vec::new(),
        }
    }
}

fn restore_name(name: &str, tool_name_map: &HashMap<String, String>) -> String {
    tool_name_map.get(name).cloned().unwrap_or_else(|| name.to_string())
}

fn claude_stop_to_openai(reason: &str) -> &'static str {
    match reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

fn gemini_finish_to_openai(reason: &str) -> &'static str {
    match reason {
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "PROHIBITED_CONTENT" => "content_filter",
        _ => "stop",
    }
}

fn openai_finish_to_claude(reason: &str) -> &'static str {
    match reason {
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        "content_filter" => "stop_sequence",
        _ => "end_turn",
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum OpenBlock {
    None,
    Text(u32),
    Tool(u32), // claude block index
}

struct Renderer {
    target: WireFormat,
    model: String,
    role_sent: bool,
    finish_sent: bool,
    message_id: String,
    // claude rendering state
    next_block_index: u32,
    open_block: OpenBlock,
    tool_blocks: HashMap<u32, u32>, // tool index → claude block index
    finish_reason: Option<String>,
    // gemini rendering buffers whole functionCall parts
    gemini_tools: HashMap<u32, (String, String, String)>, // index → (id, name, args)
    saw_tool_call: bool,
}

impl Renderer {
    fn new(target: WireFormat, model: &str) -> Self {
        Self {
            target,
            model: model.to_string(),
            role_sent: false,
            finish_sent: false,
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            next_block_index: 0,
            open_block: OpenBlock::None,
            tool_blocks: HashMap::new(),
            finish_reason: None,
            gemini_tools: HashMap::new(),
            saw_tool_call: false,
        }
    }

    fn render(&mut self, delta: Delta) -> Vec<String> {
        match self.target {
            WireFormat::Claude => self.render_claude(delta),
            WireFormat::Gemini | WireFormat::Antigravity => self.render_gemini(delta),
            WireFormat::OpenaiResponses => self.render_responses(delta),
            _ => self.render_openai(delta),
        }
    }

    /// Terminator frames for the target format
    fn finish(&mut self, tokens: &TokenCounts) -> Vec<String> {
        match self.target {
            WireFormat::Claude => self.finish_claude(tokens),
            WireFormat::Gemini | WireFormat::Antigravity => self.finish_gemini(tokens),
            WireFormat::OpenaiResponses => self.finish_responses(tokens),
            _ => self.finish_openai(tokens),
        }
    }

    /// In-stream error frame for streams that are already committed
    fn render_error(&self, message: &str) -> String {
        match self.target {
            WireFormat::Claude => ClaudeStreamEvent::Error {
                error: crate::models::claude::ClaudeError {
                    error_type: "api_error".to_string(),
                    message: message.to_string(),
                },
            }
            .to_sse(),
            _ => format!("data: {}\n\n", json!({"error": {"message": message}})),
        }
    }

    // -- openai -------------------------------------------------------------

    fn render_openai(&mut self, delta: Delta) -> Vec<String> {
        let chunk = match delta {
            Delta::Role => {
                if self.role_sent {
                    return Vec::new();
                }
                self.role_sent = true;
                OpenAIStreamDelta { role: Some("assistant".into()), ..Default::default() }
            }
            Delta::Text(text) => {
                let role = (!self.role_sent).then(|| "assistant".to_string());
                self.role_sent = true;
                OpenAIStreamDelta { role, content: Some(text), ..Default::default() }
            }
            Delta::ToolStart { index, id, name } => {
                let role = (!self.role_sent).then(|| "assistant".to_string());
                self.role_sent = true;
                OpenAIStreamDelta {
                    role,
                    content: None,
                    tool_calls: Some(vec![OpenAIStreamToolCall {
                        index,
                        id: Some(id),
                        tool_type: Some("function".into()),
                        function: OpenAIFunctionCall {
                            name: Some(name),
                            arguments: Some(String::new()),
                        },
                    }]),
                }
            }
            Delta::ToolArgs { index, fragment } => OpenAIStreamDelta {
                role: None,
                content: None,
                tool_calls: Some(vec![OpenAIStreamToolCall {
                    index,
                    id: None,
                    tool_type: None,
                    function: OpenAIFunctionCall { name: None, arguments: Some(fragment) },
                }]),
            },
            Delta::Finish { reason } => {
                self.finish_sent = true;
                let chunk = OpenAIStreamResponse::with_delta(
                    &self.model,
                    OpenAIStreamDelta::default(),
                    Some(reason),
                );
                return vec![openai_frame(&chunk)];
            }
        };
        vec![openai_frame(&OpenAIStreamResponse::with_delta(&self.model, chunk, None))]
    }

    fn finish_openai(&mut self, tokens: &TokenCounts) -> Vec<String> {
        let mut frames = Vec::new();
        if !self.finish_sent {
            self.finish_sent = true;
            frames.push(openai_frame(&OpenAIStreamResponse::with_delta(
                &self.model,
                OpenAIStreamDelta::default(),
                Some("stop".into()),
            )));
        }
        if !tokens.is_empty() {
            let mut chunk = OpenAIStreamResponse::with_delta(
                &self.model,
                OpenAIStreamDelta::default(),
                None,
            );
            chunk.choices.clear();
            chunk.usage = Some(OpenAIUsage {
                prompt_tokens: tokens.prompt,
                completion_tokens: tokens.completion,
                total_tokens: tokens.prompt + tokens.completion,
                ..Default::default()
            });
            frames.push(openai_frame(&chunk));
        }
        frames.push("data: [DONE]\n\n".to_string());
        frames
    }

    // -- claude -------------------------------------------------------------

    fn ensure_message_start(&mut self, frames: &mut Vec<String>) {
        if self.role_sent {
            return;
        }
        self.role_sent = true;
        frames.push(
            sse_named(
                "message_start",
                json!({
                    "type": "message_start",
                    "message": {
                        "id": self.message_id,
                        "type": "message",
                        "role": "assistant",
                        "content": [],
                        "model": self.model,
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": 0, "output_tokens": 0}
                    }
                }),
            ),
        );
    }

    fn close_open_block(&mut self, frames: &mut Vec<String>) {
        let index = match self.open_block {
            OpenBlock::None => return,
            OpenBlock::Text(index) | OpenBlock::Tool(index) => index,
        };
        frames.push(sse_named(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": index}),
        ));
        self.open_block = OpenBlock::None;
    }

    fn render_claude(&mut self, delta: Delta) -> Vec<String> {
        let mut frames = Vec::new();
        self.ensure_message_start(&mut frames);

        match delta {
            Delta::Role => {}
            Delta::Text(text) => {
                if !matches!(self.open_block, OpenBlock::Text(_)) {
                    self.close_open_block(&mut frames);
                    let index = self.next_block_index;
                    self.next_block_index += 1;
                    self.open_block = OpenBlock::Text(index);
                    frames.push(sse_named(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": index,
                            "content_block": {"type": "text", "text": ""}
                        }),
                    ));
                }
                if let OpenBlock::Text(index) = self.open_block {
                    frames.push(sse_named(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": index,
                            "delta": {"type": "text_delta", "text": text}
                        }),
                    ));
                }
            }
            Delta::ToolStart { index: tool_index, id, name } => {
                self.saw_tool_call = true;
                self.close_open_block(&mut frames);
                let index = self.next_block_index;
                self.next_block_index += 1;
                self.open_block = OpenBlock::Tool(index);
                self.tool_blocks.insert(tool_index, index);
                frames.push(sse_named(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
                    }),
                ));
            }
            Delta::ToolArgs { index: tool_index, fragment } => {
                if let Some(index) = self.tool_blocks.get(&tool_index).copied() {
                    frames.push(sse_named(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": index,
                            "delta": {"type": "input_json_delta", "partial_json": fragment}
                        }),
                    ));
                }
            }
            Delta::Finish { reason } => {
                self.finish_reason = Some(reason);
            }
        }
        frames
    }

    fn finish_claude(&mut self, tokens: &TokenCounts) -> Vec<String> {
        let mut frames = Vec::new();
        self.ensure_message_start(&mut frames);
        self.close_open_block(&mut frames);

        let reason = self
            .finish_reason
            .take()
            .unwrap_or_else(|| if self.saw_tool_call { "tool_calls" } else { "stop" }.into());
        frames.push(sse_named(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": openai_finish_to_claude(&reason), "stop_sequence": null},
                "usage": {
                    "input_tokens": tokens.prompt,
                    "output_tokens": tokens.completion
                }
            }),
        ));
        frames.push(sse_named("message_stop", json!({"type": "message_stop"})));
        self.finish_sent = true;
        frames
    }

    // -- gemini -------------------------------------------------------------

    fn render_gemini(&mut self, delta: Delta) -> Vec<String> {
        match delta {
            Delta::Role => Vec::new(),
            Delta::Text(text) => {
                vec![gemini_frame(json!({
                    "candidates": [{
                        "content": {"parts": [{"text": text}], "role": "model"},
                        "index": 0
                    }]
                }))]
            }
            // Gemini streams whole functionCall parts; fragments are
            // buffered until finish.
            Delta::ToolStart { index, id, name } => {
                self.saw_tool_call = true;
                self.gemini_tools.insert(index, (id, name, String::new()));
                Vec::new()
            }
            Delta::ToolArgs { index, fragment } => {
                if let Some((_, _, args)) = self.gemini_tools.get_mut(&index) {
                    args.push_str(&fragment);
                }
                Vec::new()
            }
            Delta::Finish { reason } => {
                self.finish_reason = Some(reason);
                Vec::new()
            }
        }
    }

    fn finish_gemini(&mut self, tokens: &TokenCounts) -> Vec<String> {
        self.finish_sent = true;
        let mut parts = Vec::new();
        let mut tool_indexes: Vec<u32> = self.gemini_tools.keys().copied().collect();
        tool_indexes.sort_unstable();
        for index in tool_indexes {
            let (id, name, args) = &self.gemini_tools[&index];
            let args: Value = serde_json::from_str(args).unwrap_or_else(|_| json!({}));
            parts.push(json!({"functionCall": {"id": id, "name": name, "args": args}}));
        }

        let reason = self.finish_reason.take().unwrap_or_else(|| "stop".into());
        let finish_reason = match reason.as_str() {
            "length" => "MAX_TOKENS",
            "content_filter" => "SAFETY",
            _ => "STOP",
        };

        let mut candidate = json!({"index": 0, "finishReason": finish_reason});
        if !parts.is_empty() {
            candidate["content"] = json!({"parts": parts, "role": "model"});
        }
        vec![gemini_frame(json!({
            "candidates": [candidate],
            "usageMetadata": {
                "promptTokenCount": tokens.prompt,
                "candidatesTokenCount": tokens.completion,
                "totalTokenCount": tokens.prompt + tokens.completion
            }
        }))]
    }

    // -- responses ----------------------------------------------------------

    fn render_responses(&mut self, delta: Delta) -> Vec<String> {
        match delta {
            Delta::Role => Vec::new(),
            Delta::Text(text) => vec![responses_frame(
                "response.output_text.delta",
                json!({"type": "response.output_text.delta", "delta": text}),
            )],
            Delta::ToolStart { index, id, name } => {
                self.saw_tool_call = true;
                vec![responses_frame(
                    "response.output_item.added",
                    json!({
                        "type": "response.output_item.added",
                        "output_index": index,
                        "item": {"type": "function_call", "call_id": id, "name": name, "arguments": ""}
                    }),
                )]
            }
            Delta::ToolArgs { index, fragment } => vec![responses_frame(
                "response.function_call_arguments.delta",
                json!({
                    "type": "response.function_call_arguments.delta",
                    "output_index": index,
                    "delta": fragment
                }),
            )],
            Delta::Finish { reason } => {
                self.finish_reason = Some(reason);
                Vec::new()
            }
        }
    }

    fn finish_responses(&mut self, tokens: &TokenCounts) -> Vec<String> {
        self.finish_sent = true;
        vec![responses_frame(
            "response.completed",
            json!({
                "type": "response.completed",
                "response": {
                    "id": format!("resp_{}", uuid::Uuid::new_v4().simple()),
                    "status": "completed",
                    "model": self.model,
                    "usage": {
                        "input_tokens": tokens.prompt,
                        "output_tokens": tokens.completion,
                        "total_tokens": tokens.prompt + tokens.completion
                    }
                }
            }),
        )]
    }
}

fn openai_frame(chunk: &OpenAIStreamResponse) -> String {
    format!("data: {}\n\n", serde_json::to_string(chunk).unwrap_or_else(|_| "{}".into()))
}

fn sse_named(name: &str, payload: Value) -> String {
    format!("event: {}\ndata: {}\n\n", name, payload)
}

fn gemini_frame(payload: Value) -> String {
    format!("data: {}\n\n", payload)
}

fn responses_frame(name: &str, payload: Value) -> String {
    format!("event: {}\ndata: {}\n\n", name, payload)
}

// ---------------------------------------------------------------------------
// Stream translator
// ---------------------------------------------------------------------------

/// Chunk-by-chunk stream translation with usage accumulation
pub struct StreamTranslator {
    source: WireFormat,
    normalizer: Normalizer,
    renderer: Renderer,
    pub tokens: TokenCounts,
    tool_name_map: HashMap<String, String>,
}

impl StreamTranslator {
    pub fn new(
        source: WireFormat,
        target: WireFormat,
        model: &str,
        tool_name_map: HashMap<String, String>,
    ) -> Self {
        Self {
            source,
            normalizer: Normalizer::default(),
            renderer: Renderer::new(target, model),
            tokens: TokenCounts::default(),
            tool_name_map,
        }
    }

    /// Translate one upstream SSE event into target-format frames
    pub fn on_event(&mut self, event: &SseEvent) -> Vec<String> {
        if event.data.trim() == "[DONE]" {
            return Vec::new();
        }
        let payload: Value = match serde_json::from_str(&event.data) {
            Ok(value) => value,
            Err(_) => {
                debug!("stream: skipping malformed SSE payload");
                return Vec::new();
            }
        };
        absorb_usage(self.source, &payload, &mut self.tokens);

        self.normalizer
            .normalize(self.source, event, &payload, &self.tool_name_map)
            .into_iter()
            .flat_map(|delta| self.renderer.render(delta))
            .collect()
    }

    /// Emit the target format's terminator frames
    pub fn finish(&mut self) -> Vec<String> {
        let tokens = self.tokens;
        self.renderer.finish(&tokens)
    }

    pub fn error_frame(&self, message: &str) -> String {
        self.renderer.render_error(message)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Why and how a piped stream ended
#[derive(Debug, Clone)]
pub struct StreamEnd {
    pub tokens: TokenCounts,
    pub client_disconnected: bool,
}

enum Mode {
    Translate(StreamTranslator),
    // Forward raw bytes, but still parse for the usage tally
    Passthrough { format: WireFormat, tokens: TokenCounts },
}

struct PipeState {
    upstream: ByteStream,
    parser: SseParser,
    mode: Mode,
    on_end: Option<Box<dyn FnOnce(StreamEnd) + Send>>,
    finished: bool,
}

impl PipeState {
    fn tokens(&self) -> TokenCounts {
        match &self.mode {
            Mode::Translate(translator) => translator.tokens,
            Mode::Passthrough { tokens, .. } => *tokens,
        }
    }

    fn end(&mut self, client_disconnected: bool) {
        if let Some(on_end) = self.on_end.take() {
            on_end(StreamEnd { tokens: self.tokens(), client_disconnected });
        }
    }
}

// Downstream dropped the stream before the upstream finished: propagate as a
// client disconnect.
impl Drop for PipeState {
    fn drop(&mut self) {
        if self.on_end.is_some() {
            debug!("stream: client disconnected before upstream finished");
            self.end(true);
        }
    }
}

/// Pipe an upstream SSE body to the client, translating when the formats
/// differ. `on_end` runs exactly once: at upstream EOF, on upstream error or
/// on client disconnect.
pub fn pipe_sse(
    upstream: ByteStream,
    translator: Option<StreamTranslator>,
    passthrough_format: WireFormat,
    on_end: impl FnOnce(StreamEnd) + Send + 'static,
) -> ByteStream {
    let mode = match translator {
        Some(translator) => Mode::Translate(translator),
        None => Mode::Passthrough { format: passthrough_format, tokens: TokenCounts::default() },
    };
    let state = PipeState {
        upstream,
        parser: SseParser::new(),
        mode,
        on_end: Some(Box::new(on_end)),
        finished: false,
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            match state.upstream.next().await {
                Some(Ok(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    let events = state.parser.feed(&text);
                    match &mut state.mode {
                        Mode::Translate(translator) => {
                            let frames: String =
                                events.iter().flat_map(|e| translator.on_event(e)).collect();
                            if frames.is_empty() {
                                continue; // nothing renderable yet, pull again
                            }
                            return Some((Ok(Bytes::from(frames)), state));
                        }
                        Mode::Passthrough { format, tokens } => {
                            for event in &events {
                                if let Ok(payload) = serde_json::from_str::<Value>(&event.data) {
                                    absorb_usage(*format, &payload, tokens);
                                }
                            }
                            return Some((Ok(bytes), state));
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!("stream: upstream error mid-stream: {}", e);
                    state.finished = true;
                    let frame = match &state.mode {
                        Mode::Translate(translator) => {
                            translator.error_frame(&format!("upstream error: {}", e))
                        }
                        Mode::Passthrough { .. } => format!(
                            "data: {}\n\n",
                            json!({"error": {"message": format!("upstream error: {}", e)}})
                        ),
                    };
                    state.end(false);
                    return Some((Ok(Bytes::from(frame)), state));
                }
                None => {
                    state.finished = true;
                    let frames = match &mut state.mode {
                        Mode::Translate(translator) => translator.finish().concat(),
                        Mode::Passthrough { .. } => String::new(),
                    };
                    state.end(false);
                    if frames.is_empty() {
                        return None;
                    }
                    return Some((Ok(Bytes::from(frames)), state));
                }
            }
        }
    });
    Box::pin(stream)
}

/// Collect a translated OpenAI SSE stream into a full chat completion
///
/// Used when the upstream only streams (Kiro) but the client asked for a
/// non-streaming response.
pub fn aggregate_openai_stream(sse_text: &str, model: &str) -> Value {
    let mut content = String::new();
    let mut tool_calls: Vec<(String, String, String)> = Vec::new(); // id, name, args
    let mut finish_reason = "stop".to_string();
    let mut usage = json!({"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0});

    let mut parser = SseParser::new();
    let mut events = parser.feed(sse_text);
    events.extend(parser.feed("\n\n"));
    for event in events {
        if event.data.trim() == "[DONE]" {
            continue;
        }
        let Ok(payload) = serde_json::from_str::<Value>(&event.data) else { continue };
        if let Some(u) = payload.get("usage").filter(|u| !u.is_null()) {
            usage = u.clone();
        }
        let Some(choice) = payload.get("choices").and_then(|c| c.get(0)) else { continue };
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            finish_reason = reason.to_string();
        }
        let Some(delta) = choice.get("delta") else { continue };
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            content.push_str(text);
        }
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                while tool_calls.len() <= index {
                    tool_calls.push((String::new(), String::new(), String::new()));
                }
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    tool_calls[index].0 = id.to_string();
                }
                if let Some(name) =
                    call.get("function").and_then(|f| f.get("name")).and_then(Value::as_str)
                {
                    tool_calls[index].1 = name.to_string();
                }
                if let Some(args) =
                    call.get("function").and_then(|f| f.get("arguments")).and_then(Value::as_str)
                {
                    tool_calls[index].2.push_str(args);
                }
            }
        }
    }

    let mut message = json!({"role": "assistant", "content": content});
    if !tool_calls.is_empty() {
        message["content"] = Value::Null;
        if !content.is_empty() {
            message["content"] = json!(content);
        }
        message["tool_calls"] = Value::Array(
            tool_calls
                .into_iter()
                .map(|(id, name, args)| {
                    json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": args}
                    })
                })
                .collect(),
        );
    }

    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason
        }],
        "usage": usage
    })
}
