//! Wire-format request translation
//!
//! Directed translations between client formats and provider dialects.
//! OpenAI Chat Completions is the hub: when no direct edge exists for a
//! (source, target) pair the translation is composed as source → OpenAI →
//! target. Each translator is a pure function; only the Gemini-family
//! targets call into the schema sanitizer.

use crate::models::claude::*;
use crate::models::gemini::*;
use crate::models::openai::*;
use crate::models::responses::*;
use crate::models::WireFormat;
use crate::services::schema::sanitize_tool_schema;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Per-request translation inputs beyond the body itself
#[derive(Debug, Clone, Copy, Default)]
pub struct TranslateOptions<'a> {
    /// Upstream model name, substituted into the translated body
    pub model: &'a str,
    /// Whether the client asked for a streamed response
    pub stream: bool,
    /// The upstream call authenticates via OAuth (restricts tool identifiers
    /// for Anthropic)
    pub oauth: bool,
    /// CodeWhisperer profile ARN, required by the Kiro dialect
    pub profile_arn: Option<&'a str>,
}

/// Translate a request body from `src` to `tgt`
///
/// Identity when the formats match (the model name is still substituted).
pub fn translate_request(
    src: WireFormat,
    tgt: WireFormat,
    opts: &TranslateOptions,
    body: Value,
) -> Result<Value> {
    if src == tgt {
        return Ok(substitute_model(body, opts.model, src));
    }

    match (src, tgt) {
        (WireFormat::Openai, _) => from_openai(tgt, opts, parse_openai(body)?),
        (_, WireFormat::Openai) => {
            let openai = to_openai(src, body)?;
            Ok(serde_json::to_value(apply_model(openai, opts))?)
        }
        // No direct edge: route through the hub
        _ => {
            let openai = to_openai(src, body)?;
            from_openai(tgt, opts, openai)
        }
    }
}

fn parse_openai(body: Value) -> Result<OpenAIRequest> {
    serde_json::from_value(body).context("invalid OpenAI chat completion body")
}

fn to_openai(src: WireFormat, body: Value) -> Result<OpenAIRequest> {
    match src {
        WireFormat::Openai => parse_openai(body),
        WireFormat::Claude => {
            let request: ClaudeRequest =
                serde_json::from_value(body).context("invalid Anthropic messages body")?;
            Ok(claude_to_openai(request))
        }
        WireFormat::Gemini => {
            let body = unwrap_gemini_envelope(body);
            let request: GeminiRequest =
                serde_json::from_value(body).context("invalid Gemini generateContent body")?;
            Ok(gemini_to_openai(request))
        }
        WireFormat::OpenaiResponses => {
            let request: ResponsesRequest =
                serde_json::from_value(body).context("invalid Responses API body")?;
            Ok(responses_to_openai(request))
        }
        other => anyhow::bail!("no translation from {} to openai", other),
    }
}

fn from_openai(tgt: WireFormat, opts: &TranslateOptions, request: OpenAIRequest) -> Result<Value> {
    let request = apply_model(request, opts);
    match tgt {
        WireFormat::Openai => Ok(serde_json::to_value(request)?),
        WireFormat::Claude => {
            let (claude, name_map) = openai_to_claude(request, opts.oauth);
            attach_tool_name_map(serde_json::to_value(claude)?, name_map)
        }
        WireFormat::Gemini => Ok(serde_json::to_value(openai_to_gemini(&request))?),
        WireFormat::OpenaiResponses => Ok(serde_json::to_value(openai_to_responses(request))?),
        WireFormat::Antigravity => Ok(openai_to_antigravity(&request)),
        WireFormat::Kiro => openai_to_kiro(&request, opts),
        WireFormat::Copilot => Ok(openai_to_copilot(request)),
        WireFormat::Qwen => Ok(openai_to_qwen(request)),
        WireFormat::Iflow => Ok(openai_to_iflow(request)),
    }
}

fn apply_model(mut request: OpenAIRequest, opts: &TranslateOptions) -> OpenAIRequest {
    request.model = opts.model.to_string();
    request.stream = Some(opts.stream).filter(|s| *s);
    request
}

fn substitute_model(mut body: Value, model: &str, format: WireFormat) -> Value {
    // Gemini carries the model in the URL, not the body
    if format != WireFormat::Gemini {
        if let Some(map) = body.as_object_mut() {
            map.insert("model".to_string(), json!(model));
        }
    }
    body
}

fn attach_tool_name_map(mut body: Value, name_map: HashMap<String, String>) -> Result<Value> {
    if !name_map.is_empty() {
        if let Some(map) = body.as_object_mut() {
            map.insert("_tool_name_map".to_string(), serde_json::to_value(name_map)?);
        }
    }
    Ok(body)
}

// Gemini bodies may arrive wrapped as {"model": ..., "request": {...}} from
// CLI-style clients; the inner request is the real one.
fn unwrap_gemini_envelope(body: Value) -> Value {
    match body.get("request") {
        Some(inner) if inner.get("contents").is_some() => inner.clone(),
        _ => body,
    }
}

/// Placeholder inlined when a source part has no target representation
fn image_placeholder() -> String {
    "[image content omitted]".to_string()
}

// ---------------------------------------------------------------------------
// Claude ↔ OpenAI
// ---------------------------------------------------------------------------

fn claude_to_openai(request: ClaudeRequest) -> OpenAIRequest {
    let mut messages = Vec::new();

    if let Some(system) = &request.system {
        messages.push(OpenAIMessage::text("system", system.extract_text()));
    }

    for message in request.messages {
        match message.content {
            ClaudeContent::Text(text) => {
                messages.push(OpenAIMessage::text(&message.role, text));
            }
            ClaudeContent::Blocks(blocks) => {
                convert_claude_blocks(&message.role, blocks, &mut messages);
            }
        }
    }

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| OpenAITool {
                tool_type: "function".to_string(),
                function: OpenAIFunction {
                    name: tool.name,
                    description: tool.description,
                    parameters: Some(tool.input_schema),
                },
            })
            .collect()
    });

    OpenAIRequest {
        model: request.model,
        messages,
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences,
        stream: request.stream,
        tools,
        tool_choice: request.tool_choice.map(claude_tool_choice_to_openai),
        ..Default::default()
    }
}

fn convert_claude_blocks(role: &str, blocks: Vec<ClaudeContentBlock>, out: &mut Vec<OpenAIMessage>) {
    let mut parts: Vec<OpenAIContentPart> = Vec::new();
    let mut tool_calls: Vec<OpenAIToolCall> = Vec::new();
    let mut tool_results: Vec<OpenAIMessage> = Vec::new();

    for block in blocks {
        match block {
            ClaudeContentBlock::Text { text } => {
                parts.push(OpenAIContentPart::Text { text });
            }
            ClaudeContentBlock::Thinking { .. } => {}
            ClaudeContentBlock::Image { source } => {
                let url = match (&source.url, &source.media_type, &source.data) {
                    (Some(url), _, _) => url.clone(),
                    (None, Some(media_type), Some(data)) => {
                        format!("data:{};base64,{}", media_type, data)
                    }
                    _ => {
                        parts.push(OpenAIContentPart::Text { text: image_placeholder() });
                        continue;
                    }
                };
                parts.push(OpenAIContentPart::ImageUrl {
                    image_url: OpenAIImageUrl { url, detail: None },
                });
            }
            ClaudeContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(OpenAIToolCall {
                    id,
                    tool_type: "function".to_string(),
                    function: OpenAIFunctionCall {
                        name: Some(name),
                        arguments: Some(input.to_string()),
                    },
                });
            }
            ClaudeContentBlock::ToolResult { tool_use_id, content, .. } => {
                let text = content.map(|c| c.extract_text()).unwrap_or_default();
                tool_results.push(OpenAIMessage {
                    role: "tool".to_string(),
                    content: Some(OpenAIContent::Text(text)),
                    name: None,
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id),
                });
            }
        }
    }

    // Tool results must directly follow the assistant turn that issued them
    out.extend(tool_results);

    if !parts.is_empty() || !tool_calls.is_empty() {
        let content = match parts.len() {
            0 => None,
            1 => match parts.into_iter().next() {
                Some(OpenAIContentPart::Text { text }) => Some(OpenAIContent::Text(text)),
                Some(part) => Some(OpenAIContent::Array(vec![part])),
                None => None,
            },
            _ => Some(OpenAIContent::Array(parts)),
        };
        out.push(OpenAIMessage {
            role: role.to_string(),
            content,
            name: None,
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            tool_call_id: None,
        });
    }
}

fn claude_tool_choice_to_openai(choice: Value) -> Value {
    match choice.get("type").and_then(Value::as_str) {
        Some("auto") => json!("auto"),
        Some("any") => json!("required"),
        Some("tool") => json!({
            "type": "function",
            "function": {"name": choice.get("name").cloned().unwrap_or(Value::Null)}
        }),
        _ => json!("auto"),
    }
}

fn openai_tool_choice_to_claude(choice: &Value) -> Value {
    match choice {
        Value::String(s) => match s.as_str() {
            "required" => json!({"type": "any"}),
            "none" | "auto" => json!({"type": "auto"}),
            _ => json!({"type": "auto"}),
        },
        Value::Object(_) => {
            let name = choice
                .get("function")
                .and_then(|f| f.get("name"))
                .cloned()
                .unwrap_or(Value::Null);
            json!({"type": "tool", "name": name})
        }
        _ => json!({"type": "auto"}),
    }
}

fn openai_to_claude(request: OpenAIRequest, oauth: bool) -> (ClaudeRequest, HashMap<String, String>) {
    let mut name_map = HashMap::new();
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<ClaudeMessage> = Vec::new();

    for message in &request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = &message.content {
                    system_parts.push(content.extract_text());
                }
            }
            "assistant" => {
                let mut blocks: Vec<ClaudeContentBlock> = Vec::new();
                if let Some(content) = &message.content {
                    push_claude_text_blocks(content, &mut blocks);
                }
                if let Some(tool_calls) = &message.tool_calls {
                    for call in tool_calls {
                        let original = call.function.name.clone().unwrap_or_default();
                        let renamed = rewrite_tool_name(&original, oauth, &mut name_map);
                        blocks.push(ClaudeContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: renamed,
                            input: call
                                .function
                                .arguments
                                .as_deref()
                                .and_then(|a| serde_json::from_str(a).ok())
                                .unwrap_or_else(|| json!({})),
                        });
                    }
                }
                if !blocks.is_empty() {
                    messages.push(ClaudeMessage {
                        role: "assistant".to_string(),
                        content: ClaudeContent::Blocks(blocks),
                    });
                }
            }
            "tool" => {
                let block = ClaudeContentBlock::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content: Some(ClaudeToolResultContent::Text(
                        message.content.as_ref().map(|c| c.extract_text()).unwrap_or_default(),
                    )),
                    is_error: None,
                };
                // Fold consecutive tool results into one user turn
                if let Some(ClaudeMessage { role, content: ClaudeContent::Blocks(blocks) }) =
                    messages.last_mut()
                {
                    if role == "user"
                        && blocks.iter().all(|b| matches!(b, ClaudeContentBlock::ToolResult { .. }))
                    {
                        blocks.push(block);
                        continue;
                    }
                }
                messages.push(ClaudeMessage {
                    role: "user".to_string(),
                    content: ClaudeContent::Blocks(vec![block]),
                });
            }
            _ => {
                let content = match &message.content {
                    Some(OpenAIContent::Text(text)) => ClaudeContent::Text(text.clone()),
                    Some(OpenAIContent::Array(parts)) => {
                        let mut blocks = Vec::new();
                        for part in parts {
                            match part {
                                OpenAIContentPart::Text { text } => {
                                    blocks.push(ClaudeContentBlock::Text { text: text.clone() })
                                }
                                OpenAIContentPart::ImageUrl { image_url } => {
                                    blocks.push(openai_image_to_claude(&image_url.url))
                                }
                            }
                        }
                        ClaudeContent::Blocks(blocks)
                    }
                    None => ClaudeContent::Text(String::new()),
                };
                messages.push(ClaudeMessage { role: "user".to_string(), content });
            }
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| ClaudeTool {
                name: rewrite_tool_name(&tool.function.name, oauth, &mut name_map),
                description: tool.function.description.clone(),
                input_schema: tool
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            })
            .collect()
    });

    let claude = ClaudeRequest {
        model: request.model,
        max_tokens: request.max_tokens.or(request.max_completion_tokens).unwrap_or(4096),
        messages,
        system: if system_parts.is_empty() {
            None
        } else {
            Some(ClaudeSystemPrompt::Text(system_parts.join("\n\n")))
        },
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: request.stop,
        stream: request.stream,
        tools,
        tool_choice: request.tool_choice.as_ref().map(openai_tool_choice_to_claude),
        ..Default::default()
    };
    (claude, name_map)
}

fn push_claude_text_blocks(content: &OpenAIContent, blocks: &mut Vec<ClaudeContentBlock>) {
    match content {
        OpenAIContent::Text(text) => {
            if !text.is_empty() {
                blocks.push(ClaudeContentBlock::Text { text: text.clone() });
            }
        }
        OpenAIContent::Array(parts) => {
            for part in parts {
                match part {
                    OpenAIContentPart::Text { text } => {
                        blocks.push(ClaudeContentBlock::Text { text: text.clone() })
                    }
                    OpenAIContentPart::ImageUrl { image_url } => {
                        blocks.push(openai_image_to_claude(&image_url.url))
                    }
                }
            }
        }
    }
}

fn openai_image_to_claude(url: &str) -> ClaudeContentBlock {
    if let Some((media_type, data)) = parse_data_url(url) {
        ClaudeContentBlock::Image {
            source: ClaudeImageSource {
                source_type: "base64".to_string(),
                media_type: Some(media_type),
                data: Some(data),
                url: None,
            },
        }
    } else {
        ClaudeContentBlock::Image {
            source: ClaudeImageSource {
                source_type: "url".to_string(),
                media_type: None,
                data: None,
                url: Some(url.to_string()),
            },
        }
    }
}

// Anthropic OAuth tokens reject tool identifiers outside [a-zA-Z0-9_-]{1,64};
// renamed tools are recorded so responses can be mapped back.
fn rewrite_tool_name(name: &str, oauth: bool, name_map: &mut HashMap<String, String>) -> String {
    if !oauth {
        return name.to_string();
    }
    let mut renamed: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if renamed.len() > 64 {
        renamed.truncate(64);
    }
    if renamed.is_empty() {
        renamed = "tool".to_string();
    }
    if renamed != name {
        name_map.insert(renamed.clone(), name.to_string());
    }
    renamed
}

// ---------------------------------------------------------------------------
// Gemini ↔ OpenAI
// ---------------------------------------------------------------------------

fn openai_to_gemini(request: &OpenAIRequest) -> GeminiRequest {
    let mut contents: Vec<GeminiContent> = Vec::new();
    let mut system_texts: Vec<String> = Vec::new();
    let mut call_names: HashMap<String, String> = HashMap::new();

    for message in &request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = &message.content {
                    system_texts.push(content.extract_text());
                }
            }
            "tool" => {
                let id = message.tool_call_id.clone().unwrap_or_default();
                let name = call_names.get(&id).cloned().unwrap_or_else(|| id.clone());
                let text = message.content.as_ref().map(|c| c.extract_text()).unwrap_or_default();
                push_part(
                    &mut contents,
                    "user",
                    GeminiPart::FunctionResponse {
                        function_response: GeminiFunctionResponse {
                            name,
                            response: json!({"result": text}),
                            id: Some(id).filter(|i| !i.is_empty()),
                        },
                    },
                );
            }
            role => {
                let gemini_role = if role == "assistant" { "model" } else { "user" };
                let mut parts: Vec<GeminiPart> = Vec::new();

                if let Some(content) = &message.content {
                    match content {
                        OpenAIContent::Text(text) => {
                            if !text.is_empty() {
                                parts.push(GeminiPart::Text { text: text.clone(), thought: None });
                            }
                        }
                        OpenAIContent::Array(array) => {
                            for part in array {
                                match part {
                                    OpenAIContentPart::Text { text } => parts
                                        .push(GeminiPart::Text { text: text.clone(), thought: None }),
                                    OpenAIContentPart::ImageUrl { image_url } => {
                                        if let Some((mime_type, data)) = parse_data_url(&image_url.url)
                                        {
                                            parts.push(GeminiPart::InlineData {
                                                inline_data: GeminiInlineData { mime_type, data },
                                            });
                                        } else {
                                            parts.push(GeminiPart::Text {
                                                text: image_placeholder(),
                                                thought: None,
                                            });
                                        }
                                    }
                                }
                            }
                        }
                    }
                }

                if let Some(tool_calls) = &message.tool_calls {
                    for call in tool_calls {
                        let name = call.function.name.clone().unwrap_or_default();
                        call_names.insert(call.id.clone(), name.clone());
                        parts.push(GeminiPart::FunctionCall {
                            function_call: GeminiFunctionCall {
                                name,
                                args: call
                                    .function
                                    .arguments
                                    .as_deref()
                                    .and_then(|a| serde_json::from_str(a).ok())
                                    .unwrap_or_else(|| json!({})),
                                id: Some(call.id.clone()),
                            },
                            thought_signature: None,
                        });
                    }
                }

                for part in parts {
                    push_part(&mut contents, gemini_role, part);
                }
            }
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        vec![GeminiTool {
            function_declarations: tools
                .iter()
                .map(|tool| GeminiFunctionDeclaration {
                    name: tool.function.name.clone(),
                    description: tool.function.description.clone().unwrap_or_default(),
                    parameters: sanitize_tool_schema(tool.function.parameters.clone()),
                })
                .collect(),
        }]
    });

    GeminiRequest {
        contents,
        system_instruction: if system_texts.is_empty() {
            None
        } else {
            Some(GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart::Text { text: system_texts.join("\n\n"), thought: None }],
            })
        },
        tools,
        tool_config: None,
        generation_config: Some(GeminiGenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: None,
            max_output_tokens: request.max_tokens.or(request.max_completion_tokens),
            stop_sequences: request.stop.clone(),
        }),
        safety_settings: None,
    }
}

// Consecutive parts with the same role collapse into one content entry
fn push_part(contents: &mut Vec<GeminiContent>, role: &str, part: GeminiPart) {
    if let Some(last) = contents.last_mut() {
        if last.role == role {
            last.parts.push(part);
            return;
        }
    }
    contents.push(GeminiContent { role: role.to_string(), parts: vec![part] });
}

fn gemini_to_openai(request: GeminiRequest) -> OpenAIRequest {
    let mut messages: Vec<OpenAIMessage> = Vec::new();
    // functionResponse parts pair by name when the call carried no id
    let mut last_call_ids: HashMap<String, String> = HashMap::new();

    if let Some(system) = &request.system_instruction {
        let text = gemini_parts_text(&system.parts);
        if !text.is_empty() {
            messages.push(OpenAIMessage::text("system", text));
        }
    }

    for content in &request.contents {
        let role = if content.role == "model" { "assistant" } else { "user" };
        let mut parts: Vec<OpenAIContentPart> = Vec::new();
        let mut tool_calls: Vec<OpenAIToolCall> = Vec::new();

        for part in &content.parts {
            match part {
                GeminiPart::Text { text, thought } => {
                    if thought.unwrap_or(false) {
                        continue;
                    }
                    parts.push(OpenAIContentPart::Text { text: text.clone() });
                }
                GeminiPart::InlineData { inline_data } => {
                    parts.push(OpenAIContentPart::ImageUrl {
                        image_url: OpenAIImageUrl {
                            url: format!(
                                "data:{};base64,{}",
                                inline_data.mime_type, inline_data.data
                            ),
                            detail: None,
                        },
                    });
                }
                GeminiPart::FunctionCall { function_call, .. } => {
                    let id = function_call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                    last_call_ids.insert(function_call.name.clone(), id.clone());
                    tool_calls.push(OpenAIToolCall {
                        id,
                        tool_type: "function".to_string(),
                        function: OpenAIFunctionCall {
                            name: Some(function_call.name.clone()),
                            arguments: Some(function_call.args.to_string()),
                        },
                    });
                }
                GeminiPart::FunctionResponse { function_response } => {
                    let id = function_response
                        .id
                        .clone()
                        .or_else(|| last_call_ids.get(&function_response.name).cloned())
                        .unwrap_or_else(|| function_response.name.clone());
                    let text = function_response
                        .response
                        .get("result")
                        .and_then(Value::as_str)
                        .map(String::from)
                        .unwrap_or_else(|| function_response.response.to_string());
                    messages.push(OpenAIMessage {
                        role: "tool".to_string(),
                        content: Some(OpenAIContent::Text(text)),
                        name: None,
                        tool_calls: None,
                        tool_call_id: Some(id),
                    });
                }
            }
        }

        if !parts.is_empty() || !tool_calls.is_empty() {
            let content = match parts.len() {
                0 => None,
                1 => match parts.into_iter().next() {
                    Some(OpenAIContentPart::Text { text }) => Some(OpenAIContent::Text(text)),
                    Some(part) => Some(OpenAIContent::Array(vec![part])),
                    None => None,
                },
                _ => Some(OpenAIContent::Array(parts)),
            };
            messages.push(OpenAIMessage {
                role: role.to_string(),
                content,
                name: None,
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                tool_call_id: None,
            });
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .flat_map(|tool| &tool.function_declarations)
            .map(|declaration| OpenAITool {
                tool_type: "function".to_string(),
                function: OpenAIFunction {
                    name: declaration.name.clone(),
                    description: Some(declaration.description.clone()),
                    parameters: declaration.parameters.clone(),
                },
            })
            .collect()
    });

    let config = request.generation_config.unwrap_or_default();
    OpenAIRequest {
        messages,
        tools,
        max_tokens: config.max_output_tokens,
        temperature: config.temperature,
        top_p: config.top_p,
        stop: config.stop_sequences,
        ..Default::default()
    }
}

fn gemini_parts_text(parts: &[GeminiPart]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            GeminiPart::Text { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Responses ↔ OpenAI
// ---------------------------------------------------------------------------

fn openai_to_responses(request: OpenAIRequest) -> ResponsesRequest {
    let mut instructions: Vec<String> = Vec::new();
    let mut input: Vec<Value> = Vec::new();

    for message in &request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = &message.content {
                    instructions.push(content.extract_text());
                }
            }
            "tool" => {
                input.push(json!({
                    "type": "function_call_output",
                    "call_id": message.tool_call_id.clone().unwrap_or_default(),
                    "output": message.content.as_ref().map(|c| c.extract_text()).unwrap_or_default(),
                }));
            }
            role => {
                if let Some(content) = &message.content {
                    let part_type = if role == "assistant" { "output_text" } else { "input_text" };
                    let parts: Vec<Value> = match content {
                        OpenAIContent::Text(text) => {
                            vec![json!({"type": part_type, "text": text})]
                        }
                        OpenAIContent::Array(array) => array
                            .iter()
                            .map(|part| match part {
                                OpenAIContentPart::Text { text } => {
                                    json!({"type": part_type, "text": text})
                                }
                                OpenAIContentPart::ImageUrl { image_url } => {
                                    json!({"type": "input_image", "image_url": image_url.url})
                                }
                            })
                            .collect(),
                    };
                    if !parts.is_empty() {
                        input.push(json!({"role": role, "content": parts}));
                    }
                }
                if let Some(tool_calls) = &message.tool_calls {
                    for call in tool_calls {
                        input.push(json!({
                            "type": "function_call",
                            "call_id": call.id,
                            "name": call.function.name.clone().unwrap_or_default(),
                            "arguments": call.function.arguments.clone().unwrap_or_default(),
                        }));
                    }
                }
            }
        }
    }

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| ResponsesTool {
                tool_type: "function".to_string(),
                name: Some(tool.function.name),
                description: tool.function.description,
                parameters: tool.function.parameters,
            })
            .collect()
    });

    ResponsesRequest {
        model: request.model,
        input,
        instructions: if instructions.is_empty() { None } else { Some(instructions.join("\n\n")) },
        previous_response_id: None,
        // Upstream rejects very small output budgets
        max_output_tokens: request.max_tokens.or(request.max_completion_tokens).map(|t| t.max(16)),
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.stream,
        tools,
        tool_choice: request.tool_choice,
    }
}

fn responses_to_openai(request: ResponsesRequest) -> OpenAIRequest {
    let mut messages: Vec<OpenAIMessage> = Vec::new();

    if let Some(instructions) = &request.instructions {
        messages.push(OpenAIMessage::text("system", instructions.clone()));
    }

    for item in &request.input {
        match item.get("type").and_then(Value::as_str) {
            Some("function_call") => {
                messages.push(OpenAIMessage {
                    role: "assistant".to_string(),
                    content: None,
                    name: None,
                    tool_calls: Some(vec![OpenAIToolCall {
                        id: item
                            .get("call_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        tool_type: "function".to_string(),
                        function: OpenAIFunctionCall {
                            name: item.get("name").and_then(Value::as_str).map(String::from),
                            arguments: item
                                .get("arguments")
                                .and_then(Value::as_str)
                                .map(String::from),
                        },
                    }]),
                    tool_call_id: None,
                });
            }
            Some("function_call_output") => {
                messages.push(OpenAIMessage {
                    role: "tool".to_string(),
                    content: Some(OpenAIContent::Text(
                        item.get("output").and_then(Value::as_str).unwrap_or_default().to_string(),
                    )),
                    name: None,
                    tool_calls: None,
                    tool_call_id: item
                        .get("call_id")
                        .and_then(Value::as_str)
                        .map(String::from),
                });
            }
            _ => {
                let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
                let text = match item.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Array(parts)) => parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join(""),
                    _ => continue,
                };
                messages.push(OpenAIMessage::text(role, text));
            }
        }
    }

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .filter(|tool| tool.tool_type == "function")
            .map(|tool| OpenAITool {
                tool_type: "function".to_string(),
                function: OpenAIFunction {
                    name: tool.name.unwrap_or_default(),
                    description: tool.description,
                    parameters: tool.parameters,
                },
            })
            .collect()
    });

    OpenAIRequest {
        model: request.model,
        messages,
        max_tokens: request.max_output_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.stream,
        tools,
        tool_choice: request.tool_choice,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Provider dialects (OpenAI →)
// ---------------------------------------------------------------------------

// Antigravity speaks the Gemini shape inside a CLI-style envelope.
fn openai_to_antigravity(request: &OpenAIRequest) -> Value {
    let gemini = openai_to_gemini(request);
    json!({
        "model": request.model,
        "request": gemini,
    })
}

// Copilot is OpenAI-compatible but rejects proxy-side extras.
fn openai_to_copilot(mut request: OpenAIRequest) -> Value {
    request.user = None;
    request.stream_options = None;
    serde_json::to_value(request).unwrap_or_default()
}

fn openai_to_qwen(mut request: OpenAIRequest) -> Value {
    if request.stream.unwrap_or(false) {
        // DashScope only reports usage when asked to
        request.stream_options = Some(json!({"include_usage": true}));
    }
    serde_json::to_value(request).unwrap_or_default()
}

fn openai_to_iflow(mut request: OpenAIRequest) -> Value {
    request.stream_options = None;
    serde_json::to_value(request).unwrap_or_default()
}

/// CodeWhisperer conversation-state body
fn openai_to_kiro(request: &OpenAIRequest, opts: &TranslateOptions) -> Result<Value> {
    let mut system_text = String::new();
    let mut history: Vec<Value> = Vec::new();
    let mut pending_tool_results: Vec<Value> = Vec::new();
    let mut current_user_text = String::new();

    for message in &request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = &message.content {
                    if !system_text.is_empty() {
                        system_text.push('\n');
                    }
                    system_text.push_str(&content.extract_text());
                }
            }
            "assistant" => {
                let mut entry = json!({
                    "assistantResponseMessage": {
                        "content": message.content.as_ref().map(|c| c.extract_text()).unwrap_or_default(),
                    }
                });
                if let Some(tool_calls) = &message.tool_calls {
                    let uses: Vec<Value> = tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "toolUseId": call.id,
                                "name": call.function.name.clone().unwrap_or_default(),
                                "input": call
                                    .function
                                    .arguments
                                    .as_deref()
                                    .and_then(|a| serde_json::from_str::<Value>(a).ok())
                                    .unwrap_or_else(|| json!({})),
                            })
                        })
                        .collect();
                    entry["assistantResponseMessage"]["toolUses"] = json!(uses);
                }
                history.push(entry);
            }
            "tool" => {
                pending_tool_results.push(json!({
                    "toolUseId": message.tool_call_id.clone().unwrap_or_default(),
                    "status": "success",
                    "content": [{
                        "text": message.content.as_ref().map(|c| c.extract_text()).unwrap_or_default()
                    }],
                }));
            }
            _ => {
                let text = message.content.as_ref().map(|c| c.extract_text()).unwrap_or_default();
                // Earlier user turns go into history; the final one becomes
                // the current message below.
                if !current_user_text.is_empty() {
                    history.push(json!({
                        "userInputMessage": {"content": current_user_text, "modelId": request.model}
                    }));
                }
                current_user_text = text;
            }
        }
    }

    let mut context = json!({});
    if let Some(tools) = &request.tools {
        let specs: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "toolSpecification": {
                        "name": tool.function.name,
                        "description": tool.function.description.clone().unwrap_or_default(),
                        "inputSchema": {"json": tool.function.parameters.clone().unwrap_or(json!({}))},
                    }
                })
            })
            .collect();
        context["tools"] = json!(specs);
    }
    if !pending_tool_results.is_empty() {
        context["toolResults"] = json!(pending_tool_results);
    }

    let content = if system_text.is_empty() {
        current_user_text
    } else if current_user_text.is_empty() {
        system_text
    } else {
        format!("{}\n\n{}", system_text, current_user_text)
    };

    let mut body = json!({
        "conversationState": {
            "chatTriggerType": "MANUAL",
            "conversationId": uuid::Uuid::new_v4().to_string(),
            "currentMessage": {
                "userInputMessage": {
                    "content": content,
                    "modelId": opts.model,
                    "origin": "AI_EDITOR",
                    "userInputMessageContext": context,
                }
            },
            "history": history,
        }
    });
    if let Some(profile_arn) = opts.profile_arn {
        body["profileArn"] = json!(profile_arn);
    }
    Ok(body)
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let mime_type = header.split(';').next().unwrap_or("application/octet-stream").to_string();
    Some((mime_type, data.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai_request_with_tools() -> Value {
        json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "weather in Paris?"},
                {"role": "assistant", "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "18C"},
                {"role": "assistant", "content": "It is 18C."}
            ],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "description": "Look up the weather",
                    "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
                }
            }]
        })
    }

    #[test]
    fn test_identity_substitutes_model() {
        let opts = TranslateOptions { model: "gpt-4o-mini", ..Default::default() };
        let body = json!({"model": "alias", "messages": []});
        let out =
            translate_request(WireFormat::Openai, WireFormat::Openai, &opts, body).unwrap();
        assert_eq!(out["model"], json!("gpt-4o-mini"));
    }

    #[test]
    fn test_openai_claude_roundtrip_preserves_tools_and_text() {
        let opts = TranslateOptions { model: "claude-sonnet-4", ..Default::default() };
        let claude = translate_request(
            WireFormat::Openai,
            WireFormat::Claude,
            &opts,
            openai_request_with_tools(),
        )
        .unwrap();

        assert_eq!(claude["system"], json!("be brief"));
        assert_eq!(claude["tools"][0]["name"], json!("get_weather"));
        // tool result paired with the tool_use id
        let has_tool_result = claude["messages"].as_array().unwrap().iter().any(|m| {
            m["content"].as_array().map_or(false, |blocks| {
                blocks.iter().any(|b| b["type"] == "tool_result" && b["tool_use_id"] == "call_1")
            })
        });
        assert!(has_tool_result);

        let back_opts = TranslateOptions { model: "gpt-4o", ..Default::default() };
        let back =
            translate_request(WireFormat::Claude, WireFormat::Openai, &back_opts, claude).unwrap();
        let request: OpenAIRequest = serde_json::from_value(back).unwrap();

        let roles: Vec<&str> = request.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool", "assistant"]);
        assert_eq!(request.tools.as_ref().unwrap()[0].function.name, "get_weather");
        let tool_message = request.messages.iter().find(|m| m.role == "tool").unwrap();
        assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_openai_gemini_roundtrip_preserves_pairing() {
        let opts = TranslateOptions { model: "gemini-2.5-pro", ..Default::default() };
        let gemini = translate_request(
            WireFormat::Openai,
            WireFormat::Gemini,
            &opts,
            openai_request_with_tools(),
        )
        .unwrap();

        assert!(gemini["systemInstruction"].is_object());
        assert_eq!(
            gemini["tools"][0]["functionDeclarations"][0]["name"],
            json!("get_weather")
        );

        let back_opts = TranslateOptions { model: "gpt-4o", ..Default::default() };
        let back =
            translate_request(WireFormat::Gemini, WireFormat::Openai, &back_opts, gemini).unwrap();
        let request: OpenAIRequest = serde_json::from_value(back).unwrap();

        let call = request
            .messages
            .iter()
            .find_map(|m| m.tool_calls.as_ref())
            .and_then(|calls| calls.first())
            .expect("tool call survives");
        let result = request.messages.iter().find(|m| m.role == "tool").expect("tool result");
        assert_eq!(result.tool_call_id.as_deref(), Some(call.id.as_str()));
        assert_eq!(call.function.name.as_deref(), Some("get_weather"));
    }

    #[test]
    fn test_openai_responses_roundtrip() {
        let opts = TranslateOptions { model: "gpt-5", ..Default::default() };
        let responses = translate_request(
            WireFormat::Openai,
            WireFormat::OpenaiResponses,
            &opts,
            openai_request_with_tools(),
        )
        .unwrap();

        assert_eq!(responses["instructions"], json!("be brief"));
        let call_item = responses["input"]
            .as_array()
            .unwrap()
            .iter()
            .find(|i| i["type"] == "function_call")
            .expect("function_call item");
        assert_eq!(call_item["call_id"], json!("call_1"));

        let back_opts = TranslateOptions { model: "gpt-4o", ..Default::default() };
        let back = translate_request(
            WireFormat::OpenaiResponses,
            WireFormat::Openai,
            &back_opts,
            responses,
        )
        .unwrap();
        let request: OpenAIRequest = serde_json::from_value(back).unwrap();
        assert!(request.messages.iter().any(|m| m.role == "system"));
        assert!(request
            .messages
            .iter()
            .any(|m| m.role == "tool" && m.tool_call_id.as_deref() == Some("call_1")));
    }

    #[test]
    fn test_claude_to_gemini_composes_through_hub() {
        let opts = TranslateOptions { model: "gemini-2.5-flash", ..Default::default() };
        let claude = json!({
            "model": "m",
            "max_tokens": 256,
            "system": "answer in French",
            "messages": [{"role": "user", "content": "hello"}]
        });
        let gemini =
            translate_request(WireFormat::Claude, WireFormat::Gemini, &opts, claude).unwrap();
        assert_eq!(gemini["contents"][0]["parts"][0]["text"], json!("hello"));
        assert!(gemini["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("French"));
    }

    #[test]
    fn test_kiro_body_shape() {
        let opts = TranslateOptions {
            model: "claude-sonnet-4",
            profile_arn: Some("arn:aws:codewhisperer:us-east-1:x:profile/y"),
            ..Default::default()
        };
        let body = translate_request(
            WireFormat::Openai,
            WireFormat::Kiro,
            &opts,
            openai_request_with_tools(),
        )
        .unwrap();

        assert_eq!(body["profileArn"], json!("arn:aws:codewhisperer:us-east-1:x:profile/y"));
        let state = &body["conversationState"];
        assert_eq!(state["chatTriggerType"], json!("MANUAL"));
        assert_eq!(
            state["currentMessage"]["userInputMessage"]["modelId"],
            json!("claude-sonnet-4")
        );
        let tools =
            &state["currentMessage"]["userInputMessage"]["userInputMessageContext"]["tools"];
        assert_eq!(tools[0]["toolSpecification"]["name"], json!("get_weather"));
        let results =
            &state["currentMessage"]["userInputMessage"]["userInputMessageContext"]["toolResults"];
        assert_eq!(results[0]["toolUseId"], json!("call_1"));
        assert!(!state["history"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_oauth_tool_names_rewritten_with_map() {
        let opts =
            TranslateOptions { model: "claude-sonnet-4", oauth: true, ..Default::default() };
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{
                "type": "function",
                "function": {"name": "repo.search/files", "parameters": {"type": "object"}}
            }]
        });
        let claude =
            translate_request(WireFormat::Openai, WireFormat::Claude, &opts, body).unwrap();
        assert_eq!(claude["tools"][0]["name"], json!("repo_search_files"));
        assert_eq!(claude["_tool_name_map"]["repo_search_files"], json!("repo.search/files"));
    }

    #[test]
    fn test_image_to_text_only_dialect_leaves_placeholder() {
        let opts = TranslateOptions { model: "gemini-2.5-pro", ..Default::default() };
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this?"},
                {"type": "image_url", "image_url": {"url": "https://example.com/cat.png"}}
            ]}]
        });
        let gemini =
            translate_request(WireFormat::Openai, WireFormat::Gemini, &opts, body).unwrap();
        let parts = gemini["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[1]["text"].as_str().unwrap().contains("image"));
    }

    #[test]
    fn test_gemini_envelope_unwrapped() {
        let opts = TranslateOptions { model: "gpt-4o", ..Default::default() };
        let body = json!({
            "model": "gemini-2.5-pro",
            "request": {"contents": [{"role": "user", "parts": [{"text": "hi"}]}]}
        });
        let out =
            translate_request(WireFormat::Gemini, WireFormat::Openai, &opts, body).unwrap();
        let request: OpenAIRequest = serde_json::from_value(out).unwrap();
        assert_eq!(request.messages[0].content.as_ref().unwrap().extract_text(), "hi");
    }
}
