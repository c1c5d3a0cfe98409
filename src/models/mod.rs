//! Wire-format data models
//!
//! One module per wire format, plus the format detector

pub mod claude;
pub mod gemini;
pub mod openai;
pub mod responses;

use axum::http::HeaderMap;
use serde_json::Value;

/// Wire formats understood by the gateway
///
/// The first four are client-facing request/response shapes; the rest are
/// provider dialects that only ever appear as translation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    Openai,
    Claude,
    Gemini,
    OpenaiResponses,
    Kiro,
    Copilot,
    Antigravity,
    Qwen,
    Iflow,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::Openai => "openai",
            WireFormat::Claude => "claude",
            WireFormat::Gemini => "gemini",
            WireFormat::OpenaiResponses => "openai-responses",
            WireFormat::Kiro => "kiro",
            WireFormat::Copilot => "copilot",
            WireFormat::Antigravity => "antigravity",
            WireFormat::Qwen => "qwen",
            WireFormat::Iflow => "iflow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(WireFormat::Openai),
            "claude" | "anthropic" => Some(WireFormat::Claude),
            "gemini" => Some(WireFormat::Gemini),
            "openai-responses" | "responses" => Some(WireFormat::OpenaiResponses),
            "kiro" => Some(WireFormat::Kiro),
            "copilot" => Some(WireFormat::Copilot),
            "antigravity" => Some(WireFormat::Antigravity),
            "qwen" => Some(WireFormat::Qwen),
            "iflow" => Some(WireFormat::Iflow),
            _ => None,
        }
    }

    /// Formats a client can speak. Dialects are translation targets only.
    pub fn is_client_format(&self) -> bool {
        matches!(
            self,
            WireFormat::Openai | WireFormat::Claude | WireFormat::Gemini | WireFormat::OpenaiResponses
        )
    }
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an incoming request body into a wire format
///
/// Rules are evaluated in order; ambiguous bodies fall back to OpenAI.
/// Detection is deterministic and never mutates the body.
pub fn detect_format(body: &Value, headers: &HeaderMap) -> WireFormat {
    // Responses API: `input` array plus instructions / previous_response_id
    if body.get("input").map(Value::is_array).unwrap_or(false)
        && (body.get("instructions").is_some() || body.get("previous_response_id").is_some())
    {
        return WireFormat::OpenaiResponses;
    }

    // Gemini: `contents` array, either at the top level or nested
    if has_contents_array(body) {
        return WireFormat::Gemini;
    }

    if body.get("messages").map(Value::is_array).unwrap_or(false) {
        if looks_like_claude(body, headers) {
            return WireFormat::Claude;
        }
        return WireFormat::Openai;
    }

    WireFormat::Openai
}

fn has_contents_array(body: &Value) -> bool {
    if body.get("contents").map(Value::is_array).unwrap_or(false) {
        return true;
    }
    body.get("request")
        .and_then(|r| r.get("contents"))
        .map(Value::is_array)
        .unwrap_or(false)
}

fn looks_like_claude(body: &Value, headers: &HeaderMap) -> bool {
    if headers.contains_key("anthropic-version") {
        return true;
    }
    // Anthropic-style system prompt: plain string or block list
    match body.get("system") {
        Some(Value::String(_)) | Some(Value::Array(_)) => return true,
        _ => {}
    }
    // tool_use / tool_result content blocks only exist in the Messages shape
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for message in messages {
            if let Some(blocks) = message.get("content").and_then(Value::as_array) {
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("tool_use") | Some("tool_result") => return true,
                        _ => {}
                    }
                }
            }
        }
    }
    false
}

/// Whether the request asks for a streamed response
///
/// OpenAI, Claude and Responses carry `stream: true` in the body; Gemini
/// signals streaming through the URL.
pub fn wants_stream(format: WireFormat, body: &Value, path: &str) -> bool {
    match format {
        WireFormat::Gemini => path.contains(":streamGenerateContent"),
        _ => body.get("stream").and_then(Value::as_bool).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detect_openai() {
        let body = json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]});
        assert_eq!(detect_format(&body, &HeaderMap::new()), WireFormat::Openai);
    }

    #[test]
    fn test_detect_claude_by_system_string() {
        let body = json!({
            "model": "claude-sonnet-4",
            "system": "You are helpful",
            "messages": [{"role": "user", "content": "hi"}]
        });
        assert_eq!(detect_format(&body, &HeaderMap::new()), WireFormat::Claude);
    }

    #[test]
    fn test_detect_claude_by_header() {
        let body = json!({"model": "m", "messages": []});
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-version", "2023-06-01".parse().unwrap());
        assert_eq!(detect_format(&body, &headers), WireFormat::Claude);
    }

    #[test]
    fn test_detect_claude_by_tool_blocks() {
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": "42"}
            ]}]
        });
        assert_eq!(detect_format(&body, &HeaderMap::new()), WireFormat::Claude);
    }

    #[test]
    fn test_detect_gemini() {
        let body = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});
        assert_eq!(detect_format(&body, &HeaderMap::new()), WireFormat::Gemini);

        let nested = json!({"request": {"contents": []}});
        assert_eq!(detect_format(&nested, &HeaderMap::new()), WireFormat::Gemini);
    }

    #[test]
    fn test_detect_responses() {
        let body = json!({"model": "gpt-5", "input": [], "instructions": "be brief"});
        assert_eq!(detect_format(&body, &HeaderMap::new()), WireFormat::OpenaiResponses);
    }

    #[test]
    fn test_ambiguous_defaults_to_openai() {
        let body = json!({"model": "m"});
        assert_eq!(detect_format(&body, &HeaderMap::new()), WireFormat::Openai);
    }

    #[test]
    fn test_wants_stream() {
        let body = json!({"stream": true});
        assert!(wants_stream(WireFormat::Openai, &body, "/v1/chat/completions"));
        assert!(!wants_stream(WireFormat::Openai, &json!({}), "/v1/chat/completions"));
        assert!(wants_stream(
            WireFormat::Gemini,
            &json!({}),
            "/v1beta/models/gemini-2.5-pro:streamGenerateContent"
        ));
        assert!(!wants_stream(
            WireFormat::Gemini,
            &json!({}),
            "/v1beta/models/gemini-2.5-pro:generateContent"
        ));
    }
}
