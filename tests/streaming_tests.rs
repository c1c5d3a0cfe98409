//! Streaming translation and EventStream decoding tests

use llmgateway::models::WireFormat;
use llmgateway::providers::kiro::{encode_frame, EventStreamParser, KiroStreamState};
use llmgateway::services::stream::{SseEvent, SseParser, StreamTranslator};
use serde_json::{json, Value};
use std::collections::HashMap;

fn data_payloads(frames: &str) -> Vec<Value> {
    frames
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .map(|data| serde_json::from_str(data).unwrap())
        .collect()
}

#[test]
fn openai_chunks_replay_to_claude_event_sequence() {
    let mut translator =
        StreamTranslator::new(WireFormat::Openai, WireFormat::Claude, "claude-sonnet-4", HashMap::new());

    let chunks = [
        r#"{"choices":[{"index":0,"delta":{"role":"assistant"},"finish_reason":null}]}"#,
        r#"{"choices":[{"index":0,"delta":{"content":"Bonjour"},"finish_reason":null}]}"#,
        r#"{"choices":[{"index":0,"delta":{"content":" !"},"finish_reason":null}]}"#,
        r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":11,"completion_tokens":4,"total_tokens":15}}"#,
    ];
    let mut out = String::new();
    for chunk in chunks {
        out.push_str(&translator.on_event(&SseEvent { event: None, data: chunk.into() }).concat());
    }
    out.push_str(&translator.finish().concat());

    // Canonical Anthropic event order
    let event_order: Vec<&str> = out
        .lines()
        .filter_map(|line| line.strip_prefix("event: "))
        .collect();
    assert_eq!(
        event_order,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop"
        ]
    );
    assert!(out.contains("Bonjour"));
    // Usage extracted from the final OpenAI chunk lands in message_delta
    assert!(out.contains("\"input_tokens\":11"));
    assert!(out.contains("\"output_tokens\":4"));
}

#[test]
fn claude_events_replay_to_openai_chunks_and_done() {
    let mut translator =
        StreamTranslator::new(WireFormat::Claude, WireFormat::Openai, "gpt-4o", HashMap::new());

    let events = [
        ("message_start", r#"{"type":"message_start","message":{"usage":{"input_tokens":7,"output_tokens":0}}}"#),
        ("content_block_start", r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#),
        ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#),
        ("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
        ("message_delta", r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#),
        ("message_stop", r#"{"type":"message_stop"}"#),
    ];
    let mut out = String::new();
    for (name, data) in events {
        out.push_str(
            &translator
                .on_event(&SseEvent { event: Some(name.into()), data: data.into() })
                .concat(),
        );
    }
    out.push_str(&translator.finish().concat());

    let payloads = data_payloads(&out);
    // Role arrives exactly once, on the first chunk
    assert_eq!(payloads[0]["choices"][0]["delta"]["role"], json!("assistant"));
    assert!(payloads
        .iter()
        .any(|p| p["choices"][0]["delta"]["content"] == json!("Hi")));
    assert!(payloads
        .iter()
        .any(|p| p["choices"][0]["finish_reason"] == json!("stop")));
    assert!(out.ends_with("data: [DONE]\n\n"));
}

#[test]
fn malformed_sse_line_skipped_stream_continues() {
    let mut parser = SseParser::new();
    let events = parser.feed("data: {broken\n\ndata: {\"ok\":1}\n\n");
    assert_eq!(events.len(), 2);

    let mut translator =
        StreamTranslator::new(WireFormat::Openai, WireFormat::Openai, "m", HashMap::new());
    assert!(translator.on_event(&events[0]).is_empty());
    // Second event is valid JSON but has no choices; still no panic
    assert!(translator.on_event(&events[1]).is_empty());
}

#[test]
fn eventstream_frame_split_across_reads() {
    let payload = json!({"content": "streamed across tcp reads"}).to_string();
    let frame = encode_frame("assistantResponseEvent", payload.as_bytes());

    let mut parser = EventStreamParser::new();
    let mut decoded = Vec::new();
    // Drip the frame one byte at a time
    for byte in &frame {
        decoded.extend(parser.feed(std::slice::from_ref(byte)));
    }
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].event_type(), Some("assistantResponseEvent"));
    let payload: Value = serde_json::from_slice(&decoded[0].payload).unwrap();
    assert_eq!(payload["content"], json!("streamed across tcp reads"));
}

#[test]
fn kiro_duplicate_tool_use_events_merge_into_start_plus_args() {
    // Upstream sends the same toolUseId twice: first without input, then
    // with the argument payload.
    let mut parser = EventStreamParser::new();
    let mut state = KiroStreamState::new("claude-sonnet-4");

    let mut bytes = encode_frame(
        "toolUseEvent",
        json!({"toolUseId": "tu_1", "name": "get_weather"}).to_string().as_bytes(),
    );
    bytes.extend(encode_frame(
        "toolUseEvent",
        json!({"toolUseId": "tu_1", "input": "{\"a\":1}"}).to_string().as_bytes(),
    ));

    let mut out = String::new();
    for message in parser.feed(&bytes) {
        out.push_str(&state.on_message(&message).concat());
    }
    out.push_str(&state.on_eof().concat());

    let payloads = data_payloads(&out);
    // One start chunk with empty arguments
    let start = &payloads[0]["choices"][0]["delta"]["tool_calls"][0];
    assert_eq!(start["index"], json!(0));
    assert_eq!(start["id"], json!("tu_1"));
    assert_eq!(start["function"]["arguments"], json!(""));
    // One argument chunk carrying the whole fragment
    let args = &payloads[1]["choices"][0]["delta"]["tool_calls"][0];
    assert_eq!(args["function"]["arguments"], json!("{\"a\":1}"));
    // Finish is tool_calls, then DONE
    assert!(payloads
        .iter()
        .any(|p| p["choices"][0]["finish_reason"] == json!("tool_calls")));
    assert!(out.ends_with("data: [DONE]\n\n"));
}

#[test]
fn kiro_content_stream_ends_with_stop() {
    let mut parser = EventStreamParser::new();
    let mut state = KiroStreamState::new("m");

    let mut bytes = encode_frame("assistantResponseEvent", br#"{"content":"Hello"}"#);
    bytes.extend(encode_frame("assistantResponseEvent", br#"{"content":" world"}"#));
    bytes.extend(encode_frame("meteringEvent", br#"{"unit":"tokens"}"#));

    let mut out = String::new();
    for message in parser.feed(&bytes) {
        out.push_str(&state.on_message(&message).concat());
    }
    out.push_str(&state.on_eof().concat());

    let payloads = data_payloads(&out);
    let text: String = payloads
        .iter()
        .filter_map(|p| p["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(text, "Hello world");
    assert_eq!(payloads.last().unwrap()["choices"][0]["finish_reason"], json!("stop"));
}

#[test]
fn responses_stream_to_openai_chunks() {
    let mut translator =
        StreamTranslator::new(WireFormat::OpenaiResponses, WireFormat::Openai, "gpt-5", HashMap::new());

    let events = [
        r#"{"type":"response.output_item.added","output_index":0,"item":{"type":"function_call","call_id":"call_7","name":"lookup"}}"#,
        r#"{"type":"response.function_call_arguments.delta","output_index":0,"delta":"{\"q\":"}"#,
        r#"{"type":"response.function_call_arguments.delta","output_index":0,"delta":"\"x\"}"}"#,
        r#"{"type":"response.completed","response":{"usage":{"input_tokens":9,"output_tokens":3}}}"#,
    ];
    let mut out = String::new();
    for data in events {
        out.push_str(&translator.on_event(&SseEvent { event: None, data: data.into() }).concat());
    }
    out.push_str(&translator.finish().concat());

    let payloads = data_payloads(&out);
    let start = &payloads[0]["choices"][0]["delta"]["tool_calls"][0];
    assert_eq!(start["id"], json!("call_7"));
    assert_eq!(start["function"]["name"], json!("lookup"));
    let args: String = payloads
        .iter()
        .filter_map(|p| p["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"].as_str())
        .collect();
    assert_eq!(args, "{\"q\":\"x\"}");
    assert_eq!(translator.tokens.prompt, 9);
    assert_eq!(translator.tokens.completion, 3);
}

#[test]
fn gemini_terminator_carries_buffered_function_call() {
    let mut translator =
        StreamTranslator::new(WireFormat::Openai, WireFormat::Gemini, "gemini-2.5-pro", HashMap::new());

    translator.on_event(&SseEvent {
        event: None,
        data: r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"c1","type":"function","function":{"name":"f","arguments":""}}]},"finish_reason":null}]}"#.into(),
    });
    translator.on_event(&SseEvent {
        event: None,
        data: r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"k\":2}"}}]},"finish_reason":null}]}"#.into(),
    });
    translator.on_event(&SseEvent {
        event: None,
        data: r#"{"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}],"usage":{"prompt_tokens":6,"completion_tokens":2}}"#.into(),
    });
    let terminator = translator.finish().concat();

    let payloads = data_payloads(&terminator);
    let last = payloads.last().unwrap();
    assert_eq!(last["candidates"][0]["content"]["parts"][0]["functionCall"]["name"], json!("f"));
    assert_eq!(
        last["candidates"][0]["content"]["parts"][0]["functionCall"]["args"],
        json!({"k": 2})
    );
    assert_eq!(last["usageMetadata"]["promptTokenCount"], json!(6));
}
