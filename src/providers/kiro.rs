//! Kiro (AWS CodeWhisperer) executor
//!
//! Requests are plain JSON; responses arrive as AWS EventStream binary
//! frames. The executor owns the frame parser and transcodes the event
//! stream into OpenAI-style chat-completion SSE, so downstream the Kiro
//! stream looks like any other OpenAI stream.

use super::default::masked_headers;
use super::{oauth, ExecuteArgs, ExecuteOutcome, Executor, HttpClients, RefreshedTokens};
use crate::config::ConnectionSecrets;
use crate::models::openai::{
    OpenAIFunctionCall, OpenAIStreamDelta, OpenAIStreamResponse, OpenAIStreamToolCall,
};
use crate::models::WireFormat;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use serde_json::Value;
use std::collections::HashMap;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

const KIRO_URL: &str = "https://codewhisperer.us-east-1.amazonaws.com/generateAssistantResponse";

// EventStream framing: 12-byte prelude (total length, headers length,
// prelude CRC, all u32-be) + headers + payload + 4-byte message CRC.
// Smallest possible message is 16 bytes.
const PRELUDE_LEN: usize = 12;
const MIN_MESSAGE_LEN: usize = 16;

/// One decoded EventStream message
#[derive(Debug, Clone)]
pub struct EventStreamMessage {
    pub headers: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

impl EventStreamMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header_name, _)| header_name == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header(":event-type")
    }
}

/// Stateful EventStream decoder
///
/// Frames may arrive split across TCP reads; bytes are buffered until a
/// whole message is available. CRCs are not verified, only skipped.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    buffer: BytesMut,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, draining every complete message
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<EventStreamMessage> {
        self.buffer.extend_from_slice(bytes);
        let mut messages = Vec::new();

        loop {
            if self.buffer.len() < MIN_MESSAGE_LEN {
                break;
            }
            let total_len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            if total_len < MIN_MESSAGE_LEN {
                // Unrecoverable framing error: drop the buffer instead of
                // spinning on it.
                warn!("EventStream: bogus frame length {}, discarding buffer", total_len);
                self.buffer.clear();
                break;
            }
            if self.buffer.len() < total_len {
                break;
            }

            let headers_len = u32::from_be_bytes([
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
            ]) as usize;

            let mut frame = self.buffer.split_to(total_len);
            frame.advance(PRELUDE_LEN);
            if headers_len + 4 > frame.len() {
                warn!("EventStream: header block overruns frame, skipping");
                continue;
            }
            let header_bytes = frame.split_to(headers_len);
            let payload_len = frame.len() - 4; // trailing message CRC
            let payload = frame.split_to(payload_len).to_vec();

            match parse_headers(&header_bytes) {
                Ok(headers) => messages.push(EventStreamMessage { headers, payload }),
                Err(e) => warn!("EventStream: bad header block: {}", e),
            }
        }
        messages
    }
}

// Header wire format: name length (u8), name, value type (u8), value.
// Only string values (type 7) matter here; the other types are skipped by
// their fixed or length-prefixed sizes.
fn parse_headers(mut bytes: &[u8]) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    while !bytes.is_empty() {
        anyhow::ensure!(bytes.len() >= 2, "truncated header name");
        let name_len = bytes[0] as usize;
        bytes = &bytes[1..];
        anyhow::ensure!(bytes.len() > name_len, "truncated header name body");
        let name = String::from_utf8_lossy(&bytes[..name_len]).to_string();
        bytes = &bytes[name_len..];

        let value_type = bytes[0];
        bytes = &bytes[1..];
        match value_type {
            // boolean true / false carry no value bytes
            0 | 1 => headers.push((name, (value_type == 0).to_string())),
            2 => bytes = skip(bytes, 1)?,
            3 => bytes = skip(bytes, 2)?,
            4 => bytes = skip(bytes, 4)?,
            5 | 8 => bytes = skip(bytes, 8)?,
            6 | 7 => {
                anyhow::ensure!(bytes.len() >= 2, "truncated value length");
                let value_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
                bytes = &bytes[2..];
                anyhow::ensure!(bytes.len() >= value_len, "truncated value body");
                if value_type == 7 {
                    headers.push((name, String::from_utf8_lossy(&bytes[..value_len]).to_string()));
                }
                bytes = &bytes[value_len..];
            }
            9 => bytes = skip(bytes, 16)?,
            other => anyhow::bail!("unknown header value type {}", other),
        }
    }
    Ok(headers)
}

fn skip(bytes: &[u8], n: usize) -> Result<&[u8]> {
    anyhow::ensure!(bytes.len() >= n, "truncated header value");
    Ok(&bytes[n..])
}

/// Encode one EventStream message (test fixtures and loopback tooling)
pub fn encode_frame(event_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for (name, value) in
        [(":event-type", event_type), (":content-type", "application/json"), (":message-type", "event")]
    {
        header_bytes.push(name.len() as u8);
        header_bytes.extend_from_slice(name.as_bytes());
        header_bytes.push(7u8);
        header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        header_bytes.extend_from_slice(value.as_bytes());
    }

    let total_len = PRELUDE_LEN + header_bytes.len() + payload.len() + 4;
    let mut frame = Vec::with_capacity(total_len);
    frame.extend_from_slice(&(total_len as u32).to_be_bytes());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes()); // prelude CRC, not verified
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&0u32.to_be_bytes()); // message CRC, not verified
    frame
}

/// Converts decoded CodeWhisperer events into OpenAI SSE chunks
#[derive(Debug)]
pub struct KiroStreamState {
    model: String,
    role_sent: bool,
    tool_indexes: HashMap<String, u32>,
    has_tool_calls: bool,
    finish_emitted: bool,
}

impl KiroStreamState {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            role_sent: false,
            tool_indexes: HashMap::new(),
            has_tool_calls: false,
            finish_emitted: false,
        }
    }

    /// SSE frames for one decoded message
    pub fn on_message(&mut self, message: &EventStreamMessage) -> Vec<String> {
        let payload: Value = match serde_json::from_slice(&message.payload) {
            Ok(value) => value,
            Err(_) if message.payload.is_empty() => Value::Null,
            Err(e) => {
                warn!("Kiro: unparseable event payload: {}", e);
                return Vec::new();
            }
        };

        match message.event_type() {
            Some("assistantResponseEvent") | Some("codeEvent") => {
                let Some(content) = payload.get("content").and_then(Value::as_str) else {
                    return Vec::new();
                };
                let delta = OpenAIStreamDelta {
                    role: (!self.role_sent).then(|| "assistant".to_string()),
                    content: Some(content.to_string()),
                    tool_calls: None,
                };
                self.role_sent = true;
                vec![self.chunk(delta, None)]
            }
            Some("toolUseEvent") => self.on_tool_use(&payload),
            Some("messageStopEvent") => {
                self.finish_emitted = true;
                vec![self.finish_chunk()]
            }
            // End-of-stream hints; the finish chunk is emitted at EOF if the
            // upstream never sent messageStopEvent.
            Some("meteringEvent") | Some("contextUsageEvent") => Vec::new(),
            Some(other) => {
                debug!("Kiro: ignoring event type {}", other);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    fn on_tool_use(&mut self, payload: &Value) -> Vec<String> {
        let Some(tool_use_id) = payload.get("toolUseId").and_then(Value::as_str) else {
            return Vec::new();
        };
        self.has_tool_calls = true;
        let mut frames = Vec::new();

        if !self.tool_indexes.contains_key(tool_use_id) {
            let index = self.tool_indexes.len() as u32;
            self.tool_indexes.insert(tool_use_id.to_string(), index);
            let delta = OpenAIStreamDelta {
                role: (!self.role_sent).then(|| "assistant".to_string()),
                content: None,
                tool_calls: Some(vec![OpenAIStreamToolCall {
                    index,
                    id: Some(tool_use_id.to_string()),
                    tool_type: Some("function".to_string()),
                    function: OpenAIFunctionCall {
                        name: payload.get("name").and_then(Value::as_str).map(String::from),
                        arguments: Some(String::new()),
                    },
                }]),
            };
            self.role_sent = true;
            frames.push(self.chunk(delta, None));
        }

        // `input` carries a fragment of the argument JSON string
        if let Some(fragment) = payload.get("input").and_then(Value::as_str) {
            if !fragment.is_empty() {
                let index = self.tool_indexes[tool_use_id];
                let delta = OpenAIStreamDelta {
                    role: None,
                    content: None,
                    tool_calls: Some(vec![OpenAIStreamToolCall {
                        index,
                        id: None,
                        tool_type: None,
                        function: OpenAIFunctionCall {
                            name: None,
                            arguments: Some(fragment.to_string()),
                        },
                    }]),
                };
                frames.push(self.chunk(delta, None));
            }
        }
        frames
    }

    /// Frames to emit once the upstream closes
    pub fn on_eof(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        if !self.finish_emitted {
            self.finish_emitted = true;
            frames.push(self.finish_chunk());
        }
        frames.push("data: [DONE]\n\n".to_string());
        frames
    }

    fn finish_chunk(&self) -> String {
        let reason = if self.has_tool_calls { "tool_calls" } else { "stop" };
        let chunk = OpenAIStreamResponse::with_delta(
            &self.model,
            OpenAIStreamDelta::default(),
            Some(reason.to_string()),
        );
        sse_frame(&chunk)
    }

    fn chunk(&self, delta: OpenAIStreamDelta, finish_reason: Option<String>) -> String {
        sse_frame(&OpenAIStreamResponse::with_delta(&self.model, delta, finish_reason))
    }
}

fn sse_frame(chunk: &OpenAIStreamResponse) -> String {
    format!("data: {}\n\n", serde_json::to_string(chunk).unwrap_or_else(|_| "{}".into()))
}

pub struct KiroExecutor {
    clients: HttpClients,
}

impl KiroExecutor {
    pub fn new(clients: HttpClients) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl Executor for KiroExecutor {
    fn provider_id(&self) -> &str {
        "kiro"
    }

    // The executor transcodes EventStream frames into OpenAI chunks
    fn response_format(&self) -> WireFormat {
        WireFormat::Openai
    }

    fn build_url(
        &self,
        _model: &str,
        _stream: bool,
        _url_index: usize,
        secrets: &ConnectionSecrets,
    ) -> String {
        match &secrets.base_url {
            Some(base) => base.clone(),
            None => KIRO_URL.to_string(),
        }
    }

    fn build_headers(&self, secrets: &ConnectionSecrets, _stream: bool) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Accept".to_string(), "application/vnd.amazon.eventstream".to_string()),
        ];
        if let Some(token) = &secrets.access_token {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        headers
    }

    fn transform_request(
        &self,
        _model: &str,
        mut body: Value,
        _stream: bool,
        secrets: &ConnectionSecrets,
    ) -> Value {
        if body.get("profileArn").is_none() {
            if let Some(profile_arn) = &secrets.profile_arn {
                body["profileArn"] = Value::String(profile_arn.clone());
            }
        }
        body
    }

    async fn execute(&self, args: ExecuteArgs<'_>) -> Result<ExecuteOutcome> {
        let body = self.transform_request(args.model, args.body, args.stream, args.secrets);
        let url = self.build_url(args.model, args.stream, 0, args.secrets);
        let headers = self.build_headers(args.secrets, args.stream);

        debug!("kiro: POST {}", url);
        let mut request = self.clients.stream_client.post(&url);
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        let response = request
            .json(&body)
            .send()
            .await
            .with_context(|| format!("kiro: request to {} failed", url))?;

        let status = response.status();
        let response_headers = response.headers().clone();

        if !status.is_success() {
            // Error bodies are plain JSON, pass them through untouched
            let stream = response.bytes_stream().map(|chunk| chunk.context("upstream read failed"));
            return Ok(ExecuteOutcome {
                status,
                url,
                sent_headers: masked_headers(&headers),
                response_headers,
                body: Box::pin(stream),
                transformed_body: body,
            });
        }

        // Transcode the binary event stream into OpenAI SSE
        let model = args.model.to_string();
        let upstream = Box::pin(response.bytes_stream());
        let sse = async_stream_transcode(upstream, model);

        Ok(ExecuteOutcome {
            status,
            url,
            sent_headers: masked_headers(&headers),
            response_headers,
            body: Box::pin(sse),
            transformed_body: body,
        })
    }

    async fn refresh_credentials(
        &self,
        secrets: &ConnectionSecrets,
    ) -> Result<Option<RefreshedTokens>> {
        oauth::refresh("kiro", secrets, &self.clients.client).await
    }
}

// Wraps the upstream byte stream with parser + chunk state. Implemented as
// an unfold so exactly one upstream chunk is in flight per downstream poll.
fn async_stream_transcode(
    upstream: impl tokio_stream::Stream<Item = reqwest::Result<Bytes>> + Send + Unpin + 'static,
    model: String,
) -> impl tokio_stream::Stream<Item = Result<Bytes>> + Send + 'static {
    struct Transcoder<S> {
        upstream: S,
        parser: EventStreamParser,
        state: KiroStreamState,
        done: bool,
    }

    let transcoder = Transcoder {
        upstream,
        parser: EventStreamParser::new(),
        state: KiroStreamState::new(&model),
        done: false,
    };

    futures::stream::unfold(transcoder, |mut t| async move {
        if t.done {
            return None;
        }
        loop {
            match t.upstream.next().await {
                Some(Ok(bytes)) => {
                    let frames: String = t
                        .parser
                        .feed(&bytes)
                        .iter()
                        .flat_map(|message| t.state.on_message(message))
                        .collect();
                    if !frames.is_empty() {
                        return Some((Ok(Bytes::from(frames)), t));
                    }
                    // Partial frame: keep reading
                }
                Some(Err(e)) => {
                    t.done = true;
                    return Some((Err(anyhow::Error::new(e).context("kiro stream read failed")), t));
                }
                None => {
                    t.done = true;
                    let frames: String = t.state.on_eof().concat();
                    return Some((Ok(Bytes::from(frames)), t));
                }
            }
        }
    })
}
