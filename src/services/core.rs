//! Chat core
//!
//! One account attempt, end to end: bypass detection, request translation,
//! upstream execution with reactive token refresh, error parsing, and the
//! streaming or JSON response path with usage recording.

use crate::config::{Connection, GatewayConfig, Settings};
use crate::models::WireFormat;
use crate::providers::{executor_for, ExecuteArgs, ExecuteOutcome, Executor, HttpClients};
use crate::services::credentials::CredentialStore;
use crate::services::stream::{
    aggregate_openai_stream, extract_usage, pipe_sse, StreamTranslator,
};
use crate::services::usage::{cost, track_pending, UsageEntry, UsageStore};
use crate::services::translator::{translate_request, TranslateOptions};
use crate::utils::logging::{append_log_line, RequestLogger};
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

// Probe messages short-circuited without an upstream call
const BYPASS_MESSAGES: &[&str] = &["quota", "warmup", "ping"];
const BYPASS_USER_AGENTS: &[&str] = &["warmup-probe"];

const REFRESH_ATTEMPTS: u32 = 3;
const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// Everything an attempt needs besides the request itself
pub struct AttemptContext {
    pub store: Arc<CredentialStore>,
    pub usage_store: Arc<UsageStore>,
    pub clients: HttpClients,
    pub settings: Settings,
    pub config: GatewayConfig,
    pub state_dir: PathBuf,
}

/// One account attempt
pub struct AttemptRequest<'a> {
    pub connection: Connection,
    pub provider: &'a str,
    pub model: &'a str,
    pub source_format: WireFormat,
    pub body: &'a Value,
    pub stream: bool,
    pub user_agent: Option<&'a str>,
}

/// Outcome of one attempt
pub enum AttemptResult {
    /// Response is ready to return to the client
    Success(Response),
    /// Structured upstream failure for the fallback policy
    Failure { status: Option<u16>, message: String, retry_after_ms: Option<u64> },
}

/// Run a single account attempt
pub async fn run_attempt(ctx: &AttemptContext, request: AttemptRequest<'_>) -> AttemptResult {
    // 1. Probe bypass: answer canonical warmup requests locally
    if is_bypass_probe(request.source_format, request.body, request.user_agent) {
        debug!("bypass probe detected, returning synthetic response");
        return AttemptResult::Success(synthetic_response(
            request.source_format,
            request.model,
            request.stream,
        ));
    }

    let executor = executor_for(request.provider, &request.connection, &ctx.clients);
    let target_format =
        crate::providers::target_format(request.provider, request.model, &request.connection);

    // 2. Request-scoped debug logger
    let mut logger = RequestLogger::new(&ctx.state_dir, ctx.settings.enable_request_logs);
    logger.raw_body(request.body);
    logger.formats(request.source_format.as_str(), target_format.as_str());

    // 3. Translate the request, extracting the ephemeral tool-name map
    let opts = TranslateOptions {
        model: request.model,
        stream: request.stream,
        oauth: request.connection.secrets.api_key.is_none()
            && request.connection.secrets.access_token.is_some(),
        profile_arn: request.connection.secrets.profile_arn.as_deref(),
    };
    let translated = match translate_request(
        request.source_format,
        target_format,
        &opts,
        request.body.clone(),
    ) {
        Ok(body) => body,
        Err(e) => {
            logger.error(&format!("translation failed: {}", e));
            logger.finish();
            return AttemptResult::Failure {
                status: Some(400),
                message: format!("request translation failed: {}", e),
                retry_after_ms: None,
            };
        }
    };
    let (translated, tool_name_map) = extract_tool_name_map(translated);
    logger.translated_body(&translated);

    // 4. Track the attempt and write the PENDING line
    let guard = track_pending(request.model, &request.connection.id);
    append_log_line(
        &ctx.state_dir,
        request.model,
        request.provider,
        &request.connection.label_or_id(),
        0,
        0,
        "PENDING",
    );

    // 5. Execute, refreshing reactively on 401/403
    let mut connection = request.connection.clone();
    let mut outcome = match execute_once(ctx, &executor, &connection, request.model, &translated, request.stream).await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            let message = format!("{} request failed: {}", request.provider, root_cause(&e));
            logger.error(&message);
            logger.finish();
            append_failed_line(ctx, &request, &connection, "FAILED network");
            return AttemptResult::Failure { status: None, message, retry_after_ms: None };
        }
    };

    if matches!(outcome.status.as_u16(), 401 | 403) {
        info!(
            "{}: got {}, refreshing credentials and retrying once",
            request.provider,
            outcome.status
        );
        match ctx.store.refresh_with_retry(&connection.id, &executor, REFRESH_ATTEMPTS).await {
            Some(refreshed) => {
                connection = refreshed;
                match execute_once(ctx, &executor, &connection, request.model, &translated, request.stream)
                    .await
                {
                    Ok(retried) => outcome = retried,
                    Err(e) => {
                        let message =
                            format!("{} retry failed: {}", request.provider, root_cause(&e));
                        logger.error(&message);
                        logger.finish();
                        append_failed_line(ctx, &request, &connection, "FAILED network");
                        return AttemptResult::Failure {
                            status: None,
                            message,
                            retry_after_ms: None,
                        };
                    }
                }
            }
            None => debug!("{}: refresh attempts exhausted", request.provider),
        }
    }

    logger.upstream(&outcome.url, &outcome.sent_headers);

    // 6. Upstream said no: parse the failure for the fallback policy
    if !outcome.status.is_success() {
        let status = outcome.status.as_u16();
        let (message, retry_after_ms) = parse_upstream_error(request.provider, &mut outcome).await;
        logger.error(&message);
        logger.finish();
        append_failed_line(ctx, &request, &connection, &format!("FAILED {}", status));
        return AttemptResult::Failure { status: Some(status), message, retry_after_ms };
    }

    // 7. Success path
    if request.stream {
        let upstream_format = executor.response_format();
        let translator = if upstream_format != request.source_format {
            Some(StreamTranslator::new(
                upstream_format,
                request.source_format,
                request.model,
                tool_name_map,
            ))
        } else {
            None
        };

        let pricing = ctx.config.pricing_for(request.provider, request.model).cloned();
        let usage_store = ctx.usage_store.clone();
        let store = ctx.store.clone();
        let state_dir = ctx.state_dir.clone();
        let provider = request.provider.to_string();
        let model = request.model.to_string();
        let connection_id = connection.id.clone();
        let account = connection.label_or_id();
        logger.response(200, &json!("streaming"));
        logger.finish();

        let body_stream = pipe_sse(outcome.body, translator, upstream_format, move |end| {
            let _guard = guard; // released when the stream is done
            let entry_cost = cost(pricing.as_ref(), &end.tokens);
            usage_store.append(UsageEntry {
                timestamp: chrono::Utc::now().timestamp_millis(),
                provider: provider.clone(),
                model: model.clone(),
                connection_id: connection_id.clone(),
                tokens: end.tokens,
                cost: entry_cost,
            });
            let status = if end.client_disconnected { "499 DISCONNECT" } else { "200 OK" };
            append_log_line(
                &state_dir,
                &model,
                &provider,
                &account,
                end.tokens.prompt,
                end.tokens.completion,
                status,
            );
            if !end.client_disconnected {
                store.mark_success(&connection_id);
            }
        });

        let body = Body::from_stream(
            body_stream.map(|chunk| chunk.map_err(|e| -> axum::BoxError { e.into() })),
        );
        let response = (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            body,
        )
            .into_response();
        return AttemptResult::Success(response);
    }

    // Non-streaming: collect the body
    let collected = match collect_body(&mut outcome.body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let message = format!("{} body read failed: {}", request.provider, e);
            logger.error(&message);
            logger.finish();
            append_failed_line(ctx, &request, &connection, "FAILED network");
            return AttemptResult::Failure { status: None, message, retry_after_ms: None };
        }
    };

    // Kiro only ever streams; aggregate its chunks for non-streaming clients
    let body_json: Value = if request.provider == "kiro" {
        aggregate_openai_stream(&String::from_utf8_lossy(&collected), request.model)
    } else {
        match serde_json::from_slice(&collected) {
            Ok(value) => value,
            Err(e) => {
                let message = format!("{} returned malformed JSON: {}", request.provider, e);
                logger.error(&message);
                logger.finish();
                append_failed_line(ctx, &request, &connection, "FAILED upstream");
                return AttemptResult::Failure {
                    status: Some(502),
                    message,
                    retry_after_ms: None,
                };
            }
        }
    };

    let upstream_format =
        if request.provider == "kiro" { WireFormat::Openai } else { executor.response_format() };
    let tokens = extract_usage(upstream_format, &body_json);
    let pricing = ctx.config.pricing_for(request.provider, request.model);
    ctx.usage_store.append(UsageEntry {
        timestamp: chrono::Utc::now().timestamp_millis(),
        provider: request.provider.to_string(),
        model: request.model.to_string(),
        connection_id: connection.id.clone(),
        tokens,
        cost: cost(pricing, &tokens),
    });
    append_log_line(
        &ctx.state_dir,
        request.model,
        request.provider,
        &connection.label_or_id(),
        tokens.prompt,
        tokens.completion,
        "200 OK",
    );
    logger.response(200, &body_json);
    logger.finish();
    ctx.store.mark_success(&connection.id);
    drop(guard);

    let response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from(body_json.to_string()),
    )
        .into_response();
    AttemptResult::Success(response)
}

async fn execute_once(
    ctx: &AttemptContext,
    executor: &Arc<dyn Executor>,
    connection: &Connection,
    model: &str,
    body: &Value,
    stream: bool,
) -> anyhow::Result<ExecuteOutcome> {
    let attempt = executor.execute(ExecuteArgs {
        model,
        body: body.clone(),
        stream,
        secrets: &connection.secrets,
    });
    match tokio::time::timeout(Duration::from_secs(ctx.settings.request_timeout), attempt).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("timed out after {}s", ctx.settings.request_timeout),
    }
}

fn append_failed_line(
    ctx: &AttemptContext,
    request: &AttemptRequest<'_>,
    connection: &Connection,
    status: &str,
) {
    append_log_line(
        &ctx.state_dir,
        request.model,
        request.provider,
        &connection.label_or_id(),
        0,
        0,
        status,
    );
}

/// Pull the upstream error apart: status-prefixed message plus an optional
/// server-specified retry delay.
async fn parse_upstream_error(
    provider: &str,
    outcome: &mut ExecuteOutcome,
) -> (String, Option<u64>) {
    let mut retry_after_ms = outcome
        .response_headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(crate::services::fallback::parse_retry_after);

    let bytes = collect_body(&mut outcome.body, ERROR_BODY_LIMIT).await.unwrap_or_default();
    let text = String::from_utf8_lossy(&bytes);
    let message = match serde_json::from_str::<Value>(&text) {
        Ok(parsed) => {
            if retry_after_ms.is_none() {
                retry_after_ms = parse_body_retry_hint(&parsed);
            }
            parsed
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(String::from)
                .or_else(|| {
                    parsed.get("message").and_then(Value::as_str).map(String::from)
                })
                .unwrap_or_else(|| text.to_string())
        }
        Err(_) => text.to_string(),
    };

    let message = format!("{} {}: {}", provider, outcome.status.as_u16(), message.trim());
    warn!("{}", message);
    (message, retry_after_ms)
}

// Antigravity reports its rate-limit delay inside the error body, either as
// a flat retryAfterMs or as a google.rpc RetryInfo detail ("30s").
fn parse_body_retry_hint(body: &Value) -> Option<u64> {
    if let Some(ms) = body.get("retryAfterMs").and_then(Value::as_u64) {
        return Some(ms);
    }
    let details = body.get("error")?.get("details")?.as_array()?;
    for detail in details {
        if let Some(delay) = detail.get("retryDelay").and_then(Value::as_str) {
            if let Some(seconds) = delay.strip_suffix('s').and_then(|s| s.parse::<f64>().ok()) {
                return Some((seconds * 1000.0) as u64);
            }
        }
    }
    None
}

async fn collect_body(
    body: &mut crate::providers::ByteStream,
    limit: usize,
) -> anyhow::Result<Vec<u8>> {
    let mut collected = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        collected.extend_from_slice(&chunk);
        if collected.len() >= limit {
            break;
        }
    }
    Ok(collected)
}

fn root_cause(e: &anyhow::Error) -> String {
    e.root_cause().to_string()
}

fn extract_tool_name_map(mut body: Value) -> (Value, HashMap<String, String>) {
    let map = body
        .as_object_mut()
        .and_then(|object| object.remove("_tool_name_map"))
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default();
    (body, map)
}

/// Probe detection: a lone canonical short user message, or a recognized
/// probe user agent.
pub fn is_bypass_probe(format: WireFormat, body: &Value, user_agent: Option<&str>) -> bool {
    if let Some(agent) = user_agent {
        if BYPASS_USER_AGENTS.iter().any(|probe| agent.contains(probe)) {
            return true;
        }
    }
    if format != WireFormat::Openai && format != WireFormat::Claude {
        return false;
    }
    let Some(messages) = body.get("messages").and_then(Value::as_array) else { return false };
    if messages.len() != 1 {
        return false;
    }
    let message = &messages[0];
    if message.get("role").and_then(Value::as_str) != Some("user") {
        return false;
    }
    let text = match message.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => return false,
    };
    let text = text.trim().to_lowercase();
    BYPASS_MESSAGES.contains(&text.as_str())
}

/// Synthetic OK answer in the caller's format, for bypassed probes
pub fn synthetic_response(format: WireFormat, model: &str, stream: bool) -> Response {
    if stream {
        let frames = match format {
            WireFormat::Claude => {
                let mut translator =
                    StreamTranslator::new(WireFormat::Openai, WireFormat::Claude, model, HashMap::new());
                let mut out = translator.on_event(&crate::services::stream::SseEvent {
                    event: None,
                    data: json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": "OK"}, "finish_reason": null}]})
                        .to_string(),
                });
                out.extend(translator.finish());
                out.concat()
            }
            _ => {
                let first = json!({
                    "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
                    "object": "chat.completion.chunk",
                    "created": chrono::Utc::now().timestamp(),
                    "model": model,
                    "choices": [{"index": 0, "delta": {"role": "assistant", "content": "OK"}, "finish_reason": null}]
                });
                let last = json!({
                    "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
                    "object": "chat.completion.chunk",
                    "created": chrono::Utc::now().timestamp(),
                    "model": model,
                    "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
                });
                format!("data: {}\n\ndata: {}\n\ndata: [DONE]\n\n", first, last)
            }
        };
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/event-stream")],
            Body::from(frames),
        )
            .into_response();
    }

    let body = match format {
        WireFormat::Claude => json!({
            "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "OK"}],
            "model": model,
            "stop_reason": "end_turn",
            "stop_sequence": null,
            "usage": {"input_tokens": 0, "output_tokens": 0}
        }),
        WireFormat::Gemini => json!({
            "candidates": [{
                "content": {"parts": [{"text": "OK"}], "role": "model"},
                "finishReason": "STOP",
                "index": 0
            }],
            "usageMetadata": {"promptTokenCount": 0, "candidatesTokenCount": 0, "totalTokenCount": 0}
        }),
        _ => json!({
            "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "OK"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0}
        }),
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from(body.to_string()),
    )
        .into_response()
}
