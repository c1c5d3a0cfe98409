//! Chat endpoints
//!
//! Format-detected entry points, model-alias and combo resolution, and the
//! account failover loop around the chat core.

use crate::handlers::AppState;
use crate::models::{detect_format, wants_stream, WireFormat};
use crate::providers::executor_for;
use crate::services::core::{run_attempt, AttemptContext, AttemptRequest, AttemptResult};
use crate::services::fallback;
use crate::utils::error::{upstream_error_response, GatewayError};
use crate::utils::logging::mask_key;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch(state, headers, "/v1/chat/completions", None, None, body).await
}

/// POST /v1/messages
pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch(state, headers, "/v1/messages", None, None, body).await
}

/// POST /v1/responses
pub async fn responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch(state, headers, "/v1/responses", None, None, body).await
}

/// POST /v1beta/models/{model:action} (and the unprefixed variant)
///
/// Gemini carries both the model and the streaming flag in the URL.
pub async fn generate_content(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let Some((model, method)) = action.split_once(':') else {
        return GatewayError::Validation(format!("malformed model action: {}", action))
            .into_response();
    };
    let stream = method == "streamGenerateContent";
    let path = format!("/v1beta/models/{}", action);
    dispatch(state, headers, &path, Some(model.to_string()), Some(stream), body).await
}

/// GET /v1/models
///
/// Known models from all active connections, merged with aliases and combos
/// (a combo is addressable as a model).
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = state.store.config_snapshot();
    let created = chrono::Utc::now().timestamp();
    let mut seen = std::collections::BTreeSet::new();

    for (alias, target) in &config.aliases {
        seen.insert((alias.clone(), target.split('/').next().unwrap_or("").to_string()));
    }
    for combo in config.combos.keys() {
        seen.insert((combo.clone(), "combo".to_string()));
    }
    for connection in config.connections.iter().filter(|c| c.is_active) {
        if let Some(model) = &connection.default_model {
            seen.insert((format!("{}/{}", connection.provider, model), connection.provider.clone()));
        }
    }

    let data: Vec<Value> = seen
        .into_iter()
        .map(|(id, owner)| {
            json!({"id": id, "object": "model", "created": created, "owned_by": owner})
        })
        .collect();
    Json(json!({"object": "list", "data": data}))
}

// One model attempt across its accounts
enum ModelOutcome {
    Success(Response),
    /// All accounts exhausted on retryable errors; the combo may continue
    Retryable { status: Option<u16>, message: String },
    /// Surfaced immediately, combo or not
    Fatal(Response),
}

async fn dispatch(
    state: Arc<AppState>,
    headers: HeaderMap,
    path: &str,
    model_override: Option<String>,
    stream_override: Option<bool>,
    body: Value,
) -> Response {
    let config = state.store.config_snapshot();

    let model = match model_override
        .or_else(|| body.get("model").and_then(Value::as_str).map(String::from))
        .filter(|m| !m.is_empty())
    {
        Some(model) => model,
        None => return GatewayError::Validation("missing model".into()).into_response(),
    };

    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        if messages.is_empty() {
            return GatewayError::Validation("messages must not be empty".into()).into_response();
        }
    }

    let source_format = detect_format(&body, &headers);
    let stream =
        stream_override.unwrap_or_else(|| wants_stream(source_format, &body, path));
    let user_agent =
        headers.get("user-agent").and_then(|v| v.to_str().ok()).map(String::from);
    let client_key = headers
        .get("authorization")
        .or_else(|| headers.get("x-api-key"))
        .and_then(|v| v.to_str().ok())
        .map(mask_key)
        .unwrap_or_else(|| "none".to_string());

    let message_count = body.get("messages").and_then(Value::as_array).map(Vec::len).unwrap_or(0);
    let tool_count = body.get("tools").and_then(Value::as_array).map(Vec::len).unwrap_or(0);
    info!(
        "{} model={} format={} stream={} messages={} tools={} key={}",
        path, model, source_format, stream, message_count, tool_count, client_key
    );

    let ctx = AttemptContext {
        store: state.store.clone(),
        usage_store: state.usage_store.clone(),
        clients: state.clients.clone(),
        settings: state.settings.clone(),
        config: config.clone(),
        state_dir: state.state_dir.clone(),
    };

    // Combo: an ordered fallback list of models; otherwise a single model
    let combo = config.resolve_combo(&model).map(<[String]>::to_vec);
    let models = combo.clone().unwrap_or_else(|| vec![model.clone()]);
    if combo.is_some() {
        debug!("combo {} expands to {:?}", model, models);
    }

    let mut last_failure: Option<(Option<u16>, String)> = None;
    for entry in &models {
        match attempt_model(&ctx, entry, source_format, stream, &body, user_agent.as_deref()).await
        {
            ModelOutcome::Success(response) => return response,
            ModelOutcome::Fatal(response) => return response,
            ModelOutcome::Retryable { status, message } => {
                warn!("model {} exhausted: {}", entry, message);
                last_failure = Some((status, message));
            }
        }
    }

    match last_failure {
        // Combo exhausted: the last retryable error surfaces as 503
        Some((_, message)) => GatewayError::Exhausted(message).into_response(),
        None => GatewayError::Validation(format!("unknown model: {}", model)).into_response(),
    }
}

async fn attempt_model(
    ctx: &AttemptContext,
    model_entry: &str,
    source_format: WireFormat,
    stream: bool,
    body: &Value,
    user_agent: Option<&str>,
) -> ModelOutcome {
    let Some((provider, model)) = ctx.config.resolve_model(model_entry) else {
        return ModelOutcome::Fatal(
            GatewayError::Validation(format!("unknown model or alias: {}", model_entry))
                .into_response(),
        );
    };

    if ctx.store.connections_for(&provider).is_empty() {
        return ModelOutcome::Fatal(
            GatewayError::ProviderNotConfigured(provider.clone()).into_response(),
        );
    }

    let mut tried: Vec<String> = Vec::new();
    let mut last_failure: Option<(Option<u16>, String)> = None;

    loop {
        let Some(connection) = ctx.store.select_connection(&provider, &tried, Some(&model))
        else {
            break;
        };
        tried.push(connection.id.clone());

        // Proactive refresh before the attempt; failures fall through to the
        // reactive 401 path inside the core.
        let executor = executor_for(&provider, &connection, &ctx.clients);
        let connection = ctx.store.ensure_fresh(connection, &executor).await;
        let failures = connection.consecutive_failures;

        let result = run_attempt(
            ctx,
            AttemptRequest {
                connection: connection.clone(),
                provider: &provider,
                model: &model,
                source_format,
                body,
                stream,
                user_agent,
            },
        )
        .await;

        match result {
            AttemptResult::Success(response) => return ModelOutcome::Success(response),
            AttemptResult::Failure { status, message, retry_after_ms } => {
                let decision = fallback::classify(status, retry_after_ms, failures);
                if decision.should_fallback {
                    ctx.store.mark_unavailable(
                        &connection.id,
                        decision.cooldown(),
                        status,
                        &message,
                    );
                    last_failure = Some((status, message));
                    continue;
                }
                // Fatal for this request: surface the upstream answer as-is
                return ModelOutcome::Fatal(upstream_error_response(status, &message));
            }
        }
    }

    match last_failure {
        Some((status, message)) => ModelOutcome::Retryable { status, message },
        None => ModelOutcome::Retryable {
            status: Some(401),
            message: format!("no eligible {} credential", provider),
        },
    }
}
