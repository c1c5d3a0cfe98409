//! Admin endpoints
//!
//! CRUD over connections, aliases, combos, pricing and settings. Secret
//! material never appears in a response body.

use crate::config::{Connection, PricingEntry};
use crate::handlers::AppState;
use crate::providers::executor_for;
use crate::services::core::{run_attempt, AttemptContext, AttemptRequest, AttemptResult};
use crate::services::fallback;
use crate::services::usage::active_counts;
use crate::utils::error::{GatewayError, GatewayResult};
use crate::utils::logging::read_log_lines;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// GET /admin/connections
pub async fn list_connections(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = state.store.config_snapshot();
    let connections: Vec<Value> =
        config.connections.iter().map(Connection::to_public_json).collect();
    Json(json!({"connections": connections}))
}

/// POST /admin/connections — create or replace
pub async fn upsert_connection(
    State(state): State<Arc<AppState>>,
    Json(mut connection): Json<Connection>,
) -> GatewayResult<Json<Value>> {
    if connection.provider.is_empty() {
        return Err(GatewayError::Validation("connection needs a provider".into()));
    }
    if connection.id.is_empty() {
        connection.id = uuid::Uuid::new_v4().to_string();
    }
    if connection.created_at == 0 {
        connection.created_at = chrono::Utc::now().timestamp_millis();
    }
    info!("admin: upsert connection {} ({})", connection.id, connection.provider);
    let public = connection.to_public_json();
    state.store.upsert_connection(connection);
    Ok(Json(public))
}

/// DELETE /admin/connections/{id}
pub async fn delete_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> GatewayResult<StatusCode> {
    if state.store.remove_connection(&id) {
        info!("admin: removed connection {}", id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(GatewayError::NotFound(format!("connection {}", id)))
    }
}

/// POST /admin/connections/{id}/test
///
/// Issues a one-token probe through the normal attempt path and updates the
/// connection's test status from the outcome.
pub async fn test_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> GatewayResult<Json<Value>> {
    let connection =
        state.store.get(&id).ok_or_else(|| GatewayError::NotFound(format!("connection {}", id)))?;

    let Some(model) = connection.default_model.clone() else {
        return Err(GatewayError::Validation(
            "connection has no default model to test with".into(),
        ));
    };

    let ctx = AttemptContext {
        store: state.store.clone(),
        usage_store: state.usage_store.clone(),
        clients: state.clients.clone(),
        settings: state.settings.clone(),
        config: state.store.config_snapshot(),
        state_dir: state.state_dir.clone(),
    };
    let probe_body = json!({
        "model": model,
        "messages": [{"role": "user", "content": "hi"}],
        "max_tokens": 1
    });

    let provider = connection.provider.clone();
    let executor = executor_for(&provider, &connection, &ctx.clients);
    let connection = ctx.store.ensure_fresh(connection, &executor).await;
    let failures = connection.consecutive_failures;

    let result = run_attempt(
        &ctx,
        AttemptRequest {
            connection: connection.clone(),
            provider: &provider,
            model: &model,
            source_format: crate::models::WireFormat::Openai,
            body: &probe_body,
            stream: false,
            user_agent: None,
        },
    )
    .await;

    match result {
        AttemptResult::Success(_) => Ok(Json(json!({"id": id, "testStatus": "active"}))),
        AttemptResult::Failure { status, message, retry_after_ms } => {
            let decision = fallback::classify(status, retry_after_ms, failures);
            if decision.should_fallback {
                state.store.mark_unavailable(&id, decision.cooldown(), status, &message);
            }
            Ok(Json(json!({"id": id, "testStatus": "error", "error": message})))
        }
    }
}

/// GET /admin/aliases
pub async fn get_aliases(State(state): State<Arc<AppState>>) -> Json<HashMap<String, String>> {
    Json(state.store.config_snapshot().aliases)
}

/// PUT /admin/aliases — replace the whole table
pub async fn put_aliases(
    State(state): State<Arc<AppState>>,
    Json(aliases): Json<HashMap<String, String>>,
) -> GatewayResult<StatusCode> {
    for (name, target) in &aliases {
        if !target.contains('/') {
            return Err(GatewayError::Validation(format!(
                "alias '{}' must map to provider/model",
                name
            )));
        }
    }
    state.store.update_config(|config| config.aliases = aliases);
    Ok(StatusCode::NO_CONTENT)
}

/// GET /admin/combos
pub async fn get_combos(State(state): State<Arc<AppState>>) -> Json<HashMap<String, Vec<String>>> {
    Json(state.store.config_snapshot().combos)
}

/// PUT /admin/combos — replace the whole table
pub async fn put_combos(
    State(state): State<Arc<AppState>>,
    Json(combos): Json<HashMap<String, Vec<String>>>,
) -> GatewayResult<StatusCode> {
    for (name, models) in &combos {
        if models.is_empty() {
            return Err(GatewayError::Validation(format!("combo '{}' has no models", name)));
        }
    }
    state.store.update_config(|config| config.combos = combos);
    Ok(StatusCode::NO_CONTENT)
}

/// GET /admin/pricing
pub async fn get_pricing(
    State(state): State<Arc<AppState>>,
) -> Json<HashMap<String, PricingEntry>> {
    Json(state.store.config_snapshot().pricing)
}

/// PUT /admin/pricing — replace the whole table
pub async fn put_pricing(
    State(state): State<Arc<AppState>>,
    Json(pricing): Json<HashMap<String, PricingEntry>>,
) -> StatusCode {
    state.store.update_config(|config| config.pricing = pricing);
    StatusCode::NO_CONTENT
}

/// GET /admin/settings — password hash presence only, never the hash
pub async fn get_settings(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = state.store.config_snapshot();
    Json(json!({
        "hasPassword": config.settings.password_hash.is_some(),
        "extra": config.settings.extra,
    }))
}

/// PUT /admin/settings
pub async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<Value>,
) -> StatusCode {
    state.store.update_config(|config| {
        if let Some(hash) = settings.get("passwordHash").and_then(Value::as_str) {
            config.settings.password_hash = Some(hash.to_string());
        }
        if let Some(extra) = settings.get("extra").and_then(Value::as_object) {
            for (key, value) in extra {
                config.settings.extra.insert(key.clone(), value.clone());
            }
        }
    });
    StatusCode::NO_CONTENT
}

/// GET /admin/usage
pub async fn get_usage(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({"history": state.usage_store.history()}))
}

/// GET /admin/active — in-flight request counters
pub async fn get_active(State(_state): State<Arc<AppState>>) -> Json<HashMap<String, u32>> {
    Json(active_counts())
}

/// GET /admin/logs — the request log lines
pub async fn get_logs(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({"lines": read_log_lines(&state.state_dir)}))
}
