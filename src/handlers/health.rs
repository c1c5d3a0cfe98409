//! Health check handlers

use crate::handlers::AppState;
use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HealthDetails>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthDetails {
    /// Configured connections
    pub connections: usize,
    /// Connections currently usable (active, not cooling down)
    pub available_connections: usize,
    pub aliases: usize,
    pub combos: usize,
    pub uptime_seconds: u64,
}

static START_TIME: once_cell::sync::Lazy<Instant> = once_cell::sync::Lazy::new(Instant::now);

/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    debug!("Executing health check");

    let config = state.store.config_snapshot();
    let now = chrono::Utc::now().timestamp_millis();
    let available = config
        .connections
        .iter()
        .filter(|c| c.is_active && c.cooldown_until <= now)
        .count();

    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "llmgateway".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        details: Some(HealthDetails {
            connections: config.connections.len(),
            available_connections: available,
            aliases: config.aliases.len(),
            combos: config.combos.len(),
            uptime_seconds: START_TIME.elapsed().as_secs(),
        }),
    })
}

/// GET /health/live — liveness only, no state inspection
pub async fn liveness_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "alive".to_string(),
        service: "llmgateway".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        details: None,
    })
}
