//! HTTP handlers module
//!
//! Router assembly and shared application state

pub mod admin;
pub mod chat;
pub mod health;

use crate::config::{file::state_dir, GatewayConfig, Settings};
use crate::providers::HttpClients;
use crate::services::credentials::CredentialStore;
use crate::services::usage::UsageStore;
use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

// Request bodies beyond this are rejected before parsing
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Application state
pub struct AppState {
    pub settings: Settings,
    pub store: Arc<CredentialStore>,
    pub usage_store: Arc<UsageStore>,
    pub clients: HttpClients,
    pub state_dir: PathBuf,
}

impl AppState {
    pub fn new(settings: Settings, config: GatewayConfig, persist: bool) -> Result<Self> {
        let clients = HttpClients::new(settings.request_timeout, settings.stream_timeout)?;
        let dir = state_dir();
        let usage_store = if persist {
            Arc::new(UsageStore::new(dir.join("usage.json")))
        } else {
            Arc::new(UsageStore::disabled())
        };
        Ok(Self {
            settings,
            store: Arc::new(CredentialStore::new(config, persist)),
            usage_store,
            clients,
            state_dir: dir,
        })
    }
}

/// Create the application router
pub async fn create_router(settings: Settings, config: GatewayConfig) -> Result<Router> {
    create_router_with_state(Arc::new(AppState::new(settings, config, true)?))
}

/// Router over an existing state (tests construct non-persisting states)
pub fn create_router_with_state(state: Arc<AppState>) -> Result<Router> {
    let middleware_stack = ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    );

    let router = Router::new()
        // chat surface, one handler per wire format entry point
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/messages", post(chat::messages))
        .route("/v1/responses", post(chat::responses))
        .route("/v1beta/models/:action", post(chat::generate_content))
        .route("/models/:action", post(chat::generate_content))
        .route("/v1/models", get(chat::list_models))
        // admin surface
        .route("/admin/connections", get(admin::list_connections).post(admin::upsert_connection))
        .route("/admin/connections/:id", delete(admin::delete_connection))
        .route("/admin/connections/:id/test", post(admin::test_connection))
        .route("/admin/aliases", get(admin::get_aliases).put(admin::put_aliases))
        .route("/admin/combos", get(admin::get_combos).put(admin::put_combos))
        .route("/admin/pricing", get(admin::get_pricing).put(admin::put_pricing))
        .route("/admin/settings", get(admin::get_settings).put(admin::put_settings))
        .route("/admin/usage", get(admin::get_usage))
        .route("/admin/active", get(admin::get_active))
        .route("/admin/logs", get(admin::get_logs))
        // health surface
        .route("/health", get(health::health_check))
        .route("/health/live", get(health::liveness_check))
        .with_state(state)
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware_stack);

    Ok(router)
}
