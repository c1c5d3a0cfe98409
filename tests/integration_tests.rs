//! Integration tests
//!
//! Drive the router end to end for everything that does not require a live
//! upstream: validation, detection, model listing and the admin surface.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use llmgateway::config::{AuthType, Connection, ConnectionSecrets, GatewayConfig};
use llmgateway::handlers::{create_router_with_state, AppState};
use llmgateway::providers::HttpClients;
use llmgateway::services::credentials::CredentialStore;
use llmgateway::services::usage::UsageStore;
use llmgateway::Settings;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

fn test_state(config: GatewayConfig) -> Arc<AppState> {
    Arc::new(AppState {
        settings: Settings::default(),
        store: Arc::new(CredentialStore::new(config, false)),
        usage_store: Arc::new(UsageStore::disabled()),
        clients: HttpClients::default(),
        state_dir: std::env::temp_dir()
            .join(format!("llmgateway-test-{}", uuid::Uuid::new_v4().simple())),
    })
}

fn test_app(config: GatewayConfig) -> Router {
    create_router_with_state(test_state(config)).expect("router builds")
}

fn sample_config() -> GatewayConfig {
    GatewayConfig {
        connections: vec![Connection {
            id: "openai-main".into(),
            provider: "openai".into(),
            auth_type: AuthType::Apikey,
            label: "main".into(),
            priority: 0,
            global_priority: None,
            default_model: Some("gpt-4o".into()),
            secrets: ConnectionSecrets { api_key: Some("sk-test".into()), ..Default::default() },
            test_status: Default::default(),
            last_error: None,
            last_error_at: None,
            cooldown_until: 0,
            consecutive_failures: 0,
            is_active: true,
            created_at: 1,
        }],
        aliases: HashMap::from([(
            "claude-sonnet-4".to_string(),
            "claude/claude-sonnet-4-20250514".to_string(),
        )]),
        combos: HashMap::from([(
            "all-fast".to_string(),
            vec!["cheap/a".to_string(), "cheap/b".to_string()],
        )]),
        ..Default::default()
    }
}

async fn post_json(app: Router, path: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn get_json(app: Router, path: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(path).body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn health_endpoints_respond() {
    let (status, body) = get_json(test_app(sample_config()), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("healthy"));
    assert_eq!(body["service"], json!("llmgateway"));
    assert_eq!(body["details"]["connections"], json!(1));

    let (status, body) = get_json(test_app(sample_config()), "/health/live").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("alive"));
}

#[tokio::test]
async fn missing_model_is_rejected() {
    let (status, body) = post_json(
        test_app(sample_config()),
        "/v1/chat/completions",
        json!({"messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], json!("invalid_request_error"));
}

#[tokio::test]
async fn empty_messages_rejected() {
    let (status, _) = post_json(
        test_app(sample_config()),
        "/v1/chat/completions",
        json!({"model": "openai/gpt-4o", "messages": []}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_model_rejected() {
    let (status, body) = post_json(
        test_app(sample_config()),
        "/v1/chat/completions",
        json!({"model": "mystery", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("mystery"));
}

#[tokio::test]
async fn unconfigured_provider_rejected() {
    // Alias resolves to the claude provider, which has no connection
    let (status, body) = post_json(
        test_app(sample_config()),
        "/v1/messages",
        json!({
            "model": "claude-sonnet-4",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "bonjour"}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("claude"));
}

#[tokio::test]
async fn combo_of_unknown_models_surfaces_client_error() {
    let (status, _) = post_json(
        test_app(sample_config()),
        "/v1/chat/completions",
        json!({"model": "all-fast", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    // Combo members resolve to providers with no connections
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn gemini_route_rejects_malformed_action() {
    let (status, _) = post_json(
        test_app(sample_config()),
        "/v1beta/models/not-an-action",
        json!({"contents": []}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn model_listing_merges_aliases_and_combos() {
    let (status, body) = get_json(test_app(sample_config()), "/v1/models").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], json!("list"));
    let ids: Vec<&str> =
        body["data"].as_array().unwrap().iter().filter_map(|m| m["id"].as_str()).collect();
    assert!(ids.contains(&"claude-sonnet-4"));
    assert!(ids.contains(&"all-fast"));
    assert!(ids.contains(&"openai/gpt-4o"));
}

#[tokio::test]
async fn admin_connection_listing_strips_secrets() {
    let (status, body) = get_json(test_app(sample_config()), "/admin/connections").await;
    assert_eq!(status, StatusCode::OK);
    let rendered = body.to_string();
    assert!(!rendered.contains("sk-test"));
    assert_eq!(body["connections"][0]["hasApiKey"], json!(true));
}

#[tokio::test]
async fn admin_upsert_and_delete_connection() {
    let state = test_state(sample_config());
    let app = create_router_with_state(state.clone()).unwrap();

    let (status, body) = post_json(
        app.clone(),
        "/admin/connections",
        json!({
            "id": "",
            "provider": "claude",
            "auth_type": "oauth",
            "label": "work",
            "priority": 2,
            "secrets": {"access_token": "at", "refresh_token": "rt"},
            "is_active": true
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = body["id"].as_str().unwrap().to_string();
    assert!(!body.to_string().contains("\"at\""));
    assert!(state.store.get(&id).is_some());

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/admin/connections/{}", id))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(state.store.get(&id).is_none());
}

#[tokio::test]
async fn admin_alias_validation() {
    let app = test_app(sample_config());
    let request = Request::builder()
        .method("PUT")
        .uri("/admin/aliases")
        .header("content-type", "application/json")
        .body(Body::from(json!({"bad": "no-slash"}).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cors_header_present() {
    let app = test_app(sample_config());
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get("access-control-allow-origin").and_then(|v| v.to_str().ok()),
        Some("*")
    );
}
