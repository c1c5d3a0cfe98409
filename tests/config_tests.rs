//! Gateway configuration tests

use llmgateway::config::{AuthType, Connection, ConnectionSecrets, GatewayConfig, PricingEntry};
use std::collections::HashMap;
use std::io::Write;
use tempfile::NamedTempFile;

fn connection(id: &str, provider: &str) -> Connection {
    Connection {
        id: id.into(),
        provider: provider.into(),
        auth_type: AuthType::Apikey,
        label: format!("{} account", provider),
        priority: 0,
        global_priority: None,
        default_model: Some("gpt-4o".into()),
        secrets: ConnectionSecrets { api_key: Some("sk-secret-value".into()), ..Default::default() },
        test_status: Default::default(),
        last_error: None,
        last_error_at: None,
        cooldown_until: 0,
        consecutive_failures: 0,
        is_active: true,
        created_at: 1,
    }
}

#[test]
fn round_trips_through_json_file() {
    let config = GatewayConfig {
        connections: vec![connection("c1", "openai")],
        aliases: HashMap::from([(
            "claude-sonnet-4".to_string(),
            "claude/claude-sonnet-4-20250514".to_string(),
        )]),
        combos: HashMap::from([(
            "all-fast".to_string(),
            vec!["cheap/a".to_string(), "cheap/b".to_string(), "free/c".to_string()],
        )]),
        pricing: HashMap::from([(
            "openai/gpt-4o".to_string(),
            PricingEntry { input: 2.5, output: 10.0, ..Default::default() },
        )]),
        ..Default::default()
    };

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(serde_json::to_string_pretty(&config).unwrap().as_bytes()).unwrap();

    let loaded = GatewayConfig::load(file.path()).unwrap();
    assert_eq!(loaded.connections.len(), 1);
    assert_eq!(loaded.connections[0].secrets.api_key.as_deref(), Some("sk-secret-value"));
    assert_eq!(loaded.combos["all-fast"].len(), 3);
    assert_eq!(loaded.pricing["openai/gpt-4o"].output, 10.0);
}

#[test]
fn alias_resolution_is_case_sensitive() {
    let config = GatewayConfig {
        aliases: HashMap::from([(
            "Claude-Sonnet".to_string(),
            "claude/claude-sonnet-4-20250514".to_string(),
        )]),
        ..Default::default()
    };
    assert!(config.resolve_model("Claude-Sonnet").is_some());
    assert!(config.resolve_model("claude-sonnet").is_none());
}

#[test]
fn combo_resolution_keeps_order() {
    let config = GatewayConfig {
        combos: HashMap::from([(
            "tier".to_string(),
            vec!["a/one".to_string(), "b/two".to_string()],
        )]),
        ..Default::default()
    };
    let models = config.resolve_combo("tier").unwrap();
    assert_eq!(models, &["a/one".to_string(), "b/two".to_string()]);
    assert!(config.resolve_combo("other").is_none());
}

#[test]
fn pricing_lookup_is_best_effort() {
    let config = GatewayConfig::default();
    assert!(config.pricing_for("openai", "gpt-4o").is_none());
}

#[test]
fn public_json_never_leaks_secrets() {
    let mut conn = connection("c1", "claude");
    conn.secrets.access_token = Some("oauth-access-token".into());
    conn.secrets.refresh_token = Some("oauth-refresh-token".into());

    let rendered = conn.to_public_json().to_string();
    assert!(!rendered.contains("sk-secret-value"));
    assert!(!rendered.contains("oauth-access-token"));
    assert!(!rendered.contains("oauth-refresh-token"));
    assert!(rendered.contains("hasApiKey"));
}

#[test]
fn validation_rejects_broken_state() {
    let duplicate = GatewayConfig {
        connections: vec![connection("same", "openai"), connection("same", "claude")],
        ..Default::default()
    };
    assert!(duplicate.validate().is_err());

    let bad_alias = GatewayConfig {
        aliases: HashMap::from([("x".to_string(), "noslash".to_string())]),
        ..Default::default()
    };
    assert!(bad_alias.validate().is_err());

    let empty_combo = GatewayConfig {
        combos: HashMap::from([("empty".to_string(), Vec::new())]),
        ..Default::default()
    };
    assert!(empty_combo.validate().is_err());
}
