//! File-backed gateway configuration
//!
//! Connections, model aliases, combos and pricing live in a single JSON file
//! under the state directory and are edited through the admin endpoints.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen host (default: "127.0.0.1")
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port (default: 8317)
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8317
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

/// Connection auth type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Apikey,
    Oauth,
}

impl Default for AuthType {
    fn default() -> Self {
        AuthType::Apikey
    }
}

/// Result of the most recent probe or live call on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Active,
    Error,
    #[default]
    Unknown,
}

/// Secret material for one connection. Persisted to disk, never serialized
/// into HTTP responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionSecrets {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Access-token expiry, epoch milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// CodeWhisperer profile ARN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    /// Base-URL override for compatible nodes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// API shape for compatible nodes: "chat", "responses" or "anthropic"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_type: Option<String>,
    /// Cloud project id (Gemini OAuth)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// OAuth client credentials for providers that issue them per user
    /// (AWS SSO-OIDC)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// A stored credential for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub label: String,
    /// Per-provider ordering, lower wins
    #[serde(default)]
    pub priority: i32,
    /// Cross-provider ordering, lower wins; unset connections sort last
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default)]
    pub secrets: ConnectionSecrets,
    #[serde(default)]
    pub test_status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Epoch milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<i64>,
    /// Epoch milliseconds; 0 means no cooldown
    #[serde(default)]
    pub cooldown_until: i64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Epoch milliseconds, fixes creation order for selection ties
    #[serde(default)]
    pub created_at: i64,
}

fn default_true() -> bool {
    true
}

impl Connection {
    /// Display name for logs: the label when set, the id otherwise
    pub fn label_or_id(&self) -> String {
        if self.label.is_empty() { self.id.clone() } else { self.label.clone() }
    }

    /// Public view with all secret material removed
    pub fn to_public_json(&self) -> Value {
        json!({
            "id": self.id,
            "provider": self.provider,
            "authType": self.auth_type,
            "label": self.label,
            "priority": self.priority,
            "globalPriority": self.global_priority,
            "defaultModel": self.default_model,
            "testStatus": self.test_status,
            "lastError": self.last_error,
            "lastErrorAt": self.last_error_at,
            "cooldownUntil": self.cooldown_until,
            "isActive": self.is_active,
            "hasApiKey": self.secrets.api_key.is_some(),
            "hasOauthTokens": self.secrets.refresh_token.is_some(),
        })
    }
}

/// Per (provider, model) pricing, USD per million tokens
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingEntry {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation: Option<f64>,
}

/// Opaque settings blob kept alongside the structured state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredSettings {
    /// bcrypt hash of the dashboard password; managed by the config surface
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// The whole persisted gateway state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Alias name → "provider/model". Flat, case-sensitive.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    /// Combo name → ordered model list
    #[serde(default)]
    pub combos: HashMap<String, Vec<String>>,
    /// "provider/model" → pricing
    #[serde(default)]
    pub pricing: HashMap<String, PricingEntry>,
    #[serde(default)]
    pub settings: StoredSettings,
}

impl GatewayConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading gateway configuration from: {:?}", path);

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: GatewayConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;
        config.validate()?;

        debug!("Loaded {} connections", config.connections.len());
        Ok(config)
    }

    /// Load from the state directory, or start empty if no file exists yet
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            info!("No configuration file at {:?}, starting empty", path);
            Ok(Self::default())
        }
    }

    /// Persist to the state directory
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state dir: {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// `$HOME/.llmgateway/local.json`
    pub fn default_path() -> PathBuf {
        state_dir().join("local.json")
    }

    /// Validate configuration invariants
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for connection in &self.connections {
            if connection.id.is_empty() {
                anyhow::bail!("Connection with empty id");
            }
            if connection.provider.is_empty() {
                anyhow::bail!("Connection '{}' has no provider", connection.id);
            }
            if !seen.insert(&connection.id) {
                anyhow::bail!("Duplicate connection id '{}'", connection.id);
            }
        }
        for (name, target) in &self.aliases {
            if !target.contains('/') {
                anyhow::bail!("Alias '{}' must map to provider/model, got '{}'", name, target);
            }
        }
        for (name, models) in &self.combos {
            if models.is_empty() {
                anyhow::bail!("Combo '{}' has no models", name);
            }
        }
        Ok(())
    }

    /// Resolve a model string to (provider, model)
    ///
    /// Aliases win over the literal `provider/model` split; unknown plain
    /// names resolve to None.
    pub fn resolve_model(&self, model: &str) -> Option<(String, String)> {
        let resolved = self.aliases.get(model).map(String::as_str).unwrap_or(model);
        let (provider, model) = resolved.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some((provider.to_string(), model.to_string()))
    }

    /// Combo lookup: the ordered model list if `model` names a combo
    pub fn resolve_combo(&self, model: &str) -> Option<&[String]> {
        self.combos.get(model).map(Vec::as_slice)
    }

    /// Pricing lookup is best-effort: missing entries mean cost 0
    pub fn pricing_for(&self, provider: &str, model: &str) -> Option<&PricingEntry> {
        self.pricing.get(&format!("{}/{}", provider, model))
    }
}

/// `$HOME/.llmgateway`
pub fn state_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".llmgateway")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample_config() -> String {
        r#"{
            "connections": [
                {
                    "id": "conn-1",
                    "provider": "openai",
                    "auth_type": "apikey",
                    "label": "main",
                    "priority": 0,
                    "secrets": {"api_key": "sk-test"}
                },
                {
                    "id": "conn-2",
                    "provider": "claude",
                    "auth_type": "oauth",
                    "priority": 1,
                    "secrets": {"access_token": "at", "refresh_token": "rt", "expires_at": 0}
                }
            ],
            "aliases": {
                "claude-sonnet-4": "claude/claude-sonnet-4-20250514"
            },
            "combos": {
                "all-fast": ["cheap/a", "cheap/b", "free/c"]
            },
            "pricing": {
                "openai/gpt-4o": {"input": 2.5, "output": 10.0, "cached": 1.25}
            }
        }"#
        .to_string()
    }

    #[test]
    fn test_load_config() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(sample_config().as_bytes()).unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.connections.len(), 2);
        assert_eq!(config.combos["all-fast"].len(), 3);
    }

    #[test]
    fn test_resolve_model_via_alias() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(sample_config().as_bytes()).unwrap();
        let config = GatewayConfig::load(file.path()).unwrap();

        let (provider, model) = config.resolve_model("claude-sonnet-4").unwrap();
        assert_eq!(provider, "claude");
        assert_eq!(model, "claude-sonnet-4-20250514");

        let (provider, model) = config.resolve_model("openai/gpt-4o").unwrap();
        assert_eq!(provider, "openai");
        assert_eq!(model, "gpt-4o");

        assert!(config.resolve_model("bare-name").is_none());
    }

    #[test]
    fn test_duplicate_connection_ids_rejected() {
        let config = GatewayConfig {
            connections: vec![
                Connection {
                    id: "x".into(),
                    provider: "openai".into(),
                    auth_type: AuthType::Apikey,
                    label: String::new(),
                    priority: 0,
                    global_priority: None,
                    default_model: None,
                    secrets: Default::default(),
                    test_status: Default::default(),
                    last_error: None,
                    last_error_at: None,
                    cooldown_until: 0,
                    consecutive_failures: 0,
                    is_active: true,
                    created_at: 0,
                },
                Connection {
                    id: "x".into(),
                    provider: "claude".into(),
                    auth_type: AuthType::Apikey,
                    label: String::new(),
                    priority: 0,
                    global_priority: None,
                    default_model: None,
                    secrets: Default::default(),
                    test_status: Default::default(),
                    last_error: None,
                    last_error_at: None,
                    cooldown_until: 0,
                    consecutive_failures: 0,
                    is_active: true,
                    created_at: 0,
                },
            ],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_public_json_strips_secrets() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(sample_config().as_bytes()).unwrap();
        let config = GatewayConfig::load(file.path()).unwrap();

        let public = config.connections[0].to_public_json();
        let rendered = public.to_string();
        assert!(!rendered.contains("sk-test"));
        assert_eq!(public["hasApiKey"], serde_json::json!(true));
    }

    #[test]
    fn test_invalid_alias_rejected() {
        let config = GatewayConfig {
            aliases: HashMap::from([("bad".to_string(), "no-slash".to_string())]),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
