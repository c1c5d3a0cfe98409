//! Provider executor layer
//!
//! One executor per provider family. An executor knows how to build the
//! upstream URL and headers, transform the translated body, issue the call,
//! and refresh the connection's credentials.

pub mod copilot;
pub mod default;
pub mod kiro;
pub mod oauth;

use crate::config::{Connection, ConnectionSecrets};
use crate::models::WireFormat;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::Stream;

/// A boxed byte stream of the upstream response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + 'static>>;

/// Inputs for one upstream attempt
pub struct ExecuteArgs<'a> {
    /// Upstream model name
    pub model: &'a str,
    /// Translated request body
    pub body: Value,
    /// Whether the upstream call should stream
    pub stream: bool,
    /// Credential snapshot for this attempt
    pub secrets: &'a ConnectionSecrets,
}

/// Result of one upstream attempt
///
/// The body is always exposed as a byte stream; for streaming executors it
/// carries SSE text in the executor's `response_format`, for non-streaming
/// calls the collected bytes are a single JSON document.
pub struct ExecuteOutcome {
    pub status: StatusCode,
    pub url: String,
    /// Headers that were sent upstream (values masked where secret)
    pub sent_headers: Vec<(String, String)>,
    pub response_headers: reqwest::header::HeaderMap,
    pub body: ByteStream,
    pub transformed_body: Value,
}

/// Tokens produced by a successful refresh
#[derive(Debug, Clone, Default)]
pub struct RefreshedTokens {
    pub access_token: String,
    /// Absent when the provider keeps the old refresh token valid
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    /// Epoch milliseconds
    pub expires_at: Option<i64>,
    /// Provider-specific extras (profile ARN, project id, ...)
    pub extra: HashMap<String, Value>,
}

/// Per-provider strategy object
#[async_trait]
pub trait Executor: Send + Sync {
    /// Stable provider id this executor serves
    fn provider_id(&self) -> &str;

    /// Wire format of the response body this executor yields. Executors that
    /// transcode (Kiro) report the post-transcoding format.
    fn response_format(&self) -> WireFormat;

    fn build_url(&self, model: &str, stream: bool, url_index: usize, secrets: &ConnectionSecrets)
        -> String;

    fn build_headers(&self, secrets: &ConnectionSecrets, stream: bool) -> Vec<(String, String)>;

    /// Last-mile body adjustments that depend on credentials rather than on
    /// the wire format
    fn transform_request(
        &self,
        _model: &str,
        body: Value,
        _stream: bool,
        _secrets: &ConnectionSecrets,
    ) -> Value {
        body
    }

    /// Issue the upstream call
    async fn execute(&self, args: ExecuteArgs<'_>) -> Result<ExecuteOutcome>;

    /// Refresh OAuth credentials. `Ok(None)` means the provider rejected the
    /// refresh (non-2xx); hard transport failures surface as errors.
    async fn refresh_credentials(&self, secrets: &ConnectionSecrets)
        -> Result<Option<RefreshedTokens>>;
}

/// Shared reqwest clients, one per timeout profile
#[derive(Debug, Clone)]
pub struct HttpClients {
    pub client: Client,
    pub stream_client: Client,
}

impl HttpClients {
    pub fn new(request_timeout: u64, stream_timeout: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(request_timeout))
            .user_agent(concat!("llmgateway/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let stream_client = Client::builder()
            .timeout(Duration::from_secs(stream_timeout))
            .user_agent(concat!("llmgateway/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, stream_client })
    }
}

impl Default for HttpClients {
    fn default() -> Self {
        Self::new(120, 600).expect("failed to build HTTP clients")
    }
}

/// Which URL/header shape a provider speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    /// `/chat/completions`, `Authorization: Bearer`
    OpenaiChat,
    /// `/responses`, `Authorization: Bearer`
    OpenaiResponses,
    /// messages endpoint + `?beta=true`, `x-api-key` or Bearer
    Anthropic,
    /// `{model}:generateContent`, `x-goog-api-key` or Bearer
    Gemini,
}

/// Static description of a built-in provider
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub id: &'static str,
    /// Base URLs in preference order; later entries are alternates
    pub base_urls: &'static [&'static str],
    pub family: ProviderFamily,
    /// Preferred request wire format
    pub target_format: WireFormat,
    /// Anthropic-family nodes that only accept `x-api-key`
    pub api_key_header_only: bool,
}

static PROVIDERS: &[ProviderInfo] = &[
    ProviderInfo {
        id: "openai",
        base_urls: &["https://api.openai.com/v1"],
        family: ProviderFamily::OpenaiChat,
        target_format: WireFormat::Openai,
        api_key_header_only: false,
    },
    ProviderInfo {
        id: "claude",
        base_urls: &["https://api.anthropic.com/v1/messages"],
        family: ProviderFamily::Anthropic,
        target_format: WireFormat::Claude,
        api_key_header_only: false,
    },
    ProviderInfo {
        id: "gemini",
        base_urls: &["https://generativelanguage.googleapis.com/v1beta/models"],
        family: ProviderFamily::Gemini,
        target_format: WireFormat::Gemini,
        api_key_header_only: false,
    },
    ProviderInfo {
        id: "codex",
        base_urls: &["https://chatgpt.com/backend-api/codex"],
        family: ProviderFamily::OpenaiResponses,
        target_format: WireFormat::OpenaiResponses,
        api_key_header_only: false,
    },
    ProviderInfo {
        id: "qwen",
        base_urls: &["https://portal.qwen.ai/v1"],
        family: ProviderFamily::OpenaiChat,
        target_format: WireFormat::Qwen,
        api_key_header_only: false,
    },
    ProviderInfo {
        id: "iflow",
        base_urls: &["https://apis.iflow.cn/v1"],
        family: ProviderFamily::OpenaiChat,
        target_format: WireFormat::Iflow,
        api_key_header_only: false,
    },
    ProviderInfo {
        id: "glm",
        base_urls: &["https://open.bigmodel.cn/api/anthropic/v1/messages"],
        family: ProviderFamily::Anthropic,
        target_format: WireFormat::Claude,
        api_key_header_only: true,
    },
    ProviderInfo {
        id: "kimi",
        base_urls: &["https://api.kimi.com/coding/v1/messages"],
        family: ProviderFamily::Anthropic,
        target_format: WireFormat::Claude,
        api_key_header_only: true,
    },
    ProviderInfo {
        id: "minimax",
        base_urls: &["https://api.minimax.io/anthropic/v1/messages"],
        family: ProviderFamily::Anthropic,
        target_format: WireFormat::Claude,
        api_key_header_only: true,
    },
    ProviderInfo {
        id: "openrouter",
        base_urls: &["https://openrouter.ai/api/v1"],
        family: ProviderFamily::OpenaiChat,
        target_format: WireFormat::Openai,
        api_key_header_only: false,
    },
    ProviderInfo {
        id: "antigravity",
        base_urls: &[
            "https://cloudcode-pa.googleapis.com/v1internal",
            "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal",
        ],
        family: ProviderFamily::Gemini,
        target_format: WireFormat::Antigravity,
        api_key_header_only: false,
    },
];

/// Look up a built-in provider
pub fn provider_info(id: &str) -> Option<&'static ProviderInfo> {
    PROVIDERS.iter().find(|info| info.id == id)
}

/// All built-in provider ids
pub fn builtin_provider_ids() -> Vec<&'static str> {
    let mut ids: Vec<&'static str> = PROVIDERS.iter().map(|info| info.id).collect();
    ids.push("kiro");
    ids.push("copilot");
    ids
}

// Per-model target-format overrides, consulted before the provider default.
// Keyed by (provider, model prefix).
static FORMAT_OVERRIDES: &[(&str, &str, WireFormat)] = &[
    // GLM vision models are only served on the OpenAI-compatible surface
    ("glm", "glm-4v", WireFormat::Openai),
    // MiniMax legacy chat models predate their Anthropic-compatible surface
    ("minimax", "abab", WireFormat::Openai),
];

/// Target wire format for one (provider, model) pair
pub fn target_format(provider: &str, model: &str, connection: &Connection) -> WireFormat {
    for (p, prefix, format) in FORMAT_OVERRIDES {
        if *p == provider && model.starts_with(prefix) {
            return *format;
        }
    }
    if provider == "kiro" {
        return WireFormat::Kiro;
    }
    if provider == "copilot" {
        return WireFormat::Copilot;
    }
    if let Some(info) = provider_info(provider) {
        return info.target_format;
    }
    // User-defined compatible node: shape follows its api_type
    match connection.secrets.api_type.as_deref() {
        Some("anthropic") => WireFormat::Claude,
        Some("responses") => WireFormat::OpenaiResponses,
        _ => WireFormat::Openai,
    }
}

/// Build the executor for a provider
///
/// Unknown provider ids become default executors parameterized with the
/// connection's base URL and api type (user-defined compatible nodes).
pub fn executor_for(
    provider: &str,
    connection: &Connection,
    clients: &HttpClients,
) -> Arc<dyn Executor> {
    match provider {
        "kiro" => Arc::new(kiro::KiroExecutor::new(clients.clone())),
        "copilot" => Arc::new(copilot::CopilotExecutor::new(clients.clone())),
        _ => Arc::new(default::DefaultExecutor::for_provider(provider, connection, clients.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthType;

    fn connection(provider: &str, api_type: Option<&str>) -> Connection {
        Connection {
            id: "c1".into(),
            provider: provider.into(),
            auth_type: AuthType::Apikey,
            label: String::new(),
            priority: 0,
            global_priority: None,
            default_model: None,
            secrets: ConnectionSecrets {
                api_type: api_type.map(String::from),
                ..Default::default()
            },
            test_status: Default::default(),
            last_error: None,
            last_error_at: None,
            cooldown_until: 0,
            consecutive_failures: 0,
            is_active: true,
            created_at: 0,
        }
    }

    #[test]
    fn test_provider_table_lookup() {
        assert!(provider_info("openai").is_some());
        assert!(provider_info("claude").is_some());
        assert!(provider_info("nope").is_none());
    }

    #[test]
    fn test_target_format_defaults() {
        let conn = connection("claude", None);
        assert_eq!(target_format("claude", "claude-sonnet-4", &conn), WireFormat::Claude);
        assert_eq!(target_format("kiro", "claude-sonnet-4", &conn), WireFormat::Kiro);
        assert_eq!(target_format("gemini", "gemini-2.5-pro", &conn), WireFormat::Gemini);
    }

    #[test]
    fn test_target_format_override_wins() {
        let conn = connection("glm", None);
        assert_eq!(target_format("glm", "glm-4.7", &conn), WireFormat::Claude);
        assert_eq!(target_format("glm", "glm-4v-plus", &conn), WireFormat::Openai);
    }

    #[test]
    fn test_compatible_node_format_from_api_type() {
        let conn = connection("my-node", Some("anthropic"));
        assert_eq!(target_format("my-node", "whatever", &conn), WireFormat::Claude);
        let conn = connection("my-node", Some("responses"));
        assert_eq!(target_format("my-node", "whatever", &conn), WireFormat::OpenaiResponses);
        let conn = connection("my-node", None);
        assert_eq!(target_format("my-node", "whatever", &conn), WireFormat::Openai);
    }
}
