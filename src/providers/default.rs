//! Default executor
//!
//! Covers every provider that speaks one of the standard HTTP shapes:
//! OpenAI chat, OpenAI responses, Anthropic messages and Gemini
//! generateContent. User-defined compatible nodes get an instance
//! parameterized with their base URL and api type.

use super::oauth;
use super::{
    provider_info, ExecuteArgs, ExecuteOutcome, Executor, HttpClients, ProviderFamily,
    RefreshedTokens,
};
use crate::config::{Connection, ConnectionSecrets};
use crate::models::WireFormat;
use crate::utils::logging::mask_key;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

pub struct DefaultExecutor {
    provider: String,
    family: ProviderFamily,
    base_urls: Vec<String>,
    api_key_header_only: bool,
    response_format: WireFormat,
    clients: HttpClients,
}

impl DefaultExecutor {
    /// Build an executor for a provider id, honoring the connection's
    /// base-URL override and falling back to a compatible-node setup for
    /// unknown ids.
    pub fn for_provider(provider: &str, connection: &Connection, clients: HttpClients) -> Self {
        if let Some(info) = provider_info(provider) {
            let base_urls = match &connection.secrets.base_url {
                Some(base) => vec![base.trim_end_matches('/').to_string()],
                None => info.base_urls.iter().map(|u| u.to_string()).collect(),
            };
            let response_format = match info.family {
                ProviderFamily::OpenaiChat => WireFormat::Openai,
                ProviderFamily::OpenaiResponses => WireFormat::OpenaiResponses,
                ProviderFamily::Anthropic => WireFormat::Claude,
                ProviderFamily::Gemini => WireFormat::Gemini,
            };
            return Self {
                provider: provider.to_string(),
                family: info.family,
                base_urls,
                api_key_header_only: info.api_key_header_only,
                response_format,
                clients,
            };
        }

        // Compatible node: shape follows the stored api type
        let (family, response_format) = match connection.secrets.api_type.as_deref() {
            Some("anthropic") => (ProviderFamily::Anthropic, WireFormat::Claude),
            Some("responses") => (ProviderFamily::OpenaiResponses, WireFormat::OpenaiResponses),
            _ => (ProviderFamily::OpenaiChat, WireFormat::Openai),
        };
        let base = connection
            .secrets
            .base_url
            .clone()
            .unwrap_or_else(|| "http://localhost".to_string());
        Self {
            provider: provider.to_string(),
            family,
            base_urls: vec![base.trim_end_matches('/').to_string()],
            api_key_header_only: false,
            response_format,
            clients,
        }
    }

    fn base_url(&self, url_index: usize) -> &str {
        self.base_urls
            .get(url_index)
            .or_else(|| self.base_urls.first())
            .map(String::as_str)
            .unwrap_or_default()
    }
}

#[async_trait]
impl Executor for DefaultExecutor {
    fn provider_id(&self) -> &str {
        &self.provider
    }

    fn response_format(&self) -> WireFormat {
        self.response_format
    }

    fn build_url(
        &self,
        model: &str,
        stream: bool,
        url_index: usize,
        _secrets: &ConnectionSecrets,
    ) -> String {
        let base = self.base_url(url_index);
        match self.family {
            ProviderFamily::OpenaiChat => format!("{}/chat/completions", base),
            ProviderFamily::OpenaiResponses => format!("{}/responses", base),
            ProviderFamily::Anthropic => format!("{}?beta=true", base),
            ProviderFamily::Gemini => {
                let method = if stream { "streamGenerateContent?alt=sse" } else { "generateContent" };
                if base.ends_with("/models") {
                    format!("{}/{}:{}", base, model, method)
                } else {
                    // CLI-style endpoints carry the model in the body
                    format!("{}:{}", base, method)
                }
            }
        }
    }

    fn build_headers(&self, secrets: &ConnectionSecrets, stream: bool) -> Vec<(String, String)> {
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];

        let api_key = secrets.api_key.as_deref();
        let access_token = secrets.access_token.as_deref();

        match self.family {
            ProviderFamily::Gemini => match (api_key, access_token) {
                (Some(key), _) => headers.push(("x-goog-api-key".to_string(), key.to_string())),
                (None, Some(token)) => {
                    headers.push(("Authorization".to_string(), format!("Bearer {}", token)))
                }
                _ => {}
            },
            ProviderFamily::Anthropic => {
                headers.push(("anthropic-version".to_string(), "2023-06-01".to_string()));
                if self.api_key_header_only {
                    if let Some(key) = api_key.or(access_token) {
                        headers.push(("x-api-key".to_string(), key.to_string()));
                    }
                } else {
                    match (api_key, access_token) {
                        (Some(key), _) => headers.push(("x-api-key".to_string(), key.to_string())),
                        (None, Some(token)) => {
                            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
                            headers.push((
                                "anthropic-beta".to_string(),
                                "oauth-2025-04-20".to_string(),
                            ));
                        }
                        _ => {}
                    }
                }
            }
            _ => {
                if let Some(token) = access_token.or(api_key) {
                    headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
                }
            }
        }

        if stream {
            headers.push(("Accept".to_string(), "text/event-stream".to_string()));
        }
        headers
    }

    async fn execute(&self, args: ExecuteArgs<'_>) -> Result<ExecuteOutcome> {
        let body = self.transform_request(args.model, args.body, args.stream, args.secrets);
        let headers = self.build_headers(args.secrets, args.stream);
        let client =
            if args.stream { &self.clients.stream_client } else { &self.clients.client };

        let mut last_error: Option<anyhow::Error> = None;
        for url_index in 0..self.base_urls.len() {
            let url = self.build_url(args.model, args.stream, url_index, args.secrets);
            debug!("{}: POST {}", self.provider, url);

            let mut request = client.post(&url);
            for (name, value) in &headers {
                request = request.header(name, value);
            }

            match request.json(&body).send().await {
                Ok(response) => {
                    let status = response.status();
                    let response_headers = response.headers().clone();
                    let stream = response
                        .bytes_stream()
                        .map(|chunk| chunk.context("upstream read failed"));
                    return Ok(ExecuteOutcome {
                        status,
                        url,
                        sent_headers: masked_headers(&headers),
                        response_headers,
                        body: Box::pin(stream),
                        transformed_body: body,
                    });
                }
                Err(e) if url_index + 1 < self.base_urls.len() => {
                    warn!("{}: {} unreachable, trying alternate", self.provider, url);
                    last_error = Some(anyhow::Error::new(e));
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e))
                        .with_context(|| format!("{}: request to {} failed", self.provider, url))
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no base URL configured")))
    }

    async fn refresh_credentials(
        &self,
        secrets: &ConnectionSecrets,
    ) -> Result<Option<RefreshedTokens>> {
        oauth::refresh(&self.provider, secrets, &self.clients.client).await
    }
}

/// Secret header values are masked before they reach logs or snapshots
pub(super) fn masked_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.to_lowercase();
            if lower == "authorization" || lower.contains("api-key") {
                (name.clone(), mask_key(value))
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthType;

    fn connection(provider: &str) -> Connection {
        Connection {
            id: "c".into(),
            provider: provider.into(),
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
        }
    }

    fn executor(provider: &str) -> DefaultExecutor {
        DefaultExecutor::for_provider(provider, &connection(provider), HttpClients::default())
    }

    #[test]
    fn test_openai_urls() {
        let exec = executor("openai");
        let secrets = ConnectionSecrets::default();
        assert_eq!(
            exec.build_url("gpt-4o", false, 0, &secrets),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_anthropic_url_has_beta_marker() {
        let exec = executor("claude");
        let secrets = ConnectionSecrets::default();
        assert_eq!(
            exec.build_url("claude-sonnet-4", true, 0, &secrets),
            "https://api.anthropic.com/v1/messages?beta=true"
        );
    }

    #[test]
    fn test_gemini_url_stream_marker() {
        let exec = executor("gemini");
        let secrets = ConnectionSecrets::default();
        let streaming = exec.build_url("gemini-2.5-pro", true, 0, &secrets);
        assert!(streaming.ends_with("gemini-2.5-pro:streamGenerateContent?alt=sse"));
        let blocking = exec.build_url("gemini-2.5-pro", false, 0, &secrets);
        assert!(blocking.ends_with("gemini-2.5-pro:generateContent"));
    }

    #[test]
    fn test_antigravity_url_keeps_model_out_of_path() {
        let exec = executor("antigravity");
        let secrets = ConnectionSecrets::default();
        let url = exec.build_url("gemini-3-pro", true, 0, &secrets);
        assert!(url.ends_with("v1internal:streamGenerateContent?alt=sse"));
        let alternate = exec.build_url("gemini-3-pro", true, 1, &secrets);
        assert!(alternate.contains("sandbox"));
    }

    #[test]
    fn test_gemini_headers_prefer_api_key() {
        let exec = executor("gemini");
        let secrets = ConnectionSecrets { api_key: Some("g-key".into()), ..Default::default() };
        let headers = exec.build_headers(&secrets, false);
        assert!(headers.iter().any(|(n, v)| n == "x-goog-api-key" && v == "g-key"));

        let oauth_secrets =
            ConnectionSecrets { access_token: Some("tok".into()), ..Default::default() };
        let headers = exec.build_headers(&oauth_secrets, false);
        assert!(headers.iter().any(|(n, v)| n == "Authorization" && v == "Bearer tok"));
    }

    #[test]
    fn test_anthropic_oauth_headers() {
        let exec = executor("claude");
        let secrets = ConnectionSecrets { access_token: Some("tok".into()), ..Default::default() };
        let headers = exec.build_headers(&secrets, false);
        assert!(headers.iter().any(|(n, v)| n == "Authorization" && v == "Bearer tok"));
        assert!(headers.iter().any(|(n, _)| n == "anthropic-beta"));
    }

    #[test]
    fn test_glm_requires_x_api_key() {
        let exec = executor("glm");
        let secrets = ConnectionSecrets { api_key: Some("glm-key".into()), ..Default::default() };
        let headers = exec.build_headers(&secrets, false);
        assert!(headers.iter().any(|(n, v)| n == "x-api-key" && v == "glm-key"));
        assert!(!headers.iter().any(|(n, _)| n == "Authorization"));
    }

    #[test]
    fn test_stream_accept_header() {
        let exec = executor("openai");
        let secrets = ConnectionSecrets { api_key: Some("sk".into()), ..Default::default() };
        let streaming = exec.build_headers(&secrets, true);
        assert!(streaming.iter().any(|(n, v)| n == "Accept" && v == "text/event-stream"));
        let blocking = exec.build_headers(&secrets, false);
        assert!(!blocking.iter().any(|(n, _)| n == "Accept"));
    }

    #[test]
    fn test_compatible_node_uses_connection_base_url() {
        let mut conn = connection("my-node");
        conn.secrets.base_url = Some("https://llm.internal/v1/".into());
        conn.secrets.api_type = Some("responses".into());
        let exec = DefaultExecutor::for_provider("my-node", &conn, HttpClients::default());
        assert_eq!(
            exec.build_url("m", false, 0, &conn.secrets),
            "https://llm.internal/v1/responses"
        );
    }

    #[test]
    fn test_masked_headers() {
        let masked = masked_headers(&[
            ("Authorization".to_string(), "Bearer sk-verysecretvalue123".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]);
        assert!(!masked[0].1.contains("verysecret"));
        assert_eq!(masked[1].1, "application/json");
    }
}
