//! GitHub Copilot executor
//!
//! The stored GitHub OAuth token is exchanged for a short-lived Copilot API
//! token, which is cached until shortly before expiry. Chat calls are
//! OpenAI-shaped with Copilot editor headers.

use super::default::masked_headers;
use super::{ExecuteArgs, ExecuteOutcome, Executor, HttpClients, RefreshedTokens};
use crate::config::ConnectionSecrets;
use crate::models::WireFormat;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;
use tokio_stream::StreamExt;
use tracing::debug;

const COPILOT_TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";
const COPILOT_CHAT_URL: &str = "https://api.githubcopilot.com/chat/completions";

// Exchange again this many seconds before the cached token expires
const TOKEN_EXPIRY_MARGIN: i64 = 120;

pub struct CopilotExecutor {
    clients: HttpClients,
    // (api token, epoch-seconds expiry)
    cached_token: Mutex<Option<(String, i64)>>,
}

impl CopilotExecutor {
    pub fn new(clients: HttpClients) -> Self {
        Self { clients, cached_token: Mutex::new(None) }
    }

    /// Exchange the GitHub OAuth token for a Copilot API token, with caching
    async fn api_token(&self, secrets: &ConnectionSecrets) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        if let Some((token, expires_at)) = self.cached_token.lock().unwrap().clone() {
            if expires_at - TOKEN_EXPIRY_MARGIN > now {
                return Ok(token);
            }
        }

        let github_token = secrets
            .access_token
            .as_deref()
            .or(secrets.api_key.as_deref())
            .context("copilot: no GitHub token stored")?;

        debug!("copilot: exchanging GitHub token for API token");
        let response = self
            .clients
            .client
            .get(COPILOT_TOKEN_URL)
            .header("Authorization", format!("token {}", github_token))
            .header("Editor-Version", "vscode/1.96.0")
            .send()
            .await
            .context("copilot: token exchange request failed")?;

        anyhow::ensure!(
            response.status().is_success(),
            "copilot: token exchange rejected ({})",
            response.status()
        );

        let payload: Value = response.json().await.context("copilot: token response not JSON")?;
        let token = payload
            .get("token")
            .and_then(Value::as_str)
            .context("copilot: token response missing token")?
            .to_string();
        let expires_at = payload.get("expires_at").and_then(Value::as_i64).unwrap_or(now + 600);

        *self.cached_token.lock().unwrap() = Some((token.clone(), expires_at));
        Ok(token)
    }
}

#[async_trait]
impl Executor for CopilotExecutor {
    fn provider_id(&self) -> &str {
        "copilot"
    }

    fn response_format(&self) -> WireFormat {
        WireFormat::Openai
    }

    fn build_url(
        &self,
        _model: &str,
        _stream: bool,
        _url_index: usize,
        secrets: &ConnectionSecrets,
    ) -> String {
        match &secrets.base_url {
            Some(base) => format!("{}/chat/completions", base.trim_end_matches('/')),
            None => COPILOT_CHAT_URL.to_string(),
        }
    }

    fn build_headers(&self, _secrets: &ConnectionSecrets, stream: bool) -> Vec<(String, String)> {
        // The Authorization header is added in execute() once the exchanged
        // token is known.
        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Editor-Version".to_string(), "vscode/1.96.0".to_string()),
            ("Editor-Plugin-Version".to_string(), "copilot-chat/0.26.0".to_string()),
            ("Copilot-Integration-Id".to_string(), "vscode-chat".to_string()),
        ];
        if stream {
            headers.push(("Accept".to_string(), "text/event-stream".to_string()));
        }
        headers
    }

    async fn execute(&self, args: ExecuteArgs<'_>) -> Result<ExecuteOutcome> {
        let token = self.api_token(args.secrets).await?;
        let url = self.build_url(args.model, args.stream, 0, args.secrets);
        let mut headers = self.build_headers(args.secrets, args.stream);
        headers.push(("Authorization".to_string(), format!("Bearer {}", token)));

        debug!("copilot: POST {}", url);
        let client = if args.stream { &self.clients.stream_client } else { &self.clients.client };
        let mut request = client.post(&url);
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        let response = request
            .json(&args.body)
            .send()
            .await
            .with_context(|| format!("copilot: request to {} failed", url))?;

        let status = response.status();
        let response_headers = response.headers().clone();
        let stream = response.bytes_stream().map(|chunk| chunk.context("upstream read failed"));
        Ok(ExecuteOutcome {
            status,
            url,
            sent_headers: masked_headers(&headers),
            response_headers,
            body: Box::pin(stream),
            transformed_body: args.body,
        })
    }

    // The GitHub OAuth token itself is long-lived; the short-lived API token
    // is renewed inline by api_token().
    async fn refresh_credentials(
        &self,
        _secrets: &ConnectionSecrets,
    ) -> Result<Option<RefreshedTokens>> {
        Ok(None)
    }
}
