//! OAuth token refresh
//!
//! Each provider has its own token endpoint and request encoding: JSON for
//! Anthropic and Kiro, form-encoded for OpenAI/Qwen/Google, Basic auth for
//! iFlow. A non-2xx answer means the refresh token is no longer good; that
//! is reported as `Ok(None)`, not as an error.

use super::RefreshedTokens;
use crate::config::ConnectionSecrets;
use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

const ANTHROPIC_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const ANTHROPIC_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

const OPENAI_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
const OPENAI_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

const QWEN_TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
const QWEN_CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const GOOGLE_CLIENT_SECRET: &str = "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";

const IFLOW_TOKEN_URL: &str = "https://iflow.cn/oauth/token";
const IFLOW_CLIENT_ID: &str = "10009311001";
const IFLOW_CLIENT_SECRET: &str = "4Z3YjXycVsQvyg7F3oBAJnobNe7FFQTD";

const KIRO_DESKTOP_TOKEN_URL: &str = "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken";
const KIRO_OIDC_TOKEN_URL: &str = "https://oidc.us-east-1.amazonaws.com/token";

/// Refresh the OAuth credentials of one connection
pub async fn refresh(
    provider: &str,
    secrets: &ConnectionSecrets,
    client: &Client,
) -> Result<Option<RefreshedTokens>> {
    let Some(refresh_token) = secrets.refresh_token.as_deref() else {
        debug!("{}: no refresh token stored, skipping refresh", provider);
        return Ok(None);
    };

    match provider {
        "claude" => {
            let body = json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
                "client_id": ANTHROPIC_CLIENT_ID,
            });
            let response = client
                .post(ANTHROPIC_TOKEN_URL)
                .json(&body)
                .send()
                .await
                .context("anthropic token refresh failed")?;
            parse_token_response(provider, response).await
        }
        "codex" | "openai" => {
            let form = [
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", OPENAI_CLIENT_ID),
            ];
            let response = client
                .post(OPENAI_TOKEN_URL)
                .form(&form)
                .send()
                .await
                .context("openai token refresh failed")?;
            parse_token_response(provider, response).await
        }
        "qwen" => {
            let form = [
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", QWEN_CLIENT_ID),
            ];
            let response = client
                .post(QWEN_TOKEN_URL)
                .form(&form)
                .send()
                .await
                .context("qwen token refresh failed")?;
            parse_token_response(provider, response).await
        }
        "gemini" | "antigravity" => {
            let form = [
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", GOOGLE_CLIENT_ID),
                ("client_secret", GOOGLE_CLIENT_SECRET),
            ];
            let response = client
                .post(GOOGLE_TOKEN_URL)
                .form(&form)
                .send()
                .await
                .context("google token refresh failed")?;
            parse_token_response(provider, response).await
        }
        "iflow" => {
            let form = [("grant_type", "refresh_token"), ("refresh_token", refresh_token)];
            let response = client
                .post(IFLOW_TOKEN_URL)
                .basic_auth(IFLOW_CLIENT_ID, Some(IFLOW_CLIENT_SECRET))
                .form(&form)
                .send()
                .await
                .context("iflow token refresh failed")?;
            parse_token_response(provider, response).await
        }
        "kiro" => refresh_kiro(secrets, refresh_token, client).await,
        other => {
            debug!("{}: provider has no refresh method", other);
            Ok(None)
        }
    }
}

// Kiro has two auth variants: social logins refresh against the desktop
// endpoint, Identity Center logins against AWS SSO-OIDC with per-user
// client credentials.
async fn refresh_kiro(
    secrets: &ConnectionSecrets,
    refresh_token: &str,
    client: &Client,
) -> Result<Option<RefreshedTokens>> {
    let response = match (&secrets.client_id, &secrets.client_secret) {
        (Some(client_id), Some(client_secret)) => client
            .post(KIRO_OIDC_TOKEN_URL)
            .json(&json!({
                "clientId": client_id,
                "clientSecret": client_secret,
                "grantType": "refresh_token",
                "refreshToken": refresh_token,
            }))
            .send()
            .await
            .context("kiro sso-oidc token refresh failed")?,
        _ => client
            .post(KIRO_DESKTOP_TOKEN_URL)
            .json(&json!({"refreshToken": refresh_token}))
            .send()
            .await
            .context("kiro token refresh failed")?,
    };
    parse_token_response("kiro", response).await
}

async fn parse_token_response(
    provider: &str,
    response: reqwest::Response,
) -> Result<Option<RefreshedTokens>> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!("{}: token refresh rejected ({}): {}", provider, status, truncate(&body, 200));
        return Ok(None);
    }

    let payload: Value = response.json().await.context("token response was not JSON")?;
    let Some(tokens) = parse_token_payload(&payload) else {
        warn!("{}: token response carried no access token", provider);
        return Ok(None);
    };
    debug!("{}: credentials refreshed", provider);
    Ok(Some(tokens))
}

/// Extract tokens from a refresh payload, tolerating both snake_case and
/// camelCase field names.
pub fn parse_token_payload(payload: &Value) -> Option<RefreshedTokens> {
    let access_token = string_field(payload, &["access_token", "accessToken"])?;
    let refresh_token = string_field(payload, &["refresh_token", "refreshToken"]);
    let id_token = string_field(payload, &["id_token", "idToken"]);

    let expires_at = number_field(payload, &["expires_in", "expiresIn"])
        .map(|seconds| chrono::Utc::now().timestamp_millis() + (seconds as i64) * 1000)
        .or_else(|| number_field(payload, &["expiresAt", "expires_at"]).map(|ms| ms as i64));

    let mut extra = std::collections::HashMap::new();
    for key in ["profileArn", "projectId", "resource_url"] {
        if let Some(value) = payload.get(key) {
            extra.insert(key.to_string(), value.clone());
        }
    }

    Some(RefreshedTokens { access_token, refresh_token, id_token, expires_at, extra })
}

fn string_field(payload: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| payload.get(*name).and_then(Value::as_str))
        .map(String::from)
}

fn number_field(payload: &Value, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|name| payload.get(*name).and_then(Value::as_f64))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((index, _)) => &s[..index],
        None => s,
    }
}
