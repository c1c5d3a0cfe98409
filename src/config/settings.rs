//! Runtime settings
//!
//! Environment-derived options that do not belong in the persisted state
//! file.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

use super::file::ServerConfig;

/// Runtime settings assembled from the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Server configuration
    pub server: ServerConfig,
    /// Write per-request debug snapshots to disk
    pub enable_request_logs: bool,
    /// Optional configuration-sync endpoint (accepted, currently unused)
    pub cloud_url: Option<String>,
    /// Per-attempt wall-clock timeout for non-streaming upstream calls, seconds
    pub request_timeout: u64,
    /// Per-attempt wall-clock timeout for streaming upstream calls, seconds
    pub stream_timeout: u64,
}

impl Settings {
    /// Build settings from environment variables
    pub fn new() -> Result<Self> {
        let host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("SERVER_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8317);

        Ok(Self {
            server: ServerConfig { host, port },
            enable_request_logs: env_flag("ENABLE_REQUEST_LOGS"),
            cloud_url: env::var("CLOUD_URL").ok().filter(|v| !v.is_empty()),
            request_timeout: env_u64("REQUEST_TIMEOUT", 120),
            stream_timeout: env_u64("STREAM_TIMEOUT", 600),
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            enable_request_logs: false,
            cloud_url: None,
            request_timeout: 120,
            stream_timeout: 600,
        }
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
