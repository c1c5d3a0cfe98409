//! LLM gateway server
//!
//! Multi-provider gateway that accepts OpenAI, Anthropic, Gemini and
//! Responses requests and routes them to configured upstream accounts.

use anyhow::Context;
use llmgateway::{create_router, GatewayConfig, Settings};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_logging();

    let mut settings = match Settings::new() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load settings: {}", e);
            std::process::exit(1);
        }
    };

    let config = match GatewayConfig::load_default() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load gateway configuration: {:#}", e);
            std::process::exit(1);
        }
    };
    info!("📁 Gateway configuration loaded ({} connections)", config.connections.len());

    // Persisted server settings win over the built-in defaults; explicit
    // environment overrides still apply through Settings::new.
    if let Some(server) = &config.server {
        if std::env::var("SERVER_HOST").is_err() {
            settings.server.host = server.host.clone();
        }
        if std::env::var("SERVER_PORT").is_err() {
            settings.server.port = server.port;
        }
    }

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let app = match create_router(settings, config).await {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to build router: {:#}", e);
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            error!("Port already in use: {}", addr);
            std::process::exit(2);
        }
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("🚀 LLM gateway started on {}", addr);
    info!("📝 Health check: http://{}/health", addr);
    info!("🔄 Chat endpoints: /v1/chat/completions /v1/messages /v1/responses /v1beta/models/*");

    if let Err(e) = axum::serve(listener, app).await.context("server error") {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Initialize logging system
fn init_logging() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if log_format == "json" {
        Box::new(
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .finish(),
        )
    } else {
        Box::new(
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .finish(),
        )
    };

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}
