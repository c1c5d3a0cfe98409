//! Multi-provider LLM gateway library
//!
//! Accepts chat requests in OpenAI, Anthropic, Gemini and Responses wire
//! formats, routes them to configured upstream accounts with failover, and
//! streams the answer back in the caller's format.

pub mod config;
pub mod handlers;
pub mod models;
pub mod providers;
pub mod services;
pub mod utils;

// Re-export common types
pub use config::{GatewayConfig, Settings};
pub use handlers::{create_router, create_router_with_state, AppState};
pub use models::{detect_format, WireFormat};
pub use utils::error::{GatewayError, GatewayResult};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
