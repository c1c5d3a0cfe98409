//! Configuration management module
//!
//! File-backed gateway state (connections, aliases, combos, pricing) and
//! environment-derived runtime settings.

pub mod file;
pub mod settings;

pub use file::{
    AuthType, Connection, ConnectionSecrets, GatewayConfig, PricingEntry, ServerConfig, TestStatus,
};
pub use settings::Settings;
