//! Configuration Module
//!
//! Environment-driven configuration for the streaming client.

mod settings;

pub use settings::{
    CacheSettings, ClientConfig, ConfigError, DEFAULT_WS_URL, ServerSettings, SymbolSettings,
    WebSocketSettings,
};
