//! Client Configuration Settings
//!
//! Configuration for the streaming client, loaded from environment
//! variables. Numeric values that fail to parse fall back to their defaults;
//! structural mistakes (half a credential pair, an unknown pinned channel)
//! are errors.

use std::collections::HashSet;
use std::time::Duration;

use crate::application::services::sweeper::SweeperConfig;
use crate::domain::channel::{
    ChannelKey, DEFAULT_PRIMARY_CURRENCIES, DEFAULT_SECONDARY_CURRENCIES, SymbolSet,
};
use crate::infrastructure::independent_reserve::auth::Credentials;
use crate::infrastructure::independent_reserve::connection::ConnectionConfig;
use crate::infrastructure::independent_reserve::heartbeat::HeartbeatConfig;
use crate::infrastructure::independent_reserve::reconnect::ReconnectConfig;

/// Default streaming endpoint.
pub const DEFAULT_WS_URL: &str = "wss://ws.independentreserve.com/v2";

/// WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Endpoint URL.
    pub url: String,
    /// Ping interval.
    pub heartbeat_interval: Duration,
    /// Inbound silence tolerated before reconnecting.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0, // Unlimited
        }
    }
}

/// Cache and sweeper settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Idle time after which an unpinned channel is evicted.
    pub idle_timeout: Duration,
    /// Time between sweeps.
    pub sweep_interval: Duration,
    /// How long a query waits for the first payload of a new channel.
    pub first_message_timeout: Duration,
    /// Channel names kept subscribed for the life of the process.
    pub pinned_channels: Vec<String>,
    /// Capacity of the feed event queue.
    pub event_buffer: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            first_message_timeout: Duration::from_millis(5000),
            pinned_channels: Vec::new(),
            event_buffer: 1024,
        }
    }
}

/// Known currency codes.
#[derive(Debug, Clone)]
pub struct SymbolSettings {
    /// Primary (base) currencies.
    pub primaries: Vec<String>,
    /// Secondary (quote) currencies.
    pub secondaries: Vec<String>,
}

impl Default for SymbolSettings {
    fn default() -> Self {
        Self {
            primaries: DEFAULT_PRIMARY_CURRENCIES.iter().map(ToString::to_string).collect(),
            secondaries: DEFAULT_SECONDARY_CURRENCIES.iter().map(ToString::to_string).collect(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Port for health, metrics and query endpoints (0 = disabled).
    pub http_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { http_port: 8083 }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// API credentials; `None` restricts the client to public channels.
    pub credentials: Option<Credentials>,
    /// WebSocket connection settings.
    pub websocket: WebSocketSettings,
    /// Cache and sweeper settings.
    pub cache: CacheSettings,
    /// Known currency codes.
    pub symbols: SymbolSettings,
    /// HTTP server settings.
    pub server: ServerSettings,
}

impl ClientConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if only one of `IR_API_KEY` / `IR_API_SECRET` is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`ClientConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let credentials = match (env.non_empty("IR_API_KEY"), env.non_empty("IR_API_SECRET")) {
            (Some(key), Some(secret)) => Some(
                Credentials::new(key, secret)
                    .map_err(|e| ConfigError::InvalidValue("IR_API_KEY".to_string(), e.to_string()))?,
            ),
            (Some(_), None) => return Err(ConfigError::MissingEnvVar("IR_API_SECRET".to_string())),
            (None, Some(_)) => return Err(ConfigError::MissingEnvVar("IR_API_KEY".to_string())),
            (None, None) => None,
        };

        let ws = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            url: env.non_empty("IR_WS_URL").unwrap_or(ws.url),
            heartbeat_interval: env.duration_secs("IR_HEARTBEAT_INTERVAL_SECS", ws.heartbeat_interval),
            heartbeat_timeout: env.duration_secs("IR_HEARTBEAT_TIMEOUT_SECS", ws.heartbeat_timeout),
            reconnect_delay_initial: env.duration_millis(
                "IR_RECONNECT_DELAY_INITIAL_MS",
                ws.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.duration_secs(
                "IR_RECONNECT_DELAY_MAX_SECS",
                ws.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.parse(
                "IR_RECONNECT_DELAY_MULTIPLIER",
                ws.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: env.parse(
                "IR_MAX_RECONNECT_ATTEMPTS",
                ws.max_reconnect_attempts,
            ),
        };

        let defaults = CacheSettings::default();
        let cache = CacheSettings {
            idle_timeout: env.duration_secs("IR_CACHE_TIMEOUT_SECS", defaults.idle_timeout),
            sweep_interval: env.duration_secs("IR_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            first_message_timeout: env.duration_millis(
                "IR_FIRST_MESSAGE_TIMEOUT_MS",
                defaults.first_message_timeout,
            ),
            pinned_channels: env.list("IR_PINNED_CHANNELS").unwrap_or_default(),
            event_buffer: env.parse("IR_EVENT_BUFFER", defaults.event_buffer).max(1),
        };

        let defaults = SymbolSettings::default();
        let symbols = SymbolSettings {
            primaries: env.list("IR_PRIMARY_CURRENCIES").unwrap_or(defaults.primaries),
            secondaries: env
                .list("IR_SECONDARY_CURRENCIES")
                .unwrap_or(defaults.secondaries),
        };

        let server = ServerSettings {
            http_port: env.parse("IR_HTTP_PORT", ServerSettings::default().http_port),
        };

        let config = Self {
            credentials,
            websocket,
            cache,
            symbols,
            server,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check settings that depend on each other.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when the idle timeout does not
    /// exceed the first message timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.idle_timeout <= self.cache.first_message_timeout {
            return Err(ConfigError::InvalidValue(
                "IR_CACHE_TIMEOUT_SECS".to_string(),
                format!(
                    "idle timeout {:?} must exceed first message timeout {:?}",
                    self.cache.idle_timeout, self.cache.first_message_timeout
                ),
            ));
        }
        Ok(())
    }

    /// The known symbol set.
    #[must_use]
    pub fn symbol_set(&self) -> SymbolSet {
        SymbolSet::new(&self.symbols.primaries, &self.symbols.secondaries)
    }

    /// Resolve pinned channel names against `symbols`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for names that do not parse.
    pub fn pinned_keys(&self, symbols: &SymbolSet) -> Result<HashSet<ChannelKey>, ConfigError> {
        self.cache
            .pinned_channels
            .iter()
            .map(|name| {
                symbols.parse_channel(name).map_err(|e| {
                    ConfigError::InvalidValue("IR_PINNED_CHANNELS".to_string(), e.to_string())
                })
            })
            .collect()
    }

    /// Settings for the feed connection.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        let ws = &self.websocket;
        ConnectionConfig {
            url: ws.url.clone(),
            heartbeat: HeartbeatConfig {
                ping_interval: ws.heartbeat_interval,
                silence_timeout: ws.heartbeat_timeout,
            },
            reconnect: ReconnectConfig {
                initial_delay: ws.reconnect_delay_initial,
                max_delay: ws.reconnect_delay_max,
                multiplier: ws.reconnect_delay_multiplier,
                max_attempts: ws.max_reconnect_attempts,
                ..ReconnectConfig::default()
            },
        }
    }

    /// Settings for the eviction sweeper.
    #[must_use]
    pub fn sweeper_config(&self, pinned: HashSet<ChannelKey>) -> SweeperConfig {
        SweeperConfig {
            interval: self.cache.sweep_interval,
            idle_timeout: self.cache.idle_timeout,
            pinned,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has an unusable value.
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn non_empty(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.non_empty(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.non_empty(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.non_empty(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.non_empty(key).map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
    }
}
