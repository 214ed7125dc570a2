#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! IR Stream Client - On-demand Market Data Cache
//!
//! Keeps one WebSocket connection to Independent Reserve, subscribes channels
//! the first time someone asks for them, serves later queries from a cache,
//! and unsubscribes channels nobody has asked for within the idle timeout.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: channel keys and symbol sets, typed payloads, entry state
//! - **Application**: ports, and the cache, router, sweeper and ingestion services
//! - **Infrastructure**: Independent Reserve adapter, config, HTTP surface,
//!   metrics, telemetry
//!
//! # Data Flow
//!
//! ```text
//!  caller ──► Router ──► SubscriptionCache ──(miss)──► FeedConnection ──► exchange
//!                             ▲                              │
//!                             └──────── ingestion ◄──────────┘
//!                             ▲
//!                          Sweeper (evicts idle entries, unsubscribes)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Channel and payload types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Process-scoped client handle.
pub mod client;

// =============================================================================
// Re-exports
// =============================================================================

// Client handle
pub use client::{ClientError, StreamClient};

// Domain types
pub use domain::channel::{ChannelError, ChannelKey, ChannelKind, CurrencyPair, SymbolSet};
pub use domain::payload::{Balance, ChannelPayload, OrderBook, RecentTrades, Ticker};
pub use domain::subscription::{CacheStats, ConnectionState, SubscriptionId};

// Query surface
pub use application::error::{ErrorKind, QueryError};
pub use application::services::router::{MarketDataRouter, Snapshot};

// Infrastructure config
pub use infrastructure::config::{ClientConfig, ConfigError};

// Transport
pub use infrastructure::independent_reserve::connector::WebSocketConnector;

// HTTP surface
pub use infrastructure::http::{HttpServer, HttpServerError, HttpState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
