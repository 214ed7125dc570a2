//! Stream Client
//!
//! Process-scoped handle that owns the feed connection and the background
//! tasks around it. One client serves any number of concurrent callers.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::application::error::QueryError;
use crate::application::ports::{FeedConnector, SubscribeError};
use crate::application::services::cache::SubscriptionCache;
use crate::application::services::ingest::run_ingestion;
use crate::application::services::router::{MarketDataRouter, Snapshot};
use crate::application::services::sweeper::EvictionSweeper;
use crate::domain::channel::{ChannelKey, SymbolSet};
use crate::domain::payload::{Balance, OrderBook, RecentTrades, Ticker};
use crate::domain::subscription::{CacheStats, ConnectionState};
use crate::infrastructure::config::{ClientConfig, ConfigError};
use crate::infrastructure::http::HttpState;
use crate::infrastructure::independent_reserve::auth::Authenticator;
use crate::infrastructure::independent_reserve::connection::FeedConnection;

/// Errors starting the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A pinned channel could not be subscribed.
    #[error("cannot pin {channel}: {source}")]
    Pinned {
        /// Channel name.
        channel: String,
        /// Underlying failure.
        source: SubscribeError,
    },
}

/// Running streaming client.
pub struct StreamClient {
    router: MarketDataRouter,
    cache: Arc<SubscriptionCache>,
    connection: Arc<FeedConnection>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    _guard: DropGuard,
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("connection", &self.connection)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl StreamClient {
    /// Wire up and spawn the connection, ingestion and sweeper tasks.
    ///
    /// Pinned channels are subscribed immediately. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] for inconsistent timeouts, unparseable pinned
    /// channels, or a pinned private channel without credentials.
    pub fn start(
        config: &ClientConfig,
        connector: Arc<dyn FeedConnector>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let symbols = Arc::new(config.symbol_set());
        let pinned = config.pinned_keys(&symbols)?;
        let cancel = CancellationToken::new();

        let (events_tx, events_rx) = mpsc::channel(config.cache.event_buffer);
        let connection = Arc::new(FeedConnection::new(
            config.connection_config(),
            connector,
            Authenticator::new(config.credentials.clone()),
            Arc::clone(&symbols),
            events_tx,
            cancel.child_token(),
        ));
        let cache = Arc::new(SubscriptionCache::new(Arc::clone(&connection) as _));
        let router = MarketDataRouter::new(
            Arc::clone(&cache),
            Arc::clone(&symbols),
            config.cache.first_message_timeout,
        );

        let mut warm: Vec<&ChannelKey> = pinned.iter().collect();
        warm.sort();
        for key in warm {
            cache.get_or_subscribe(key).map_err(|source| ClientError::Pinned {
                channel: key.channel_name(),
                source,
            })?;
        }

        let sweeper = EvictionSweeper::new(
            Arc::clone(&cache),
            config.sweeper_config(pinned),
            cancel.child_token(),
        );

        let conn = Arc::clone(&connection);
        let tasks = vec![
            tokio::spawn(async move {
                if let Err(e) = conn.run().await {
                    tracing::error!(error = %e, "feed connection stopped");
                }
            }),
            tokio::spawn(run_ingestion(
                events_rx,
                Arc::clone(&cache),
                cancel.child_token(),
            )),
            tokio::spawn(sweeper.run()),
        ];

        tracing::info!(
            url = %config.websocket.url,
            authenticated = config.credentials.is_some(),
            "stream client started"
        );

        Ok(Self {
            router,
            cache,
            connection,
            _guard: cancel.clone().drop_guard(),
            cancel,
            tasks,
        })
    }

    /// Latest ticker for a pair.
    ///
    /// # Errors
    ///
    /// See [`MarketDataRouter::query`].
    pub async fn get_ticker(
        &self,
        primary: &str,
        secondary: &str,
    ) -> Result<Snapshot<Ticker>, QueryError> {
        self.router.get_ticker(primary, secondary).await
    }

    /// Latest order book for a pair.
    ///
    /// # Errors
    ///
    /// See [`MarketDataRouter::query`].
    pub async fn get_order_book(
        &self,
        primary: &str,
        secondary: &str,
    ) -> Result<Snapshot<OrderBook>, QueryError> {
        self.router.get_order_book(primary, secondary).await
    }

    /// Latest trades for a pair.
    ///
    /// # Errors
    ///
    /// See [`MarketDataRouter::query`].
    pub async fn get_recent_trades(
        &self,
        primary: &str,
        secondary: &str,
    ) -> Result<Snapshot<RecentTrades>, QueryError> {
        self.router.get_recent_trades(primary, secondary).await
    }

    /// Account balance for a currency.
    ///
    /// # Errors
    ///
    /// See [`MarketDataRouter::query`].
    pub async fn get_balance(&self, currency: &str) -> Result<Snapshot<Balance>, QueryError> {
        self.router.get_balance(currency).await
    }

    /// The query router, cloneable into other tasks.
    #[must_use]
    pub const fn router(&self) -> &MarketDataRouter {
        &self.router
    }

    /// Known symbols.
    #[must_use]
    pub fn symbols(&self) -> &SymbolSet {
        self.router.symbols()
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    /// Reconnect attempts since start.
    #[must_use]
    pub fn reconnect_count(&self) -> u64 {
        self.connection.reconnect_count()
    }

    /// Cache counters.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Channels currently held in the cache, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<ChannelKey> {
        self.cache.subscribed_keys()
    }

    /// State for the HTTP surface.
    #[must_use]
    pub fn http_state(&self, version: impl Into<String>) -> HttpState {
        HttpState::new(
            version.into(),
            self.router.clone(),
            Arc::clone(&self.cache),
            self.connection.watch_state(),
        )
    }

    /// Stop all background tasks and wait for them to finish.
    pub async fn shutdown(self) {
        tracing::info!("stream client shutting down");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!("stream client stopped");
    }
}
