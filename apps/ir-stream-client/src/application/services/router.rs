//! Request Router
//!
//! Public query entry points. Each query validates its arguments against the
//! symbol set, resolves a [`ChannelKey`], and reads through the cache.
//!
//! The first query for a channel subscribes it as a side effect and waits up
//! to the first-message timeout for data. Later queries within the idle
//! window are answered from the cache without touching the connection.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::application::error::{ErrorKind, QueryError};
use crate::application::services::cache::{Lookup, SubscriptionCache, WaitError};
use crate::domain::channel::{ChannelError, ChannelKey, SymbolSet};
use crate::domain::payload::{Balance, OrderBook, RecentTrades, Ticker, TypedPayload};
use crate::infrastructure::metrics;

/// A payload returned to a caller, with the time it arrived.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot<T> {
    /// Channel the data came from.
    pub channel: String,
    /// When the payload was received from the exchange.
    pub received_at: DateTime<Utc>,
    /// The payload.
    pub data: T,
}

/// Query front door over the subscription cache.
#[derive(Debug, Clone)]
pub struct MarketDataRouter {
    cache: Arc<SubscriptionCache>,
    symbols: Arc<SymbolSet>,
    first_message_timeout: Duration,
}

impl MarketDataRouter {
    /// Create a router.
    #[must_use]
    pub const fn new(
        cache: Arc<SubscriptionCache>,
        symbols: Arc<SymbolSet>,
        first_message_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            symbols,
            first_message_timeout,
        }
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
        self.query(self.symbols.ticker(primary, secondary)).await
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
        self.query(self.symbols.order_book(primary, secondary)).await
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
        self.query(self.symbols.recent_trades(primary, secondary))
            .await
    }

    /// Account balance for a currency. Requires API credentials.
    ///
    /// # Errors
    ///
    /// See [`MarketDataRouter::query`].
    pub async fn get_balance(&self, currency: &str) -> Result<Snapshot<Balance>, QueryError> {
        self.query(self.symbols.balance(currency)).await
    }

    /// Known symbols.
    #[must_use]
    pub fn symbols(&self) -> &SymbolSet {
        &self.symbols
    }

    /// Read a channel through the cache.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for unknown currencies or a channel the exchange refused
    /// - `AuthenticationFailure` for private channels without credentials or
    ///   with refused credentials
    /// - `Timeout` when no payload arrives within the first-message wait; the
    ///   subscription stays in place for later queries
    /// - `TransportFailure` once the connection has shut down
    pub async fn query<T: TypedPayload>(
        &self,
        key: Result<ChannelKey, ChannelError>,
    ) -> Result<Snapshot<T>, QueryError> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("query", %request_id, channel = tracing::field::Empty);

        async move {
            let result = self.resolve(key).await;
            if let Err(err) = &result {
                metrics::record_query_error(err.kind);
                tracing::warn!(kind = %err.kind, error = %err.message, "query failed");
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn resolve<T: TypedPayload>(
        &self,
        key: Result<ChannelKey, ChannelError>,
    ) -> Result<Snapshot<T>, QueryError> {
        let key = key?;
        tracing::Span::current().record("channel", tracing::field::display(&key));

        let cached = match self.cache.get_or_subscribe(&key)? {
            Lookup::Ready(cached) => cached,
            Lookup::Pending(pending) => {
                tracing::debug!(timeout_ms = self.first_message_timeout.as_millis(), "waiting for first payload");
                let started = Instant::now();
                let outcome = pending.wait(self.first_message_timeout).await;
                metrics::record_first_message_wait(key.kind(), started.elapsed());
                outcome.map_err(|err| wait_error(&key, err))?
            }
        };

        let data = T::from_payload(&cached.payload).cloned().ok_or_else(|| {
            QueryError::new(
                ErrorKind::ProtocolError,
                format!("{key} holds a {} payload", cached.payload.kind()),
            )
        })?;

        Ok(Snapshot {
            channel: key.channel_name(),
            received_at: cached.received_at,
            data,
        })
    }
}

fn wait_error(key: &ChannelKey, err: WaitError) -> QueryError {
    match err {
        WaitError::TimedOut(timeout) => QueryError::new(
            ErrorKind::Timeout,
            format!(
                "no data for {key} within {} ms; the channel is now subscribed, retry shortly",
                timeout.as_millis()
            ),
        ),
        WaitError::Rejected(rejection) => rejection.into(),
        WaitError::Closed => QueryError::new(
            ErrorKind::TransportFailure,
            format!("{key} was dropped before any data arrived"),
        ),
    }
}
