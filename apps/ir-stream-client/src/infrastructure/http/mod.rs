//! HTTP Surface
//!
//! Health, metrics and query endpoints over the streaming client.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON status: connection state, subscriptions, cache stats
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (ready once the feed is connected)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /v1/ticker/{primary}/{secondary}`
//! - `GET /v1/orderbook/{primary}/{secondary}`
//! - `GET /v1/trades/{primary}/{secondary}`
//! - `GET /v1/balance/{currency}`
//!
//! Query endpoints return the snapshot as JSON, or the payload summary as
//! plain text with `?format=text`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::application::error::{ErrorKind, QueryError};
use crate::application::services::cache::SubscriptionCache;
use crate::application::services::router::{MarketDataRouter, Snapshot};
use crate::domain::payload::TypedPayload;
use crate::domain::subscription::{CacheStats, ConnectionState};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Client version.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Feed connection state.
    pub connection: ConnectionState,
    /// Channels currently held in the cache.
    pub subscriptions: Vec<String>,
    /// Cache counters.
    pub cache: CacheStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Feed connected.
    Healthy,
    /// Feed connecting or authenticating.
    Degraded,
    /// Feed down.
    Unhealthy,
}

impl From<ConnectionState> for HealthStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => Self::Healthy,
            ConnectionState::Connecting | ConnectionState::Authenticating => Self::Degraded,
            ConnectionState::Disconnected => Self::Unhealthy,
        }
    }
}

/// Response body format for query endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Snapshot as JSON.
    #[default]
    Json,
    /// Payload summary as plain text.
    Text,
}

#[derive(Debug, Default, Deserialize)]
struct FormatParams {
    #[serde(default)]
    format: Format,
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = match self.kind {
            ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorKind::AuthenticationFailure => StatusCode::UNAUTHORIZED,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::TransportFailure | ErrorKind::ProtocolError => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        (status, Json(self)).into_response()
    }
}

// =============================================================================
// Server State
// =============================================================================

/// Shared state for the HTTP server.
#[derive(Debug)]
pub struct HttpState {
    version: String,
    started_at: Instant,
    router: MarketDataRouter,
    cache: Arc<SubscriptionCache>,
    connection: watch::Receiver<ConnectionState>,
}

impl HttpState {
    /// Create server state.
    #[must_use]
    pub fn new(
        version: String,
        router: MarketDataRouter,
        cache: Arc<SubscriptionCache>,
        connection: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            router,
            cache,
            connection,
        }
    }

    fn health(&self) -> HealthResponse {
        let connection = *self.connection.borrow();
        HealthResponse {
            status: connection.into(),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: Utc::now(),
            connection,
            subscriptions: self
                .cache
                .subscribed_keys()
                .iter()
                .map(|key| key.channel_name())
                .collect(),
            cache: self.cache.stats(),
        }
    }
}

/// Build the route table.
pub fn routes(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/ticker/{primary}/{secondary}", get(ticker_handler))
        .route("/v1/orderbook/{primary}/{secondary}", get(order_book_handler))
        .route("/v1/trades/{primary}/{secondary}", get(trades_handler))
        .route("/v1/balance/{currency}", get(balance_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Server
// =============================================================================

/// HTTP server for health and query endpoints.
pub struct HttpServer {
    port: u16,
    state: Arc<HttpState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a new server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HttpState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the server stops with
    /// an error.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "HTTP server listening");

        axum::serve(listener, routes(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let response = state.health();
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    if state.connection.borrow().is_connected() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn ticker_handler(
    State(state): State<Arc<HttpState>>,
    Path((primary, secondary)): Path<(String, String)>,
    Query(params): Query<FormatParams>,
) -> Response {
    render(state.router.get_ticker(&primary, &secondary).await, params.format)
}

async fn order_book_handler(
    State(state): State<Arc<HttpState>>,
    Path((primary, secondary)): Path<(String, String)>,
    Query(params): Query<FormatParams>,
) -> Response {
    render(
        state.router.get_order_book(&primary, &secondary).await,
        params.format,
    )
}

async fn trades_handler(
    State(state): State<Arc<HttpState>>,
    Path((primary, secondary)): Path<(String, String)>,
    Query(params): Query<FormatParams>,
) -> Response {
    render(
        state.router.get_recent_trades(&primary, &secondary).await,
        params.format,
    )
}

async fn balance_handler(
    State(state): State<Arc<HttpState>>,
    Path(currency): Path<String>,
    Query(params): Query<FormatParams>,
) -> Response {
    render(state.router.get_balance(&currency).await, params.format)
}

fn render<T: TypedPayload>(result: Result<Snapshot<T>, QueryError>, format: Format) -> Response {
    match (result, format) {
        (Ok(snapshot), Format::Json) => Json(snapshot).into_response(),
        (Ok(snapshot), Format::Text) => (StatusCode::OK, snapshot.data.summary()).into_response(),
        (Err(err), _) => err.into_response(),
    }
}

// =============================================================================
// Errors
// =============================================================================

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{MockSubscriptionControl, SubscribeError};
    use crate::domain::channel::SymbolSet;
    use crate::domain::payload::{ChannelPayload, Ticker};
    use crate::domain::subscription::SubscriptionId;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(
        control: MockSubscriptionControl,
        connection: ConnectionState,
    ) -> (Arc<HttpState>, Arc<SubscriptionCache>, watch::Sender<ConnectionState>) {
        let cache = Arc::new(SubscriptionCache::new(Arc::new(control)));
        let router = MarketDataRouter::new(
            Arc::clone(&cache),
            Arc::new(SymbolSet::default()),
            Duration::from_millis(50),
        );
        let (tx, rx) = watch::channel(connection);
        let state = HttpState::new("test".to_string(), router, Arc::clone(&cache), rx);
        (Arc::new(state), cache, tx)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn xbt_aud_ticker() -> ChannelPayload {
        ChannelPayload::Ticker(Ticker {
            primary_currency_code: "Xbt".to_string(),
            secondary_currency_code: "Aud".to_string(),
            last_price: Some(95_000.into()),
            best_bid: Some(94_990.into()),
            best_ask: None,
            volume_24_hour: None,
            day_highest_price: None,
            day_lowest_price: None,
        })
    }

    #[test]
    fn health_status_follows_connection_state() {
        assert_eq!(HealthStatus::from(ConnectionState::Connected), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from(ConnectionState::Authenticating), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from(ConnectionState::Disconnected), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn readiness_tracks_connection() {
        let (state, _, tx) = state(MockSubscriptionControl::new(), ConnectionState::Connecting);
        let app = routes(state);

        let (status, _) = get(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        tx.send_replace(ConnectionState::Connected);
        let (status, body) = get(app, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "READY");
    }

    #[tokio::test]
    async fn health_lists_subscriptions() {
        let mut control = MockSubscriptionControl::new();
        control.expect_subscribe().returning(|_| Ok(SubscriptionId::new(1)));
        let (state, cache, _tx) = state(control, ConnectionState::Connected);
        let key = SymbolSet::default().ticker("xbt", "aud").unwrap();
        cache.get_or_subscribe(&key).unwrap();

        let (status, body) = get(routes(state), "/health").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["connection"], "connected");
        assert_eq!(json["subscriptions"], serde_json::json!(["ticker-xbtaud"]));
        assert_eq!(json["cache"]["entries"], 1);
    }

    #[tokio::test]
    async fn ticker_as_json_and_text() {
        let mut control = MockSubscriptionControl::new();
        control.expect_subscribe().times(1).returning(|_| Ok(SubscriptionId::new(1)));
        let (state, cache, _tx) = state(control, ConnectionState::Connected);
        let key = SymbolSet::default().ticker("xbt", "aud").unwrap();
        cache.get_or_subscribe(&key).unwrap();
        assert!(cache.update(&key, xbt_aud_ticker()));
        let app = routes(state);

        let (status, body) = get(app.clone(), "/v1/ticker/BTC/AUD").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["channel"], "ticker-xbtaud");
        assert_eq!(json["data"]["PrimaryCurrencyCode"], "Xbt");

        let (status, body) = get(app, "/v1/ticker/xbt/aud?format=text").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("Ticker for Xbt/Aud:"));
    }

    #[tokio::test]
    async fn unknown_pair_is_bad_request() {
        let (state, _, _tx) = state(MockSubscriptionControl::new(), ConnectionState::Connected);

        let (status, body) = get(routes(state), "/v1/orderbook/xyz/aud").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["kind"], "invalid_argument");
    }

    #[tokio::test]
    async fn balance_without_credentials_is_unauthorized() {
        let mut control = MockSubscriptionControl::new();
        control
            .expect_subscribe()
            .returning(|key| Err(SubscribeError::MissingCredentials(key.channel_name())));
        let (state, _, _tx) = state(control, ConnectionState::Connected);

        let (status, _) = get(routes(state), "/v1/balance/aud").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_channel_is_gateway_timeout() {
        let mut control = MockSubscriptionControl::new();
        control.expect_subscribe().returning(|_| Ok(SubscriptionId::new(1)));
        let (state, _, _tx) = state(control, ConnectionState::Connected);

        let (status, _) = get(routes(state), "/v1/trades/eth/aud").await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    }
}
