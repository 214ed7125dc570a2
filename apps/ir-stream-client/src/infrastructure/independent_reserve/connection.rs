//! Feed Connection
//!
//! Owns the single duplex channel to the exchange. Callers register interest
//! through [`SubscriptionControl`]; the connection task reconciles that
//! desired set against what the current session has actually sent, so
//! subscribe and unsubscribe are idempotent and survive reconnects.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ─► Connecting ─► [Authenticating] ─► Connected
//!       ▲                                              │
//!       └──────── backoff ◄── transport error / silence┘
//! ```
//!
//! After every connect the full desired set is replayed; private channels
//! are signed with a fresh nonce each time. Cached payloads are untouched by
//! reconnects.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::auth::Authenticator;
use super::codec::{FeedMessage, JsonCodec};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::messages::ControlRequest;
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{
    FeedConnector, FrameSink, SubscribeError, SubscriptionControl, TransportError, WireFrame,
};
use crate::domain::channel::{ChannelKey, ChannelKind, SymbolSet};
use crate::domain::payload::ChannelPayload;
use crate::domain::subscription::{ConnectionState, FeedEvent, Rejection, SubscriptionId};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// Keep-alive timing.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws.independentreserve.com/v2".to_string(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Fatal connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Reconnect attempts exhausted.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),

    /// `run` was called twice.
    #[error("connection task already running")]
    AlreadyRunning,
}

/// Why a session ended.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Lost(String),
}

// =============================================================================
// Connection
// =============================================================================

/// A channel the connection keeps subscribed.
#[derive(Debug, Clone)]
struct DesiredChannel {
    key: ChannelKey,
    subscription: SubscriptionId,
}

/// The exchange connection and its desired subscription set.
pub struct FeedConnection {
    config: ConnectionConfig,
    connector: Arc<dyn FeedConnector>,
    authenticator: Authenticator,
    codec: JsonCodec,
    symbols: Arc<SymbolSet>,
    events: mpsc::Sender<FeedEvent>,
    dirty_tx: mpsc::UnboundedSender<ChannelKey>,
    dirty_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelKey>>>,
    desired: RwLock<HashMap<String, DesiredChannel>>,
    next_subscription: AtomicU64,
    state: watch::Sender<ConnectionState>,
    reconnects: AtomicU64,
    cancel: CancellationToken,
}

impl std::fmt::Debug for FeedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConnection")
            .field("url", &self.config.url)
            .field("state", &*self.state.borrow())
            .field("subscriptions", &self.desired.read().len())
            .finish_non_exhaustive()
    }
}

impl FeedConnection {
    /// Create a connection. Nothing happens until [`FeedConnection::run`].
    #[must_use]
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn FeedConnector>,
        authenticator: Authenticator,
        symbols: Arc<SymbolSet>,
        events: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            connector,
            authenticator,
            codec: JsonCodec::new(),
            symbols,
            events,
            dirty_tx,
            dirty_rx: Mutex::new(Some(dirty_rx)),
            desired: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            state,
            reconnects: AtomicU64::new(0),
            cancel,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Channels the connection keeps subscribed, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<_> = self
            .desired
            .read()
            .values()
            .map(|desired| desired.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Reconnect attempts since start.
    #[must_use]
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "connection state changed");
        }
    }

    /// Drive the connection until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::MaxAttemptsExceeded`] when a finite retry
    /// budget runs out; the connection is closed for new subscriptions.
    pub async fn run(self: Arc<Self>) -> Result<(), ConnectionError> {
        let mut dirty = self
            .dirty_rx
            .lock()
            .take()
            .ok_or(ConnectionError::AlreadyRunning)?;
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        tracing::info!(url = %self.config.url, "feed connection starting");

        let result = loop {
            if self.cancel.is_cancelled() {
                break Ok(());
            }

            match self.connect_and_run(&mut dirty, &mut policy).await {
                Ok(SessionEnd::Shutdown) => break Ok(()),
                Ok(SessionEnd::Lost(reason)) => {
                    tracing::warn!(reason = %reason, "feed connection lost");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "feed connection failed");
                }
            }
            self.set_state(ConnectionState::Disconnected);

            let Some(delay) = policy.next_delay() else {
                let attempts = policy.attempt_count();
                tracing::error!(attempts, "giving up on feed connection");
                self.cancel.cancel();
                break Err(ConnectionError::MaxAttemptsExceeded(attempts));
            };

            self.reconnects.fetch_add(1, Ordering::Relaxed);
            metrics::record_reconnect();
            tracing::info!(
                delay_ms = delay.as_millis(),
                attempt = policy.attempt_count(),
                "reconnecting"
            );

            tokio::select! {
                () = self.cancel.cancelled() => break Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        };

        self.set_state(ConnectionState::Disconnected);
        tracing::info!("feed connection stopped");
        result
    }

    async fn connect_and_run(
        &self,
        dirty: &mut mpsc::UnboundedReceiver<ChannelKey>,
        policy: &mut ReconnectPolicy,
    ) -> Result<SessionEnd, TransportError> {
        self.set_state(ConnectionState::Connecting);

        let channel = tokio::select! {
            () = self.cancel.cancelled() => return Ok(SessionEnd::Shutdown),
            channel = self.connector.connect(&self.config.url) => channel?,
        };
        let mut sink = channel.sink;
        let mut stream = channel.stream;
        policy.reset();

        // Replay the desired set. Keys marked dirty meanwhile are reconciled
        // again below, which is a no-op for keys already sent.
        let mut live = HashSet::new();
        let replay = self.subscriptions();
        if replay.iter().any(ChannelKey::is_private) {
            self.set_state(ConnectionState::Authenticating);
        }
        for key in &replay {
            self.reconcile(key, &mut live, &mut sink).await?;
        }
        self.set_state(ConnectionState::Connected);
        tracing::info!(resubscribed = live.len(), "feed connected");

        let heartbeat = Arc::new(HeartbeatState::new());
        let (hb_tx, mut hb_rx) = mpsc::channel(4);
        let session = self.cancel.child_token();
        let _session_guard = session.clone().drop_guard();
        tokio::spawn(
            HeartbeatManager::new(
                self.config.heartbeat.clone(),
                Arc::clone(&heartbeat),
                hb_tx,
                session,
            )
            .run(),
        );

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    let _ = sink.send(WireFrame::Close).await;
                    return Ok(SessionEnd::Shutdown);
                }

                Some(event) = hb_rx.recv() => match event {
                    HeartbeatEvent::SendPing => sink.send(WireFrame::Ping(Vec::new())).await?,
                    HeartbeatEvent::Timeout => {
                        return Ok(SessionEnd::Lost("heartbeat timeout".to_string()));
                    }
                },

                Some(key) = dirty.recv() => {
                    self.reconcile(&key, &mut live, &mut sink).await?;
                }

                frame = stream.next() => {
                    let frame = match frame {
                        None => return Ok(SessionEnd::Lost("stream ended".to_string())),
                        Some(Err(e)) => return Ok(SessionEnd::Lost(e.to_string())),
                        Some(Ok(frame)) => frame,
                    };
                    heartbeat.record_activity();

                    match frame {
                        WireFrame::Text(text) => self.handle_text(&text, &mut live).await,
                        WireFrame::Ping(data) => sink.send(WireFrame::Pong(data)).await?,
                        WireFrame::Pong(_) => {}
                        WireFrame::Close => {
                            return Ok(SessionEnd::Lost("closed by server".to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Bring the session in line with the desired set for one key.
    async fn reconcile(
        &self,
        key: &ChannelKey,
        live: &mut HashSet<String>,
        sink: &mut FrameSink,
    ) -> Result<(), TransportError> {
        let channel = key.channel_name();
        let wanted = self.desired.read().contains_key(&channel);
        let sent = live.contains(&channel);

        let request = match (wanted, sent) {
            (true, false) => match self.subscribe_request(key, &channel).await {
                Some(request) => request,
                None => return Ok(()),
            },
            (false, true) => ControlRequest::unsubscribe(&channel),
            _ => return Ok(()),
        };

        let text = self
            .codec
            .encode(&request)
            .map_err(|e| TransportError::Send(e.to_string()))?;
        sink.send(WireFrame::Text(text)).await?;

        if wanted {
            tracing::debug!(channel = %channel, private = key.is_private(), "subscribe sent");
            live.insert(channel);
        } else {
            tracing::debug!(channel = %channel, "unsubscribe sent");
            live.remove(&channel);
        }
        Ok(())
    }

    async fn subscribe_request(&self, key: &ChannelKey, channel: &str) -> Option<ControlRequest> {
        if !key.is_private() {
            return Some(ControlRequest::subscribe(channel));
        }

        match self.authenticator.sign_next(channel) {
            Ok(credential) => Some(ControlRequest::subscribe_signed(channel, credential)),
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "cannot sign private channel");
                let removed = self.desired.write().remove(channel)?;
                let event = FeedEvent::Rejected {
                    rejection: Rejection::for_key(key, e.to_string()),
                    key: removed.key,
                    subscription: removed.subscription,
                };
                if self.events.send(event).await.is_err() {
                    tracing::warn!(channel = %channel, "ingestion stopped, signing failure dropped");
                }
                None
            }
        }
    }

    async fn handle_text(&self, text: &str, live: &mut HashSet<String>) {
        let messages = match self.codec.decode(text) {
            Ok(messages) => messages,
            Err(e) => {
                metrics::record_malformed_message();
                tracing::warn!(error = %e, "dropping malformed frame");
                return;
            }
        };

        for message in messages {
            let event = match message {
                FeedMessage::Data { channel, payload } => self.data_event(&channel, payload),
                FeedMessage::Error { channel, message } => {
                    Some(self.error_event(channel.as_deref(), message, live))
                }
                FeedMessage::Event(name) => {
                    tracing::trace!(event = %name, "feed event ignored");
                    None
                }
            };

            let Some(event) = event else {
                continue;
            };
            if self.events.send(event).await.is_err() {
                tracing::debug!("ingestion stopped, dropping feed event");
            }
        }
    }

    fn data_event(&self, channel: &str, payload: Value) -> Option<FeedEvent> {
        let Some(key) = self.resolve_channel(channel, &payload) else {
            metrics::record_malformed_message();
            tracing::warn!(channel = %channel, "payload for unrecognised channel dropped");
            return None;
        };

        match ChannelPayload::decode(key.kind(), payload) {
            Ok(payload) => {
                metrics::record_message_received(key.kind());
                Some(FeedEvent::Data { key, payload })
            }
            Err(e) => {
                metrics::record_malformed_message();
                tracing::warn!(channel = %channel, error = %e, "undecodable payload dropped");
                None
            }
        }
    }

    fn error_event(
        &self,
        channel: Option<&str>,
        message: String,
        live: &mut HashSet<String>,
    ) -> FeedEvent {
        let name = channel.map(|name| {
            self.symbols
                .parse_channel(name)
                .map_or_else(|_| name.to_string(), |key| key.channel_name())
        });

        // A refused channel is dropped, not retried.
        let removed = name.as_deref().and_then(|name| {
            let removed = self.desired.write().remove(name);
            live.remove(name);
            removed
        });

        let Some(DesiredChannel { key, subscription }) = removed else {
            tracing::warn!(channel = ?channel, error = %message, "exchange error");
            return FeedEvent::ServerError(message);
        };

        FeedEvent::Rejected {
            rejection: Rejection::for_key(&key, message),
            key,
            subscription,
        }
    }

    /// Map an inbound channel name to a subscribed key.
    ///
    /// Exact names win. Otherwise the kind comes from the name's prefix and
    /// the currencies from the payload, which also covers hyphenated names
    /// such as `ticker-xbt-usd`.
    fn resolve_channel(&self, channel: &str, payload: &Value) -> Option<ChannelKey> {
        if let Some(desired) = self.desired.read().get(channel) {
            return Some(desired.key.clone());
        }

        let kind = channel
            .split_once('-')
            .map_or(channel, |(prefix, _)| prefix);
        let kind = ChannelKind::from_prefix(kind)?;

        let code = |field: &str| payload.get(field).and_then(Value::as_str);
        let from_payload = if kind == ChannelKind::Balance {
            code("CurrencyCode").and_then(|c| ChannelKey::from_codes(kind, c, None))
        } else {
            code("PrimaryCurrencyCode").and_then(|primary| {
                ChannelKey::from_codes(kind, primary, code("SecondaryCurrencyCode"))
            })
        };

        from_payload.or_else(|| self.symbols.parse_channel(channel).ok())
    }
}

impl SubscriptionControl for FeedConnection {
    fn subscribe(&self, key: &ChannelKey) -> Result<SubscriptionId, SubscribeError> {
        if self.cancel.is_cancelled() {
            return Err(SubscribeError::Closed);
        }
        if key.is_private() && !self.authenticator.has_credentials() {
            return Err(SubscribeError::MissingCredentials(key.channel_name()));
        }

        let channel = key.channel_name();
        let subscription = {
            let mut desired = self.desired.write();
            if let Some(existing) = desired.get(&channel) {
                return Ok(existing.subscription);
            }
            let subscription =
                SubscriptionId::new(self.next_subscription.fetch_add(1, Ordering::Relaxed));
            desired.insert(
                channel.clone(),
                DesiredChannel {
                    key: key.clone(),
                    subscription,
                },
            );
            subscription
        };

        if self.dirty_tx.send(key.clone()).is_err() {
            self.desired.write().remove(&channel);
            return Err(SubscribeError::Closed);
        }
        Ok(subscription)
    }

    fn unsubscribe(&self, key: &ChannelKey) {
        let removed = self.desired.write().remove(&key.channel_name()).is_some();
        if removed {
            let _ = self.dirty_tx.send(key.clone());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::independent_reserve::auth::Credentials;

    struct NeverConnects;

    #[async_trait::async_trait]
    impl FeedConnector for NeverConnects {
        async fn connect(
            &self,
            _url: &str,
        ) -> Result<crate::application::ports::FeedChannel, TransportError> {
            Err(TransportError::Connect("unreachable".to_string()))
        }
    }

    fn connection(credentials: Option<Credentials>) -> (FeedConnection, mpsc::Receiver<FeedEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let connection = FeedConnection::new(
            ConnectionConfig::default(),
            Arc::new(NeverConnects),
            Authenticator::new(credentials),
            Arc::new(SymbolSet::default()),
            tx,
            CancellationToken::new(),
        );
        (connection, rx)
    }

    #[test]
    fn subscribe_is_idempotent() {
        let (conn, _rx) = connection(None);
        let key = SymbolSet::default().ticker("xbt", "aud").unwrap();

        let first = conn.subscribe(&key).unwrap();
        assert_eq!(conn.subscribe(&key).unwrap(), first);
        assert_eq!(conn.subscriptions(), vec![key.clone()]);

        let mut dirty = conn.dirty_rx.lock().take().unwrap();
        assert_eq!(dirty.try_recv().unwrap(), key);
        assert!(dirty.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_unknown_is_noop() {
        let (conn, _rx) = connection(None);
        let key = SymbolSet::default().ticker("xbt", "aud").unwrap();
        conn.unsubscribe(&key);

        let mut dirty = conn.dirty_rx.lock().take().unwrap();
        assert!(dirty.try_recv().is_err());
    }

    #[test]
    fn private_channel_without_credentials_is_refused() {
        let (conn, _rx) = connection(None);
        let key = SymbolSet::default().balance("aud").unwrap();

        assert_eq!(
            conn.subscribe(&key),
            Err(SubscribeError::MissingCredentials("balance-aud".to_string()))
        );
        assert!(conn.subscriptions().is_empty());
    }

    #[test]
    fn private_channel_with_credentials_is_accepted() {
        let (conn, _rx) = connection(Some(Credentials::new("k", "s").unwrap()));
        let key = SymbolSet::default().balance("aud").unwrap();
        assert!(conn.subscribe(&key).is_ok());
    }

    #[test]
    fn cancelled_connection_refuses_subscribe() {
        let (conn, _rx) = connection(None);
        conn.cancel.cancel();
        let key = SymbolSet::default().ticker("xbt", "aud").unwrap();
        assert_eq!(conn.subscribe(&key), Err(SubscribeError::Closed));
    }

    #[test]
    fn resolves_hyphenated_channel_from_payload() {
        let (conn, _rx) = connection(None);
        let key = SymbolSet::default().ticker("xbt", "usd").unwrap();
        conn.subscribe(&key).unwrap();

        let payload = serde_json::json!({"PrimaryCurrencyCode": "Xbt", "SecondaryCurrencyCode": "Usd"});
        assert_eq!(conn.resolve_channel("ticker-xbtusd", &payload), Some(key.clone()));
        assert_eq!(conn.resolve_channel("ticker-xbt-usd", &payload), Some(key));

        let trades = serde_json::json!({"PrimaryCurrencyCode": "Btc", "SecondaryCurrencyCode": "Usd"});
        assert_eq!(
            conn.resolve_channel("recenttrades-btc-usd", &trades)
                .map(|k| k.channel_name()),
            Some("recenttrades-xbtusd".to_string())
        );
        assert!(conn.resolve_channel("candles-xbtusd", &payload).is_none());
    }

    #[test]
    fn error_for_channel_drops_subscription() {
        let (conn, _rx) = connection(Some(Credentials::new("k", "s").unwrap()));
        let key = SymbolSet::default().balance("aud").unwrap();
        let subscription = conn.subscribe(&key).unwrap();
        let mut live = HashSet::from(["balance-aud".to_string()]);

        let event = conn.error_event(Some("balance-aud"), "Invalid nonce".to_string(), &mut live);
        let FeedEvent::Rejected {
            key: rejected,
            subscription: refused,
            rejection,
        } = event
        else {
            panic!("expected rejection");
        };
        assert_eq!(rejected, key);
        assert_eq!(refused, subscription);
        assert_eq!(rejection.reason, "Invalid nonce");
        assert!(conn.subscriptions().is_empty());
        assert!(live.is_empty());

        assert!(matches!(
            conn.error_event(None, "rate limited".to_string(), &mut live),
            FeedEvent::ServerError(_)
        ));
        // Already dropped: a repeated refusal carries no subscription.
        assert!(matches!(
            conn.error_event(Some("balance-aud"), "Invalid nonce".to_string(), &mut live),
            FeedEvent::ServerError(_)
        ));
    }

    #[test]
    fn resubscribe_after_unsubscribe_gets_new_id() {
        let (conn, _rx) = connection(None);
        let key = SymbolSet::default().ticker("xbt", "aud").unwrap();

        let first = conn.subscribe(&key).unwrap();
        conn.unsubscribe(&key);
        let second = conn.subscribe(&key).unwrap();

        assert_ne!(first, second);
        assert_eq!(conn.subscriptions(), vec![key]);
    }

    #[tokio::test]
    async fn signing_failure_is_reported_to_ingestion() {
        let (tx, mut rx) = mpsc::channel(1);
        let conn = FeedConnection::new(
            ConnectionConfig::default(),
            Arc::new(NeverConnects),
            Authenticator::new(None),
            Arc::new(SymbolSet::default()),
            tx.clone(),
            CancellationToken::new(),
        );
        let key = SymbolSet::default().balance("aud").unwrap();
        let subscription = SubscriptionId::new(7);
        conn.desired.write().insert(
            key.channel_name(),
            DesiredChannel {
                key: key.clone(),
                subscription,
            },
        );

        // Fill the queue so the report has to wait for room.
        tx.send(FeedEvent::ServerError("busy".into())).await.unwrap();
        let drain = tokio::spawn(async move {
            let first = rx.recv().await;
            let second = rx.recv().await;
            (first, second)
        });

        assert!(conn.subscribe_request(&key, "balance-aud").await.is_none());
        assert!(conn.subscriptions().is_empty());

        let (first, second) = drain.await.unwrap();
        assert!(matches!(first, Some(FeedEvent::ServerError(_))));
        let Some(FeedEvent::Rejected { subscription: refused, .. }) = second else {
            panic!("expected rejection, got {second:?}");
        };
        assert_eq!(refused, subscription);
    }

    #[tokio::test(start_paused = true)]
    async fn run_gives_up_after_max_attempts() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let config = ConnectionConfig {
            reconnect: ReconnectConfig {
                max_attempts: 2,
                ..ReconnectConfig::default()
            },
            ..ConnectionConfig::default()
        };
        let conn = Arc::new(FeedConnection::new(
            config,
            Arc::new(NeverConnects),
            Authenticator::new(None),
            Arc::new(SymbolSet::default()),
            tx,
            cancel.clone(),
        ));

        let result = Arc::clone(&conn).run().await;
        assert!(matches!(result, Err(ConnectionError::MaxAttemptsExceeded(2))));
        assert_eq!(conn.reconnect_count(), 2);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(cancel.is_cancelled());

        // A second run is refused.
        assert!(matches!(
            Arc::clone(&conn).run().await,
            Err(ConnectionError::AlreadyRunning)
        ));
    }
}
