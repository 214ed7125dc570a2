//! In-memory exchange for integration tests.
//!
//! `MemoryConnector` hands each connection attempt to the test as a
//! [`ServerSession`], which plays the exchange side of the socket.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use ir_stream_client::ClientConfig;
use ir_stream_client::application::ports::{
    FeedChannel, FeedConnector, TransportError, WireFrame,
};

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Connector whose sockets terminate in the test.
pub struct MemoryConnector {
    sessions: mpsc::UnboundedSender<ServerSession>,
}

impl MemoryConnector {
    /// Create a connector and the queue of sessions it opens.
    pub fn new() -> (Arc<Self>, SessionQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { sessions: tx }), SessionQueue(rx))
    }
}

#[async_trait]
impl FeedConnector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<FeedChannel, TransportError> {
        let (client_tx, server_rx) = fmpsc::unbounded::<WireFrame>();
        let (server_tx, client_rx) = fmpsc::unbounded::<Result<WireFrame, TransportError>>();

        self.sessions
            .send(ServerSession {
                inbound: server_rx,
                outbound: server_tx,
            })
            .map_err(|_| TransportError::Connect("test harness gone".to_string()))?;

        Ok(FeedChannel {
            sink: Box::pin(client_tx.sink_map_err(|e| TransportError::Send(e.to_string()))),
            stream: Box::pin(client_rx),
        })
    }
}

/// Sessions opened by the client, in order.
pub struct SessionQueue(mpsc::UnboundedReceiver<ServerSession>);

impl SessionQueue {
    /// Wait for the next connection attempt.
    pub async fn next(&mut self) -> ServerSession {
        tokio::time::timeout(WAIT, self.0.recv())
            .await
            .expect("client did not connect")
            .expect("connector dropped")
    }
}

/// Exchange side of one socket.
pub struct ServerSession {
    inbound: fmpsc::UnboundedReceiver<WireFrame>,
    outbound: fmpsc::UnboundedSender<Result<WireFrame, TransportError>>,
}

impl ServerSession {
    /// Next control request from the client, skipping keep-alives.
    pub async fn next_control(&mut self) -> Value {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.inbound.next().await.expect("client hung up") {
                    WireFrame::Text(text) => return serde_json::from_str(&text).unwrap(),
                    WireFrame::Ping(_) | WireFrame::Pong(_) => {}
                    WireFrame::Close => panic!("client closed the socket"),
                }
            }
        })
        .await
        .expect("no control request")
    }

    /// A control request already buffered, if any.
    pub fn try_control(&mut self) -> Option<Value> {
        while let Some(Some(frame)) = self.inbound.next().now_or_never() {
            if let WireFrame::Text(text) = frame {
                return Some(serde_json::from_str(&text).unwrap());
            }
        }
        None
    }

    /// Push a JSON message to the client.
    pub fn send(&self, message: &Value) {
        self.outbound
            .unbounded_send(Ok(WireFrame::Text(message.to_string())))
            .unwrap();
    }

    /// Drop the socket from the exchange side.
    pub fn disconnect(self) {
        self.outbound.close_channel();
    }
}

/// Configuration tuned for fast tests.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.websocket.url = "memory://exchange".to_string();
    config.websocket.reconnect_delay_initial = Duration::from_millis(10);
    config.websocket.reconnect_delay_max = Duration::from_millis(50);
    config.cache.first_message_timeout = Duration::from_secs(2);
    config.server.http_port = 0;
    config
}

/// A ticker frame for `channel`.
pub fn ticker_frame(channel: &str, primary: &str, secondary: &str, last: f64) -> Value {
    serde_json::json!({
        "n": channel,
        "o": {
            "PrimaryCurrencyCode": primary,
            "SecondaryCurrencyCode": secondary,
            "LastPrice": last,
            "BestBid": last - 10.0,
            "BestAsk": last + 10.0,
            "Volume24Hour": 42.5
        }
    })
}

impl ServerSession {
    /// Wait for the client's close frame.
    pub async fn expect_close(&mut self) {
        tokio::time::timeout(WAIT, async {
            while let Some(frame) = self.inbound.next().await {
                if frame == WireFrame::Close {
                    return;
                }
            }
            panic!("socket ended without a close frame");
        })
        .await
        .expect("no close frame");
    }
}
