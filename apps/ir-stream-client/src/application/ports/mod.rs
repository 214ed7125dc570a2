//! Port Interfaces
//!
//! Contracts between the application services and the adapters that
//! implement them, following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`SubscriptionControl`]: subscribe/unsubscribe entry points of the feed
//!   connection, called by the cache.
//! - [`FeedConnector`]: opens one duplex frame channel to the exchange.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};
use thiserror::Error;

use crate::domain::channel::ChannelKey;
use crate::domain::subscription::SubscriptionId;

// =============================================================================
// Subscription Control
// =============================================================================

/// Errors returned when a subscribe request cannot be accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    /// A private channel was requested without API credentials.
    #[error("channel {0} requires API credentials but none are configured")]
    MissingCredentials(String),

    /// The connection has shut down.
    #[error("feed connection is shut down")]
    Closed,
}

/// Subscribe/unsubscribe surface of the feed connection.
///
/// Both calls are non-blocking: requests are recorded and written to the
/// transport by the connection task, or replayed after the next connect.
#[cfg_attr(test, mockall::automock)]
pub trait SubscriptionControl: Send + Sync {
    /// Start streaming a channel. Idempotent for channels already subscribed,
    /// which keep their existing [`SubscriptionId`].
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError::MissingCredentials`] for private channels
    /// when no credentials are configured; nothing is sent in that case.
    fn subscribe(&self, key: &ChannelKey) -> Result<SubscriptionId, SubscribeError>;

    /// Stop streaming a channel. Idempotent for channels not subscribed.
    fn unsubscribe(&self, key: &ChannelKey);
}

// =============================================================================
// Transport
// =============================================================================

/// Transport failures. Absorbed by the reconnect loop.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Opening the channel failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Reading a frame failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// The remote end closed the channel.
    #[error("connection closed by remote")]
    Closed,
}

/// One frame on the duplex channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// UTF-8 text message.
    Text(String),
    /// Keep-alive ping.
    Ping(Vec<u8>),
    /// Keep-alive pong.
    Pong(Vec<u8>),
    /// Close handshake.
    Close,
}

/// Outbound half of a feed channel.
pub type FrameSink = Pin<Box<dyn Sink<WireFrame, Error = TransportError> + Send>>;

/// Inbound half of a feed channel.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WireFrame, TransportError>> + Send>>;

/// An open duplex channel, owned by the connection task.
pub struct FeedChannel {
    /// Frames to the exchange.
    pub sink: FrameSink,
    /// Frames from the exchange.
    pub stream: FrameStream,
}

impl std::fmt::Debug for FeedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedChannel").finish_non_exhaustive()
    }
}

/// Factory for feed channels.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    /// Open a new channel to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the endpoint is unreachable.
    async fn connect(&self, url: &str) -> Result<FeedChannel, TransportError>;
}
