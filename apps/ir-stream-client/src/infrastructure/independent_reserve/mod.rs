//! Independent Reserve Stream Adapter
//!
//! Implements the feed connection against Independent Reserve's v2
//! WebSocket endpoint.
//!
//! - [`connection::FeedConnection`]: session lifecycle, replay, routing
//! - [`auth::Authenticator`]: HMAC signing and nonce issuance
//! - [`codec::JsonCodec`]: control request encoding and frame classification
//! - [`heartbeat::HeartbeatManager`]: ping and silence detection
//! - [`reconnect::ReconnectPolicy`]: bounded exponential backoff
//! - [`connector::WebSocketConnector`]: `tokio-tungstenite` transport

/// Private channel signing.
pub mod auth;

/// JSON codec.
pub mod codec;

/// Connection lifecycle.
pub mod connection;

/// WebSocket transport.
pub mod connector;

/// Keep-alive.
pub mod heartbeat;

/// Wire message types.
pub mod messages;

/// Reconnect backoff.
pub mod reconnect;
