//! Subscription State Types
//!
//! Domain types describing the lifecycle of a channel subscription and the
//! events that flow from the feed connection into the cache.
//!
//! # Design
//!
//! A cache entry moves through three states:
//!
//! ```text
//! Pending ──first payload──► Ready ──newer payload──► Ready
//!    │
//!    └──server error──► Rejected (entry removed)
//! ```
//!
//! Waiters on a pending entry observe the transition out of `Pending`
//! through a watch channel owned by the cache.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::channel::ChannelKey;
use crate::domain::payload::ChannelPayload;

// =============================================================================
// Connection State
// =============================================================================

/// State of the feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport; subscribe requests are queued.
    #[default]
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport open, sending signed subscriptions for private channels.
    Authenticating,
    /// Transport open and subscriptions replayed.
    Connected,
}

impl ConnectionState {
    /// Stable label for logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
        }
    }

    /// Whether control messages can be written immediately.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Entry State
// =============================================================================

/// A payload held by the cache together with its arrival time.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPayload {
    /// The latest payload received for the channel.
    pub payload: Arc<ChannelPayload>,
    /// When the payload arrived.
    pub received_at: DateTime<Utc>,
}

impl CachedPayload {
    /// Wrap a freshly received payload.
    #[must_use]
    pub fn now(payload: ChannelPayload) -> Self {
        Self {
            payload: Arc::new(payload),
            received_at: Utc::now(),
        }
    }
}

/// Identity of one subscription to a channel.
///
/// A channel that is evicted and later queried again gets a new id, so late
/// events addressed to the earlier subscription can be recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why the exchange refused a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// Signature, key or nonce was refused (private channels).
    Authentication,
    /// The channel itself was refused.
    InvalidChannel,
}

/// A subscription refused by the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Classification of the refusal.
    pub kind: RejectionKind,
    /// Reason reported by the exchange.
    pub reason: String,
}

impl Rejection {
    /// Classify a server error for a channel key.
    #[must_use]
    pub fn for_key(key: &ChannelKey, reason: impl Into<String>) -> Self {
        let kind = if key.is_private() {
            RejectionKind::Authentication
        } else {
            RejectionKind::InvalidChannel
        };
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Observable state of a cache entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EntryState {
    /// Subscribed, no payload yet.
    #[default]
    Pending,
    /// At least one payload received.
    Ready(CachedPayload),
    /// The subscription was refused; the entry is gone.
    Rejected(Rejection),
}

impl EntryState {
    /// Whether the entry is still waiting for its first payload.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

// =============================================================================
// Feed Events
// =============================================================================

/// Events emitted by the feed connection for the ingestion path.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A payload arrived for a subscribed channel.
    Data {
        /// Channel the payload belongs to.
        key: ChannelKey,
        /// Decoded payload.
        payload: ChannelPayload,
    },
    /// The exchange refused a subscription.
    Rejected {
        /// Channel that was refused.
        key: ChannelKey,
        /// The subscription the refusal answers.
        subscription: SubscriptionId,
        /// Classified refusal.
        rejection: Rejection,
    },
    /// An error event not tied to any channel.
    ServerError(String),
}

// =============================================================================
// Statistics
// =============================================================================

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    /// Entries currently cached.
    pub entries: usize,
    /// Entries still waiting for their first payload.
    pub pending: usize,
    /// Lookups served from an existing entry.
    pub hits: u64,
    /// Lookups that created a new entry.
    pub misses: u64,
    /// Entries removed by the sweeper.
    pub evictions: u64,
}
