//! Caller-facing query errors.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::application::ports::SubscribeError;
use crate::domain::channel::ChannelError;
use crate::domain::subscription::{Rejection, RejectionKind};

/// Classification of a failed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown or malformed currency/account argument. Not retried.
    InvalidArgument,
    /// Missing or refused credentials on a private channel. Not retried.
    AuthenticationFailure,
    /// No payload arrived within the first-message wait. The subscription
    /// stays cached.
    Timeout,
    /// The connection is gone for good (shutdown or retries exhausted).
    TransportFailure,
    /// Malformed inbound data. Logged and dropped, never returned to callers.
    ProtocolError,
}

impl ErrorKind {
    /// Stable label for metrics and JSON bodies.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::AuthenticationFailure => "authentication_failure",
            Self::Timeout => "timeout",
            Self::TransportFailure => "transport_failure",
            Self::ProtocolError => "protocol_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed router query: a kind plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{kind}: {message}")]
pub struct QueryError {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl QueryError {
    /// Build an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<ChannelError> for QueryError {
    fn from(err: ChannelError) -> Self {
        Self::new(ErrorKind::InvalidArgument, err.to_string())
    }
}

impl From<SubscribeError> for QueryError {
    fn from(err: SubscribeError) -> Self {
        match err {
            SubscribeError::MissingCredentials(_) => {
                Self::new(ErrorKind::AuthenticationFailure, err.to_string())
            }
            SubscribeError::Closed => Self::new(ErrorKind::TransportFailure, err.to_string()),
        }
    }
}

impl From<Rejection> for QueryError {
    fn from(rejection: Rejection) -> Self {
        let kind = match rejection.kind {
            RejectionKind::Authentication => ErrorKind::AuthenticationFailure,
            RejectionKind::InvalidChannel => ErrorKind::InvalidArgument,
        };
        Self::new(kind, format!("subscription refused: {}", rejection.reason))
    }
}
