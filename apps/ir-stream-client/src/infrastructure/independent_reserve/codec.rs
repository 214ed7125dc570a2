//! Stream Codec
//!
//! JSON encoding of control requests and classification of inbound frames.
//!
//! Inbound frames are sorted into three shapes:
//!
//! - **Data**: a channel name plus a payload object
//! - **Error**: `"e":"error"`, optionally naming the refused channel
//! - **Event**: any other `"e"` event (heartbeats, subscription lists), ignored
//!
//! Anything else is a [`CodecError`] and is dropped by the connection.

use serde_json::Value;

use super::messages::{ControlRequest, InboundMessage};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Well-formed JSON that is not a feed message.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Payload for a channel.
    Data {
        /// Channel name as sent by the exchange.
        channel: String,
        /// Raw payload object.
        payload: Value,
    },
    /// Server-side error.
    Error {
        /// Channel the error refers to, if any.
        channel: Option<String>,
        /// Reason reported by the exchange.
        message: String,
    },
    /// Informational event with no cache effect.
    Event(String),
}

/// JSON codec for the Independent Reserve stream.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Encode a control request.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self, request: &ControlRequest) -> Result<String, CodecError> {
        Ok(serde_json::to_string(request)?)
    }

    /// Decode one text frame. Arrays of messages are flattened.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON, or a message has neither an
    /// event name nor a channel with a payload object.
    pub fn decode(&self, text: &str) -> Result<Vec<FeedMessage>, CodecError> {
        let trimmed = text.trim();

        if trimmed.starts_with('[') {
            let raw: Vec<InboundMessage> = serde_json::from_str(trimmed)?;
            raw.into_iter().map(classify).collect()
        } else if trimmed.starts_with('{') {
            let raw: InboundMessage = serde_json::from_str(trimmed)?;
            Ok(vec![classify(raw)?])
        } else {
            Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}",
                trimmed.chars().take(50).collect::<String>()
            )))
        }
    }
}

fn classify(raw: InboundMessage) -> Result<FeedMessage, CodecError> {
    let InboundMessage {
        event,
        channel,
        body,
    } = raw;

    if event
        .as_deref()
        .is_some_and(|e| e.eq_ignore_ascii_case("error"))
    {
        let message = match body {
            Some(Value::String(reason)) => reason,
            Some(Value::Null) | None => "unspecified error".to_string(),
            Some(other) => other.to_string(),
        };
        return Ok(FeedMessage::Error { channel, message });
    }

    match (channel, body, event) {
        (Some(channel), Some(payload @ Value::Object(_)), _) => {
            Ok(FeedMessage::Data { channel, payload })
        }
        (_, _, Some(event)) => Ok(FeedMessage::Event(event)),
        (Some(channel), Some(_), None) => Err(CodecError::InvalidFormat(format!(
            "payload for {channel} is not an object"
        ))),
        _ => Err(CodecError::InvalidFormat(
            "message has neither a channel payload nor an event".to_string(),
        )),
    }
}
