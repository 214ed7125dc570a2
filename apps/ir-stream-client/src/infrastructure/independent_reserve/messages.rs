//! Independent Reserve WebSocket Message Types
//!
//! Wire format for the v2 streaming endpoint. Control requests use short
//! keys: `m` (method) and `n` (channel name). Inbound frames carry `n`
//! (channel), `o` (payload or error reason) and, for events, `e`.
//!
//! # Outbound
//!
//! ```json
//! {"m":"subscribe","n":"ticker-xbtaud"}
//! {"m":"unsubscribe","n":"ticker-xbtaud"}
//! {"m":"subscribe","n":"balance-aud","apiKey":"...","nonce":1718000000000,"signature":"9F2C..."}
//! ```
//!
//! # Inbound
//!
//! ```json
//! {"n":"ticker-xbtaud","o":{"PrimaryCurrencyCode":"Xbt","SecondaryCurrencyCode":"Aud","LastPrice":98000}}
//! {"e":"error","n":"balance-aud","o":"Invalid signature"}
//! {"e":"heartbeat"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::auth::SignedCredential;

/// Control method of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMethod {
    /// Start streaming a channel.
    Subscribe,
    /// Stop streaming a channel.
    Unsubscribe,
}

/// Outbound subscribe/unsubscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Method.
    #[serde(rename = "m")]
    pub method: ControlMethod,

    /// Channel name.
    #[serde(rename = "n")]
    pub channel: String,

    /// API key (private channels only).
    #[serde(rename = "apiKey", skip_serializing_if = "Option::is_none", default)]
    pub api_key: Option<String>,

    /// Nonce covered by the signature (private channels only).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nonce: Option<u64>,

    /// Upper-case hex HMAC-SHA256 (private channels only).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,
}

impl ControlRequest {
    /// Unsigned subscribe request.
    #[must_use]
    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self {
            method: ControlMethod::Subscribe,
            channel: channel.into(),
            api_key: None,
            nonce: None,
            signature: None,
        }
    }

    /// Subscribe request carrying a signed envelope.
    #[must_use]
    pub fn subscribe_signed(channel: impl Into<String>, credential: SignedCredential) -> Self {
        Self {
            method: ControlMethod::Subscribe,
            channel: channel.into(),
            api_key: Some(credential.api_key),
            nonce: Some(credential.nonce),
            signature: Some(credential.signature),
        }
    }

    /// Unsubscribe request.
    #[must_use]
    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Self {
            method: ControlMethod::Unsubscribe,
            channel: channel.into(),
            api_key: None,
            nonce: None,
            signature: None,
        }
    }
}

/// Raw inbound frame before classification.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InboundMessage {
    /// Event name (`error`, `heartbeat`, `subscriptions`, ...).
    #[serde(rename = "e", default)]
    pub event: Option<String>,

    /// Channel name.
    #[serde(rename = "n", default)]
    pub channel: Option<String>,

    /// Payload object, or the reason string for error events.
    #[serde(rename = "o", default)]
    pub body: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn public_subscribe_has_only_method_and_channel() {
        let json = serde_json::to_value(ControlRequest::subscribe("ticker-xbtaud")).unwrap();
        assert_eq!(json, json!({"m": "subscribe", "n": "ticker-xbtaud"}));
    }

    #[test]
    fn unsubscribe_wire_format() {
        let json = serde_json::to_string(&ControlRequest::unsubscribe("orderbook-ethaud")).unwrap();
        assert_eq!(json, r#"{"m":"unsubscribe","n":"orderbook-ethaud"}"#);
    }

    #[test]
    fn signed_subscribe_carries_envelope() {
        let request = ControlRequest::subscribe_signed(
            "balance-aud",
            SignedCredential {
                api_key: "key".to_string(),
                nonce: 17,
                signature: "ABCD".to_string(),
            },
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            json!({"m": "subscribe", "n": "balance-aud", "apiKey": "key", "nonce": 17, "signature": "ABCD"})
        );
    }

    #[test]
    fn inbound_fields_are_optional() {
        let msg: InboundMessage = serde_json::from_str(r#"{"e":"heartbeat"}"#).unwrap();
        assert_eq!(msg.event.as_deref(), Some("heartbeat"));
        assert!(msg.channel.is_none());
        assert!(msg.body.is_none());

        let msg: InboundMessage =
            serde_json::from_str(r#"{"n":"ticker-xbtaud","o":{"LastPrice":1}}"#).unwrap();
        assert_eq!(msg.channel.as_deref(), Some("ticker-xbtaud"));
        assert_eq!(msg.body, Some(json!({"LastPrice": 1})));
    }
}
