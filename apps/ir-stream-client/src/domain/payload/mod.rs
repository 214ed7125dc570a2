//! Channel Payloads
//!
//! Typed bodies of the `"o"` field carried by inbound data messages. The
//! exchange uses PascalCase field names and sends prices and volumes either
//! as JSON numbers or as strings; both decode into [`Decimal`].
//!
//! Each payload also renders a short human-readable summary, used by the
//! text query format.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::channel::ChannelKind;

/// Number of price levels shown per side in an order book summary.
pub const SUMMARY_BOOK_DEPTH: usize = 5;

/// Number of trades shown in a recent trades summary.
pub const SUMMARY_TRADE_COUNT: usize = 5;

/// A payload could not be decoded for its channel kind.
#[derive(Debug, Error)]
#[error("invalid {kind} payload: {source}")]
pub struct PayloadError {
    /// Channel kind the payload was decoded as.
    pub kind: ChannelKind,
    /// Underlying JSON error.
    #[source]
    pub source: serde_json::Error,
}

// =============================================================================
// Ticker
// =============================================================================

/// Ticker snapshot for a currency pair.
///
/// # Wire Format (JSON)
///
/// ```json
/// {
///   "PrimaryCurrencyCode": "Xbt",
///   "SecondaryCurrencyCode": "Aud",
///   "LastPrice": 98000.5,
///   "BestBid": 97990.0,
///   "BestAsk": 98010.0,
///   "Volume24Hour": 12.5
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ticker {
    /// Primary currency as reported by the exchange.
    pub primary_currency_code: String,
    /// Secondary currency as reported by the exchange.
    pub secondary_currency_code: String,
    /// Last traded price.
    #[serde(default)]
    pub last_price: Option<Decimal>,
    /// Highest open bid.
    #[serde(default)]
    pub best_bid: Option<Decimal>,
    /// Lowest open ask.
    #[serde(default)]
    pub best_ask: Option<Decimal>,
    /// Traded volume over the last 24 hours.
    #[serde(default, rename = "Volume24Hour")]
    pub volume_24_hour: Option<Decimal>,
    /// Highest price of the current day.
    #[serde(default)]
    pub day_highest_price: Option<Decimal>,
    /// Lowest price of the current day.
    #[serde(default)]
    pub day_lowest_price: Option<Decimal>,
}

impl Ticker {
    /// Human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Ticker for {}/{}:\n  - Last Price: {}\n  - Best Bid: {}\n  - Best Ask: {}\n  - 24h Volume: {}",
            self.primary_currency_code,
            self.secondary_currency_code,
            or_na(self.last_price),
            or_na(self.best_bid),
            or_na(self.best_ask),
            or_na(self.volume_24_hour),
        )
    }
}

// =============================================================================
// Order Book
// =============================================================================

/// One price level of an order book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PriceLevel {
    /// Limit price.
    pub price: Decimal,
    /// Volume resting at the price.
    pub volume: Decimal,
}

/// Order book for a currency pair.
///
/// # Wire Format (JSON)
///
/// ```json
/// {
///   "PrimaryCurrencyCode": "Eth",
///   "SecondaryCurrencyCode": "Aud",
///   "BuyOrders": [{"Price": 3000, "Volume": 10}],
///   "SellOrders": [{"Price": 3010, "Volume": 4}]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderBook {
    /// Primary currency as reported by the exchange.
    pub primary_currency_code: String,
    /// Secondary currency as reported by the exchange.
    pub secondary_currency_code: String,
    /// Bids, best first.
    #[serde(default)]
    pub buy_orders: Vec<PriceLevel>,
    /// Asks, best first.
    #[serde(default)]
    pub sell_orders: Vec<PriceLevel>,
}

impl OrderBook {
    /// Human-readable summary of the top of the book.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Order Book for {}/{}:\n--- Top {depth} Bids (Buy Orders) ---\n{}\n\n--- Top {depth} Asks (Sell Orders) ---\n{}",
            self.primary_currency_code,
            self.secondary_currency_code,
            levels(&self.buy_orders),
            levels(&self.sell_orders),
            depth = SUMMARY_BOOK_DEPTH,
        )
    }
}

fn levels(side: &[PriceLevel]) -> String {
    side.iter()
        .take(SUMMARY_BOOK_DEPTH)
        .map(|level| format!("  - {} ({})", level.price, level.volume))
        .collect::<Vec<_>>()
        .join("\n")
}

// =============================================================================
// Recent Trades
// =============================================================================

/// One executed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TradeRecord {
    /// Execution price.
    pub price: Decimal,
    /// Executed volume.
    pub volume: Decimal,
    /// Execution time, when provided.
    #[serde(default, rename = "TradeTimestampUtc")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Recent trades for a currency pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecentTrades {
    /// Primary currency as reported by the exchange.
    pub primary_currency_code: String,
    /// Secondary currency as reported by the exchange.
    pub secondary_currency_code: String,
    /// Trades, most recent first.
    #[serde(default)]
    pub trades: Vec<TradeRecord>,
}

impl RecentTrades {
    /// Human-readable summary of the latest trades.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Recent Trades for {}/{}:",
            self.primary_currency_code, self.secondary_currency_code
        );
        for trade in self.trades.iter().take(SUMMARY_TRADE_COUNT) {
            let _ = write!(out, "\n  - {} ({})", trade.price, trade.volume);
            if let Some(ts) = trade.timestamp {
                let _ = write!(out, " at {}", ts.to_rfc3339());
            }
        }
        if self.trades.is_empty() {
            out.push_str("\n  (no trades)");
        }
        out
    }
}

// =============================================================================
// Balance
// =============================================================================

/// Account balance for one currency (private channel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Balance {
    /// Currency of the balance.
    pub currency_code: String,
    /// Funds free to trade or withdraw.
    #[serde(default)]
    pub available_balance: Option<Decimal>,
    /// Total funds including those reserved by open orders.
    #[serde(default)]
    pub total_balance: Option<Decimal>,
}

impl Balance {
    /// Human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Balance for {}:\n  - Available: {}\n  - Total: {}",
            self.currency_code,
            or_na(self.available_balance),
            or_na(self.total_balance),
        )
    }
}

fn or_na(value: Option<Decimal>) -> String {
    value.map_or_else(|| "N/A".to_string(), |v| v.to_string())
}

// =============================================================================
// Channel Payload
// =============================================================================

/// A decoded payload for any channel kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChannelPayload {
    /// Ticker payload.
    Ticker(Ticker),
    /// Order book payload.
    OrderBook(OrderBook),
    /// Recent trades payload.
    RecentTrades(RecentTrades),
    /// Balance payload.
    Balance(Balance),
}

impl ChannelPayload {
    /// Decode a raw payload as the given channel kind.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] if the JSON does not match the kind's shape.
    pub fn decode(kind: ChannelKind, value: serde_json::Value) -> Result<Self, PayloadError> {
        let wrap = |source| PayloadError { kind, source };
        Ok(match kind {
            ChannelKind::Ticker => Self::Ticker(serde_json::from_value(value).map_err(wrap)?),
            ChannelKind::OrderBook => Self::OrderBook(serde_json::from_value(value).map_err(wrap)?),
            ChannelKind::RecentTrades => {
                Self::RecentTrades(serde_json::from_value(value).map_err(wrap)?)
            }
            ChannelKind::Balance => Self::Balance(serde_json::from_value(value).map_err(wrap)?),
        })
    }

    /// Channel kind of the payload.
    #[must_use]
    pub const fn kind(&self) -> ChannelKind {
        match self {
            Self::Ticker(_) => ChannelKind::Ticker,
            Self::OrderBook(_) => ChannelKind::OrderBook,
            Self::RecentTrades(_) => ChannelKind::RecentTrades,
            Self::Balance(_) => ChannelKind::Balance,
        }
    }

    /// Human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Ticker(t) => t.summary(),
            Self::OrderBook(b) => b.summary(),
            Self::RecentTrades(r) => r.summary(),
            Self::Balance(b) => b.summary(),
        }
    }
}

/// A payload type carried by one channel kind.
pub trait TypedPayload: Sized + Clone + Serialize + Send + Sync + 'static {
    /// Borrow the typed payload if the variant matches.
    fn from_payload(payload: &ChannelPayload) -> Option<&Self>;

    /// Human-readable summary.
    fn summary(&self) -> String;
}

impl TypedPayload for Ticker {
    fn summary(&self) -> String {
        Self::summary(self)
    }

    fn from_payload(payload: &ChannelPayload) -> Option<&Self> {
        match payload {
            ChannelPayload::Ticker(t) => Some(t),
            _ => None,
        }
    }
}

impl TypedPayload for OrderBook {
    fn summary(&self) -> String {
        Self::summary(self)
    }

    fn from_payload(payload: &ChannelPayload) -> Option<&Self> {
        match payload {
            ChannelPayload::OrderBook(b) => Some(b),
            _ => None,
        }
    }
}

impl TypedPayload for RecentTrades {
    fn summary(&self) -> String {
        Self::summary(self)
    }

    fn from_payload(payload: &ChannelPayload) -> Option<&Self> {
        match payload {
            ChannelPayload::RecentTrades(r) => Some(r),
            _ => None,
        }
    }
}

impl TypedPayload for Balance {
    fn summary(&self) -> String {
        Self::summary(self)
    }

    fn from_payload(payload: &ChannelPayload) -> Option<&Self> {
        match payload {
            ChannelPayload::Balance(b) => Some(b),
            _ => None,
        }
    }
}
