//! Channel Identity
//!
//! Types that name a subscribable stream on the exchange feed.
//!
//! A [`ChannelKey`] is the cache key for everything the client knows about a
//! stream: a channel kind plus the currency pair (market channels) or the
//! account currency (balance channel). Keys are built only through a
//! [`SymbolSet`], so every key in the system refers to a known market.
//!
//! # Channel Names
//!
//! | Kind           | Wire name                      |
//! |----------------|--------------------------------|
//! | Ticker         | `ticker-{primary}{secondary}`  |
//! | Order book     | `orderbook-{primary}{secondary}` |
//! | Recent trades  | `recenttrades-{primary}{secondary}` |
//! | Balance        | `balance-{currency}`           |

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Primary (base) currencies accepted when no override is configured.
pub const DEFAULT_PRIMARY_CURRENCIES: &[&str] = &[
    "xbt", "eth", "xrp", "ltc", "bch", "usdt", "usdc", "sol", "ada", "doge", "dot", "link", "uni",
    "xlm", "aave", "sand", "mana",
];

/// Secondary (quote) currencies accepted when no override is configured.
pub const DEFAULT_SECONDARY_CURRENCIES: &[&str] = &["aud", "usd", "nzd", "sgd"];

/// Exchange spelling of bitcoin. `btc` is accepted as an alias.
const BITCOIN_CODE: &str = "xbt";

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while building channel identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The currency code is empty or contains non-alphanumeric characters.
    #[error("invalid currency code: {0:?}")]
    InvalidCode(String),

    /// The primary currency is not traded on the exchange.
    #[error("unknown primary currency: {0}")]
    UnknownPrimary(String),

    /// The secondary currency is not traded on the exchange.
    #[error("unknown secondary currency: {0}")]
    UnknownSecondary(String),

    /// The account currency is not known.
    #[error("unknown account currency: {0}")]
    UnknownCurrency(String),

    /// Primary and secondary currency are the same.
    #[error("currency pair must use two different currencies, got {0}/{0}")]
    SameCurrency(String),

    /// The channel name could not be mapped to a known channel.
    #[error("unrecognised channel name: {0}")]
    UnknownChannel(String),
}

// =============================================================================
// Channel Kind
// =============================================================================

/// Kind of stream a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Best bid/ask, last price and 24h volume for a pair.
    Ticker,
    /// Bid and ask ladders for a pair.
    OrderBook,
    /// Latest executed trades for a pair.
    RecentTrades,
    /// Account balance for one currency (private).
    Balance,
}

impl ChannelKind {
    /// All channel kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Ticker,
            Self::OrderBook,
            Self::RecentTrades,
            Self::Balance,
        ]
    }

    /// Prefix used in wire channel names.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::OrderBook => "orderbook",
            Self::RecentTrades => "recenttrades",
            Self::Balance => "balance",
        }
    }

    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::OrderBook => "order_book",
            Self::RecentTrades => "recent_trades",
            Self::Balance => "balance",
        }
    }

    /// Whether subscribing requires a signed request.
    #[must_use]
    pub const fn is_private(self) -> bool {
        matches!(self, Self::Balance)
    }

    /// Look up a kind by its wire prefix.
    #[must_use]
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|kind| kind.prefix().eq_ignore_ascii_case(prefix))
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Currency Codes
// =============================================================================

/// A normalised (lower-case) currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    /// Normalise a raw currency code.
    ///
    /// Codes are trimmed and lower-cased; `btc` maps to the exchange's `xbt`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidCode`] when the code is empty or not
    /// purely alphanumeric.
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        let code = raw.trim().to_ascii_lowercase();

        if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ChannelError::InvalidCode(raw.to_string()));
        }

        if code == "btc" {
            return Ok(Self(BITCOIN_CODE.to_string()));
        }

        Ok(Self(code))
    }

    /// The normalised code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A primary/secondary currency pair, e.g. `xbt/aud`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CurrencyPair {
    primary: CurrencyCode,
    secondary: CurrencyCode,
}

impl CurrencyPair {
    /// The traded (base) currency.
    #[must_use]
    pub const fn primary(&self) -> &CurrencyCode {
        &self.primary
    }

    /// The quote currency.
    #[must_use]
    pub const fn secondary(&self) -> &CurrencyCode {
        &self.secondary
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.primary, self.secondary)
    }
}

// =============================================================================
// Channel Key
// =============================================================================

/// Identifies one subscribable stream; the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKey {
    /// Ticker for a pair.
    Ticker(CurrencyPair),
    /// Order book for a pair.
    OrderBook(CurrencyPair),
    /// Recent trades for a pair.
    RecentTrades(CurrencyPair),
    /// Account balance for a currency.
    Balance(CurrencyCode),
}

impl ChannelKey {
    /// The channel kind.
    #[must_use]
    pub const fn kind(&self) -> ChannelKind {
        match self {
            Self::Ticker(_) => ChannelKind::Ticker,
            Self::OrderBook(_) => ChannelKind::OrderBook,
            Self::RecentTrades(_) => ChannelKind::RecentTrades,
            Self::Balance(_) => ChannelKind::Balance,
        }
    }

    /// Whether the channel needs a signed subscribe request.
    #[must_use]
    pub const fn is_private(&self) -> bool {
        self.kind().is_private()
    }

    /// The currency pair, for market channels.
    #[must_use]
    pub const fn pair(&self) -> Option<&CurrencyPair> {
        match self {
            Self::Ticker(pair) | Self::OrderBook(pair) | Self::RecentTrades(pair) => Some(pair),
            Self::Balance(_) => None,
        }
    }

    /// Wire channel name, e.g. `ticker-xbtaud`.
    #[must_use]
    pub fn channel_name(&self) -> String {
        let prefix = self.kind().prefix();
        match self {
            Self::Ticker(pair) | Self::OrderBook(pair) | Self::RecentTrades(pair) => {
                format!("{prefix}-{}{}", pair.primary, pair.secondary)
            }
            Self::Balance(currency) => format!("{prefix}-{currency}"),
        }
    }

    /// Build a key from the currency codes carried inside a payload.
    ///
    /// Used when an inbound message names its channel in a form that does not
    /// match any subscription exactly. No symbol validation is applied: the
    /// exchange already accepted the subscription.
    #[must_use]
    pub fn from_codes(kind: ChannelKind, primary: &str, secondary: Option<&str>) -> Option<Self> {
        let primary = CurrencyCode::parse(primary).ok()?;

        if kind == ChannelKind::Balance {
            return Some(Self::Balance(primary));
        }

        let secondary = CurrencyCode::parse(secondary?).ok()?;
        let pair = CurrencyPair { primary, secondary };

        Some(match kind {
            ChannelKind::Ticker => Self::Ticker(pair),
            ChannelKind::OrderBook => Self::OrderBook(pair),
            ChannelKind::RecentTrades => Self::RecentTrades(pair),
            ChannelKind::Balance => return None,
        })
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel_name())
    }
}

// =============================================================================
// Symbol Set
// =============================================================================

/// The currencies the client accepts in queries.
///
/// Every [`ChannelKey`] handed to the cache is built here, so an unknown
/// currency is rejected before anything reaches the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolSet {
    primaries: BTreeSet<CurrencyCode>,
    secondaries: BTreeSet<CurrencyCode>,
}

impl Default for SymbolSet {
    fn default() -> Self {
        Self::new(
            DEFAULT_PRIMARY_CURRENCIES.iter().copied(),
            DEFAULT_SECONDARY_CURRENCIES.iter().copied(),
        )
    }
}

impl SymbolSet {
    /// Build a symbol set; codes that fail to normalise are skipped.
    #[must_use]
    pub fn new<P, S>(
        primaries: impl IntoIterator<Item = P>,
        secondaries: impl IntoIterator<Item = S>,
    ) -> Self
    where
        P: AsRef<str>,
        S: AsRef<str>,
    {
        Self {
            primaries: primaries
                .into_iter()
                .filter_map(|code| CurrencyCode::parse(code.as_ref()).ok())
                .collect(),
            secondaries: secondaries
                .into_iter()
                .filter_map(|code| CurrencyCode::parse(code.as_ref()).ok())
                .collect(),
        }
    }

    /// Validate and normalise a currency pair.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] when either code is malformed or unknown,
    /// or when both sides name the same currency.
    pub fn pair(&self, primary: &str, secondary: &str) -> Result<CurrencyPair, ChannelError> {
        let primary = CurrencyCode::parse(primary)?;
        let secondary = CurrencyCode::parse(secondary)?;

        if primary == secondary {
            return Err(ChannelError::SameCurrency(primary.0));
        }
        if !self.primaries.contains(&primary) {
            return Err(ChannelError::UnknownPrimary(primary.0));
        }
        if !self.secondaries.contains(&secondary) {
            return Err(ChannelError::UnknownSecondary(secondary.0));
        }

        Ok(CurrencyPair { primary, secondary })
    }

    /// Validate an account currency (any known primary or secondary).
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] when the code is malformed or unknown.
    pub fn currency(&self, code: &str) -> Result<CurrencyCode, ChannelError> {
        let code = CurrencyCode::parse(code)?;

        if self.primaries.contains(&code) || self.secondaries.contains(&code) {
            Ok(code)
        } else {
            Err(ChannelError::UnknownCurrency(code.0))
        }
    }

    /// Ticker key for a pair.
    ///
    /// # Errors
    ///
    /// See [`SymbolSet::pair`].
    pub fn ticker(&self, primary: &str, secondary: &str) -> Result<ChannelKey, ChannelError> {
        self.pair(primary, secondary).map(ChannelKey::Ticker)
    }

    /// Order book key for a pair.
    ///
    /// # Errors
    ///
    /// See [`SymbolSet::pair`].
    pub fn order_book(&self, primary: &str, secondary: &str) -> Result<ChannelKey, ChannelError> {
        self.pair(primary, secondary).map(ChannelKey::OrderBook)
    }

    /// Recent trades key for a pair.
    ///
    /// # Errors
    ///
    /// See [`SymbolSet::pair`].
    pub fn recent_trades(
        &self,
        primary: &str,
        secondary: &str,
    ) -> Result<ChannelKey, ChannelError> {
        self.pair(primary, secondary).map(ChannelKey::RecentTrades)
    }

    /// Balance key for a currency.
    ///
    /// # Errors
    ///
    /// See [`SymbolSet::currency`].
    pub fn balance(&self, currency: &str) -> Result<ChannelKey, ChannelError> {
        self.currency(currency).map(ChannelKey::Balance)
    }

    /// Parse a wire channel name back into a key.
    ///
    /// Accepts both the compact form (`ticker-xbtaud`) and a hyphenated
    /// form (`ticker-xbt-aud`). The compact form is split using the known
    /// secondary currencies.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::UnknownChannel`] for unknown prefixes or
    /// names that do not split into known currencies.
    pub fn parse_channel(&self, name: &str) -> Result<ChannelKey, ChannelError> {
        let unknown = || ChannelError::UnknownChannel(name.to_string());

        let (prefix, rest) = name.trim().split_once('-').ok_or_else(unknown)?;
        let kind = ChannelKind::from_prefix(prefix).ok_or_else(unknown)?;

        if kind == ChannelKind::Balance {
            return self.balance(rest).map_err(|_| unknown());
        }

        let pair = if let Some((primary, secondary)) = rest.split_once('-') {
            self.pair(primary, secondary).map_err(|_| unknown())?
        } else {
            let rest = rest.to_ascii_lowercase();
            self.secondaries
                .iter()
                .filter_map(|secondary| {
                    rest.strip_suffix(secondary.as_str())
                        .and_then(|primary| self.pair(primary, secondary.as_str()).ok())
                })
                .next()
                .ok_or_else(unknown)?
        };

        Ok(match kind {
            ChannelKind::Ticker => ChannelKey::Ticker(pair),
            ChannelKind::OrderBook => ChannelKey::OrderBook(pair),
            ChannelKind::RecentTrades => ChannelKey::RecentTrades(pair),
            ChannelKind::Balance => return Err(unknown()),
        })
    }

    /// Known primary currencies.
    pub fn primaries(&self) -> impl Iterator<Item = &CurrencyCode> {
        self.primaries.iter()
    }

    /// Known secondary currencies.
    pub fn secondaries(&self) -> impl Iterator<Item = &CurrencyCode> {
        self.secondaries.iter()
    }
}

// =============================================================================
// Tests
// =============================================================================
