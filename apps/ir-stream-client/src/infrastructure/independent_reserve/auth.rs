//! Private Channel Signing
//!
//! Private channels (account balances) are subscribed with a signed
//! envelope. The signature is an HMAC-SHA256, keyed by the API secret, over
//! the ASCII concatenation of nonce, API key and channel name, rendered as
//! upper-case hex.
//!
//! ```text
//! signature = HEX(HMAC_SHA256(secret, "{nonce}{api_key}{channel}"))
//! ```
//!
//! Every signature uses a fresh nonce. The [`Authenticator`] issues nonces
//! from the wall clock in milliseconds, bumped past the last issued value, and
//! refuses any caller-supplied nonce that is not strictly greater than every
//! nonce it has already signed.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised while building signed credentials.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// A private channel was requested but no credentials are configured.
    #[error("no API credentials configured")]
    MissingCredentials,

    /// The key or secret is unusable.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The nonce was not strictly greater than the last one signed.
    #[error("nonce {nonce} already used (last issued {last})")]
    NonceReused {
        /// Nonce that was refused.
        nonce: u64,
        /// Highest nonce signed so far.
        last: u64,
    },
}

// =============================================================================
// Credentials
// =============================================================================

/// Independent Reserve API key pair.
///
/// `Debug` and `Display` never print the secret.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    /// Create credentials.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] if either part is blank.
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Result<Self, AuthError> {
        let api_key = api_key.into().trim().to_string();
        let api_secret = api_secret.into().trim().to_string();

        if api_key.is_empty() {
            return Err(AuthError::InvalidCredentials(
                "API key cannot be empty".to_string(),
            ));
        }
        if api_secret.is_empty() {
            return Err(AuthError::InvalidCredentials(
                "API secret cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            api_key,
            api_secret,
        })
    }

    /// The public API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

impl std::fmt::Display for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credentials(api_key={})", self.api_key)
    }
}

/// Signed envelope fields for one private subscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCredential {
    /// Public API key.
    pub api_key: String,
    /// Nonce the signature covers.
    pub nonce: u64,
    /// Upper-case hex HMAC-SHA256.
    pub signature: String,
}

// =============================================================================
// Authenticator
// =============================================================================

/// Signs private channel names and issues nonces.
#[derive(Debug)]
pub struct Authenticator {
    credentials: Option<Credentials>,
    last_nonce: AtomicU64,
}

impl Authenticator {
    /// Create an authenticator. `None` allows public channels only.
    #[must_use]
    pub const fn new(credentials: Option<Credentials>) -> Self {
        Self {
            credentials,
            last_nonce: AtomicU64::new(0),
        }
    }

    /// Whether private channels can be signed.
    #[must_use]
    pub const fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Sign `channel` with a caller-supplied nonce.
    ///
    /// # Errors
    ///
    /// - [`AuthError::MissingCredentials`] without credentials
    /// - [`AuthError::NonceReused`] if `nonce` is not greater than every nonce
    ///   signed before
    pub fn sign(&self, channel: &str, nonce: u64) -> Result<SignedCredential, AuthError> {
        let credentials = self.credentials()?;

        self.last_nonce
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                (nonce > last).then_some(nonce)
            })
            .map_err(|last| AuthError::NonceReused { nonce, last })?;

        Self::signed(credentials, channel, nonce)
    }

    /// Sign `channel` with a freshly issued nonce.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingCredentials`] without credentials.
    pub fn sign_next(&self, channel: &str) -> Result<SignedCredential, AuthError> {
        let credentials = self.credentials()?;
        let nonce = self.issue_nonce();
        Self::signed(credentials, channel, nonce)
    }

    /// Reserve the next nonce: wall-clock milliseconds, or one past the last
    /// issued value when the clock has not moved forward.
    fn issue_nonce(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let next = |last: u64| now.max(last.saturating_add(1));

        // The closure always returns Some, so both arms carry the previous value.
        let previous = self
            .last_nonce
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(next(last)))
            .unwrap_or_else(|last| last);
        next(previous)
    }

    fn credentials(&self) -> Result<&Credentials, AuthError> {
        self.credentials.as_ref().ok_or(AuthError::MissingCredentials)
    }

    fn signed(
        credentials: &Credentials,
        channel: &str,
        nonce: u64,
    ) -> Result<SignedCredential, AuthError> {
        let message = format!("{nonce}{}{channel}", credentials.api_key);
        Ok(SignedCredential {
            api_key: credentials.api_key.clone(),
            nonce,
            signature: hmac_sha256_upper_hex(&credentials.api_secret, &message)?,
        })
    }
}

fn hmac_sha256_upper_hex(secret: &str, message: &str) -> Result<String, AuthError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AuthError::InvalidCredentials(format!("unusable API secret: {e}")))?;
    mac.update(message.as_bytes());
    Ok(hex::encode_upper(mac.finalize().into_bytes()))
}

// =============================================================================
// Tests
// =============================================================================
