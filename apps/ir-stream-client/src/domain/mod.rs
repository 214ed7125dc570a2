//! Domain Layer - Channel identity, payloads and subscription state.
//!
//! Pure types with no I/O. Everything that crosses a layer boundary is
//! defined here.

/// Channel keys, currency codes and the known symbol set.
pub mod channel;

/// Typed channel payloads and their text summaries.
pub mod payload;

/// Entry lifecycle, connection state and feed events.
pub mod subscription;
