//! Application Layer - Use cases and port definitions.
//!
//! Holds the cache, router and sweeper, and the port traits the feed
//! connection implements.

/// Caller-facing query errors.
pub mod error;

/// Port interfaces for the feed connection.
pub mod ports;

/// Cache, router, sweeper and ingestion services.
pub mod services;
