//! Application Services
//!
//! Services that orchestrate the domain types over the ports.
//!
//! - [`cache::SubscriptionCache`]: subscribe-on-demand payload cache
//! - [`router::MarketDataRouter`]: public query entry points
//! - [`sweeper::EvictionSweeper`]: idle channel eviction
//! - [`ingest::run_ingestion`]: feed events into the cache

/// Subscribe-on-demand payload cache.
pub mod cache;

/// Feed event ingestion.
pub mod ingest;

/// Query entry points.
pub mod router;

/// Idle eviction.
pub mod sweeper;
