//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus process plumbing.

/// Environment configuration.
pub mod config;

/// Health, metrics and query HTTP endpoints.
pub mod http;

/// Independent Reserve WebSocket adapter.
pub mod independent_reserve;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing and OpenTelemetry setup.
pub mod telemetry;
