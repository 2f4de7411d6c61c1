//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the process-level plumbing.

/// File-backed checkpoint store.
pub mod checkpoint;

/// Configuration loaded from the environment.
pub mod config;

/// Connection event loop and heartbeat monitor.
pub mod connection;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// In-process simulated broker.
pub mod paper;

/// OpenTelemetry tracing integration.
pub mod telemetry;
