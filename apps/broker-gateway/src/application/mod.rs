//! Application Layer - Use cases and port definitions.
//!
//! The engine's components live here, written against the port traits so
//! they can run over the real connection manager or a test fake.

/// Bounded exponential backoff.
pub mod backoff;

/// Checkpoint restore and save.
pub mod checkpoint;

/// Market data, order and account adapters.
pub mod dispatch;

/// Health aggregation.
pub mod health;

/// Ordered event application and downstream forwarding.
pub mod pipeline;

/// Port interfaces for external systems.
pub mod ports;

/// Token-bucket admission control.
pub mod rate_limit;

/// Periodic repair of cached state against broker snapshots.
pub mod reconciliation;

/// Local cache of orders, positions and account values.
pub mod state;
