//! Domain Layer - Core gateway types and invariants.
//!
//! Pure value types describing the broker session, orders, positions and
//! account values. Nothing in here performs I/O.

/// Strongly-typed identifiers.
pub mod identifiers;

/// Connection lifecycle state machine.
pub mod connection;

/// Order records, events and the status lattice.
pub mod order;

/// Executions and commission reports.
pub mod execution;

/// Position records and snapshots.
pub mod position;

/// Account value records.
pub mod account;

/// Market data value objects.
pub mod market;

/// Broker events and snapshots as seen by the core.
pub mod events;

/// Durable checkpoint record.
pub mod checkpoint;

/// Health signal exposed to the execution-intent caller.
pub mod health;

pub use identifiers::{AccountId, BrokerOrderId, EventId, InstrumentKey, LocalOrderId, SessionId};
