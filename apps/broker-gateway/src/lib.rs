#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Broker Gateway - Connection Resilience & State Reconciliation
//!
//! Keeps one authenticated session to an external broker alive, throttles
//! outbound requests per operation class, and keeps a local cache of
//! orders, positions and account values convergent with broker truth.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Value types and invariants
//!   - `connection`: Session state machine
//!   - `order`, `position`, `account`: Cached records
//!   - `events`: Broker events and snapshots
//!
//! - **Application**: Engine components written against ports
//!   - `rate_limit`: Token buckets per operation class
//!   - `state`: Local cache and reconciliation diffing
//!   - `pipeline`: Ordered event application and forwarding
//!   - `dispatch`: Market data, order and account adapters
//!   - `reconciliation`: Periodic repair loop
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `connection`: Event loop over a [`BrokerTransport`]
//!   - `paper`: In-process simulated broker
//!   - `checkpoint`: File-backed checkpoint store
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!  broker ──► ConnectionManager ──► pipeline ──► StateManager ──► event sink
//!                  ▲                     ▲
//!  caller ──► dispatchers ──► RateLimiter│
//!                          ReconciliationLoop (snapshots, resolutions)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core gateway types with no I/O.
pub mod domain;

/// Application layer - Engine components and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Error taxonomy.
pub mod error;

/// Gateway wiring and lifecycle.
pub mod runtime;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{ConnectionState, StateTransition, TransitionReason};
pub use domain::health::{HealthReport, HealthStatus};
pub use domain::order::{OrderIntent, OrderReceipt, OrderRecord, OrderStatus, RejectReason};
pub use domain::{AccountId, BrokerOrderId, EventId, InstrumentKey, LocalOrderId, SessionId};

// Ports
pub use application::ports::{
    BrokerSession, BrokerTransport, CheckpointStore, Credentials, EventSink,
};

// Errors
pub use error::{ErrorKind, GatewayError};

// Runtime
pub use runtime::Gateway;

// Infrastructure config
pub use infrastructure::config::{ConfigError, Environment, GatewayConfig};

// Adapters
pub use infrastructure::checkpoint::FileCheckpointStore;
pub use infrastructure::connection::{ConnectionHandle, ConnectionManager, ConnectionSettings};
pub use infrastructure::paper::{FillMode, LoginBehavior, PaperBroker, PaperBrokerControl};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
