//! Gateway error taxonomy.
//!
//! Every failure maps onto one [`ErrorKind`]; the kind decides how it
//! propagates.
//!
//! | Kind | Retried in dispatcher | Reaches health signal |
//! |------|-----------------------|-----------------------|
//! | `TransientTransport` | yes (bounded) | via connection state |
//! | `RateLimited` | yes (until deadline) | no |
//! | `ProtocolRejection` | no | via connection state |
//! | `AuthenticationFatal` | no | yes, `Down` |
//! | `ReconciliationAmbiguous` | no | yes, `Degraded` |

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::rate_limit::OperationClass;
use crate::domain::connection::ConnectionState;
use crate::domain::order::OrderStatus;
use crate::domain::LocalOrderId;

/// Error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Network blip, timeout, dropped session.
    TransientTransport,
    /// Credentials rejected or concurrent session. Never retried.
    AuthenticationFatal,
    /// Local admission control refused the call.
    RateLimited,
    /// The broker refused the request or the session.
    ProtocolRejection,
    /// Reconciliation found a mismatch it cannot resolve from broker data.
    ReconciliationAmbiguous,
}

impl ErrorKind {
    /// Reason string for logs and metric labels.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::TransientTransport => "TRANSIENT_TRANSPORT",
            Self::AuthenticationFatal => "AUTHENTICATION_FATAL",
            Self::RateLimited => "RATE_LIMITED",
            Self::ProtocolRejection => "PROTOCOL_REJECTION",
            Self::ReconciliationAmbiguous => "RECONCILIATION_AMBIGUOUS",
        }
    }

    /// Whether a caller may retry.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::TransientTransport | Self::RateLimited)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Errors surfaced by the session handle and the dispatch adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The session is not ready.
    #[error("not connected (state: {0})")]
    NotConnected(ConnectionState),

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// No response before the deadline.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Session dropped while a request was in flight.
    #[error("session lost before response")]
    SessionLost,

    /// Credentials rejected.
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// Another session logged in with the same identity.
    #[error("concurrent session detected for the same identity")]
    ConcurrentSession,

    /// No token before the deadline.
    #[error("rate limited ({0})")]
    RateLimited(OperationClass),

    /// The broker refused the request.
    #[error("broker rejected request: {0}")]
    ProtocolRejection(String),

    /// The broker answered with a response of the wrong shape.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// No cached order has this local id.
    #[error("unknown order {0}")]
    UnknownOrder(LocalOrderId),

    /// The broker has not acknowledged the order yet.
    #[error("order {0} has no broker id yet")]
    OrderNotAcknowledged(LocalOrderId),

    /// The order is no longer working.
    #[error("order {id} is {status}")]
    OrderNotOpen {
        /// Local id.
        id: LocalOrderId,
        /// Current status.
        status: OrderStatus,
    },

    /// The requested modification cannot apply to the order.
    #[error("invalid modification of order {id}: {reason}")]
    InvalidModification {
        /// Local id.
        id: LocalOrderId,
        /// What is wrong with it.
        reason: String,
    },

    /// Reconciliation could not resolve a mismatch.
    #[error("reconciliation ambiguous: {0}")]
    ReconciliationAmbiguous(String),

    /// The connection manager has stopped.
    #[error("gateway is shutting down")]
    ShuttingDown,
}

impl GatewayError {
    /// Classify the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConnected(_)
            | Self::Transport(_)
            | Self::Timeout(_)
            | Self::SessionLost
            | Self::ShuttingDown => ErrorKind::TransientTransport,
            Self::AuthenticationRejected(_) | Self::ConcurrentSession => {
                ErrorKind::AuthenticationFatal
            }
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::ProtocolRejection(_)
            | Self::UnexpectedResponse(_)
            | Self::UnknownOrder(_)
            | Self::OrderNotAcknowledged(_)
            | Self::OrderNotOpen { .. }
            | Self::InvalidModification { .. } => ErrorKind::ProtocolRejection,
            Self::ReconciliationAmbiguous(_) => ErrorKind::ReconciliationAmbiguous,
        }
    }

    /// Whether the dispatcher may retry the call.
    ///
    /// `NotConnected` is transient but not retried in place: callers get an
    /// immediate answer while the session is down.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        !matches!(self, Self::NotConnected(_) | Self::ShuttingDown) && self.kind().is_retriable()
    }
}

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(GatewayError::Transport("reset".into()), ErrorKind::TransientTransport, true)]
    #[test_case(GatewayError::Timeout("snapshot".into()), ErrorKind::TransientTransport, true)]
    #[test_case(GatewayError::SessionLost, ErrorKind::TransientTransport, true)]
    #[test_case(GatewayError::NotConnected(ConnectionState::Reconnecting), ErrorKind::TransientTransport, false)]
    #[test_case(GatewayError::ConcurrentSession, ErrorKind::AuthenticationFatal, false)]
    #[test_case(GatewayError::RateLimited(OperationClass::Orders), ErrorKind::RateLimited, true)]
    #[test_case(GatewayError::ProtocolRejection("bad symbol".into()), ErrorKind::ProtocolRejection, false)]
    #[test_case(GatewayError::OrderNotAcknowledged("ord-1".into()), ErrorKind::ProtocolRejection, false)]
    #[test_case(GatewayError::InvalidModification { id: "ord-1".into(), reason: "nothing to change".into() }, ErrorKind::ProtocolRejection, false)]
    #[test_case(GatewayError::ReconciliationAmbiguous("order B-1".into()), ErrorKind::ReconciliationAmbiguous, false)]
    fn classification(error: GatewayError, kind: ErrorKind, retriable: bool) {
        assert_eq!(error.kind(), kind);
        assert_eq!(error.is_retriable(), retriable);
    }

    #[test]
    fn kind_serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::AuthenticationFatal).unwrap(),
            "\"AUTHENTICATION_FATAL\""
        );
    }
}
