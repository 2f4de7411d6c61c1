//! Connection Lifecycle
//!
//! The session state machine driven by the connection manager.
//!
//! ```text
//! Disconnected ──start──► Connecting ──transport up──► Authenticating ──accepted──► Ready
//!                             ▲                               │                       │
//!                             │ backoff elapsed               │ fatal auth            │ error / missed heartbeat
//!                             │                               ▼                       ▼
//!                        Reconnecting ──attempts exhausted──► FailedPermanently ◄── Reconnecting
//! ```
//!
//! Any state may move to `Disconnected` on shutdown.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection state of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session and no attempt in progress.
    #[default]
    Disconnected,
    /// Establishing the transport.
    Connecting,
    /// Transport established, credentials sent.
    Authenticating,
    /// Authenticated and usable.
    Ready,
    /// Session lost, waiting out the backoff delay.
    Reconnecting,
    /// Gave up. Requires operator intervention.
    FailedPermanently,
}

impl ConnectionState {
    /// Lowercase name used in logs, metrics and health output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::FailedPermanently => "failed_permanently",
        }
    }

    /// Numeric code for the connection state gauge.
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Authenticating => 2,
            Self::Ready => 3,
            Self::Reconnecting => 4,
            Self::FailedPermanently => 5,
        }
    }

    /// Whether requests may be dispatched.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Whether a session attempt is in flight or established.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Authenticating | Self::Ready | Self::Reconnecting
        )
    }

    /// Whether the state machine has given up.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::FailedPermanently)
    }

    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        use ConnectionState::{
            Authenticating, Connecting, Disconnected, FailedPermanently, Ready, Reconnecting,
        };

        matches!(
            (*self, next),
            (Disconnected, Connecting)
                | (Connecting, Authenticating)
                | (Authenticating, Ready)
                | (Connecting | Authenticating | Ready, Reconnecting)
                | (Reconnecting, Connecting)
                | (Connecting | Authenticating | Reconnecting, FailedPermanently)
                | (
                    Connecting | Authenticating | Ready | Reconnecting | FailedPermanently,
                    Disconnected
                )
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TransitionReason {
    /// Initial start or explicit reconnect request.
    Requested,
    /// Transport connected.
    TransportEstablished,
    /// Broker accepted the credentials.
    Authenticated,
    /// Transport failed or closed.
    TransportError(String),
    /// Broker rejected the session at the protocol level.
    ProtocolRejection(String),
    /// No heartbeat acknowledgment within the timeout.
    HeartbeatTimeout,
    /// Backoff delay elapsed.
    BackoffElapsed,
    /// Retry budget exhausted.
    MaxAttemptsExceeded(u32),
    /// Credentials rejected or concurrent session. Not retriable.
    AuthenticationFatal(String),
    /// Gateway shutdown.
    Shutdown,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("requested"),
            Self::TransportEstablished => f.write_str("transport established"),
            Self::Authenticated => f.write_str("authenticated"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
            Self::ProtocolRejection(e) => write!(f, "protocol rejection: {e}"),
            Self::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            Self::BackoffElapsed => f.write_str("backoff elapsed"),
            Self::MaxAttemptsExceeded(n) => write!(f, "{n} reconnect attempts exhausted"),
            Self::AuthenticationFatal(e) => write!(f, "authentication fatal: {e}"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// A state change, broadcast once per accepted transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state.
    pub from: ConnectionState,
    /// New state.
    pub to: ConnectionState,
    /// Reconnect attempt counter at the time of the transition.
    pub attempt: u32,
    /// Cause of the transition.
    pub reason: TransitionReason,
    /// When the transition was applied.
    pub at: DateTime<Utc>,
}
