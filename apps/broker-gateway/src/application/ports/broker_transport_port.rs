//! Broker Transport Port (Driven Port)
//!
//! The physical session to the broker. Wire encoding lives behind this
//! trait; the core only sees decoded messages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::events::{BrokerEvent, BrokerSnapshot, OrderLookup};
use crate::domain::market::MarketDataSubscription;
use crate::domain::order::OrderIntent;
use crate::domain::{AccountId, BrokerOrderId, EventId, InstrumentKey, LocalOrderId};
use crate::error::ErrorKind;

/// Broker login credentials.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
    account_id: AccountId,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(username: String, password: String, account_id: AccountId) -> Self {
        Self {
            username,
            password,
            account_id,
        }
    }

    /// Get the username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Get the password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Get the account the session trades.
    #[must_use]
    pub const fn account_id(&self) -> &AccountId {
        &self.account_id
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &"[REDACTED]")
            .field("password", &"[REDACTED]")
            .field("account_id", &self.account_id)
            .finish()
    }
}

/// What the broker tells us after a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Accounts visible to the session.
    pub accounts: Vec<AccountId>,
    /// Broker clock at login.
    pub server_time: DateTime<Utc>,
}

/// Correlation id for requests that expect a response.
pub type RequestId = u64;

/// Outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerRequest {
    /// Place an order. The intent's idempotency key is the client order id.
    PlaceOrder(OrderIntent),
    /// Cancel a working order.
    CancelOrder {
        /// Broker order id.
        broker_order_id: BrokerOrderId,
    },
    /// Change quantity or limit price of a working order.
    ModifyOrder {
        /// Broker order id.
        broker_order_id: BrokerOrderId,
        /// Client order id.
        local_order_id: LocalOrderId,
        /// New total quantity.
        quantity: Option<Decimal>,
        /// New limit price.
        limit_price: Option<Decimal>,
    },
    /// Start streaming quotes.
    SubscribeMarketData(MarketDataSubscription),
    /// Stop streaming quotes.
    UnsubscribeMarketData {
        /// Instrument.
        instrument: InstrumentKey,
    },
    /// Request positions, open orders and account values.
    Snapshot {
        /// Account.
        account_id: AccountId,
        /// Last order event applied locally, as a scope hint.
        order_cursor: Option<EventId>,
    },
    /// Look up one order.
    QueryOrder {
        /// Account.
        account_id: AccountId,
        /// Broker id, when known.
        broker_order_id: Option<BrokerOrderId>,
        /// Client order id.
        local_order_id: LocalOrderId,
    },
    /// Keepalive.
    Heartbeat,
}

impl BrokerRequest {
    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PlaceOrder(_) => "place_order",
            Self::CancelOrder { .. } => "cancel_order",
            Self::ModifyOrder { .. } => "modify_order",
            Self::SubscribeMarketData(_) => "subscribe_market_data",
            Self::UnsubscribeMarketData { .. } => "unsubscribe_market_data",
            Self::Snapshot { .. } => "snapshot",
            Self::QueryOrder { .. } => "query_order",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// A request with its optional correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    /// Set when the caller waits for a response.
    pub request_id: Option<RequestId>,
    /// The request.
    pub request: BrokerRequest,
}

/// Correlated response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerResponse {
    /// Answer to `Snapshot`.
    Snapshot(BrokerSnapshot),
    /// Answer to `QueryOrder`.
    Order(OrderLookup),
    /// Plain acknowledgment.
    Ack,
}

/// Decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Broker-pushed event.
    Event(BrokerEvent),
    /// Answer to a heartbeat.
    HeartbeatAck,
    /// Answer to a correlated request. `Err` carries the broker's message.
    Response {
        /// Correlation id.
        request_id: RequestId,
        /// Payload or broker error.
        result: Result<BrokerResponse, String>,
    },
    /// The broker terminated the session.
    SessionRejected {
        /// Broker message.
        reason: String,
        /// Another login with the same identity displaced this one.
        concurrent_session: bool,
    },
}

/// Transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not establish the connection.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,

    /// Read or write failed.
    #[error("i/o error: {0}")]
    Io(String),

    /// Credentials rejected.
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// Another session holds the identity.
    #[error("concurrent session: {0}")]
    ConcurrentSession(String),

    /// Unexpected or malformed protocol message.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Classify the failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectFailed(_) | Self::Closed | Self::Io(_) => ErrorKind::TransientTransport,
            Self::AuthenticationRejected(_) | Self::ConcurrentSession(_) => {
                ErrorKind::AuthenticationFatal
            }
            Self::Protocol(_) => ErrorKind::ProtocolRejection,
        }
    }

    /// Whether the connection manager must stop retrying.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::AuthenticationFatal)
    }
}

/// Port for the physical broker session.
///
/// One instance is owned by the connection event loop. `connect` after a
/// failure or `close` starts a fresh session.
#[async_trait]
pub trait BrokerTransport: Send + 'static {
    /// Establish the transport.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Log in on an established transport.
    async fn authenticate(&mut self, credentials: &Credentials)
    -> Result<SessionInfo, TransportError>;

    /// Write one request.
    async fn send(&mut self, envelope: OutboundEnvelope) -> Result<(), TransportError>;

    /// Wait for the next inbound message.
    ///
    /// Must be cancel-safe: it is polled inside `select!`.
    async fn recv(&mut self) -> Result<InboundMessage, TransportError>;

    /// Tear the session down.
    async fn close(&mut self);
}
