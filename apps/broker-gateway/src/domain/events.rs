//! Broker events and snapshots as seen by the core.
//!
//! Decoding is the transport's job; everything here is already typed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::account::AccountValueEvent;
use super::execution::CommissionEvent;
use super::identifiers::{AccountId, BrokerOrderId, EventId, InstrumentKey, LocalOrderId};
use super::market::QuoteEvent;
use super::order::{OrderEvent, OrderStatus, Side};
use super::position::{PositionSnapshot, SnapshotPosition};

/// Informational broker output with no effect on state (bulletins,
/// farm status, latency samples).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Broker-side code or topic.
    pub topic: String,
    /// Free text.
    pub message: String,
    /// Timestamp.
    pub timestamp: DateTime<Utc>,
}

/// An event pushed by the broker over the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BrokerEvent {
    /// Order status update.
    Order(OrderEvent),
    /// Unsolicited full position set for an account.
    Positions(PositionSnapshot),
    /// Account value update.
    AccountValue(AccountValueEvent),
    /// Commission charged for an execution.
    Commission(CommissionEvent),
    /// Quote.
    Quote(QuoteEvent),
    /// Informational output.
    Telemetry(TelemetryEvent),
}

impl BrokerEvent {
    /// Canonical events are never shed by the forwarder.
    #[must_use]
    pub const fn is_canonical(&self) -> bool {
        !matches!(self, Self::Telemetry(_))
    }

    /// Short name for logs and metric labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Order(_) => "order",
            Self::Positions(_) => "positions",
            Self::AccountValue(_) => "account_value",
            Self::Commission(_) => "commission",
            Self::Quote(_) => "quote",
            Self::Telemetry(_) => "telemetry",
        }
    }
}

/// An order as listed in a snapshot or returned by an individual query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotOrder {
    /// Broker order id.
    pub broker_order_id: BrokerOrderId,
    /// Client order id, if the order was placed through this gateway.
    pub local_order_id: Option<LocalOrderId>,
    /// Instrument.
    pub instrument: InstrumentKey,
    /// Side.
    pub side: Side,
    /// Original quantity.
    pub quantity: Decimal,
    /// Broker status.
    pub status: OrderStatus,
    /// Cumulative filled quantity.
    pub filled_quantity: Decimal,
    /// Working quantity.
    pub remaining_quantity: Decimal,
    /// Average fill price.
    pub avg_fill_price: Option<Decimal>,
}

/// Authoritative account state returned by a snapshot request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    /// Account.
    pub account_id: AccountId,
    /// All positions.
    pub positions: Vec<SnapshotPosition>,
    /// All working orders.
    pub open_orders: Vec<SnapshotOrder>,
    /// Account values.
    pub account_values: Vec<AccountValueEvent>,
    /// Broker's order event cursor at snapshot time, if it has one.
    pub order_cursor: Option<EventId>,
    /// Snapshot time.
    pub as_of: DateTime<Utc>,
}

impl BrokerSnapshot {
    /// The position half of the snapshot.
    #[must_use]
    pub fn position_snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            account_id: self.account_id.clone(),
            positions: self.positions.clone(),
            as_of: self.as_of,
        }
    }
}

/// Result of an individual order query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "order", rename_all = "snake_case")]
pub enum OrderLookup {
    /// The broker knows the order.
    Found(SnapshotOrder),
    /// The broker has no such order.
    NotFound,
}
