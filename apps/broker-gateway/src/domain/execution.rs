//! Executions and the commissions the broker charges for them.
//!
//! An execution is recorded for every fill quantity the cache applies from
//! the event stream, keyed by the id of the event that carried it. Commission
//! reports arrive separately and are matched to their execution by that id.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::identifiers::{AccountId, BrokerOrderId, EventId, InstrumentKey, LocalOrderId};
use super::order::Side;

/// One execution against an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    /// Id of the broker event that carried the fill.
    pub execution_id: EventId,
    /// Owning account.
    pub account_id: AccountId,
    /// Local order id.
    pub local_order_id: LocalOrderId,
    /// Broker order id.
    pub broker_order_id: BrokerOrderId,
    /// Instrument.
    pub instrument: InstrumentKey,
    /// Side.
    pub side: Side,
    /// Executed quantity.
    pub quantity: Decimal,
    /// Execution price.
    pub price: Decimal,
    /// Commission, once reported.
    pub commission: Option<Decimal>,
    /// Commission currency, once reported.
    pub commission_currency: Option<String>,
    /// Broker timestamp of the fill.
    pub timestamp: DateTime<Utc>,
}

impl Execution {
    /// Signed notional: negative for buys, positive for sells.
    #[must_use]
    pub fn cash_flow(&self) -> Decimal {
        -self.side.signed(self.quantity * self.price)
    }
}

/// Commission report for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionEvent {
    /// Owning account.
    pub account_id: AccountId,
    /// Id of the fill event the commission belongs to.
    pub execution_id: EventId,
    /// Amount charged.
    pub commission: Decimal,
    /// Currency of the charge.
    pub currency: String,
    /// Broker timestamp.
    pub timestamp: DateTime<Utc>,
}
