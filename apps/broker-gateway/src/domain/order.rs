//! Orders
//!
//! Order intents, the broker-sourced order records they turn into, and the
//! forward-only status lattice those records move through.
//!
//! ```text
//! Pending ──► Submitted ──► PartiallyFilled ──► ClosedUnknown ──► Filled | Cancelled | Rejected
//!    └───────────┴──────────────┴──────────────────────┴──────────────────────▲
//! ```
//!
//! `ClosedUnknown` is set only by reconciliation when an open order vanishes
//! from a snapshot. A follow-up query may resolve it to a terminal status, or
//! confirm the broker still has it working. Only an update stamped after the
//! order was flagged may reopen it.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::connection::ConnectionState;
use super::identifiers::{AccountId, BrokerOrderId, EventId, InstrumentKey, LocalOrderId};

// ============================================================================
// Enums
// ============================================================================

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

impl Side {
    /// Apply the side's sign to an unsigned quantity.
    #[must_use]
    pub fn signed(self, quantity: Decimal) -> Decimal {
        match self {
            Self::Buy => quantity,
            Self::Sell => -quantity,
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Execute at the prevailing price.
    #[default]
    Market,
    /// Execute at the limit price or better.
    Limit,
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Intent registered, not yet acknowledged by the broker.
    #[default]
    Pending,
    /// Acknowledged and working.
    Submitted,
    /// Some quantity filled, remainder working.
    PartiallyFilled,
    /// Missing from a snapshot; cancelled or filled, unknown which.
    ClosedUnknown,
    /// Completely filled.
    Filled,
    /// Cancelled by the broker or the user.
    Cancelled,
    /// Rejected by the broker or by local admission.
    Rejected,
}

impl OrderStatus {
    /// Position in the lattice. Terminal statuses share the top rank.
    #[must_use]
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Submitted => 1,
            Self::PartiallyFilled => 2,
            Self::ClosedUnknown => 3,
            Self::Filled | Self::Cancelled | Self::Rejected => 4,
        }
    }

    /// Check if the status is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }

    /// Check if the order is believed to be working at the broker.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Submitted | Self::PartiallyFilled)
    }

    /// Whether moving from `self` to `next` keeps the lattice forward-only.
    ///
    /// Equal ranks are allowed for non-terminal statuses so repeated updates
    /// (e.g. a second partial fill) apply. A `ClosedUnknown` order may return
    /// to a working status when the broker confirms it is still live; the
    /// record additionally requires that confirmation to postdate the flag
    /// (see [`OrderRecord::check_advance`]).
    #[must_use]
    pub const fn can_advance_to(&self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(self, Self::ClosedUnknown)
            && matches!(next, Self::Submitted | Self::PartiallyFilled)
        {
            return true;
        }
        next.rank() >= self.rank()
    }

    /// Lowercase name for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::PartiallyFilled => "partially_filled",
            Self::ClosedUnknown => "closed_unknown",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Intents and receipts
// ============================================================================

/// Execution intent submitted by the caller.
///
/// `idempotency_key` becomes the local order id; resubmitting the same key
/// never creates a second order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Caller-chosen idempotency key.
    pub idempotency_key: LocalOrderId,
    /// Target account.
    pub account_id: AccountId,
    /// Instrument to trade.
    pub instrument: InstrumentKey,
    /// Buy or sell.
    pub side: Side,
    /// Market or limit.
    pub order_type: OrderType,
    /// Unsigned quantity.
    pub quantity: Decimal,
    /// Limit price, required for limit orders.
    pub limit_price: Option<Decimal>,
}

impl OrderIntent {
    /// Validate the intent before it reaches the broker.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.quantity <= Decimal::ZERO {
            return Err(format!("quantity must be positive, got {}", self.quantity));
        }
        match (self.order_type, self.limit_price) {
            (OrderType::Limit, None) => Err("limit order requires a limit price".to_string()),
            (OrderType::Limit, Some(p)) if p <= Decimal::ZERO => {
                Err(format!("limit price must be positive, got {p}"))
            }
            (OrderType::Market, Some(_)) => {
                Err("market order must not carry a limit price".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Why an intent was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    /// The intent failed local validation.
    Invalid(String),
    /// The session was not ready.
    NotConnected(ConnectionState),
    /// No order token before the admission deadline.
    RateLimited,
    /// Gateway health is down.
    Unhealthy(String),
    /// The transport refused the write.
    TransportFailure(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(e) => write!(f, "invalid intent: {e}"),
            Self::NotConnected(state) => write!(f, "not connected (state: {state})"),
            Self::RateLimited => f.write_str("rate limited"),
            Self::Unhealthy(e) => write!(f, "gateway unhealthy: {e}"),
            Self::TransportFailure(e) => write!(f, "transport failure: {e}"),
        }
    }
}

/// Synchronous answer to an intent. Never a fill guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OrderReceipt {
    /// Handed to the broker; facts arrive on the event stream.
    Accepted {
        /// Local order id.
        local_order_id: LocalOrderId,
    },
    /// Not sent.
    Rejected {
        /// Local order id.
        local_order_id: LocalOrderId,
        /// Why.
        reason: RejectReason,
    },
}

impl OrderReceipt {
    /// Check if the receipt is an acceptance.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    /// Rejection reason, if any.
    #[must_use]
    pub const fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            Self::Accepted { .. } => None,
            Self::Rejected { reason, .. } => Some(reason),
        }
    }
}

/// Requested change to a working order. Unset fields stay as they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderModification {
    /// New total quantity, filled part included.
    pub quantity: Option<Decimal>,
    /// New limit price.
    pub limit_price: Option<Decimal>,
}

impl OrderModification {
    /// Check if nothing would change.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.quantity.is_none() && self.limit_price.is_none()
    }

    /// Validate against the order it would change.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self, record: &OrderRecord) -> Result<(), String> {
        if self.is_empty() {
            return Err("modification changes nothing".to_string());
        }
        if let Some(quantity) = self.quantity {
            if quantity <= record.filled_quantity {
                return Err(format!(
                    "quantity {quantity} must exceed the filled {}",
                    record.filled_quantity
                ));
            }
        }
        match (self.limit_price, record.limit_price) {
            (Some(p), _) if p <= Decimal::ZERO => {
                Err(format!("limit price must be positive, got {p}"))
            }
            (Some(_), None) => Err("order has no limit price to modify".to_string()),
            _ => Ok(()),
        }
    }

    /// Whether the record already carries every requested value.
    #[must_use]
    pub fn is_reflected_in(&self, record: &OrderRecord) -> bool {
        self.quantity.is_none_or(|q| q == record.quantity)
            && self.limit_price.is_none_or(|p| Some(p) == record.limit_price)
    }
}

// ============================================================================
// Broker events
// ============================================================================

/// A single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    /// Executed quantity.
    pub quantity: Decimal,
    /// Execution price.
    pub price: Decimal,
}

/// Decoded order status update from the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEvent {
    /// Broker-assigned event id, used for deduplication.
    pub event_id: EventId,
    /// Owning account.
    pub account_id: AccountId,
    /// Broker order id.
    pub broker_order_id: BrokerOrderId,
    /// Client order id echoed back by the broker, if any.
    pub local_order_id: Option<LocalOrderId>,
    /// Instrument.
    pub instrument: InstrumentKey,
    /// Side.
    pub side: Side,
    /// Status reported by the broker.
    pub status: OrderStatus,
    /// Original order quantity.
    pub quantity: Decimal,
    /// Cumulative filled quantity.
    pub filled_quantity: Decimal,
    /// Quantity still working.
    pub remaining_quantity: Decimal,
    /// Average fill price so far.
    pub avg_fill_price: Option<Decimal>,
    /// The execution carried by this event, if any.
    pub last_fill: Option<Fill>,
    /// Broker timestamp.
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Record
// ============================================================================

/// Why an update was not applied to an order record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceRejection {
    /// The record is already terminal.
    Terminal(OrderStatus),
    /// The update would move the status backwards.
    StatusRegression {
        /// Current status.
        from: OrderStatus,
        /// Proposed status.
        to: OrderStatus,
    },
    /// The update reports less cumulative fill than already recorded.
    FillRegression {
        /// Recorded cumulative fill.
        from: Decimal,
        /// Proposed cumulative fill.
        to: Decimal,
    },
    /// A working status stamped no later than the moment reconciliation
    /// flagged the order `ClosedUnknown`.
    StaleReopen {
        /// When the order was flagged.
        flagged_at: DateTime<Utc>,
        /// Timestamp of the update.
        update_at: DateTime<Utc>,
    },
}

impl fmt::Display for AdvanceRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminal(s) => write!(f, "order already terminal ({s})"),
            Self::StatusRegression { from, to } => write!(f, "status regression {from} -> {to}"),
            Self::FillRegression { from, to } => write!(f, "filled quantity regression {from} -> {to}"),
            Self::StaleReopen { flagged_at, update_at } => write!(
                f,
                "update from {update_at} cannot reopen an order flagged at {flagged_at}"
            ),
        }
    }
}

/// Cached view of one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    /// Local id (the intent's idempotency key, or derived from the broker id
    /// for orders adopted from a snapshot).
    pub local_order_id: LocalOrderId,
    /// Broker id once acknowledged.
    pub broker_order_id: Option<BrokerOrderId>,
    /// Owning account.
    pub account_id: AccountId,
    /// Instrument.
    pub instrument: InstrumentKey,
    /// Side.
    pub side: Side,
    /// Original quantity.
    pub quantity: Decimal,
    /// Current status.
    pub status: OrderStatus,
    /// Cumulative filled quantity.
    pub filled_quantity: Decimal,
    /// Working quantity.
    pub remaining_quantity: Decimal,
    /// Average fill price.
    pub avg_fill_price: Option<Decimal>,
    /// Limit price as last requested, unknown for adopted orders.
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    /// Last transport error seen when submitting, if any.
    pub last_submit_error: Option<String>,
    /// When reconciliation last flagged the order `ClosedUnknown`.
    #[serde(default)]
    pub closed_unknown_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    /// Create a pending record for a new intent.
    #[must_use]
    pub fn from_intent(intent: &OrderIntent, now: DateTime<Utc>) -> Self {
        Self {
            local_order_id: intent.idempotency_key.clone(),
            broker_order_id: None,
            account_id: intent.account_id.clone(),
            instrument: intent.instrument.clone(),
            side: intent.side,
            quantity: intent.quantity,
            status: OrderStatus::Pending,
            filled_quantity: Decimal::ZERO,
            remaining_quantity: intent.quantity,
            avg_fill_price: None,
            limit_price: intent.limit_price,
            last_submit_error: None,
            closed_unknown_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a record for a broker order with no local intent.
    #[must_use]
    pub fn adopted(event: &OrderEvent) -> Self {
        Self {
            local_order_id: event
                .local_order_id
                .clone()
                .unwrap_or_else(|| LocalOrderId::new(format!("broker:{}", event.broker_order_id))),
            broker_order_id: Some(event.broker_order_id.clone()),
            account_id: event.account_id.clone(),
            instrument: event.instrument.clone(),
            side: event.side,
            quantity: event.quantity,
            status: OrderStatus::Pending,
            filled_quantity: Decimal::ZERO,
            remaining_quantity: event.quantity,
            avg_fill_price: None,
            limit_price: None,
            last_submit_error: None,
            closed_unknown_at: None,
            created_at: event.timestamp,
            updated_at: event.timestamp,
        }
    }

    /// Check a proposed update against the lattice without applying it.
    ///
    /// # Errors
    ///
    /// Returns the reason the update would be dropped.
    pub fn check_advance(
        &self,
        status: OrderStatus,
        filled_quantity: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), AdvanceRejection> {
        if self.status.is_terminal() {
            return Err(AdvanceRejection::Terminal(self.status));
        }
        if !self.status.can_advance_to(status) {
            return Err(AdvanceRejection::StatusRegression {
                from: self.status,
                to: status,
            });
        }
        if self.status == OrderStatus::ClosedUnknown && status.is_open() {
            if let Some(flagged_at) = self.closed_unknown_at.filter(|flagged| at <= *flagged) {
                return Err(AdvanceRejection::StaleReopen {
                    flagged_at,
                    update_at: at,
                });
            }
        }
        if filled_quantity < self.filled_quantity {
            return Err(AdvanceRejection::FillRegression {
                from: self.filled_quantity,
                to: filled_quantity,
            });
        }
        Ok(())
    }

    /// Apply a broker-sourced update. Returns the newly filled quantity.
    ///
    /// # Errors
    ///
    /// Returns the reason the update was dropped; the record is unchanged.
    pub fn advance(
        &mut self,
        status: OrderStatus,
        filled_quantity: Decimal,
        remaining_quantity: Decimal,
        avg_fill_price: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> Result<Decimal, AdvanceRejection> {
        self.check_advance(status, filled_quantity, at)?;

        let delta = filled_quantity - self.filled_quantity;
        if status == OrderStatus::ClosedUnknown && self.status != OrderStatus::ClosedUnknown {
            self.closed_unknown_at = Some(at);
        } else if status.is_open() {
            self.closed_unknown_at = None;
        }
        self.status = status;
        self.filled_quantity = filled_quantity;
        self.remaining_quantity = remaining_quantity;
        if avg_fill_price.is_some() {
            self.avg_fill_price = avg_fill_price;
        }
        if at > self.updated_at {
            self.updated_at = at;
        }
        Ok(delta)
    }

    /// Bind the broker id after acknowledgment.
    pub fn bind_broker_id(&mut self, broker_order_id: BrokerOrderId) {
        if self.broker_order_id.is_none() {
            self.broker_order_id = Some(broker_order_id);
        }
    }

    /// Mark as possibly closed after vanishing from a snapshot.
    ///
    /// Returns `false` if the record was not open.
    pub fn mark_closed_unknown(&mut self, at: DateTime<Utc>) -> bool {
        if !self.status.is_open() {
            return false;
        }
        self.status = OrderStatus::ClosedUnknown;
        self.closed_unknown_at = Some(at);
        self.updated_at = at;
        true
    }

    /// Check if the record is an open order.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use test_case::test_case;

    fn intent() -> OrderIntent {
        OrderIntent {
            idempotency_key: LocalOrderId::from("ord-1"),
            account_id: AccountId::from("DU123"),
            instrument: InstrumentKey::from("AAPL"),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: dec!(10),
            limit_price: Some(dec!(150.25)),
        }
    }

    fn record() -> OrderRecord {
        OrderRecord::from_intent(&intent(), Utc::now())
    }

    #[test]
    fn new_record_is_pending_and_open() {
        let r = record();
        assert_eq!(r.status, OrderStatus::Pending);
        assert_eq!(r.remaining_quantity, dec!(10));
        assert!(r.is_open());
    }

    #[test]
    fn validate_rejects_nonpositive_quantity() {
        let mut i = intent();
        i.quantity = dec!(0);
        assert!(i.validate().is_err());
    }

    #[test]
    fn validate_requires_limit_price() {
        let mut i = intent();
        i.limit_price = None;
        assert!(i.validate().is_err());
        i.order_type = OrderType::Market;
        assert!(i.validate().is_ok());
    }

    #[test]
    fn advance_reports_fill_delta() {
        let mut r = record();
        let now = Utc::now();
        assert_eq!(
            r.advance(OrderStatus::Submitted, dec!(0), dec!(10), None, now),
            Ok(dec!(0))
        );
        assert_eq!(
            r.advance(OrderStatus::PartiallyFilled, dec!(4), dec!(6), Some(dec!(150)), now),
            Ok(dec!(4))
        );
        assert_eq!(
            r.advance(OrderStatus::PartiallyFilled, dec!(7), dec!(3), Some(dec!(150.1)), now),
            Ok(dec!(3))
        );
        assert_eq!(
            r.advance(OrderStatus::Filled, dec!(10), dec!(0), Some(dec!(150.2)), now),
            Ok(dec!(3))
        );
        assert_eq!(r.status, OrderStatus::Filled);
        assert_eq!(r.avg_fill_price, Some(dec!(150.2)));
    }

    #[test]
    fn terminal_record_is_frozen() {
        let mut r = record();
        let now = Utc::now();
        r.advance(OrderStatus::Filled, dec!(10), dec!(0), None, now).unwrap();
        let before = r.clone();
        assert_eq!(
            r.advance(OrderStatus::Cancelled, dec!(10), dec!(0), None, now),
            Err(AdvanceRejection::Terminal(OrderStatus::Filled))
        );
        assert_eq!(r, before);
    }

    #[test]
    fn fill_regression_is_dropped() {
        let mut r = record();
        let now = Utc::now();
        r.advance(OrderStatus::PartiallyFilled, dec!(5), dec!(5), None, now).unwrap();
        assert!(matches!(
            r.advance(OrderStatus::PartiallyFilled, dec!(3), dec!(7), None, now),
            Err(AdvanceRejection::FillRegression { .. })
        ));
        assert_eq!(r.filled_quantity, dec!(5));
    }

    #[test]
    fn closed_unknown_resolves_or_reopens() {
        let mut r = record();
        let now = Utc::now();
        r.advance(OrderStatus::Submitted, dec!(0), dec!(10), None, now).unwrap();
        assert!(r.mark_closed_unknown(now));
        assert_eq!(r.closed_unknown_at, Some(now));
        assert!(!r.is_open());
        assert!(r.status.can_advance_to(OrderStatus::Cancelled));
        assert!(r.status.can_advance_to(OrderStatus::Submitted));
        assert!(!r.status.can_advance_to(OrderStatus::Pending));
    }

    #[test_case(-5, false; "update from before the flag")]
    #[test_case(0, false; "update stamped at the flag")]
    #[test_case(5, true; "update from after the flag")]
    fn reopen_needs_a_later_update(offset_secs: i64, reopens: bool) {
        let mut r = record();
        let flagged_at = Utc::now();
        r.advance(OrderStatus::Submitted, dec!(0), dec!(10), None, flagged_at)
            .unwrap();
        r.mark_closed_unknown(flagged_at);

        let update_at = flagged_at + chrono::Duration::seconds(offset_secs);
        let result = r.advance(OrderStatus::Submitted, dec!(0), dec!(10), None, update_at);
        assert_eq!(result.is_ok(), reopens);
        if reopens {
            assert_eq!(r.status, OrderStatus::Submitted);
            assert_eq!(r.closed_unknown_at, None);
        } else {
            assert_eq!(
                result,
                Err(AdvanceRejection::StaleReopen {
                    flagged_at,
                    update_at
                })
            );
            assert_eq!(r.status, OrderStatus::ClosedUnknown);
        }
    }

    #[test]
    fn stale_update_cannot_reopen_but_may_still_settle() {
        let mut r = record();
        let flagged_at = Utc::now();
        r.advance(OrderStatus::Submitted, dec!(0), dec!(10), None, flagged_at)
            .unwrap();
        r.mark_closed_unknown(flagged_at);

        let earlier = flagged_at - chrono::Duration::seconds(1);
        assert!(
            r.advance(OrderStatus::PartiallyFilled, dec!(2), dec!(8), None, earlier)
                .is_err()
        );
        assert_eq!(
            r.advance(OrderStatus::Filled, dec!(10), dec!(0), None, earlier),
            Ok(dec!(10))
        );
    }

    #[test]
    fn modification_is_checked_against_the_record() {
        let mut r = record();
        r.advance(OrderStatus::PartiallyFilled, dec!(4), dec!(6), None, Utc::now())
            .unwrap();

        assert!(OrderModification::default().validate(&r).is_err());
        let shrink = OrderModification {
            quantity: Some(dec!(4)),
            limit_price: None,
        };
        assert!(shrink.validate(&r).is_err());
        let reprice = OrderModification {
            quantity: Some(dec!(12)),
            limit_price: Some(dec!(149.5)),
        };
        assert_eq!(reprice.validate(&r), Ok(()));
        assert!(!reprice.is_reflected_in(&r));

        r.limit_price = None;
        assert!(reprice.validate(&r).is_err());
    }

    #[test]
    fn modification_already_reflected() {
        let r = record();
        let same = OrderModification {
            quantity: Some(dec!(10)),
            limit_price: Some(dec!(150.25)),
        };
        assert!(same.is_reflected_in(&r));
    }

    #[test_case(OrderStatus::Submitted, OrderStatus::Pending; "submitted to pending")]
    #[test_case(OrderStatus::PartiallyFilled, OrderStatus::Submitted; "partial to submitted")]
    #[test_case(OrderStatus::Filled, OrderStatus::Pending; "filled to pending")]
    #[test_case(OrderStatus::Cancelled, OrderStatus::Filled; "cancelled to filled")]
    #[test_case(OrderStatus::Rejected, OrderStatus::Rejected; "rejected again")]
    fn regressions_are_illegal(from: OrderStatus, to: OrderStatus) {
        assert!(!from.can_advance_to(to));
    }

    fn any_status() -> impl Strategy<Value = OrderStatus> {
        prop_oneof![
            Just(OrderStatus::Pending),
            Just(OrderStatus::Submitted),
            Just(OrderStatus::PartiallyFilled),
            Just(OrderStatus::ClosedUnknown),
            Just(OrderStatus::Filled),
            Just(OrderStatus::Cancelled),
            Just(OrderStatus::Rejected),
        ]
    }

    proptest! {
        #[test]
        fn applied_sequences_never_regress(statuses in prop::collection::vec(any_status(), 1..30)) {
            // one timestamp throughout: nothing is newer than a flag, so
            // nothing may reopen
            let mut r = record();
            let now = Utc::now();
            let mut seen_terminal = false;
            for status in statuses {
                let before = r.status;
                let applied = r
                    .advance(status, r.filled_quantity, r.remaining_quantity, None, now)
                    .is_ok();
                if seen_terminal {
                    prop_assert!(!applied);
                }
                prop_assert!(r.status.rank() >= before.rank());
                seen_terminal |= r.status.is_terminal();
            }
        }
    }
}
