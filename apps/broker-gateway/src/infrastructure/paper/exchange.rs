//! Simulated broker book: orders, positions and account values for one
//! account, plus the event stream they produce.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Utc;
use rust_decimal::Decimal;

use crate::application::ports::{BrokerRequest, BrokerResponse, InboundMessage, RequestId};
use crate::domain::account::AccountValueEvent;
use crate::domain::events::{BrokerEvent, BrokerSnapshot, OrderLookup, SnapshotOrder};
use crate::domain::execution::CommissionEvent;
use crate::domain::market::QuoteEvent;
use crate::domain::order::{Fill, OrderEvent, OrderIntent, OrderStatus};
use crate::domain::position::SnapshotPosition;
use crate::domain::{AccountId, BrokerOrderId, EventId, InstrumentKey, LocalOrderId};

/// How placed orders execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    /// Acknowledge and fill in full at the fill price right away.
    #[default]
    Immediate,
    /// Acknowledge only. Fills come from [`Exchange::fill`].
    Manual,
}

#[derive(Debug, Clone)]
struct BookOrder {
    order: SnapshotOrder,
    notional: Decimal,
    limit_price: Option<Decimal>,
}

/// Per-share commission with a floor per execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommissionSchedule {
    /// Charged per unit executed.
    pub per_unit: Decimal,
    /// Smallest charge for one execution.
    pub minimum: Decimal,
}

impl CommissionSchedule {
    fn charge(&self, quantity: Decimal) -> Decimal {
        (self.per_unit * quantity).max(self.minimum)
    }
}

#[derive(Debug, Clone, Copy)]
struct Holding {
    quantity: Decimal,
    avg_cost: Decimal,
}

/// The book behind the paper broker.
#[derive(Debug)]
pub(super) struct Exchange {
    account_id: AccountId,
    pub(super) fill_mode: FillMode,
    pub(super) fill_price: Decimal,
    pub(super) commission: Option<CommissionSchedule>,
    pub(super) fill_after_snapshot: Option<(LocalOrderId, Decimal)>,
    orders: HashMap<BrokerOrderId, BookOrder>,
    by_client_id: HashMap<LocalOrderId, BrokerOrderId>,
    holdings: BTreeMap<InstrumentKey, Holding>,
    cash: Decimal,
    subscriptions: BTreeSet<InstrumentKey>,
    next_order: u64,
    next_event: u64,
    last_order_event: Option<EventId>,
}

impl Exchange {
    pub(super) fn new(account_id: AccountId, starting_cash: Decimal) -> Self {
        Self {
            account_id,
            fill_mode: FillMode::default(),
            fill_price: Decimal::ONE_HUNDRED,
            commission: None,
            fill_after_snapshot: None,
            orders: HashMap::new(),
            by_client_id: HashMap::new(),
            holdings: BTreeMap::new(),
            cash: starting_cash,
            subscriptions: BTreeSet::new(),
            next_order: 0,
            next_event: 0,
            last_order_event: None,
        }
    }

    pub(super) const fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// Streams die with the session.
    pub(super) fn drop_subscriptions(&mut self) {
        self.subscriptions.clear();
    }

    pub(super) fn subscriptions(&self) -> Vec<InstrumentKey> {
        self.subscriptions.iter().cloned().collect()
    }

    /// Handle one request. Returns the messages to deliver, in order.
    ///
    /// An armed after-snapshot fill executes right behind the snapshot's
    /// answer, so its events follow the response on the stream.
    pub(super) fn handle(
        &mut self,
        request_id: Option<RequestId>,
        request: BrokerRequest,
    ) -> Vec<InboundMessage> {
        let mut out = Vec::new();
        let mut fill_after = None;
        let result = match request {
            BrokerRequest::Heartbeat => Ok(BrokerResponse::Ack),
            BrokerRequest::PlaceOrder(intent) => {
                self.place(&intent, &mut out);
                Ok(BrokerResponse::Ack)
            }
            BrokerRequest::CancelOrder { broker_order_id } => {
                self.cancel(&broker_order_id, &mut out)
            }
            BrokerRequest::ModifyOrder {
                broker_order_id,
                quantity,
                limit_price,
                ..
            } => self.modify(&broker_order_id, quantity, limit_price, &mut out),
            BrokerRequest::SubscribeMarketData(subscription) => {
                self.subscriptions.insert(subscription.instrument);
                Ok(BrokerResponse::Ack)
            }
            BrokerRequest::UnsubscribeMarketData { instrument } => {
                self.subscriptions.remove(&instrument);
                Ok(BrokerResponse::Ack)
            }
            BrokerRequest::Snapshot { account_id, .. } => {
                if account_id == self.account_id {
                    fill_after = self.fill_after_snapshot.take();
                    Ok(BrokerResponse::Snapshot(self.snapshot()))
                } else {
                    Err(format!("unknown account {account_id}"))
                }
            }
            BrokerRequest::QueryOrder {
                broker_order_id,
                local_order_id,
                ..
            } => Ok(BrokerResponse::Order(
                self.lookup(broker_order_id.as_ref(), &local_order_id),
            )),
        };

        if let Some(request_id) = request_id {
            out.push(InboundMessage::Response { request_id, result });
        }
        if let Some((local_order_id, quantity)) = fill_after {
            out.extend(self.fill(&local_order_id, quantity));
        }
        out
    }

    fn place(&mut self, intent: &OrderIntent, out: &mut Vec<InboundMessage>) {
        if self.by_client_id.contains_key(&intent.idempotency_key) {
            tracing::debug!(
                local_order_id = %intent.idempotency_key,
                "Paper broker ignoring duplicate client order id"
            );
            return;
        }

        self.next_order += 1;
        let broker_order_id = BrokerOrderId::from(format!("P-{}", self.next_order));
        let status = if intent.account_id == self.account_id {
            OrderStatus::Submitted
        } else {
            OrderStatus::Rejected
        };
        let order = SnapshotOrder {
            broker_order_id: broker_order_id.clone(),
            local_order_id: Some(intent.idempotency_key.clone()),
            instrument: intent.instrument.clone(),
            side: intent.side,
            quantity: intent.quantity,
            status,
            filled_quantity: Decimal::ZERO,
            remaining_quantity: intent.quantity,
            avg_fill_price: None,
        };
        self.by_client_id
            .insert(intent.idempotency_key.clone(), broker_order_id.clone());
        out.push(self.order_event(order.clone(), None));
        self.orders.insert(
            broker_order_id.clone(),
            BookOrder {
                order,
                notional: Decimal::ZERO,
                limit_price: intent.limit_price,
            },
        );

        if status == OrderStatus::Submitted && self.fill_mode == FillMode::Immediate {
            self.execute(&broker_order_id, intent.quantity, out);
        }
    }

    fn cancel(
        &mut self,
        broker_order_id: &BrokerOrderId,
        out: &mut Vec<InboundMessage>,
    ) -> Result<BrokerResponse, String> {
        let Some(book) = self.orders.get_mut(broker_order_id) else {
            return Err(format!("unknown order {broker_order_id}"));
        };
        if book.order.status.is_terminal() {
            return Err(format!("order {broker_order_id} is {}", book.order.status));
        }
        book.order.status = OrderStatus::Cancelled;
        let order = book.order.clone();
        out.push(self.order_event(order, None));
        Ok(BrokerResponse::Ack)
    }

    fn modify(
        &mut self,
        broker_order_id: &BrokerOrderId,
        quantity: Option<Decimal>,
        limit_price: Option<Decimal>,
        out: &mut Vec<InboundMessage>,
    ) -> Result<BrokerResponse, String> {
        let Some(book) = self.orders.get_mut(broker_order_id) else {
            return Err(format!("unknown order {broker_order_id}"));
        };
        if book.order.status.is_terminal() {
            return Err(format!("order {broker_order_id} is {}", book.order.status));
        }
        if let Some(quantity) = quantity {
            if quantity <= book.order.filled_quantity {
                return Err(format!(
                    "quantity {quantity} does not exceed filled {}",
                    book.order.filled_quantity
                ));
            }
            book.order.quantity = quantity;
            book.order.remaining_quantity = quantity - book.order.filled_quantity;
        }
        if limit_price.is_some() {
            book.limit_price = limit_price;
        }
        let order = book.order.clone();
        out.push(self.order_event(order, None));
        Ok(BrokerResponse::Ack)
    }

    /// Fill up to `quantity` of a working order at the fill price.
    pub(super) fn fill(
        &mut self,
        local_order_id: &LocalOrderId,
        quantity: Decimal,
    ) -> Vec<InboundMessage> {
        let mut out = Vec::new();
        if let Some(broker_order_id) = self.by_client_id.get(local_order_id).cloned() {
            self.execute(&broker_order_id, quantity, &mut out);
        }
        out
    }

    fn execute(
        &mut self,
        broker_order_id: &BrokerOrderId,
        quantity: Decimal,
        out: &mut Vec<InboundMessage>,
    ) {
        let price = self.fill_price;
        let Some(book) = self.orders.get_mut(broker_order_id) else {
            return;
        };
        if book.order.status.is_terminal() {
            return;
        }
        let quantity = quantity.min(book.order.remaining_quantity);
        if quantity <= Decimal::ZERO {
            return;
        }

        book.notional += quantity * price;
        book.order.filled_quantity += quantity;
        book.order.remaining_quantity -= quantity;
        book.order.avg_fill_price = Some(book.notional / book.order.filled_quantity);
        book.order.status = if book.order.remaining_quantity.is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let signed = book.order.side.signed(quantity);
        let order = book.order.clone();
        let instrument = order.instrument.clone();

        out.push(self.order_event(order, Some(Fill { quantity, price })));
        self.apply_fill(&instrument, signed, price);
        self.cash -= signed * price;

        if let (Some(schedule), Some(execution_id)) =
            (self.commission, self.last_order_event.clone())
        {
            let commission = schedule.charge(quantity);
            self.cash -= commission;
            out.push(InboundMessage::Event(BrokerEvent::Commission(
                CommissionEvent {
                    account_id: self.account_id.clone(),
                    execution_id,
                    commission,
                    currency: "USD".to_string(),
                    timestamp: Utc::now(),
                },
            )));
        }
        out.push(InboundMessage::Event(BrokerEvent::AccountValue(
            self.cash_value(),
        )));
    }

    fn apply_fill(&mut self, instrument: &InstrumentKey, signed: Decimal, price: Decimal) {
        let holding = self.holdings.entry(instrument.clone()).or_insert(Holding {
            quantity: Decimal::ZERO,
            avg_cost: Decimal::ZERO,
        });
        let next = holding.quantity + signed;
        if holding.quantity.is_zero() || holding.quantity.is_sign_positive() == signed.is_sign_positive()
        {
            holding.avg_cost =
                (holding.avg_cost * holding.quantity.abs() + price * signed.abs()) / next.abs();
        } else if next.is_sign_positive() != holding.quantity.is_sign_positive() && !next.is_zero() {
            holding.avg_cost = price;
        }
        holding.quantity = next;
        if next.is_zero() {
            self.holdings.remove(instrument);
        }
    }

    fn order_event(&mut self, order: SnapshotOrder, last_fill: Option<Fill>) -> InboundMessage {
        self.next_event += 1;
        let event_id = EventId::from(format!("pe-{}", self.next_event));
        self.last_order_event = Some(event_id.clone());

        InboundMessage::Event(BrokerEvent::Order(OrderEvent {
            event_id,
            account_id: self.account_id.clone(),
            broker_order_id: order.broker_order_id,
            local_order_id: order.local_order_id,
            instrument: order.instrument,
            side: order.side,
            status: order.status,
            quantity: order.quantity,
            filled_quantity: order.filled_quantity,
            remaining_quantity: order.remaining_quantity,
            avg_fill_price: order.avg_fill_price,
            last_fill,
            timestamp: Utc::now(),
        }))
    }

    fn cash_value(&self) -> AccountValueEvent {
        AccountValueEvent {
            account_id: self.account_id.clone(),
            key: "CashBalance".to_string(),
            value: self.cash.to_string(),
            currency: "USD".to_string(),
            timestamp: Utc::now(),
        }
    }

    fn lookup(
        &self,
        broker_order_id: Option<&BrokerOrderId>,
        local_order_id: &LocalOrderId,
    ) -> OrderLookup {
        let id = broker_order_id.or_else(|| self.by_client_id.get(local_order_id));
        id.and_then(|id| self.orders.get(id))
            .map_or(OrderLookup::NotFound, |book| {
                OrderLookup::Found(book.order.clone())
            })
    }

    pub(super) fn snapshot(&self) -> BrokerSnapshot {
        let mut open_orders: Vec<SnapshotOrder> = self
            .orders
            .values()
            .filter(|book| !book.order.status.is_terminal())
            .map(|book| book.order.clone())
            .collect();
        open_orders.sort_by(|a, b| a.broker_order_id.cmp(&b.broker_order_id));

        BrokerSnapshot {
            account_id: self.account_id.clone(),
            positions: self
                .holdings
                .iter()
                .map(|(instrument, holding)| SnapshotPosition {
                    instrument: instrument.clone(),
                    quantity: holding.quantity,
                    avg_cost: holding.avg_cost,
                })
                .collect(),
            open_orders,
            account_values: vec![self.cash_value()],
            order_cursor: self.last_order_event.clone(),
            as_of: Utc::now(),
        }
    }

    /// Quotes for every subscribed instrument around the fill price.
    pub(super) fn quotes(&self) -> Vec<InboundMessage> {
        let spread = Decimal::new(1, 2);
        self.subscriptions
            .iter()
            .map(|instrument| {
                InboundMessage::Event(BrokerEvent::Quote(QuoteEvent {
                    instrument: instrument.clone(),
                    bid: Some(self.fill_price - spread),
                    ask: Some(self.fill_price + spread),
                    bid_size: Some(Decimal::ONE_HUNDRED),
                    ask_size: Some(Decimal::ONE_HUNDRED),
                    last: Some(self.fill_price),
                    timestamp: Utc::now(),
                }))
            })
            .collect()
    }

    /// Overwrite a holding without emitting anything.
    pub(super) fn set_position(&mut self, instrument: InstrumentKey, quantity: Decimal, avg_cost: Decimal) {
        if quantity.is_zero() {
            self.holdings.remove(&instrument);
        } else {
            self.holdings.insert(instrument, Holding { quantity, avg_cost });
        }
    }

    /// Move an order to `status` without emitting an event.
    pub(super) fn settle_silently(&mut self, local_order_id: &LocalOrderId, status: OrderStatus) -> bool {
        let Some(broker_order_id) = self.by_client_id.get(local_order_id) else {
            return false;
        };
        let Some(book) = self.orders.get_mut(broker_order_id) else {
            return false;
        };
        book.order.status = status;
        if status == OrderStatus::Filled {
            book.order.filled_quantity = book.order.quantity;
            book.order.remaining_quantity = Decimal::ZERO;
            book.order.avg_fill_price.get_or_insert(self.fill_price);
        }
        true
    }

    /// Remove every trace of an order.
    pub(super) fn forget(&mut self, local_order_id: &LocalOrderId) -> bool {
        self.by_client_id
            .remove(local_order_id)
            .and_then(|id| self.orders.remove(&id))
            .is_some()
    }
}
