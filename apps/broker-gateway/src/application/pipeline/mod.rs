//! Event Pipeline
//!
//! The single FIFO through which every state mutation flows: broker events
//! and snapshot answers from the connection's inbound loop, plus follow-up
//! query results. One consumer applies them to the [`StateManager`] in
//! arrival order and then forwards the raw events downstream.
//!
//! Snapshot answers are staged by the inbound loop at the point the broker's
//! response was read, so a fill the broker sent after taking the snapshot is
//! always applied after it, never erased by it.
//!
//! The queue is unbounded: the inbound task only enqueues and never waits.

mod forward;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::application::state::{OrderReconciliation, Resolution, StateManager};
use crate::domain::events::{BrokerEvent, BrokerSnapshot, OrderLookup};
use crate::domain::position::PositionDiff;
use crate::domain::{AccountId, LocalOrderId};
use crate::error::GatewayError;

pub use forward::{EventForwarder, ForwarderSettings, ForwarderStats};

/// What applying a reconciliation snapshot changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotOutcome {
    /// Position changes.
    pub positions: PositionDiff,
    /// Order changes.
    pub orders: OrderReconciliation,
    /// Account values that changed.
    pub account_values_changed: usize,
}

/// Receives the outcome of a staged snapshot.
pub type SnapshotReply = oneshot::Sender<Result<SnapshotOutcome, GatewayError>>;

/// A unit of work for the consumer.
#[derive(Debug)]
pub enum PipelineMessage {
    /// Broker-pushed event.
    Event(BrokerEvent),
    /// Authoritative snapshot from reconciliation.
    Snapshot {
        /// The snapshot.
        snapshot: BrokerSnapshot,
        /// Receives the outcome once applied.
        reply: SnapshotReply,
    },
    /// Answer to a follow-up order query.
    Resolution {
        /// Account.
        account_id: AccountId,
        /// Order being resolved.
        local_order_id: LocalOrderId,
        /// Broker answer.
        lookup: OrderLookup,
        /// Receives the outcome once applied.
        reply: oneshot::Sender<Resolution>,
    },
}

/// The pipeline consumer has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event pipeline closed")]
pub struct PipelineClosed;

/// Producer side of the pipeline. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PipelineSender {
    tx: mpsc::UnboundedSender<PipelineMessage>,
}

impl PipelineSender {
    /// Enqueue a broker event. Never waits.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineClosed`] if the consumer has stopped.
    pub fn publish(&self, event: BrokerEvent) -> Result<(), PipelineClosed> {
        self.tx
            .send(PipelineMessage::Event(event))
            .map_err(|_| PipelineClosed)
    }

    /// Enqueue a snapshot answer behind everything already published.
    /// Never waits; `reply` receives the outcome once it has been applied.
    ///
    /// A snapshot for another account than `expected` is answered with
    /// [`GatewayError::UnexpectedResponse`] and never applied.
    pub fn stage_snapshot(
        &self,
        expected: &AccountId,
        snapshot: BrokerSnapshot,
        reply: SnapshotReply,
    ) {
        if &snapshot.account_id != expected {
            let _ = reply.send(Err(GatewayError::UnexpectedResponse(format!(
                "snapshot for account {}, expected {expected}",
                snapshot.account_id
            ))));
            return;
        }
        if let Err(mpsc::error::SendError(message)) =
            self.tx.send(PipelineMessage::Snapshot { snapshot, reply })
        {
            if let PipelineMessage::Snapshot { reply, .. } = message {
                let _ = reply.send(Err(GatewayError::ShuttingDown));
            }
        }
    }

    /// Enqueue a follow-up answer and wait until it has been applied.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineClosed`] if the consumer has stopped.
    pub async fn apply_resolution(
        &self,
        account_id: AccountId,
        local_order_id: LocalOrderId,
        lookup: OrderLookup,
    ) -> Result<Resolution, PipelineClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PipelineMessage::Resolution {
                account_id,
                local_order_id,
                lookup,
                reply,
            })
            .map_err(|_| PipelineClosed)?;
        rx.await.map_err(|_| PipelineClosed)
    }
}

/// Create the pipeline queue.
#[must_use]
pub fn channel() -> (PipelineSender, mpsc::UnboundedReceiver<PipelineMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PipelineSender { tx }, rx)
}

/// The single consumer task.
#[derive(Debug)]
pub struct PipelineConsumer {
    state: Arc<StateManager>,
    forwarder: EventForwarder,
    rx: mpsc::UnboundedReceiver<PipelineMessage>,
    flush_interval: Duration,
    cancel: CancellationToken,
}

impl PipelineConsumer {
    /// Create a consumer.
    #[must_use]
    pub const fn new(
        state: Arc<StateManager>,
        forwarder: EventForwarder,
        rx: mpsc::UnboundedReceiver<PipelineMessage>,
        flush_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            forwarder,
            rx,
            flush_interval,
            cancel,
        }
    }

    /// Run until cancelled or every sender is gone. Messages already queued
    /// at cancellation are still applied.
    pub async fn run(mut self) {
        let mut flush = tokio::time::interval(self.flush_interval);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    self.rx.close();
                    while let Some(message) = self.rx.recv().await {
                        self.handle(message);
                    }
                    self.forwarder.flush();
                    tracing::info!(
                        backlog = self.forwarder.stats().backlog,
                        "Event pipeline stopped"
                    );
                    break;
                }

                message = self.rx.recv() => {
                    let Some(message) = message else {
                        tracing::info!("Event pipeline senders dropped");
                        break;
                    };
                    self.handle(message);
                }

                _ = flush.tick() => {
                    self.forwarder.flush();
                }
            }
        }
    }

    /// Apply one message, then forward any raw event.
    pub fn handle(&mut self, message: PipelineMessage) {
        match message {
            PipelineMessage::Event(event) => {
                self.apply_event(&event);
                self.forwarder.forward(event);
            }
            PipelineMessage::Snapshot { snapshot, reply } => {
                let outcome = self.apply_snapshot(&snapshot);
                let _ = reply.send(Ok(outcome));
            }
            PipelineMessage::Resolution {
                account_id,
                local_order_id,
                lookup,
                reply,
            } => {
                let resolution =
                    self.state
                        .resolve_order(&account_id, &local_order_id, &lookup, Utc::now());
                let _ = reply.send(resolution);
            }
        }
    }

    fn apply_event(&self, event: &BrokerEvent) {
        metrics::counter!("gateway_events_received_total", "kind" => event.kind()).increment(1);
        match event {
            BrokerEvent::Order(order) => {
                self.state.apply_order_event(order);
            }
            BrokerEvent::Positions(snapshot) => {
                self.state.apply_position_snapshot(snapshot);
            }
            BrokerEvent::AccountValue(value) => {
                self.state.apply_account_value(value);
            }
            BrokerEvent::Commission(commission) => {
                self.state.apply_commission(commission);
            }
            BrokerEvent::Quote(quote) => {
                self.state.apply_quote(quote);
            }
            BrokerEvent::Telemetry(_) => {}
        }
    }

    fn apply_snapshot(&self, snapshot: &BrokerSnapshot) -> SnapshotOutcome {
        let positions = self
            .state
            .apply_position_snapshot(&snapshot.position_snapshot());
        let orders = self.state.reconcile_orders(
            &snapshot.account_id,
            &snapshot.open_orders,
            snapshot.order_cursor.as_ref(),
            snapshot.as_of,
        );
        let account_values_changed = snapshot
            .account_values
            .iter()
            .filter(|v| self.state.apply_account_value(v))
            .count();

        SnapshotOutcome {
            positions,
            orders,
            account_values_changed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::health::HealthMonitor;
    use crate::domain::order::{OrderEvent, OrderStatus, Side};
    use crate::domain::position::SnapshotPosition;
    use crate::domain::{BrokerOrderId, EventId, InstrumentKey};
    use rust_decimal_macros::dec;

    fn consumer() -> (
        PipelineSender,
        PipelineConsumer,
        Arc<StateManager>,
        mpsc::Receiver<BrokerEvent>,
    ) {
        let state = Arc::new(StateManager::new(AccountId::from("DU1")));
        let (sink_tx, sink_rx) = mpsc::channel(64);
        let forwarder = EventForwarder::new(
            Arc::new(sink_tx),
            Arc::new(HealthMonitor::new()),
            ForwarderSettings::default(),
        );
        let (tx, rx) = channel();
        let consumer = PipelineConsumer::new(
            Arc::clone(&state),
            forwarder,
            rx,
            Duration::from_millis(50),
            CancellationToken::new(),
        );
        (tx, consumer, state, sink_rx)
    }

    fn fill_event(id: &str, filled: rust_decimal::Decimal) -> BrokerEvent {
        BrokerEvent::Order(OrderEvent {
            event_id: EventId::from(id),
            account_id: AccountId::from("DU1"),
            broker_order_id: BrokerOrderId::from("B-1"),
            local_order_id: None,
            instrument: InstrumentKey::from("SPY"),
            side: Side::Buy,
            status: OrderStatus::PartiallyFilled,
            quantity: dec!(10),
            filled_quantity: filled,
            remaining_quantity: dec!(10) - filled,
            avg_fill_price: Some(dec!(500)),
            last_fill: None,
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn events_are_applied_then_forwarded() {
        let (tx, mut consumer, state, mut sink) = consumer();
        tx.publish(fill_event("e-1", dec!(2))).unwrap();

        let message = consumer.rx.recv().await.unwrap();
        consumer.handle(message);

        assert_eq!(
            state.get_position(&InstrumentKey::from("SPY")).unwrap().quantity,
            dec!(2)
        );
        assert_eq!(sink.recv().await.unwrap().kind(), "order");
    }

    fn spy_snapshot(account: &str, quantity: rust_decimal::Decimal) -> BrokerSnapshot {
        BrokerSnapshot {
            account_id: AccountId::from(account),
            positions: vec![SnapshotPosition {
                instrument: InstrumentKey::from("SPY"),
                quantity,
                avg_cost: dec!(500),
            }],
            open_orders: Vec::new(),
            account_values: Vec::new(),
            order_cursor: None,
            as_of: Utc::now(),
        }
    }

    #[tokio::test]
    async fn snapshot_is_serialized_behind_queued_fills() {
        let (tx, consumer, state, _sink) = consumer();
        let cancel = consumer.cancel.clone();
        let task = tokio::spawn(consumer.run());

        tx.publish(fill_event("e-1", dec!(3))).unwrap();
        let (reply, outcome) = oneshot::channel();
        tx.stage_snapshot(&AccountId::from("DU1"), spy_snapshot("DU1", dec!(3)), reply);
        let outcome = outcome.await.unwrap().unwrap();

        // the fill landed first, so the snapshot saw a matching position
        assert!(!outcome.positions.has_changes());
        assert_eq!(
            state.get_position(&InstrumentKey::from("SPY")).unwrap().quantity,
            dec!(3)
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn fill_published_after_staging_applies_on_top_of_snapshot() {
        let (tx, mut consumer, state, _sink) = consumer();

        let (reply, outcome) = oneshot::channel();
        tx.stage_snapshot(&AccountId::from("DU1"), spy_snapshot("DU1", dec!(0)), reply);
        tx.publish(fill_event("e-1", dec!(4))).unwrap();
        for _ in 0..2 {
            let message = consumer.rx.recv().await.unwrap();
            consumer.handle(message);
        }

        outcome.await.unwrap().unwrap();
        let position = state.get_position(&InstrumentKey::from("SPY")).unwrap();
        assert_eq!(position.quantity, dec!(4));
        assert_eq!(
            position.snapshot_quantity + position.applied_fill_quantity,
            position.quantity
        );
    }

    #[tokio::test]
    async fn snapshot_for_another_account_is_refused() {
        let (tx, mut consumer, state, _sink) = consumer();

        let (reply, outcome) = oneshot::channel();
        tx.stage_snapshot(&AccountId::from("DU1"), spy_snapshot("DU2", dec!(7)), reply);

        assert!(matches!(
            outcome.await.unwrap(),
            Err(GatewayError::UnexpectedResponse(_))
        ));
        assert!(consumer.rx.try_recv().is_err());
        assert!(state.get_position(&InstrumentKey::from("SPY")).is_none());
    }

    #[tokio::test]
    async fn staging_after_shutdown_answers_shutting_down() {
        let (tx, consumer, _state, _sink) = consumer();
        drop(consumer);

        let (reply, outcome) = oneshot::channel();
        tx.stage_snapshot(&AccountId::from("DU1"), spy_snapshot("DU1", dec!(1)), reply);
        assert_eq!(outcome.await.unwrap(), Err(GatewayError::ShuttingDown));
    }

    #[test]
    fn quotes_and_commissions_reach_the_cache() {
        use crate::domain::execution::CommissionEvent;
        use crate::domain::market::QuoteEvent;

        let (_tx, mut consumer, state, _sink) = consumer();
        consumer.handle(PipelineMessage::Event(fill_event("e-1", dec!(2))));
        consumer.handle(PipelineMessage::Event(BrokerEvent::Commission(CommissionEvent {
            account_id: AccountId::from("DU1"),
            execution_id: EventId::from("e-1"),
            commission: dec!(1.25),
            currency: "USD".into(),
            timestamp: Utc::now(),
        })));
        consumer.handle(PipelineMessage::Event(BrokerEvent::Quote(QuoteEvent {
            instrument: InstrumentKey::from("SPY"),
            bid: Some(dec!(499.9)),
            ask: Some(dec!(500.1)),
            bid_size: None,
            ask_size: None,
            last: Some(dec!(500)),
            timestamp: Utc::now(),
        })));

        assert_eq!(
            state.get_commission(&AccountId::from("DU1"), &LocalOrderId::from("broker:B-1")),
            Some(dec!(1.25))
        );
        let quote = state.get_quote(&InstrumentKey::from("SPY")).unwrap();
        assert_eq!(quote.last, Some(dec!(500)));
    }

    #[tokio::test]
    async fn queued_messages_drain_on_cancel() {
        let (tx, consumer, state, _sink) = consumer();
        let cancel = consumer.cancel.clone();
        tx.publish(fill_event("e-1", dec!(1))).unwrap();
        tx.publish(fill_event("e-2", dec!(4))).unwrap();
        cancel.cancel();

        consumer.run().await;
        assert_eq!(
            state.get_position(&InstrumentKey::from("SPY")).unwrap().quantity,
            dec!(4)
        );
        assert_eq!(tx.publish(fill_event("e-3", dec!(5))), Err(PipelineClosed));
    }
}
