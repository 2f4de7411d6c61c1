//! Reconciliation Loop
//!
//! Periodically, and right after every transition into `Ready`, fetches an
//! authoritative snapshot and repairs the cache against it:
//!
//! 1. The snapshot is applied through the event pipeline at the point the
//!    broker's answer arrived on the stream: fills sent before it are
//!    already in it, fills sent after it land on top.
//! 2. Open orders the snapshot no longer lists come back `ClosedUnknown`;
//!    each is queried individually and the answer goes through the
//!    pipeline too.
//! 3. Orders the broker cannot account for stay flagged and hold the
//!    reconciliation health condition at `Degraded`.
//!
//! A pass never fabricates a fill.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::checkpoint::CheckpointKeeper;
use crate::application::dispatch::AccountDispatcher;
use crate::application::health::HealthMonitor;
use crate::application::pipeline::PipelineSender;
use crate::application::state::{Resolution, StateManager};
use crate::domain::connection::{ConnectionState, StateTransition};
use crate::domain::health::{Component, HealthStatus};
use crate::domain::order::OrderRecord;
use crate::domain::position::PositionDiff;
use crate::domain::{AccountId, LocalOrderId};
use crate::error::GatewayError;

/// Reconciliation timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationSettings {
    /// Time between periodic passes.
    pub interval: Duration,
    /// Minimum time between checkpoint saves.
    pub checkpoint_interval: Duration,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            checkpoint_interval: Duration::from_secs(300),
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Account reconciled.
    pub account_id: AccountId,
    /// Position changes.
    pub positions: PositionDiff,
    /// Local intents bound to broker ids.
    pub orders_bound: usize,
    /// Orders whose status or fill moved forward.
    pub orders_advanced: usize,
    /// Broker orders adopted into the cache.
    pub orders_adopted: usize,
    /// Snapshot order updates the lattice refused.
    pub orders_dropped: usize,
    /// Open orders missing from the snapshot.
    pub orders_vanished: usize,
    /// Follow-up query outcomes.
    pub resolutions: Vec<(LocalOrderId, Resolution)>,
    /// Orders still flagged after follow-up.
    pub unresolved: Vec<LocalOrderId>,
    /// Account values that changed.
    pub account_values_changed: usize,
    /// When the pass finished.
    pub completed_at: DateTime<Utc>,
}

impl ReconciliationReport {
    /// Whether the pass changed anything.
    #[must_use]
    pub fn has_corrections(&self) -> bool {
        self.positions.has_changes()
            || self.orders_bound > 0
            || self.orders_advanced > 0
            || self.orders_adopted > 0
            || self.orders_vanished > 0
            || self.account_values_changed > 0
    }
}

/// The periodic reconciliation task.
pub struct ReconciliationLoop {
    account_id: AccountId,
    account: Arc<AccountDispatcher>,
    pipeline: PipelineSender,
    state: Arc<StateManager>,
    health: Arc<HealthMonitor>,
    checkpoints: Option<Arc<CheckpointKeeper>>,
    settings: ReconciliationSettings,
    last_checkpoint: Option<Instant>,
    trigger: Arc<Notify>,
}

impl std::fmt::Debug for ReconciliationLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationLoop")
            .field("account_id", &self.account_id)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ReconciliationLoop {
    /// Create the loop.
    #[must_use]
    pub fn new(
        account_id: AccountId,
        account: Arc<AccountDispatcher>,
        pipeline: PipelineSender,
        state: Arc<StateManager>,
        health: Arc<HealthMonitor>,
        settings: ReconciliationSettings,
    ) -> Self {
        Self {
            account_id,
            account,
            pipeline,
            state,
            health,
            checkpoints: None,
            settings,
            last_checkpoint: None,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Handle that requests an immediate pass from the running loop.
    #[must_use]
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    /// Save checkpoints after successful passes.
    #[must_use]
    pub fn with_checkpoints(mut self, keeper: Arc<CheckpointKeeper>) -> Self {
        self.checkpoints = Some(keeper);
        self
    }

    /// Run until cancelled.
    pub async fn run(
        mut self,
        mut transitions: broadcast::Receiver<StateTransition>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.settings.interval,
            self.settings.interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Reconciliation loop stopped");
                    break;
                }

                _ = ticker.tick() => {
                    self.run_logged("periodic").await;
                }

                () = self.trigger.notified() => {
                    ticker.reset();
                    self.run_logged("requested").await;
                }

                received = transitions.recv() => match received {
                    Ok(transition) if transition.to == ConnectionState::Ready => {
                        ticker.reset();
                        self.run_logged("session_ready").await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Reconciliation loop lagged behind transitions");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn run_logged(&mut self, trigger: &'static str) {
        let started = std::time::Instant::now();
        match self.run_pass().await {
            Ok(report) => {
                metrics::histogram!("gateway_reconciliation_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                metrics::counter!("gateway_reconciliations_total", "result" => "ok").increment(1);
                tracing::info!(
                    trigger,
                    corrections = report.has_corrections(),
                    positions_added = report.positions.added.len(),
                    positions_updated = report.positions.updated.len(),
                    positions_removed = report.positions.removed.len(),
                    orders_advanced = report.orders_advanced,
                    orders_adopted = report.orders_adopted,
                    orders_vanished = report.orders_vanished,
                    unresolved = report.unresolved.len(),
                    "Reconciliation pass complete"
                );
            }
            Err(GatewayError::NotConnected(state)) => {
                tracing::debug!(trigger, state = %state, "Reconciliation skipped, session not ready");
            }
            Err(err) => {
                metrics::counter!("gateway_reconciliations_total", "result" => "failed")
                    .increment(1);
                tracing::warn!(
                    trigger,
                    error = %err,
                    reason = err.kind().reason(),
                    "Reconciliation pass failed"
                );
            }
        }
    }

    /// Run one pass.
    ///
    /// # Errors
    ///
    /// Fails if the snapshot cannot be fetched or the pipeline has stopped.
    /// Follow-up query failures leave the order flagged instead.
    pub async fn run_pass(&mut self) -> Result<ReconciliationReport, GatewayError> {
        let cursor = self.state.order_cursor(&self.account_id);
        let outcome = self.account.snapshot(&self.account_id, cursor).await?;

        let mut flagged: Vec<OrderRecord> = outcome.orders.vanished.clone();
        for record in self.state.get_unresolved_orders() {
            let known = flagged
                .iter()
                .any(|f| f.local_order_id == record.local_order_id);
            if record.account_id == self.account_id && !known {
                flagged.push(record);
            }
        }

        let mut resolutions = Vec::with_capacity(flagged.len());
        let mut unresolved = Vec::new();
        for record in flagged {
            let resolution = self.follow_up(&record).await?;
            if resolution == Resolution::Unresolved {
                unresolved.push(record.local_order_id.clone());
            }
            resolutions.push((record.local_order_id, resolution));
        }

        self.update_health(&unresolved);

        let report = ReconciliationReport {
            account_id: self.account_id.clone(),
            positions: outcome.positions,
            orders_bound: outcome.orders.bound,
            orders_advanced: outcome.orders.advanced,
            orders_adopted: outcome.orders.adopted,
            orders_dropped: outcome.orders.dropped,
            orders_vanished: outcome.orders.vanished.len(),
            resolutions,
            unresolved,
            account_values_changed: outcome.account_values_changed,
            completed_at: Utc::now(),
        };

        self.maybe_checkpoint().await;
        Ok(report)
    }

    async fn follow_up(&self, record: &OrderRecord) -> Result<Resolution, GatewayError> {
        let lookup = match self
            .account
            .query_order(
                &self.account_id,
                record.broker_order_id.clone(),
                &record.local_order_id,
            )
            .await
        {
            Ok(lookup) => lookup,
            Err(err) => {
                tracing::warn!(
                    local_order_id = %record.local_order_id,
                    error = %err,
                    "Follow-up order query failed"
                );
                return Ok(Resolution::Unresolved);
            }
        };

        self.pipeline
            .apply_resolution(
                self.account_id.clone(),
                record.local_order_id.clone(),
                lookup,
            )
            .await
            .map_err(|_| GatewayError::ShuttingDown)
    }

    fn update_health(&self, unresolved: &[LocalOrderId]) {
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("gateway_unresolved_orders").set(unresolved.len() as f64);

        if unresolved.is_empty() {
            self.health.clear(Component::Reconciliation);
            return;
        }

        let ids: Vec<&str> = unresolved.iter().map(LocalOrderId::as_str).collect();
        let reason = GatewayError::ReconciliationAmbiguous(format!(
            "broker cannot account for orders {}",
            ids.join(", ")
        ));
        self.health.set(
            Component::Reconciliation,
            HealthStatus::Degraded,
            Some(reason.to_string()),
        );
    }

    async fn maybe_checkpoint(&mut self) {
        let Some(keeper) = self.checkpoints.as_ref() else {
            return;
        };
        let due = self
            .last_checkpoint
            .is_none_or(|at| at.elapsed() >= self.settings.checkpoint_interval);
        if !due {
            return;
        }

        match keeper.save(&self.state).await {
            Ok(_) => self.last_checkpoint = Some(Instant::now()),
            Err(err) => tracing::warn!(error = %err, "Checkpoint save failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::dispatch::{DispatchSettings, OrderDispatcher};
    use crate::application::dispatch::testing::ScriptedSession;
    use crate::application::state::SUBMIT_GRACE_SECS;
    use crate::application::pipeline::{self, EventForwarder, ForwarderSettings, PipelineConsumer};
    use crate::application::ports::{BrokerResponse, BrokerSession};
    use crate::application::rate_limit::{RateLimitSettings, RateLimiter};
    use crate::domain::events::{BrokerEvent, BrokerSnapshot, OrderLookup};
    use crate::domain::order::{OrderEvent, OrderIntent, OrderStatus, OrderType, Side};
    use crate::domain::{BrokerOrderId, EventId, InstrumentKey};
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    struct Fixture {
        session: Arc<ScriptedSession>,
        state: Arc<StateManager>,
        health: Arc<HealthMonitor>,
        reconciler: ReconciliationLoop,
        cancel: CancellationToken,
        _sink: mpsc::Receiver<BrokerEvent>,
    }

    fn fixture() -> Fixture {
        let session = Arc::new(ScriptedSession::ready());
        let account_id = AccountId::from("DU1");
        let state = Arc::new(StateManager::new(account_id.clone()));
        let health = Arc::new(HealthMonitor::new());
        let (sink_tx, sink) = mpsc::channel(64);
        let (sender, rx) = pipeline::channel();
        *session.pipeline.lock() = Some(sender.clone());
        let cancel = CancellationToken::new();
        tokio::spawn(
            PipelineConsumer::new(
                Arc::clone(&state),
                EventForwarder::new(Arc::new(sink_tx), Arc::clone(&health), ForwarderSettings::default()),
                rx,
                Duration::from_millis(50),
                cancel.clone(),
            )
            .run(),
        );
        let account = Arc::new(AccountDispatcher::new(
            Arc::clone(&session) as Arc<dyn BrokerSession>,
            Arc::new(RateLimiter::new(RateLimitSettings::default())),
            DispatchSettings::default(),
        ));
        let reconciler = ReconciliationLoop::new(
            account_id,
            account,
            sender,
            Arc::clone(&state),
            Arc::clone(&health),
            ReconciliationSettings::default(),
        );
        Fixture {
            session,
            state,
            health,
            reconciler,
            cancel,
            _sink: sink,
        }
    }

    fn intent(key: &str) -> OrderIntent {
        OrderIntent {
            idempotency_key: LocalOrderId::from(key),
            account_id: AccountId::from("DU1"),
            instrument: InstrumentKey::from("SPY"),
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity: dec!(10),
            limit_price: None,
        }
    }

    fn register_aged(state: &StateManager, key: &str, age_secs: i64) {
        state.register_intent(&intent(key), Utc::now() - chrono::Duration::seconds(age_secs));
    }

    fn register(state: &StateManager, key: &str) {
        register_aged(state, key, 5);
    }

    fn acknowledge(state: &StateManager, key: &str, broker_id: &str) {
        state.apply_order_event(&OrderEvent {
            event_id: EventId::new(format!("ack-{key}")),
            account_id: AccountId::from("DU1"),
            broker_order_id: BrokerOrderId::from(broker_id),
            local_order_id: Some(LocalOrderId::from(key)),
            instrument: InstrumentKey::from("SPY"),
            side: Side::Buy,
            status: OrderStatus::Submitted,
            quantity: dec!(10),
            filled_quantity: dec!(0),
            remaining_quantity: dec!(10),
            avg_fill_price: None,
            last_fill: None,
            timestamp: Utc::now(),
        });
    }

    fn empty_snapshot() -> BrokerResponse {
        BrokerResponse::Snapshot(BrokerSnapshot {
            account_id: AccountId::from("DU1"),
            positions: Vec::new(),
            open_orders: Vec::new(),
            account_values: Vec::new(),
            order_cursor: None,
            as_of: Utc::now(),
        })
    }

    #[tokio::test]
    async fn vanished_orders_are_followed_up() {
        let mut fx = fixture();
        register_aged(&fx.state, "never-acked", SUBMIT_GRACE_SECS * 4);
        fx.state
            .record_submit_failure(&AccountId::from("DU1"), &"never-acked".into(), "broken pipe");
        register(&fx.state, "acked");
        acknowledge(&fx.state, "acked", "B-7");

        // the broker knows neither order
        fx.session.responses.lock().extend([
            Ok(empty_snapshot()),
            Ok(BrokerResponse::Order(OrderLookup::NotFound)),
            Ok(BrokerResponse::Order(OrderLookup::NotFound)),
        ]);

        let report = fx.reconciler.run_pass().await.unwrap();
        assert_eq!(report.orders_vanished, 2);
        assert_eq!(report.unresolved, vec![LocalOrderId::from("acked")]);

        let account = AccountId::from("DU1");
        assert_eq!(
            fx.state.get_order(&account, &"never-acked".into()).unwrap().status,
            OrderStatus::Rejected
        );
        assert_eq!(
            fx.state.get_order(&account, &"acked".into()).unwrap().status,
            OrderStatus::ClosedUnknown
        );
        assert_eq!(
            fx.health.component_status(Component::Reconciliation),
            HealthStatus::Degraded
        );
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn flag_clears_once_the_broker_answers() {
        let mut fx = fixture();
        register(&fx.state, "acked");
        acknowledge(&fx.state, "acked", "B-7");
        fx.session.responses.lock().extend([
            Ok(empty_snapshot()),
            Ok(BrokerResponse::Order(OrderLookup::NotFound)),
        ]);
        fx.reconciler.run_pass().await.unwrap();
        assert_eq!(fx.health.status(), HealthStatus::Degraded);

        let filled = crate::domain::events::SnapshotOrder {
            broker_order_id: BrokerOrderId::from("B-7"),
            local_order_id: Some(LocalOrderId::from("acked")),
            instrument: InstrumentKey::from("SPY"),
            side: Side::Buy,
            quantity: dec!(10),
            status: OrderStatus::Filled,
            filled_quantity: dec!(10),
            remaining_quantity: dec!(0),
            avg_fill_price: Some(dec!(501)),
        };
        fx.session.responses.lock().extend([
            Ok(empty_snapshot()),
            Ok(BrokerResponse::Order(OrderLookup::Found(filled))),
        ]);
        let report = fx.reconciler.run_pass().await.unwrap();

        assert_eq!(
            report.resolutions,
            vec![(LocalOrderId::from("acked"), Resolution::Advanced(OrderStatus::Filled))]
        );
        assert!(report.unresolved.is_empty());
        assert_eq!(fx.health.status(), HealthStatus::Healthy);
        // the snapshot path never fabricates position from a resolved fill
        assert!(fx.state.get_position(&InstrumentKey::from("SPY")).is_none());
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn fill_right_after_the_snapshot_answer_survives() {
        let mut fx = fixture();
        register(&fx.state, "ord-1");
        acknowledge(&fx.state, "ord-1", "B-1");

        let working = crate::domain::events::SnapshotOrder {
            broker_order_id: BrokerOrderId::from("B-1"),
            local_order_id: Some(LocalOrderId::from("ord-1")),
            instrument: InstrumentKey::from("SPY"),
            side: Side::Buy,
            quantity: dec!(10),
            status: OrderStatus::Submitted,
            filled_quantity: dec!(0),
            remaining_quantity: dec!(10),
            avg_fill_price: None,
        };
        let BrokerResponse::Snapshot(mut snapshot) = empty_snapshot() else {
            unreachable!()
        };
        snapshot.open_orders.push(working);
        fx.session
            .responses
            .lock()
            .push_back(Ok(BrokerResponse::Snapshot(snapshot)));

        // the broker fills right after taking the snapshot
        fx.session
            .after_snapshot
            .lock()
            .push(BrokerEvent::Order(OrderEvent {
                event_id: EventId::from("fill-1"),
                account_id: AccountId::from("DU1"),
                broker_order_id: BrokerOrderId::from("B-1"),
                local_order_id: Some(LocalOrderId::from("ord-1")),
                instrument: InstrumentKey::from("SPY"),
                side: Side::Buy,
                status: OrderStatus::PartiallyFilled,
                quantity: dec!(10),
                filled_quantity: dec!(4),
                remaining_quantity: dec!(6),
                avg_fill_price: Some(dec!(500)),
                last_fill: Some(crate::domain::order::Fill {
                    quantity: dec!(4),
                    price: dec!(500),
                }),
                timestamp: Utc::now(),
            }));

        fx.reconciler.run_pass().await.unwrap();
        // the fill is queued behind the snapshot; wait for it to land
        let position = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(position) = fx.state.get_position(&InstrumentKey::from("SPY")) {
                    break position;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(position.quantity, dec!(4));
        assert_eq!(
            position.snapshot_quantity + position.applied_fill_quantity,
            position.quantity
        );
        let order = fx
            .state
            .get_order(&AccountId::from("DU1"), &"ord-1".into())
            .unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_quantity, dec!(4));
        fx.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn pass_during_a_slow_send_leaves_the_intent_alone() {
        let mut fx = fixture();
        *fx.session.send_delay.lock() = Some(Duration::from_secs(2));
        let orders = OrderDispatcher::new(
            Arc::clone(&fx.session) as Arc<dyn BrokerSession>,
            Arc::new(RateLimiter::new(RateLimitSettings::default())),
            Arc::clone(&fx.state),
            Arc::clone(&fx.health),
            DispatchSettings::default(),
        );
        let submit = tokio::spawn(async move { orders.submit_order(intent("ord-1")).await });

        // the intent is registered and its send is still on the wire
        tokio::time::sleep(Duration::from_millis(500)).await;
        let account = AccountId::from("DU1");
        assert_eq!(
            fx.state.get_order(&account, &"ord-1".into()).unwrap().status,
            OrderStatus::Pending
        );

        fx.session.responses.lock().push_back(Ok(empty_snapshot()));
        let report = fx.reconciler.run_pass().await.unwrap();
        assert_eq!(report.orders_vanished, 0);
        assert!(report.resolutions.is_empty());
        assert!(submit.await.unwrap().is_accepted());

        // the broker's acknowledgment still applies
        acknowledge(&fx.state, "ord-1", "B-1");
        let order = fx.state.get_order(&account, &"ord-1".into()).unwrap();
        assert_eq!(order.status, OrderStatus::Submitted);
        assert_eq!(order.broker_order_id, Some(BrokerOrderId::from("B-1")));
        fx.cancel.cancel();
    }
}
