//! State Manager
//!
//! Authoritative local cache of orders, executions, positions and account
//! values, sharded per account. Each shard sits behind its own `RwLock`, so
//! readers on one account never wait on writers to another. The latest
//! quote per instrument is kept alongside, outside the shards.
//!
//! Every mutation is driven by broker-sourced data (events, snapshots,
//! individual order queries) or by the local registration of a new intent.
//! Order status moves forward only; redelivered events are recognised by
//! their broker event id and applied at most once.

mod reconcile;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::account::{AccountValueEvent, AccountValueRecord};
use crate::domain::execution::{CommissionEvent, Execution};
use crate::domain::market::QuoteEvent;
use crate::domain::order::{
    AdvanceRejection, OrderEvent, OrderIntent, OrderModification, OrderRecord, OrderStatus,
};
use crate::domain::position::{PositionChange, PositionDiff, PositionRecord, PositionSnapshot};
use crate::domain::{AccountId, BrokerOrderId, EventId, InstrumentKey, LocalOrderId};

pub use reconcile::{OrderReconciliation, Resolution, SUBMIT_GRACE_SECS};

/// Default number of processed event ids remembered per account.
pub const DEFAULT_DEDUP_WINDOW: usize = 10_000;

/// Outcome of applying one order event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEventOutcome {
    /// The event changed the record.
    Applied {
        /// Local id of the affected order.
        local_order_id: LocalOrderId,
        /// Newly filled quantity carried by the event.
        fill_delta: Decimal,
    },
    /// The event id was already processed.
    Duplicate,
    /// The event would have broken the lattice and was dropped.
    Dropped(AdvanceRejection),
}

/// Outcome of registering an execution intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentRegistration {
    /// First time this idempotency key was seen.
    New(OrderRecord),
    /// The key is already known; no new order was created.
    Existing(OrderRecord),
}

/// Counts across all shards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateSummary {
    /// Accounts with state.
    pub accounts: usize,
    /// Orders of any status.
    pub orders: usize,
    /// Orders believed working.
    pub open_orders: usize,
    /// Orders flagged `ClosedUnknown`.
    pub unresolved_orders: usize,
    /// Non-flat positions.
    pub positions: usize,
    /// Account value entries.
    pub account_values: usize,
    /// Newest update applied.
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ShardState {
    orders: HashMap<LocalOrderId, OrderRecord>,
    broker_index: HashMap<BrokerOrderId, LocalOrderId>,
    positions: HashMap<InstrumentKey, PositionRecord>,
    account_values: HashMap<(String, String), AccountValueRecord>,
    executions: HashMap<LocalOrderId, Vec<Execution>>,
    execution_owner: HashMap<EventId, LocalOrderId>,
    processed: HashSet<EventId>,
    processed_order: VecDeque<EventId>,
    order_cursor: Option<EventId>,
    account_cursor: Option<DateTime<Utc>>,
    last_update: Option<DateTime<Utc>>,
}

impl ShardState {
    fn touch(&mut self, at: DateTime<Utc>) {
        if self.last_update.is_none_or(|last| at > last) {
            self.last_update = Some(at);
        }
    }

    fn remember(&mut self, event_id: EventId, window: usize) {
        if self.processed.insert(event_id.clone()) {
            self.processed_order.push_back(event_id);
            while self.processed_order.len() > window {
                if let Some(old) = self.processed_order.pop_front() {
                    self.processed.remove(&old);
                }
            }
        }
    }

    fn find_local_id(
        &self,
        broker_order_id: Option<&BrokerOrderId>,
        local_order_id: Option<&LocalOrderId>,
    ) -> Option<LocalOrderId> {
        broker_order_id
            .and_then(|id| self.broker_index.get(id).cloned())
            .or_else(|| {
                local_order_id
                    .filter(|id| self.orders.contains_key(*id))
                    .cloned()
            })
    }

    fn bind(&mut self, local_order_id: &LocalOrderId, broker_order_id: &BrokerOrderId) {
        if let Some(record) = self.orders.get_mut(local_order_id) {
            record.bind_broker_id(broker_order_id.clone());
        }
        self.broker_index
            .insert(broker_order_id.clone(), local_order_id.clone());
    }

    fn apply_fill(&mut self, event: &OrderEvent, delta: Decimal, price: Decimal) {
        let position = self
            .positions
            .entry(event.instrument.clone())
            .or_insert_with(|| {
                PositionRecord::flat(
                    event.account_id.clone(),
                    event.instrument.clone(),
                    event.timestamp,
                )
            });
        position.apply_fill(event.side.signed(delta), price, event.timestamp);
    }

    fn record_execution(
        &mut self,
        event: &OrderEvent,
        local_order_id: &LocalOrderId,
        quantity: Decimal,
        price: Decimal,
    ) {
        self.execution_owner
            .insert(event.event_id.clone(), local_order_id.clone());
        self.executions
            .entry(local_order_id.clone())
            .or_default()
            .push(Execution {
                execution_id: event.event_id.clone(),
                account_id: event.account_id.clone(),
                local_order_id: local_order_id.clone(),
                broker_order_id: event.broker_order_id.clone(),
                instrument: event.instrument.clone(),
                side: event.side,
                quantity,
                price,
                commission: None,
                commission_currency: None,
                timestamp: event.timestamp,
            });
    }
}

type Shard = Arc<RwLock<ShardState>>;

/// Local cache of broker state.
#[derive(Debug)]
pub struct StateManager {
    primary_account: AccountId,
    shards: RwLock<HashMap<AccountId, Shard>>,
    quotes: RwLock<HashMap<InstrumentKey, QuoteEvent>>,
    dedup_window: usize,
}

impl StateManager {
    /// Create an empty cache for the configured account.
    #[must_use]
    pub fn new(primary_account: AccountId) -> Self {
        Self::with_dedup_window(primary_account, DEFAULT_DEDUP_WINDOW)
    }

    /// Create an empty cache with a custom deduplication window.
    #[must_use]
    pub fn with_dedup_window(primary_account: AccountId, dedup_window: usize) -> Self {
        Self {
            primary_account,
            shards: RwLock::new(HashMap::new()),
            quotes: RwLock::new(HashMap::new()),
            dedup_window: dedup_window.max(1),
        }
    }

    /// The account the gateway trades.
    #[must_use]
    pub const fn primary_account(&self) -> &AccountId {
        &self.primary_account
    }

    fn shard(&self, account_id: &AccountId) -> Shard {
        if let Some(shard) = self.shards.read().get(account_id) {
            return Arc::clone(shard);
        }
        Arc::clone(
            self.shards
                .write()
                .entry(account_id.clone())
                .or_default(),
        )
    }

    fn existing_shard(&self, account_id: &AccountId) -> Option<Shard> {
        self.shards.read().get(account_id).map(Arc::clone)
    }

    fn all_shards(&self) -> Vec<Shard> {
        self.shards.read().values().map(Arc::clone).collect()
    }

    // ------------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------------

    /// Apply a broker order event.
    ///
    /// Idempotent per `event_id`. Events implying a status or fill regression
    /// are logged and dropped. A newly filled quantity adjusts the position
    /// and is recorded as an execution.
    pub fn apply_order_event(&self, event: &OrderEvent) -> OrderEventOutcome {
        let shard = self.shard(&event.account_id);
        let mut state = shard.write();

        if state.processed.contains(&event.event_id) {
            tracing::debug!(
                event_id = %event.event_id,
                broker_order_id = %event.broker_order_id,
                "Duplicate order event ignored"
            );
            metrics::counter!("gateway_order_events_total", "outcome" => "duplicate").increment(1);
            return OrderEventOutcome::Duplicate;
        }

        let local_id = state
            .find_local_id(Some(&event.broker_order_id), event.local_order_id.as_ref())
            .unwrap_or_else(|| {
                let record = OrderRecord::adopted(event);
                let id = record.local_order_id.clone();
                tracing::info!(
                    broker_order_id = %event.broker_order_id,
                    local_order_id = %id,
                    "Adopting order unknown to the cache"
                );
                state.orders.insert(id.clone(), record);
                id
            });
        state.bind(&local_id, &event.broker_order_id);

        let Some(record) = state.orders.get_mut(&local_id) else {
            return OrderEventOutcome::Duplicate;
        };
        let old_filled = record.filled_quantity;
        let old_avg = record.avg_fill_price;

        let result = record.advance(
            event.status,
            event.filled_quantity,
            event.remaining_quantity,
            event.avg_fill_price,
            event.timestamp,
        );
        if result.is_ok() && event.quantity > Decimal::ZERO {
            record.quantity = event.quantity;
        }

        let window = self.dedup_window;
        state.remember(event.event_id.clone(), window);

        match result {
            Ok(delta) => {
                if delta > Decimal::ZERO {
                    let price = fill_price(event, delta, old_filled, old_avg);
                    state.apply_fill(event, delta, price);
                    state.record_execution(event, &local_id, delta, price);
                }
                state.order_cursor = Some(event.event_id.clone());
                state.touch(event.timestamp);
                tracing::debug!(
                    event_id = %event.event_id,
                    local_order_id = %local_id,
                    status = %event.status,
                    fill_delta = %delta,
                    "Order event applied"
                );
                metrics::counter!("gateway_order_events_total", "outcome" => "applied")
                    .increment(1);
                OrderEventOutcome::Applied {
                    local_order_id: local_id,
                    fill_delta: delta,
                }
            }
            Err(rejection) => {
                tracing::warn!(
                    event_id = %event.event_id,
                    local_order_id = %local_id,
                    reason = %rejection,
                    "Order event dropped"
                );
                metrics::counter!("gateway_order_events_total", "outcome" => "dropped")
                    .increment(1);
                OrderEventOutcome::Dropped(rejection)
            }
        }
    }

    /// Register an execution intent as a pending order.
    ///
    /// A repeated idempotency key returns the existing record unchanged.
    pub fn register_intent(&self, intent: &OrderIntent, now: DateTime<Utc>) -> IntentRegistration {
        let shard = self.shard(&intent.account_id);
        let mut state = shard.write();

        if let Some(existing) = state.orders.get(&intent.idempotency_key) {
            tracing::debug!(
                local_order_id = %intent.idempotency_key,
                status = %existing.status,
                "Intent already registered"
            );
            return IntentRegistration::Existing(existing.clone());
        }

        let record = OrderRecord::from_intent(intent, now);
        state
            .orders
            .insert(record.local_order_id.clone(), record.clone());
        state.touch(now);
        IntentRegistration::New(record)
    }

    /// Record a transport failure for a pending submission.
    pub fn record_submit_failure(
        &self,
        account_id: &AccountId,
        local_order_id: &LocalOrderId,
        error: &str,
    ) {
        if let Some(shard) = self.existing_shard(account_id) {
            if let Some(record) = shard.write().orders.get_mut(local_order_id) {
                record.last_submit_error = Some(error.to_string());
            }
        }
    }

    /// Clear a recorded submission failure after a successful resend.
    pub fn clear_submit_failure(&self, account_id: &AccountId, local_order_id: &LocalOrderId) {
        if let Some(shard) = self.existing_shard(account_id) {
            if let Some(record) = shard.write().orders.get_mut(local_order_id) {
                record.last_submit_error = None;
            }
        }
    }

    /// Remember the limit price of a modification handed to the broker.
    ///
    /// Quantity changes are left to the broker's order events.
    pub fn record_modification(
        &self,
        account_id: &AccountId,
        local_order_id: &LocalOrderId,
        modification: &OrderModification,
    ) {
        let Some(limit_price) = modification.limit_price else {
            return;
        };
        if let Some(shard) = self.existing_shard(account_id) {
            if let Some(record) = shard.write().orders.get_mut(local_order_id) {
                record.limit_price = Some(limit_price);
            }
        }
    }

    /// Look up an order by local id.
    #[must_use]
    pub fn get_order(
        &self,
        account_id: &AccountId,
        local_order_id: &LocalOrderId,
    ) -> Option<OrderRecord> {
        self.existing_shard(account_id)?
            .read()
            .orders
            .get(local_order_id)
            .cloned()
    }

    /// Look up an order by broker id.
    #[must_use]
    pub fn get_order_by_broker_id(
        &self,
        account_id: &AccountId,
        broker_order_id: &BrokerOrderId,
    ) -> Option<OrderRecord> {
        let shard = self.existing_shard(account_id)?;
        let state = shard.read();
        let local = state.broker_index.get(broker_order_id)?;
        state.orders.get(local).cloned()
    }

    /// All orders believed working, across accounts.
    #[must_use]
    pub fn get_open_orders(&self) -> Vec<OrderRecord> {
        self.collect_orders(OrderRecord::is_open)
    }

    /// Orders flagged `ClosedUnknown`, awaiting a follow-up query.
    #[must_use]
    pub fn get_unresolved_orders(&self) -> Vec<OrderRecord> {
        self.collect_orders(|o| o.status == OrderStatus::ClosedUnknown)
    }

    /// All orders for an instrument, across accounts.
    #[must_use]
    pub fn get_orders_by_instrument(&self, instrument: &InstrumentKey) -> Vec<OrderRecord> {
        self.collect_orders(|o| &o.instrument == instrument)
    }

    fn collect_orders(&self, keep: impl Fn(&OrderRecord) -> bool) -> Vec<OrderRecord> {
        let mut orders: Vec<OrderRecord> = self
            .all_shards()
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .orders
                    .values()
                    .filter(|o| keep(o))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        orders.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.local_order_id.cmp(&b.local_order_id))
        });
        orders
    }

    // ------------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------------

    /// Attach a commission report to its execution.
    ///
    /// Returns whether a known execution changed. A repeated report
    /// overwrites rather than adds.
    pub fn apply_commission(&self, event: &CommissionEvent) -> bool {
        let shard = self.shard(&event.account_id);
        let mut state = shard.write();

        let Some(local_id) = state.execution_owner.get(&event.execution_id).cloned() else {
            tracing::warn!(
                account_id = %event.account_id,
                execution_id = %event.execution_id,
                "Commission for unknown execution ignored"
            );
            metrics::counter!("gateway_orphan_commissions_total").increment(1);
            return false;
        };
        let Some(execution) = state
            .executions
            .get_mut(&local_id)
            .and_then(|list| list.iter_mut().find(|e| e.execution_id == event.execution_id))
        else {
            return false;
        };

        let changed = execution.commission != Some(event.commission)
            || execution.commission_currency.as_deref() != Some(event.currency.as_str());
        execution.commission = Some(event.commission);
        execution.commission_currency = Some(event.currency.clone());
        if changed {
            tracing::debug!(
                local_order_id = %local_id,
                execution_id = %event.execution_id,
                commission = %event.commission,
                "Commission recorded"
            );
            state.touch(event.timestamp);
        }
        changed
    }

    /// Executions of one order, oldest first.
    #[must_use]
    pub fn get_executions(
        &self,
        account_id: &AccountId,
        local_order_id: &LocalOrderId,
    ) -> Vec<Execution> {
        self.existing_shard(account_id)
            .and_then(|shard| shard.read().executions.get(local_order_id).cloned())
            .unwrap_or_default()
    }

    /// Total commission reported for one order, if any was.
    #[must_use]
    pub fn get_commission(
        &self,
        account_id: &AccountId,
        local_order_id: &LocalOrderId,
    ) -> Option<Decimal> {
        let shard = self.existing_shard(account_id)?;
        let state = shard.read();
        state
            .executions
            .get(local_order_id)?
            .iter()
            .filter_map(|e| e.commission)
            .reduce(|total, c| total + c)
    }

    // ------------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------------

    /// Replace the account's positions with broker truth.
    ///
    /// Fills applied since the previous snapshot are discarded; the snapshot
    /// already contains them.
    pub fn apply_position_snapshot(&self, snapshot: &PositionSnapshot) -> PositionDiff {
        let shard = self.shard(&snapshot.account_id);
        let mut state = shard.write();

        let mut previous = std::mem::take(&mut state.positions);
        let mut diff = PositionDiff::default();

        for line in &snapshot.positions {
            if line.quantity.is_zero() {
                continue;
            }
            let record =
                PositionRecord::from_snapshot(snapshot.account_id.clone(), line, snapshot.as_of);
            match previous.remove(&line.instrument) {
                None => diff.added.push(line.instrument.clone()),
                Some(old) if old.quantity == line.quantity && old.avg_cost == line.avg_cost => {
                    diff.unchanged.push(line.instrument.clone());
                }
                Some(old) => diff.updated.push(PositionChange {
                    instrument: line.instrument.clone(),
                    previous: old.quantity,
                    current: line.quantity,
                }),
            }
            state.positions.insert(line.instrument.clone(), record);
        }

        diff.removed = previous
            .into_values()
            .filter(|old| !old.is_flat())
            .map(|old| old.instrument)
            .collect();
        state.touch(snapshot.as_of);

        if diff.has_changes() {
            tracing::info!(
                account_id = %snapshot.account_id,
                added = diff.added.len(),
                updated = diff.updated.len(),
                removed = diff.removed.len(),
                unchanged = diff.unchanged.len(),
                "Positions replaced from snapshot"
            );
        }
        diff
    }

    /// Position in the primary account.
    #[must_use]
    pub fn get_position(&self, instrument: &InstrumentKey) -> Option<PositionRecord> {
        self.get_position_in(&self.primary_account, instrument)
    }

    /// Position in a specific account.
    #[must_use]
    pub fn get_position_in(
        &self,
        account_id: &AccountId,
        instrument: &InstrumentKey,
    ) -> Option<PositionRecord> {
        self.existing_shard(account_id)?
            .read()
            .positions
            .get(instrument)
            .cloned()
    }

    /// All positions in an account.
    #[must_use]
    pub fn get_positions(&self, account_id: &AccountId) -> Vec<PositionRecord> {
        let Some(shard) = self.existing_shard(account_id) else {
            return Vec::new();
        };
        let mut positions: Vec<_> = shard.read().positions.values().cloned().collect();
        positions.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        positions
    }

    // ------------------------------------------------------------------------
    // Account values
    // ------------------------------------------------------------------------

    /// Apply an account value, last-write-wins by timestamp.
    ///
    /// Returns whether the cache changed.
    pub fn apply_account_value(&self, event: &AccountValueEvent) -> bool {
        let shard = self.shard(&event.account_id);
        let mut state = shard.write();

        let key = (event.key.clone(), event.currency.clone());
        let changed = match state.account_values.get_mut(&key) {
            Some(record) => record.merge(event),
            None => {
                state
                    .account_values
                    .insert(key, AccountValueRecord::from(event));
                true
            }
        };

        if state.account_cursor.is_none_or(|c| event.timestamp > c) {
            state.account_cursor = Some(event.timestamp);
        }
        if changed {
            state.touch(event.timestamp);
        }
        changed
    }

    /// One account value.
    #[must_use]
    pub fn get_account_value(
        &self,
        account_id: &AccountId,
        key: &str,
        currency: &str,
    ) -> Option<AccountValueRecord> {
        self.existing_shard(account_id)?
            .read()
            .account_values
            .get(&(key.to_string(), currency.to_string()))
            .cloned()
    }

    /// All account values for an account.
    #[must_use]
    pub fn get_account_values(&self, account_id: &AccountId) -> Vec<AccountValueRecord> {
        let Some(shard) = self.existing_shard(account_id) else {
            return Vec::new();
        };
        let mut values: Vec<_> = shard.read().account_values.values().cloned().collect();
        values.sort_by_key(AccountValueRecord::cache_key);
        values
    }

    // ------------------------------------------------------------------------
    // Quotes
    // ------------------------------------------------------------------------

    /// Keep the quote unless a newer one is already cached.
    pub fn apply_quote(&self, quote: &QuoteEvent) -> bool {
        let mut quotes = self.quotes.write();
        if quotes
            .get(&quote.instrument)
            .is_some_and(|cached| cached.timestamp > quote.timestamp)
        {
            return false;
        }
        quotes.insert(quote.instrument.clone(), quote.clone());
        true
    }

    /// Latest quote for an instrument.
    #[must_use]
    pub fn get_quote(&self, instrument: &InstrumentKey) -> Option<QuoteEvent> {
        self.quotes.read().get(instrument).cloned()
    }

    // ------------------------------------------------------------------------
    // Cursors and summary
    // ------------------------------------------------------------------------

    /// Last order event applied for an account.
    #[must_use]
    pub fn order_cursor(&self, account_id: &AccountId) -> Option<EventId> {
        self.existing_shard(account_id)?.read().order_cursor.clone()
    }

    /// Newest account value timestamp seen for an account.
    #[must_use]
    pub fn account_cursor(&self, account_id: &AccountId) -> Option<DateTime<Utc>> {
        self.existing_shard(account_id)?.read().account_cursor
    }

    /// Seed cursors from a validated checkpoint.
    pub fn seed_cursors(
        &self,
        account_id: &AccountId,
        order_cursor: Option<EventId>,
        account_cursor: Option<DateTime<Utc>>,
    ) {
        let shard = self.shard(account_id);
        let mut state = shard.write();
        if state.order_cursor.is_none() {
            state.order_cursor = order_cursor;
        }
        if state.account_cursor.is_none() {
            state.account_cursor = account_cursor;
        }
    }

    /// Counts across all accounts.
    #[must_use]
    pub fn summary(&self) -> StateSummary {
        let shards = self.all_shards();
        let mut summary = StateSummary {
            accounts: shards.len(),
            ..StateSummary::default()
        };
        for shard in shards {
            let state = shard.read();
            summary.orders += state.orders.len();
            summary.open_orders += state.orders.values().filter(|o| o.is_open()).count();
            summary.unresolved_orders += state
                .orders
                .values()
                .filter(|o| o.status == OrderStatus::ClosedUnknown)
                .count();
            summary.positions += state.positions.values().filter(|p| !p.is_flat()).count();
            summary.account_values += state.account_values.len();
            summary.last_update = summary.last_update.max(state.last_update);
        }
        summary
    }

    /// Drop all cached state.
    pub fn clear(&self) {
        self.shards.write().clear();
        self.quotes.write().clear();
        tracing::info!("State cache cleared");
    }
}

/// Price of the newly filled quantity.
///
/// Prefers the execution carried by the event; otherwise backs it out of the
/// change in average price.
fn fill_price(
    event: &OrderEvent,
    delta: Decimal,
    old_filled: Decimal,
    old_avg: Option<Decimal>,
) -> Decimal {
    if let Some(fill) = event.last_fill.filter(|f| f.quantity == delta) {
        return fill.price;
    }
    match (event.avg_fill_price, old_avg) {
        (Some(new_avg), Some(old_avg)) if !old_filled.is_zero() => {
            (new_avg * event.filled_quantity - old_avg * old_filled) / delta
        }
        (Some(new_avg), _) => new_avg,
        (None, _) => event.last_fill.map_or(Decimal::ZERO, |f| f.price),
    }
}
