//! Order reconciliation against broker snapshots and individual queries.
//!
//! Snapshot-sourced order data advances status and cumulative fill, but
//! never touches positions: the position half of the same snapshot is
//! already the truth, and a later stream event for the same fill sees no
//! new quantity.
//!
//! An intent the broker has not acknowledged yet may still be on its way.
//! It is left alone for [`SUBMIT_GRACE_SECS`] after registration, and is
//! only concluded `Rejected` once that has passed and its last send is
//! known to have failed.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use super::StateManager;
use crate::domain::events::{OrderLookup, SnapshotOrder};
use crate::domain::order::{OrderEvent, OrderRecord, OrderStatus};
use crate::domain::{AccountId, EventId, LocalOrderId};

/// How long an unacknowledged intent counts as in flight.
pub const SUBMIT_GRACE_SECS: i64 = 30;

fn in_flight(record: &OrderRecord, at: DateTime<Utc>) -> bool {
    record.status == OrderStatus::Pending
        && record.broker_order_id.is_none()
        && at - record.created_at < Duration::seconds(SUBMIT_GRACE_SECS)
}

/// Whether the broker's "not found" proves the intent never arrived.
fn send_known_failed(record: &OrderRecord, at: DateTime<Utc>) -> bool {
    record.broker_order_id.is_none()
        && record.last_submit_error.is_some()
        && at - record.created_at >= Duration::seconds(SUBMIT_GRACE_SECS)
}

/// What reconciling the snapshot's order list did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderReconciliation {
    /// Local intents matched to a broker id for the first time.
    pub bound: usize,
    /// Records whose status or fill moved forward.
    pub advanced: usize,
    /// Broker orders the cache did not know.
    pub adopted: usize,
    /// Updates dropped by the lattice.
    pub dropped: usize,
    /// Open records the snapshot did not list, now `ClosedUnknown`.
    pub vanished: Vec<OrderRecord>,
}

/// Outcome of a follow-up order query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The broker's answer moved the order to this status.
    Advanced(OrderStatus),
    /// The broker never saw this intent and its send had failed; it is now
    /// `Rejected`.
    Rejected,
    /// The broker cannot account for the order, or a send may still land.
    Unresolved,
    /// Something else already resolved the order.
    AlreadyResolved(OrderStatus),
    /// The cache has no such order.
    NotTracked,
}

impl StateManager {
    /// Reconcile the cached orders of one account against the snapshot's
    /// open-order list.
    ///
    /// Listed orders are bound and advanced (or adopted). Open records the
    /// snapshot omits are marked `ClosedUnknown` and returned for follow-up;
    /// records created after `as_of` and intents still in flight are left
    /// alone.
    pub fn reconcile_orders(
        &self,
        account_id: &AccountId,
        open_orders: &[SnapshotOrder],
        order_cursor: Option<&EventId>,
        as_of: DateTime<Utc>,
    ) -> OrderReconciliation {
        let shard = self.shard(account_id);
        let mut state = shard.write();
        let mut report = OrderReconciliation::default();
        let mut listed = Vec::with_capacity(open_orders.len());

        for order in open_orders {
            let found =
                state.find_local_id(Some(&order.broker_order_id), order.local_order_id.as_ref());
            let local_id = match found {
                Some(id) => id,
                None => {
                    let record = OrderRecord::adopted(&as_event(account_id, order, as_of));
                    let id = record.local_order_id.clone();
                    state.orders.insert(id.clone(), record);
                    report.adopted += 1;
                    tracing::info!(
                        account_id = %account_id,
                        broker_order_id = %order.broker_order_id,
                        "Adopted broker order from snapshot"
                    );
                    id
                }
            };

            if state
                .orders
                .get(&local_id)
                .is_some_and(|r| r.broker_order_id.is_none())
            {
                report.bound += 1;
            }
            state.bind(&local_id, &order.broker_order_id);

            if let Some(record) = state.orders.get_mut(&local_id) {
                let before = (record.status, record.filled_quantity);
                match record.advance(
                    order.status,
                    order.filled_quantity,
                    order.remaining_quantity,
                    order.avg_fill_price,
                    as_of,
                ) {
                    Ok(_) if before != (record.status, record.filled_quantity) => {
                        report.advanced += 1;
                    }
                    Ok(_) => {}
                    Err(rejection) => {
                        report.dropped += 1;
                        tracing::warn!(
                            local_order_id = %local_id,
                            broker_order_id = %order.broker_order_id,
                            reason = %rejection,
                            "Snapshot order update dropped"
                        );
                    }
                }
            }
            listed.push(local_id);
        }

        let vanished_ids: Vec<LocalOrderId> = state
            .orders
            .values()
            .filter(|r| r.is_open() && r.created_at <= as_of && !listed.contains(&r.local_order_id))
            .filter(|r| {
                let waiting = in_flight(r, as_of);
                if waiting {
                    tracing::debug!(
                        local_order_id = %r.local_order_id,
                        "Unacknowledged intent still in flight, not flagged"
                    );
                }
                !waiting
            })
            .map(|r| r.local_order_id.clone())
            .collect();

        for id in vanished_ids {
            if let Some(record) = state.orders.get_mut(&id) {
                if record.mark_closed_unknown(as_of) {
                    tracing::warn!(
                        account_id = %account_id,
                        local_order_id = %id,
                        broker_order_id = ?record.broker_order_id,
                        "Open order missing from snapshot, marked closed-unknown"
                    );
                    report.vanished.push(record.clone());
                }
            }
        }

        if let Some(cursor) = order_cursor {
            state.order_cursor = Some(cursor.clone());
        }
        state.touch(as_of);
        report
    }

    /// Apply the answer to a follow-up query for a `ClosedUnknown` order.
    pub fn resolve_order(
        &self,
        account_id: &AccountId,
        local_order_id: &LocalOrderId,
        lookup: &OrderLookup,
        at: DateTime<Utc>,
    ) -> Resolution {
        let Some(shard) = self.existing_shard(account_id) else {
            return Resolution::NotTracked;
        };
        let mut state = shard.write();

        let Some(record) = state.orders.get(local_order_id) else {
            return Resolution::NotTracked;
        };
        if record.status != OrderStatus::ClosedUnknown {
            return Resolution::AlreadyResolved(record.status);
        }
        let never_arrived = send_known_failed(record, at);

        let resolution = match lookup {
            OrderLookup::Found(order) => {
                state.bind(local_order_id, &order.broker_order_id);
                let Some(record) = state.orders.get_mut(local_order_id) else {
                    return Resolution::NotTracked;
                };
                match record.advance(
                    order.status,
                    order.filled_quantity,
                    order.remaining_quantity,
                    order.avg_fill_price,
                    at,
                ) {
                    Ok(_) => Resolution::Advanced(order.status),
                    Err(rejection) => {
                        tracing::warn!(
                            local_order_id = %local_order_id,
                            reason = %rejection,
                            "Follow-up answer could not be applied"
                        );
                        Resolution::Unresolved
                    }
                }
            }
            OrderLookup::NotFound if never_arrived => {
                let Some(record) = state.orders.get_mut(local_order_id) else {
                    return Resolution::NotTracked;
                };
                let filled = record.filled_quantity;
                match record.advance(OrderStatus::Rejected, filled, Decimal::ZERO, None, at) {
                    Ok(_) => Resolution::Rejected,
                    Err(_) => Resolution::Unresolved,
                }
            }
            OrderLookup::NotFound => Resolution::Unresolved,
        };

        if !matches!(resolution, Resolution::Unresolved) {
            state.touch(at);
        }
        tracing::info!(
            account_id = %account_id,
            local_order_id = %local_order_id,
            resolution = ?resolution,
            "Follow-up order query resolved"
        );
        resolution
    }
}

/// View a snapshot order as an event so it can seed an adopted record.
fn as_event(account_id: &AccountId, order: &SnapshotOrder, at: DateTime<Utc>) -> OrderEvent {
    OrderEvent {
        event_id: EventId::new(format!("snapshot:{}", order.broker_order_id)),
        account_id: account_id.clone(),
        broker_order_id: order.broker_order_id.clone(),
        local_order_id: order.local_order_id.clone(),
        instrument: order.instrument.clone(),
        side: order.side,
        status: order.status,
        quantity: order.quantity,
        filled_quantity: order.filled_quantity,
        remaining_quantity: order.remaining_quantity,
        avg_fill_price: order.avg_fill_price,
        last_fill: None,
        timestamp: at,
    }
}
