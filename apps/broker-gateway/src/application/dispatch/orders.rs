//! Order Execution adapter.

use std::sync::Arc;

use chrono::Utc;

use super::{admit, with_retry, DispatchSettings};
use crate::application::health::HealthMonitor;
use crate::application::ports::{BrokerRequest, BrokerSession};
use crate::application::rate_limit::{OperationClass, RateLimiter};
use crate::application::state::{IntentRegistration, StateManager};
use crate::domain::health::HealthStatus;
use crate::domain::order::{
    OrderIntent, OrderModification, OrderReceipt, OrderRecord, OrderStatus, RejectReason,
};
use crate::domain::{AccountId, LocalOrderId};
use crate::error::GatewayError;

/// Submits, modifies and cancels orders.
pub struct OrderDispatcher {
    session: Arc<dyn BrokerSession>,
    limiter: Arc<RateLimiter>,
    state: Arc<StateManager>,
    health: Arc<HealthMonitor>,
    settings: DispatchSettings,
}

impl std::fmt::Debug for OrderDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderDispatcher")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl OrderDispatcher {
    /// Create the adapter.
    #[must_use]
    pub fn new(
        session: Arc<dyn BrokerSession>,
        limiter: Arc<RateLimiter>,
        state: Arc<StateManager>,
        health: Arc<HealthMonitor>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            session,
            limiter,
            state,
            health,
            settings,
        }
    }

    /// Submit an execution intent.
    ///
    /// The receipt says whether the order was handed to the broker, never
    /// whether it filled. Resubmitting an idempotency key that was already
    /// handed over returns `Accepted` without sending a second order. A key
    /// whose last send failed is sent again until reconciliation concludes
    /// the broker never received it; from then on the order is `Rejected`
    /// and resubmitting the key is refused as `Invalid`.
    pub async fn submit_order(&self, intent: OrderIntent) -> OrderReceipt {
        let local_order_id = intent.idempotency_key.clone();
        let reject = |reason: RejectReason| {
            metrics::counter!("gateway_order_receipts_total", "result" => "rejected").increment(1);
            tracing::info!(
                local_order_id = %intent.idempotency_key,
                reason = %reason,
                "Order intent rejected"
            );
            OrderReceipt::Rejected {
                local_order_id: intent.idempotency_key.clone(),
                reason,
            }
        };

        if let Err(problem) = intent.validate() {
            return reject(RejectReason::Invalid(problem));
        }

        if let Some(existing) = self.state.get_order(&intent.account_id, &local_order_id) {
            if !needs_resend(&existing) {
                return receipt_for_existing(&existing)
                    .unwrap_or_else(|| reject(rejected_key_reason()));
            }
        }

        let state = self.session.state();
        if !state.is_ready() {
            return reject(RejectReason::NotConnected(state));
        }

        if self.health.status() == HealthStatus::Down {
            return reject(RejectReason::Unhealthy(self.health.report().summary()));
        }

        if admit(&self.limiter, OperationClass::Orders, self.settings.admission_timeout)
            .await
            .is_err()
        {
            return reject(RejectReason::RateLimited);
        }

        // a concurrent retry of the same key may have registered it meanwhile
        if let IntentRegistration::Existing(existing) =
            self.state.register_intent(&intent, Utc::now())
        {
            if !needs_resend(&existing) {
                return receipt_for_existing(&existing)
                    .unwrap_or_else(|| reject(rejected_key_reason()));
            }
        }

        let session = &self.session;
        let request = BrokerRequest::PlaceOrder(intent.clone());
        let sent = with_retry(self.settings.retry, "place_order", move || {
            session.send(request.clone())
        })
        .await;

        match sent {
            Ok(()) => {
                self.state
                    .clear_submit_failure(&intent.account_id, &local_order_id);
                metrics::counter!("gateway_order_receipts_total", "result" => "accepted")
                    .increment(1);
                tracing::info!(
                    local_order_id = %local_order_id,
                    instrument = %intent.instrument,
                    side = ?intent.side,
                    quantity = %intent.quantity,
                    "Order intent accepted"
                );
                OrderReceipt::Accepted { local_order_id }
            }
            Err(err) => {
                self.state
                    .record_submit_failure(&intent.account_id, &local_order_id, &err.to_string());
                match err {
                    GatewayError::NotConnected(state) => reject(RejectReason::NotConnected(state)),
                    other => reject(RejectReason::TransportFailure(other.to_string())),
                }
            }
        }
    }

    /// Change the quantity or limit price of a working order.
    ///
    /// The new quantity is the order's total, and must stay above what has
    /// already filled. A modification the cached order already reflects is
    /// not sent. The cached quantity moves when the broker confirms; the
    /// limit price is recorded once the request is handed over.
    ///
    /// # Errors
    ///
    /// Fails if the order is unknown, not yet acknowledged, no longer open,
    /// the modification does not fit the order, or the request could not be
    /// delivered.
    pub async fn modify_order(
        &self,
        account_id: &AccountId,
        local_order_id: &LocalOrderId,
        modification: OrderModification,
    ) -> Result<(), GatewayError> {
        let record = self
            .state
            .get_order(account_id, local_order_id)
            .ok_or_else(|| GatewayError::UnknownOrder(local_order_id.clone()))?;
        if record.status.is_terminal() {
            return Err(GatewayError::OrderNotOpen {
                id: local_order_id.clone(),
                status: record.status,
            });
        }
        modification
            .validate(&record)
            .map_err(|reason| GatewayError::InvalidModification {
                id: local_order_id.clone(),
                reason,
            })?;
        let broker_order_id = record
            .broker_order_id
            .clone()
            .ok_or_else(|| GatewayError::OrderNotAcknowledged(local_order_id.clone()))?;

        if modification.is_reflected_in(&record) {
            tracing::debug!(
                local_order_id = %local_order_id,
                "Modification already reflected, not sent"
            );
            return Ok(());
        }

        let state = self.session.state();
        if !state.is_ready() {
            return Err(GatewayError::NotConnected(state));
        }

        let (session, limiter) = (&self.session, &self.limiter);
        let admission_timeout = self.settings.admission_timeout;
        let request = BrokerRequest::ModifyOrder {
            broker_order_id: broker_order_id.clone(),
            local_order_id: local_order_id.clone(),
            quantity: modification.quantity,
            limit_price: modification.limit_price,
        };
        with_retry(self.settings.retry, "modify_order", move || {
            let request = request.clone();
            async move {
                admit(limiter, OperationClass::Orders, admission_timeout).await?;
                session.send(request).await
            }
        })
        .await?;

        self.state
            .record_modification(account_id, local_order_id, &modification);
        metrics::counter!("gateway_order_modifications_total").increment(1);
        tracing::info!(
            local_order_id = %local_order_id,
            broker_order_id = %broker_order_id,
            quantity = ?modification.quantity,
            limit_price = ?modification.limit_price,
            "Modification requested"
        );
        Ok(())
    }

    /// Request cancellation of a working order.
    ///
    /// # Errors
    ///
    /// Fails if the order is unknown, not yet acknowledged, no longer open,
    /// or the request could not be delivered.
    pub async fn cancel_order(
        &self,
        account_id: &AccountId,
        local_order_id: &LocalOrderId,
    ) -> Result<(), GatewayError> {
        let record = self
            .state
            .get_order(account_id, local_order_id)
            .ok_or_else(|| GatewayError::UnknownOrder(local_order_id.clone()))?;
        if record.status.is_terminal() {
            return Err(GatewayError::OrderNotOpen {
                id: local_order_id.clone(),
                status: record.status,
            });
        }
        let broker_order_id = record
            .broker_order_id
            .ok_or_else(|| GatewayError::OrderNotAcknowledged(local_order_id.clone()))?;

        let state = self.session.state();
        if !state.is_ready() {
            return Err(GatewayError::NotConnected(state));
        }

        let (session, limiter) = (&self.session, &self.limiter);
        let admission_timeout = self.settings.admission_timeout;
        let request = BrokerRequest::CancelOrder {
            broker_order_id: broker_order_id.clone(),
        };
        with_retry(self.settings.retry, "cancel_order", move || {
            let request = request.clone();
            async move {
                admit(limiter, OperationClass::Orders, admission_timeout).await?;
                session.send(request).await
            }
        })
        .await?;

        tracing::info!(
            local_order_id = %local_order_id,
            broker_order_id = %broker_order_id,
            "Cancel requested"
        );
        Ok(())
    }
}

/// A registered order is sent again only if its last send failed before
/// the broker ever acknowledged it, and no follow-up has ruled on it yet.
fn needs_resend(record: &OrderRecord) -> bool {
    matches!(record.status, OrderStatus::Pending | OrderStatus::ClosedUnknown)
        && record.broker_order_id.is_none()
        && record.last_submit_error.is_some()
}

fn receipt_for_existing(record: &OrderRecord) -> Option<OrderReceipt> {
    (record.status != OrderStatus::Rejected).then(|| OrderReceipt::Accepted {
        local_order_id: record.local_order_id.clone(),
    })
}

fn rejected_key_reason() -> RejectReason {
    RejectReason::Invalid("idempotency key already used by a rejected order".to_string())
}
