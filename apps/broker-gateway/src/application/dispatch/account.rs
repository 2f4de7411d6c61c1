//! Account adapter: snapshots and individual order queries.

use std::sync::Arc;

use super::{admit, with_retry, DispatchSettings};
use crate::application::pipeline::SnapshotOutcome;
use crate::application::ports::{BrokerRequest, BrokerResponse, BrokerSession};
use crate::application::rate_limit::{OperationClass, RateLimiter};
use crate::domain::events::OrderLookup;
use crate::domain::{AccountId, BrokerOrderId, EventId, LocalOrderId};
use crate::error::GatewayError;

/// Account queries.
pub struct AccountDispatcher {
    session: Arc<dyn BrokerSession>,
    limiter: Arc<RateLimiter>,
    settings: DispatchSettings,
}

impl std::fmt::Debug for AccountDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountDispatcher")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl AccountDispatcher {
    /// Create the adapter.
    #[must_use]
    pub fn new(
        session: Arc<dyn BrokerSession>,
        limiter: Arc<RateLimiter>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            session,
            limiter,
            settings,
        }
    }

    /// Fetch an authoritative snapshot of positions, open orders and account
    /// values, and wait until it has been applied to the cache in stream
    /// order.
    ///
    /// # Errors
    ///
    /// Returns the last failure once retries are exhausted, or immediately
    /// for non-retriable failures. A snapshot for another account is refused
    /// with [`GatewayError::UnexpectedResponse`].
    pub async fn snapshot(
        &self,
        account_id: &AccountId,
        order_cursor: Option<EventId>,
    ) -> Result<SnapshotOutcome, GatewayError> {
        self.ensure_ready()?;
        let (session, limiter) = (&self.session, &self.limiter);
        let (admission_timeout, request_timeout) =
            (self.settings.admission_timeout, self.settings.request_timeout);
        with_retry(self.settings.retry, "snapshot", move || {
            let order_cursor = order_cursor.clone();
            async move {
                admit(limiter, OperationClass::Account, admission_timeout).await?;
                session
                    .snapshot(account_id, order_cursor, request_timeout)
                    .await
            }
        })
        .await
    }

    /// Look up one order by broker id (when known) or client order id.
    ///
    /// # Errors
    ///
    /// As for [`snapshot`](Self::snapshot).
    pub async fn query_order(
        &self,
        account_id: &AccountId,
        broker_order_id: Option<BrokerOrderId>,
        local_order_id: &LocalOrderId,
    ) -> Result<OrderLookup, GatewayError> {
        let response = self
            .call(
                "query_order",
                BrokerRequest::QueryOrder {
                    account_id: account_id.clone(),
                    broker_order_id,
                    local_order_id: local_order_id.clone(),
                },
            )
            .await?;
        match response {
            BrokerResponse::Order(lookup) => Ok(lookup),
            other => Err(GatewayError::UnexpectedResponse(format!(
                "{other:?} to order query"
            ))),
        }
    }

    fn ensure_ready(&self) -> Result<(), GatewayError> {
        let state = self.session.state();
        if state.is_ready() {
            Ok(())
        } else {
            Err(GatewayError::NotConnected(state))
        }
    }

    async fn call(
        &self,
        operation: &'static str,
        request: BrokerRequest,
    ) -> Result<BrokerResponse, GatewayError> {
        self.ensure_ready()?;

        let (session, limiter) = (&self.session, &self.limiter);
        let (admission_timeout, request_timeout) =
            (self.settings.admission_timeout, self.settings.request_timeout);
        with_retry(self.settings.retry, operation, move || {
            let request = request.clone();
            async move {
                admit(limiter, OperationClass::Account, admission_timeout).await?;
                session.request(request, request_timeout).await
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::dispatch::testing::{spawn_pipeline, ScriptedSession};
    use crate::application::rate_limit::RateLimitSettings;
    use crate::application::state::StateManager;
    use crate::domain::events::{BrokerEvent, BrokerSnapshot};
    use crate::domain::position::SnapshotPosition;
    use crate::domain::InstrumentKey;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn piped_session(
        state: &Arc<StateManager>,
    ) -> (Arc<ScriptedSession>, mpsc::Receiver<BrokerEvent>) {
        let session = Arc::new(ScriptedSession::ready());
        let (sender, sink) = spawn_pipeline(Arc::clone(state), CancellationToken::new());
        *session.pipeline.lock() = Some(sender);
        (session, sink)
    }

    fn dispatcher(session: &Arc<ScriptedSession>) -> AccountDispatcher {
        AccountDispatcher::new(
            Arc::clone(session) as Arc<dyn BrokerSession>,
            Arc::new(RateLimiter::new(RateLimitSettings::default())),
            DispatchSettings::default(),
        )
    }

    fn empty_snapshot(account: &str) -> BrokerSnapshot {
        BrokerSnapshot {
            account_id: AccountId::from(account),
            positions: Vec::new(),
            open_orders: Vec::new(),
            account_values: Vec::new(),
            order_cursor: None,
            as_of: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_survives_a_timeout() {
        let state = Arc::new(StateManager::new(AccountId::from("DU1")));
        let (session, _sink) = piped_session(&state);
        let mut snapshot = empty_snapshot("DU1");
        snapshot.positions.push(SnapshotPosition {
            instrument: InstrumentKey::from("SPY"),
            quantity: dec!(2),
            avg_cost: dec!(500),
        });
        session.responses.lock().extend([
            Err(GatewayError::Timeout("snapshot".into())),
            Ok(BrokerResponse::Snapshot(snapshot)),
        ]);
        let account = dispatcher(&session);

        let outcome = account.snapshot(&AccountId::from("DU1"), None).await.unwrap();
        assert_eq!(outcome.positions.added.len(), 1);
        assert_eq!(
            state.get_position(&InstrumentKey::from("SPY")).unwrap().quantity,
            dec!(2)
        );
        assert_eq!(session.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_for_another_account_is_refused() {
        let state = Arc::new(StateManager::new(AccountId::from("DU1")));
        let (session, _sink) = piped_session(&state);
        let mut foreign = empty_snapshot("DU2");
        foreign.positions.push(SnapshotPosition {
            instrument: InstrumentKey::from("SPY"),
            quantity: dec!(9),
            avg_cost: dec!(500),
        });
        session
            .responses
            .lock()
            .push_back(Ok(BrokerResponse::Snapshot(foreign)));

        let err = dispatcher(&session)
            .snapshot(&AccountId::from("DU1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnexpectedResponse(_)));
        assert!(state.get_position(&InstrumentKey::from("SPY")).is_none());
        assert_eq!(session.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn query_order_returns_lookup() {
        let session = Arc::new(ScriptedSession::ready());
        session
            .responses
            .lock()
            .push_back(Ok(BrokerResponse::Order(OrderLookup::NotFound)));

        let lookup = dispatcher(&session)
            .query_order(&AccountId::from("DU1"), None, &LocalOrderId::from("ord-1"))
            .await
            .unwrap();
        assert_eq!(lookup, OrderLookup::NotFound);
    }
}
