//! Market Data adapter.
//!
//! Remembers every requested subscription so it can be restored after the
//! session is re-established; the broker forgets them on disconnect.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{admit, with_retry, DispatchSettings};
use crate::application::ports::{BrokerRequest, BrokerSession};
use crate::application::rate_limit::{OperationClass, RateLimiter};
use crate::domain::connection::{ConnectionState, StateTransition};
use crate::domain::market::MarketDataSubscription;
use crate::domain::InstrumentKey;
use crate::error::GatewayError;

/// Quote subscriptions.
pub struct MarketDataDispatcher {
    session: Arc<dyn BrokerSession>,
    limiter: Arc<RateLimiter>,
    settings: DispatchSettings,
    subscriptions: Mutex<BTreeMap<InstrumentKey, MarketDataSubscription>>,
}

impl std::fmt::Debug for MarketDataDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataDispatcher")
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish_non_exhaustive()
    }
}

impl MarketDataDispatcher {
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
            subscriptions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Subscribe to quotes.
    ///
    /// The subscription is remembered even if the session is down, and is
    /// sent on the next transition into `Ready`.
    ///
    /// # Errors
    ///
    /// Returns the failure of the immediate attempt.
    pub async fn subscribe(&self, subscription: MarketDataSubscription) -> Result<(), GatewayError> {
        self.subscriptions
            .lock()
            .insert(subscription.instrument.clone(), subscription.clone());
        self.send_subscription(subscription).await
    }

    /// Stop quotes for an instrument.
    ///
    /// # Errors
    ///
    /// Returns the failure to deliver the request. The subscription is
    /// forgotten either way.
    pub async fn unsubscribe(&self, instrument: &InstrumentKey) -> Result<(), GatewayError> {
        if self.subscriptions.lock().remove(instrument).is_none() {
            return Ok(());
        }
        let state = self.session.state();
        if !state.is_ready() {
            // the broker dropped it with the session
            return Ok(());
        }

        let (session, limiter) = (&self.session, &self.limiter);
        let admission_timeout = self.settings.admission_timeout;
        let request = BrokerRequest::UnsubscribeMarketData {
            instrument: instrument.clone(),
        };
        with_retry(self.settings.retry, "unsubscribe_market_data", move || {
            let request = request.clone();
            async move {
                admit(limiter, OperationClass::MarketData, admission_timeout).await?;
                session.send(request).await
            }
        })
        .await
    }

    /// Remembered subscriptions, ordered by instrument.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<MarketDataSubscription> {
        self.subscriptions.lock().values().cloned().collect()
    }

    /// Send every remembered subscription again. Returns how many were
    /// restored.
    pub async fn restore_subscriptions(&self) -> usize {
        let pending = self.subscriptions();
        if pending.is_empty() {
            return 0;
        }

        // sent concurrently; the limiter paces them
        let results = join_all(pending.into_iter().map(|subscription| async move {
            let instrument = subscription.instrument.clone();
            (instrument, self.send_subscription(subscription).await)
        }))
        .await;

        let mut restored = 0;
        for (instrument, result) in results {
            match result {
                Ok(()) => restored += 1,
                Err(err) => {
                    tracing::warn!(
                        instrument = %instrument,
                        error = %err,
                        "Failed to restore market data subscription"
                    );
                }
            }
        }

        metrics::counter!("gateway_subscriptions_restored_total").increment(restored as u64);
        tracing::info!(restored, "Market data subscriptions restored");
        restored
    }

    /// Restore subscriptions on every transition into `Ready` until
    /// cancelled.
    pub async fn run_restorer(
        &self,
        mut transitions: broadcast::Receiver<StateTransition>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = transitions.recv() => match received {
                    Ok(transition) if transition.to == ConnectionState::Ready => {
                        self.restore_subscriptions().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Subscription restorer lagged, restoring");
                        if self.session.state().is_ready() {
                            self.restore_subscriptions().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn send_subscription(&self, subscription: MarketDataSubscription) -> Result<(), GatewayError> {
        let state = self.session.state();
        if !state.is_ready() {
            return Err(GatewayError::NotConnected(state));
        }

        let (session, limiter) = (&self.session, &self.limiter);
        let admission_timeout = self.settings.admission_timeout;
        let request = BrokerRequest::SubscribeMarketData(subscription);
        with_retry(self.settings.retry, "subscribe_market_data", move || {
            let request = request.clone();
            async move {
                admit(limiter, OperationClass::MarketData, admission_timeout).await?;
                session.send(request).await
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::dispatch::testing::ScriptedSession;
    use crate::application::rate_limit::RateLimitSettings;
    use crate::domain::connection::TransitionReason;
    use chrono::Utc;

    fn dispatcher(session: &Arc<ScriptedSession>) -> MarketDataDispatcher {
        MarketDataDispatcher::new(
            Arc::clone(session) as Arc<dyn BrokerSession>,
            Arc::new(RateLimiter::new(RateLimitSettings::default())),
            DispatchSettings::default(),
        )
    }

    fn subscription(symbol: &str) -> MarketDataSubscription {
        MarketDataSubscription {
            instrument: InstrumentKey::from(symbol),
            depth: false,
        }
    }

    fn subscribes(session: &ScriptedSession) -> Vec<BrokerRequest> {
        session
            .sent()
            .into_iter()
            .filter(|r| matches!(r, BrokerRequest::SubscribeMarketData(_)))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_requested_while_down_are_sent_on_ready() {
        let session = Arc::new(ScriptedSession::default());
        *session.state.lock() = ConnectionState::Reconnecting;
        let md = Arc::new(dispatcher(&session));

        let err = md.subscribe(subscription("SPY")).await.unwrap_err();
        assert_eq!(err, GatewayError::NotConnected(ConnectionState::Reconnecting));
        assert!(subscribes(&session).is_empty());

        let (tx, rx) = broadcast::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let md = Arc::clone(&md);
            let cancel = cancel.clone();
            async move { md.run_restorer(rx, cancel).await }
        });

        *session.state.lock() = ConnectionState::Ready;
        tx.send(StateTransition {
            from: ConnectionState::Authenticating,
            to: ConnectionState::Ready,
            attempt: 0,
            reason: TransitionReason::Authenticated,
            at: Utc::now(),
        })
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(subscribes(&session), vec![BrokerRequest::SubscribeMarketData(subscription("SPY"))]);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_forgets_the_instrument() {
        let session = Arc::new(ScriptedSession::ready());
        let md = dispatcher(&session);

        md.subscribe(subscription("SPY")).await.unwrap();
        md.subscribe(subscription("QQQ")).await.unwrap();
        md.unsubscribe(&InstrumentKey::from("SPY")).await.unwrap();

        assert_eq!(md.subscriptions(), vec![subscription("QQQ")]);
        assert_eq!(md.restore_subscriptions().await, 1);
    }
}
