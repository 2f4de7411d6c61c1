//! Dispatchers
//!
//! Thin request/response shims over the managed session. Every call is
//! admitted by the [`RateLimiter`] first; transient failures are retried
//! here with bounded backoff and never surface past the dispatcher, except
//! as an order rejection receipt.

mod account;
mod market_data;
mod orders;

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::application::backoff::{BackoffConfig, BackoffPolicy};
use crate::application::rate_limit::{OperationClass, RateLimiter};
use crate::error::GatewayError;

pub use account::AccountDispatcher;
pub use market_data::MarketDataDispatcher;
pub use orders::OrderDispatcher;

/// Dispatcher timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchSettings {
    /// How long a correlated request may wait for its response.
    pub request_timeout: Duration,
    /// How long a call may wait for a rate-limit token.
    pub admission_timeout: Duration,
    /// Retry policy for transient failures.
    pub retry: BackoffConfig,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            admission_timeout: Duration::from_secs(5),
            retry: BackoffConfig {
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(2),
                jitter_factor: 0.0,
                max_attempts: 3,
            },
        }
    }
}

/// Wait for a token of `class` for at most `timeout`.
async fn admit(
    limiter: &RateLimiter,
    class: OperationClass,
    timeout: Duration,
) -> Result<(), GatewayError> {
    limiter
        .acquire_blocking(class, Instant::now() + timeout)
        .await
        .map_err(|_| GatewayError::RateLimited(class))
}

/// Run `call` until it succeeds, fails non-retriably, or the retry budget
/// is spent.
async fn with_retry<T, F, Fut>(
    retry: BackoffConfig,
    operation: &'static str,
    mut call: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut backoff = BackoffPolicy::new(retry);
    loop {
        let err = match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() => err,
            Err(err) => return Err(err),
        };

        let Some(delay) = backoff.next_delay() else {
            tracing::warn!(
                operation,
                attempts = backoff.attempt_count(),
                error = %err,
                "Retries exhausted"
            );
            return Err(err);
        };

        metrics::counter!("gateway_dispatch_retries_total", "operation" => operation)
            .increment(1);
        tracing::debug!(
            operation,
            attempt = backoff.attempt_count(),
            delay_ms = delay.as_millis(),
            reason = err.kind().reason(),
            "Retrying after transient failure"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted session fake shared by the dispatcher tests.

    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::{mpsc, oneshot};
    use tokio_util::sync::CancellationToken;

    use crate::application::health::HealthMonitor;
    use crate::application::pipeline::{
        self, EventForwarder, ForwarderSettings, PipelineConsumer, PipelineSender, SnapshotOutcome,
    };
    use crate::application::ports::{BrokerRequest, BrokerResponse, BrokerSession};
    use crate::application::state::StateManager;
    use crate::domain::connection::ConnectionState;
    use crate::domain::events::BrokerEvent;
    use crate::domain::{AccountId, EventId};
    use crate::error::GatewayError;

    /// Answers scripted responses in order. Snapshot answers are staged on
    /// `pipeline`, followed by whatever `after_snapshot` holds, the way the
    /// connection loop stages them ahead of later stream events.
    #[derive(Debug, Default)]
    pub struct ScriptedSession {
        pub state: Mutex<ConnectionState>,
        pub sent: Mutex<Vec<BrokerRequest>>,
        pub send_results: Mutex<VecDeque<Result<(), GatewayError>>>,
        pub send_delay: Mutex<Option<Duration>>,
        pub responses: Mutex<VecDeque<Result<BrokerResponse, GatewayError>>>,
        pub pipeline: Mutex<Option<PipelineSender>>,
        pub after_snapshot: Mutex<Vec<BrokerEvent>>,
    }

    /// Spawn a consumer applying to `state`. Keep the receiver alive for as
    /// long as events should forward.
    pub fn spawn_pipeline(
        state: Arc<StateManager>,
        cancel: CancellationToken,
    ) -> (PipelineSender, mpsc::Receiver<BrokerEvent>) {
        let (sink_tx, sink) = mpsc::channel(64);
        let (sender, rx) = pipeline::channel();
        tokio::spawn(
            PipelineConsumer::new(
                state,
                EventForwarder::new(
                    Arc::new(sink_tx),
                    Arc::new(HealthMonitor::new()),
                    ForwarderSettings::default(),
                ),
                rx,
                Duration::from_millis(50),
                cancel,
            )
            .run(),
        );
        (sender, sink)
    }

    impl ScriptedSession {
        pub fn ready() -> Self {
            let session = Self::default();
            *session.state.lock() = ConnectionState::Ready;
            session
        }

        pub fn sent(&self) -> Vec<BrokerRequest> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl BrokerSession for ScriptedSession {
        fn state(&self) -> ConnectionState {
            *self.state.lock()
        }

        async fn send(&self, request: BrokerRequest) -> Result<(), GatewayError> {
            let state = self.state();
            if !state.is_ready() {
                return Err(GatewayError::NotConnected(state));
            }
            self.sent.lock().push(request);
            let delay = *self.send_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.send_results.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn request(
            &self,
            request: BrokerRequest,
            _timeout: Duration,
        ) -> Result<BrokerResponse, GatewayError> {
            let state = self.state();
            if !state.is_ready() {
                return Err(GatewayError::NotConnected(state));
            }
            self.sent.lock().push(request);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or(Ok(BrokerResponse::Ack))
        }

        async fn snapshot(
            &self,
            account_id: &AccountId,
            order_cursor: Option<EventId>,
            timeout: Duration,
        ) -> Result<SnapshotOutcome, GatewayError> {
            let request = BrokerRequest::Snapshot {
                account_id: account_id.clone(),
                order_cursor,
            };
            let BrokerResponse::Snapshot(snapshot) = self.request(request, timeout).await? else {
                return Err(GatewayError::UnexpectedResponse("not a snapshot".into()));
            };
            let pipeline = self
                .pipeline
                .lock()
                .clone()
                .ok_or(GatewayError::ShuttingDown)?;

            let (reply, outcome) = oneshot::channel();
            pipeline.stage_snapshot(account_id, snapshot, reply);
            let after: Vec<BrokerEvent> = self.after_snapshot.lock().drain(..).collect();
            for event in after {
                let _ = pipeline.publish(event);
            }
            outcome.await.map_err(|_| GatewayError::SessionLost)?
        }
    }
}
