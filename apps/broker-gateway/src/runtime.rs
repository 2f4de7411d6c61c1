//! Gateway runtime: wires the engine together and owns its tasks.
//!
//! ```text
//!                 ┌────────────────────┐  events   ┌──────────────┐   raw    ┌────────────┐
//! transport ─────►│ ConnectionManager  │──────────►│   pipeline   │─────────►│ event sink │
//!                 └────────────────────┘           │  (consumer)  │          └────────────┘
//!                     ▲   │ transitions            └──────────────┘
//!                     │   ▼                               ▲ snapshots, resolutions
//!               dispatchers, restorer ◄── RateLimiter     │
//!                                       ReconciliationLoop┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::application::checkpoint::CheckpointKeeper;
use crate::application::dispatch::{AccountDispatcher, MarketDataDispatcher, OrderDispatcher};
use crate::application::health::HealthMonitor;
use crate::application::pipeline::{self, EventForwarder, PipelineConsumer};
use crate::application::ports::{BrokerSession, BrokerTransport, CheckpointStore, EventSink};
use crate::application::rate_limit::RateLimiter;
use crate::application::reconciliation::ReconciliationLoop;
use crate::application::state::StateManager;
use crate::domain::checkpoint::Checkpoint;
use crate::error::GatewayError;
use crate::infrastructure::config::GatewayConfig;
use crate::infrastructure::connection::{ConnectionHandle, ConnectionManager};

/// Upper bound on waiting for background tasks at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// A running gateway.
pub struct Gateway {
    connection: ConnectionHandle,
    orders: Arc<OrderDispatcher>,
    market_data: Arc<MarketDataDispatcher>,
    account: Arc<AccountDispatcher>,
    state: Arc<StateManager>,
    health: Arc<HealthMonitor>,
    limiter: Arc<RateLimiter>,
    checkpoints: Arc<CheckpointKeeper>,
    reconcile: Arc<Notify>,
    restored: Option<Checkpoint>,
    cancel: CancellationToken,
    pipeline_cancel: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("connection", &self.connection)
            .field("health", &self.health.status())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Restore the checkpoint, spawn every task and start connecting.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShuttingDown`] if the connection event loop
    /// stopped before it could be started.
    pub async fn start(
        config: &GatewayConfig,
        transport: Box<dyn BrokerTransport>,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, GatewayError> {
        let account_id = config.account_id().clone();
        let cancel = CancellationToken::new();
        let pipeline_cancel = CancellationToken::new();
        let tasks = TaskTracker::new();

        let health = Arc::new(HealthMonitor::new());
        let state = Arc::new(StateManager::with_dedup_window(
            account_id.clone(),
            config.pipeline.dedup_window,
        ));
        let limiter = Arc::new(RateLimiter::new(config.rate_limits));

        let checkpoints = Arc::new(CheckpointKeeper::new(
            store,
            config.session_id(),
            account_id.clone(),
            config.checkpoint.ttl,
        ));
        let restored = checkpoints.restore(&state).await;

        let (pipeline, pipeline_rx) = pipeline::channel();
        let forwarder = EventForwarder::new(sink, Arc::clone(&health), config.pipeline.forwarder);
        tasks.spawn(
            PipelineConsumer::new(
                Arc::clone(&state),
                forwarder,
                pipeline_rx,
                config.pipeline.flush_interval,
                pipeline_cancel.clone(),
            )
            .run(),
        );

        let (manager, connection) = ConnectionManager::new(
            transport,
            config.connection_settings(),
            pipeline.clone(),
            Arc::clone(&health),
            cancel.clone(),
        );
        let session: Arc<dyn BrokerSession> = Arc::new(connection.clone());

        let orders = Arc::new(OrderDispatcher::new(
            Arc::clone(&session),
            Arc::clone(&limiter),
            Arc::clone(&state),
            Arc::clone(&health),
            config.dispatch,
        ));
        let market_data = Arc::new(MarketDataDispatcher::new(
            Arc::clone(&session),
            Arc::clone(&limiter),
            config.dispatch,
        ));
        let account = Arc::new(AccountDispatcher::new(
            session,
            Arc::clone(&limiter),
            config.dispatch,
        ));

        let reconciliation = ReconciliationLoop::new(
            account_id,
            Arc::clone(&account),
            pipeline,
            Arc::clone(&state),
            Arc::clone(&health),
            config.reconciliation,
        )
        .with_checkpoints(Arc::clone(&checkpoints));
        let reconcile = reconciliation.trigger();

        // Subscribe before the manager runs so the first Ready is seen.
        tasks.spawn(reconciliation.run(connection.subscribe_transitions(), cancel.clone()));
        {
            let market_data = Arc::clone(&market_data);
            let transitions = connection.subscribe_transitions();
            let cancel = cancel.clone();
            tasks.spawn(async move { market_data.run_restorer(transitions, cancel).await });
        }
        tasks.spawn(manager.run());

        connection.start().await?;
        tracing::info!(
            session_id = %config.session_id(),
            restored = restored.is_some(),
            "Gateway started"
        );

        Ok(Self {
            connection,
            orders,
            market_data,
            account,
            state,
            health,
            limiter,
            checkpoints,
            reconcile,
            restored,
            cancel,
            pipeline_cancel,
            tasks,
        })
    }

    /// Session handle.
    #[must_use]
    pub const fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Order adapter.
    #[must_use]
    pub fn orders(&self) -> &OrderDispatcher {
        &self.orders
    }

    /// Market data adapter.
    #[must_use]
    pub fn market_data(&self) -> &MarketDataDispatcher {
        &self.market_data
    }

    /// Account adapter.
    #[must_use]
    pub fn account(&self) -> &AccountDispatcher {
        &self.account
    }

    /// Local cache.
    #[must_use]
    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    /// Health signal.
    #[must_use]
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Rate limiter.
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The checkpoint accepted at startup, if any.
    #[must_use]
    pub const fn restored_checkpoint(&self) -> Option<&Checkpoint> {
        self.restored.as_ref()
    }

    /// Ask the reconciliation loop for an immediate pass.
    pub fn reconcile_now(&self) {
        self.reconcile.notify_one();
    }

    /// Close the session, stop every task and write a final checkpoint.
    ///
    /// Events already received are applied before the checkpoint is taken.
    pub async fn shutdown(self) -> Option<Checkpoint> {
        tracing::info!("Gateway shutting down");
        self.connection.shutdown().await;
        self.cancel.cancel();
        self.pipeline_cancel.cancel();

        self.tasks.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "Background tasks did not stop in time"
            );
        }

        match self.checkpoints.save(&self.state).await {
            Ok(checkpoint) => {
                tracing::info!(saved_at = %checkpoint.saved_at, "Final checkpoint written");
                Some(checkpoint)
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to write final checkpoint");
                None
            }
        }
    }
}
