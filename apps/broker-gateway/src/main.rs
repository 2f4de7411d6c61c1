//! Broker Gateway Binary
//!
//! Runs the gateway against the built-in paper broker and serves the health
//! endpoint until SIGINT or SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin broker-gateway
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `BROKER_USERNAME`, `BROKER_PASSWORD`: Broker login
//! - `BROKER_ACCOUNT_ID`: Account the session trades
//!
//! ## Optional
//! - `GATEWAY_ENV`: PAPER | LIVE (default: PAPER)
//! - `GATEWAY_SUBSCRIPTIONS`: Comma-separated instruments to stream (default: none)
//! - `PAPER_STARTING_CASH`: Paper account cash (default: 1000000)
//! - `HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `CHECKPOINT_PATH`: Checkpoint file (default: data/gateway-checkpoint.json)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log filter (default: info)
//!
//! See `GatewayConfig::from_env` for session, rate limit and pipeline tuning.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use broker_gateway::application::ports::{CheckpointStore, EventSink};
use broker_gateway::domain::events::BrokerEvent;
use broker_gateway::domain::market::MarketDataSubscription;
use broker_gateway::infrastructure::telemetry;
use broker_gateway::{
    Environment, FileCheckpointStore, Gateway, GatewayConfig, HealthServer, HealthServerState,
    InstrumentKey, PaperBroker, PaperBrokerControl, init_metrics,
};
use rust_decimal::Decimal;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How often the paper broker publishes quotes.
const QUOTE_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv_from_ancestors();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting Broker Gateway");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed, /metrics disabled");
    }

    let config = GatewayConfig::from_env()?;
    log_config(&config);

    if config.environment == Environment::Live {
        bail!("LIVE environment requires a broker transport; this binary only ships the paper broker");
    }

    let starting_cash = match std::env::var("PAPER_STARTING_CASH") {
        Ok(raw) => Decimal::from_str(&raw)
            .with_context(|| format!("invalid PAPER_STARTING_CASH: {raw}"))?,
        Err(_) => Decimal::from(1_000_000),
    };
    let (broker, control) = PaperBroker::new(config.account_id().clone(), starting_cash);

    let shutdown_token = CancellationToken::new();

    // Downstream consumer
    let (sink_tx, sink_rx) = mpsc::channel::<BrokerEvent>(config.pipeline.downstream_capacity);
    let sink: Arc<dyn EventSink> = Arc::new(sink_tx);
    tokio::spawn(drain_downstream(sink_rx));

    let store: Arc<dyn CheckpointStore> =
        Arc::new(FileCheckpointStore::new(config.checkpoint.path.clone()));

    let gateway = Gateway::start(&config, Box::new(broker), sink, store).await?;

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(gateway.health()),
        Arc::clone(gateway.state()),
        Arc::clone(gateway.limiter()),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tokio::spawn(publish_quotes(control, shutdown_token.clone()));

    for instrument in subscriptions_from_env() {
        let subscription = MarketDataSubscription {
            instrument: instrument.clone(),
            depth: false,
        };
        if let Err(e) = gateway.market_data().subscribe(subscription).await {
            tracing::info!(
                instrument = %instrument,
                error = %e,
                "Subscription deferred until session is ready"
            );
        }
    }

    tracing::info!("Broker gateway ready");

    await_shutdown(shutdown_token).await;

    if gateway.shutdown().await.is_none() {
        tracing::warn!("Stopped without a final checkpoint");
    }

    tracing::info!("Broker gateway stopped");
    Ok(())
}

/// Log events reaching the downstream consumer.
async fn drain_downstream(mut rx: mpsc::Receiver<BrokerEvent>) {
    while let Some(event) = rx.recv().await {
        match &event {
            BrokerEvent::Order(order) => tracing::info!(
                local_order_id = ?order.local_order_id,
                status = order.status.as_str(),
                filled = %order.filled_quantity,
                "Order update"
            ),
            other => tracing::debug!(kind = other.kind(), "Event forwarded"),
        }
    }
}

/// Drive the paper broker's quote stream.
async fn publish_quotes(control: PaperBrokerControl, shutdown_token: CancellationToken) {
    let mut ticker = tokio::time::interval(QUOTE_INTERVAL);
    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => break,
            _ = ticker.tick() => {
                let published = control.publish_quotes();
                tracing::trace!(published, "Paper quotes published");
            }
        }
    }
}

fn subscriptions_from_env() -> Vec<InstrumentKey> {
    std::env::var("GATEWAY_SUBSCRIPTIONS")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(InstrumentKey::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        environment = config.environment.as_str(),
        session_id = %config.session_id(),
        account_id = %config.account_id(),
        health_port = config.server.health_port,
        checkpoint = %config.checkpoint.path.display(),
        "Configuration loaded"
    );
    tracing::debug!(
        connect_timeout_secs = config.session.connect_timeout.as_secs(),
        heartbeat_interval_secs = config.session.heartbeat.interval.as_secs(),
        max_reconnect_attempts = config.session.backoff.max_attempts,
        "Session timings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
