//! Shared fixtures: a gateway wired to the paper broker.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use broker_gateway::domain::events::BrokerEvent;
use broker_gateway::domain::order::{OrderType, Side};
use broker_gateway::{
    AccountId, ConnectionState, Credentials, FileCheckpointStore, Gateway, GatewayConfig,
    LocalOrderId, OrderIntent, PaperBroker, PaperBrokerControl,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const ACCOUNT: &str = "DU1234567";

pub fn account() -> AccountId {
    AccountId::from(ACCOUNT)
}

pub fn credentials() -> Credentials {
    Credentials::new("trader".to_string(), "hunter2".to_string(), account())
}

pub fn config() -> GatewayConfig {
    GatewayConfig::new(credentials())
}

pub fn market(key: &str, side: Side, quantity: Decimal) -> OrderIntent {
    OrderIntent {
        idempotency_key: LocalOrderId::from(key),
        account_id: account(),
        instrument: "SPY".into(),
        side,
        order_type: OrderType::Market,
        quantity,
        limit_price: None,
    }
}

pub struct Harness {
    pub gateway: Gateway,
    pub control: PaperBrokerControl,
    pub downstream: mpsc::Receiver<BrokerEvent>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn start(config: GatewayConfig) -> Self {
        Self::start_in(config, tempfile::tempdir().unwrap(), |_| {}).await
    }

    /// Start with a checkpoint directory and a hook to prepare the broker.
    pub async fn start_in(
        config: GatewayConfig,
        dir: TempDir,
        prepare: impl FnOnce(&PaperBrokerControl),
    ) -> Self {
        let (broker, control) = PaperBroker::new(account(), dec!(1000000));
        prepare(&control);
        let (sink, downstream) = mpsc::channel(config.pipeline.downstream_capacity);
        let store = Arc::new(FileCheckpointStore::new(checkpoint_path(&dir)));
        let gateway = Gateway::start(&config, Box::new(broker), Arc::new(sink), store)
            .await
            .unwrap();
        Self {
            gateway,
            control,
            downstream,
            dir,
        }
    }

    pub async fn wait_for(&self, target: ConnectionState) {
        tokio::time::timeout(
            Duration::from_secs(600),
            self.gateway.connection().wait_for(|s| s == target),
        )
        .await
        .expect("state not reached")
        .unwrap();
    }

    pub async fn ready(&self) {
        self.wait_for(ConnectionState::Ready).await;
        settle().await;
    }

    /// Everything forwarded so far.
    pub fn drain(&mut self) -> Vec<BrokerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.downstream.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn checkpoint_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("checkpoint.json")
}

/// Let spawned tasks process queued work. Time is paused in these tests,
/// so the sleep only returns once every task is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
