//! Connection Lifecycle Integration Tests
//!
//! Drives the connection event loop against the paper broker: ordered
//! transition broadcast, heartbeat loss, fatal sessions and retry limits.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use broker_gateway::application::health::HealthMonitor;
use broker_gateway::application::pipeline::{self, PipelineMessage, SnapshotOutcome};
use broker_gateway::application::ports::BrokerRequest;
use broker_gateway::domain::events::BrokerEvent;
use broker_gateway::domain::order::Side;
use broker_gateway::domain::market::MarketDataSubscription;
use broker_gateway::{
    ConnectionHandle, ConnectionManager, ConnectionSettings, ConnectionState, GatewayError,
    FillMode, HealthStatus, InstrumentKey, LocalOrderId, LoginBehavior, OrderStatus, PaperBroker, PaperBrokerControl, StateTransition,
    TransitionReason,
};
use rust_decimal_macros::dec;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

use ConnectionState::{
    Authenticating, Connecting, Disconnected, FailedPermanently, Ready, Reconnecting,
};
use support::Harness;

struct Session {
    handle: ConnectionHandle,
    control: PaperBrokerControl,
    health: Arc<HealthMonitor>,
    transitions: broadcast::Receiver<StateTransition>,
    events: mpsc::UnboundedReceiver<PipelineMessage>,
}

/// A running event loop, subscribed before the first transition.
fn session(prepare: impl FnOnce(&PaperBrokerControl)) -> Session {
    let (broker, control) = PaperBroker::new(support::account(), dec!(100000));
    prepare(&control);
    let (sender, events) = pipeline::channel();
    let health = Arc::new(HealthMonitor::new());
    let (manager, handle) = ConnectionManager::new(
        Box::new(broker),
        ConnectionSettings::new(support::credentials()),
        sender,
        Arc::clone(&health),
        CancellationToken::new(),
    );
    let transitions = handle.subscribe_transitions();
    tokio::spawn(manager.run());
    Session {
        handle,
        control,
        health,
        transitions,
        events,
    }
}

impl Session {
    async fn wait_for(&self, target: ConnectionState) {
        timeout(
            Duration::from_secs(600),
            self.handle.wait_for(|s| s == target),
        )
        .await
        .expect("state not reached")
        .unwrap();
    }

    fn seen(&mut self) -> Vec<StateTransition> {
        let mut seen = Vec::new();
        while let Ok(transition) = self.transitions.try_recv() {
            seen.push(transition);
        }
        seen
    }
}

fn edges(transitions: &[StateTransition]) -> Vec<(ConnectionState, ConnectionState)> {
    transitions.iter().map(|t| (t.from, t.to)).collect()
}

#[tokio::test(start_paused = true)]
async fn transitions_are_broadcast_once_and_in_order() {
    let mut s = session(|_| {});
    s.handle.start().await.unwrap();
    s.wait_for(Ready).await;

    let dropped_at = Instant::now();
    s.control.drop_connection();
    s.wait_for(Reconnecting).await;
    s.wait_for(Ready).await;
    assert!(dropped_at.elapsed() >= Duration::from_secs(2));

    s.handle.shutdown().await;

    let seen = s.seen();
    assert_eq!(
        edges(&seen),
        vec![
            (Disconnected, Connecting),
            (Connecting, Authenticating),
            (Authenticating, Ready),
            (Ready, Reconnecting),
            (Reconnecting, Connecting),
            (Connecting, Authenticating),
            (Authenticating, Ready),
            (Ready, Disconnected),
        ]
    );
    assert!(matches!(seen[3].reason, TransitionReason::TransportError(_)));
    assert_eq!(seen[4].reason, TransitionReason::BackoffElapsed);
    assert_eq!(seen[4].attempt, 1);
    assert_eq!(seen[6].attempt, 0, "attempts reset on Ready");
    assert_eq!(seen[7].reason, TransitionReason::Shutdown);
    assert_eq!(s.control.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_heartbeat_drops_the_session() {
    let mut s = session(|_| {});
    s.handle.start().await.unwrap();
    s.wait_for(Ready).await;
    s.seen();

    s.control.ack_heartbeats(false);
    let silent_since = Instant::now();
    s.wait_for(Reconnecting).await;

    // first ping at the interval, declared dead one timeout later
    let elapsed = silent_since.elapsed();
    assert!(elapsed >= Duration::from_secs(10), "{elapsed:?}");
    assert!(elapsed <= Duration::from_secs(15) + Duration::from_millis(100), "{elapsed:?}");
    assert!(matches!(s.handle.last_error(), Some(GatewayError::Timeout(_))));
    assert_eq!(s.health.status(), HealthStatus::Degraded);

    s.control.ack_heartbeats(true);
    s.wait_for(Ready).await;
    assert_eq!(s.health.status(), HealthStatus::Healthy);
    assert_eq!(s.handle.last_error(), None);

    let seen = s.seen();
    assert_eq!(seen[0].reason, TransitionReason::HeartbeatTimeout);
    assert_eq!(seen.last().map(|t| t.attempt), Some(0));
}

#[tokio::test(start_paused = true)]
async fn concurrent_session_while_ready_fails_permanently() {
    let mut s = session(|_| {});
    s.handle.start().await.unwrap();
    s.wait_for(Ready).await;

    s.control.reject_session("session taken over", true);
    s.wait_for(FailedPermanently).await;

    assert_eq!(s.handle.last_error(), Some(GatewayError::ConcurrentSession));
    assert_eq!(s.health.status(), HealthStatus::Down);
    let last = s.seen().pop().unwrap();
    assert!(matches!(last.reason, TransitionReason::AuthenticationFatal(_)));

    // no automatic retry, and start is not a way out
    let connects = s.control.connects();
    s.handle.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(s.control.connects(), connects);
    assert_eq!(s.handle.state(), FailedPermanently);
}

#[tokio::test(start_paused = true)]
async fn rejected_login_is_never_retried() {
    let mut s = session(|c| c.set_login(LoginBehavior::Reject("bad password".into())));
    s.handle.start().await.unwrap();
    s.wait_for(FailedPermanently).await;

    assert_eq!(s.control.logins(), 1);
    assert!(matches!(
        s.handle.last_error(),
        Some(GatewayError::AuthenticationRejected(_))
    ));
    assert_eq!(
        edges(&s.seen()),
        vec![
            (Disconnected, Connecting),
            (Connecting, Authenticating),
            (Authenticating, FailedPermanently),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn retry_budget_exhaustion_fails_permanently() {
    let mut s = session(|c| c.refuse_connects(100));
    let started = Instant::now();
    s.handle.start().await.unwrap();
    s.wait_for(FailedPermanently).await;

    // 2 + 4 + 8 + 16 + 32 seconds of backoff
    assert!(started.elapsed() >= Duration::from_secs(62));
    assert_eq!(s.control.connects(), 6);
    let last = s.seen().pop().unwrap();
    assert_eq!(last.reason, TransitionReason::MaxAttemptsExceeded(5));
    assert_eq!(s.health.status(), HealthStatus::Down);
}

#[tokio::test(start_paused = true)]
async fn reconnect_request_skips_the_backoff() {
    let mut s = session(|c| c.refuse_connects(1));
    s.handle.start().await.unwrap();
    s.wait_for(Reconnecting).await;

    let requested_at = Instant::now();
    s.handle.reconnect().await.unwrap();
    s.wait_for(Ready).await;
    assert!(requested_at.elapsed() < Duration::from_secs(2));

    let seen = s.seen();
    let resumed = seen.iter().find(|t| t.from == Reconnecting).unwrap();
    assert_eq!(resumed.reason, TransitionReason::Requested);
}

#[tokio::test(start_paused = true)]
async fn requests_fail_fast_while_not_ready() {
    let s = session(|c| c.refuse_connects(100));
    s.handle.start().await.unwrap();
    s.wait_for(Reconnecting).await;

    let err = broker_gateway::BrokerSession::send(
        &s.handle,
        broker_gateway::application::ports::BrokerRequest::Heartbeat,
    )
    .await
    .unwrap_err();
    assert_eq!(err, GatewayError::NotConnected(Reconnecting));
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
    let s = session(|c| c.answer_requests(false));
    s.handle.start().await.unwrap();
    s.wait_for(Ready).await;

    let err = broker_gateway::BrokerSession::request(
        &s.handle,
        broker_gateway::application::ports::BrokerRequest::Snapshot {
            account_id: support::account(),
            order_cursor: None,
        },
        Duration::from_secs(3),
    )
    .await
    .unwrap_err();
    assert_eq!(err, GatewayError::Timeout("snapshot".to_string()));
    assert_eq!(s.handle.state(), Ready);
}

#[tokio::test(start_paused = true)]
async fn abandoned_requests_are_swept() {
    let s = session(|c| c.answer_requests(false));
    s.handle.start().await.unwrap();
    s.wait_for(Ready).await;

    for key in ["ord-1", "ord-2", "ord-3", "ord-4"] {
        let err = broker_gateway::BrokerSession::request(
            &s.handle,
            BrokerRequest::QueryOrder {
                account_id: support::account(),
                broker_order_id: None,
                local_order_id: LocalOrderId::from(key),
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert_eq!(err, GatewayError::Timeout("query_order".to_string()));
    }
    // each new request clears the ones timed out before it
    assert_eq!(s.handle.in_flight(), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(s.handle.in_flight(), 0);
    assert_eq!(s.handle.state(), Ready);
}

#[tokio::test(start_paused = true)]
async fn snapshot_answer_is_staged_in_stream_order() {
    let mut s = session(|c| c.set_fill_mode(FillMode::Manual));
    s.handle.start().await.unwrap();
    s.wait_for(Ready).await;

    let id = LocalOrderId::from("ord-9");
    broker_gateway::BrokerSession::send(
        &s.handle,
        BrokerRequest::PlaceOrder(support::market("ord-9", Side::Buy, dec!(10))),
    )
    .await
    .unwrap();
    s.control.fill_after_snapshot(&id, dec!(4));

    let handle = s.handle.clone();
    let snapshot = tokio::spawn(async move {
        broker_gateway::BrokerSession::snapshot(
            &handle,
            &support::account(),
            None,
            Duration::from_secs(5),
        )
        .await
    });

    let mut before = Vec::new();
    let reply = loop {
        match s.events.recv().await.expect("pipeline open") {
            PipelineMessage::Event(BrokerEvent::Order(order)) => before.push(order.status),
            PipelineMessage::Snapshot { snapshot, reply } => {
                assert_eq!(snapshot.account_id, support::account());
                break reply;
            }
            _ => {}
        }
    };
    assert_eq!(before, vec![OrderStatus::Submitted]);

    let after = loop {
        if let PipelineMessage::Event(BrokerEvent::Order(order)) =
            s.events.recv().await.expect("pipeline open")
        {
            break order;
        }
    };
    assert_eq!(after.status, OrderStatus::PartiallyFilled);
    assert_eq!(after.filled_quantity, dec!(4));

    reply.send(Ok(SnapshotOutcome::default())).unwrap();
    assert_eq!(snapshot.await.unwrap(), Ok(SnapshotOutcome::default()));
    assert_eq!(s.handle.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn subscriptions_are_restored_after_reconnect() {
    let mut h = Harness::start(support::config()).await;
    h.ready().await;

    h.gateway
        .market_data()
        .subscribe(MarketDataSubscription {
            instrument: "SPY".into(),
            depth: false,
        })
        .await
        .unwrap();
    assert_eq!(h.control.subscriptions(), vec![InstrumentKey::from("SPY")]);

    h.control.drop_connection();
    h.wait_for(Reconnecting).await;
    assert!(h.control.subscriptions().is_empty());
    h.ready().await;

    assert_eq!(h.control.subscriptions(), vec![InstrumentKey::from("SPY")]);
    assert_eq!(h.control.sent_count("subscribe_market_data"), 2);

    h.drain();
    assert_eq!(h.control.publish_quotes(), 1);
    support::settle().await;
    assert!(
        h.drain()
            .iter()
            .any(|e| matches!(e, broker_gateway::domain::events::BrokerEvent::Quote(_)))
    );
}

#[tokio::test(start_paused = true)]
async fn subscription_made_while_down_is_sent_on_ready() {
    let h = Harness::start_in(support::config(), tempfile::tempdir().unwrap(), |c| {
        c.refuse_connects(1);
    })
    .await;
    h.wait_for(Reconnecting).await;

    let err = h
        .gateway
        .market_data()
        .subscribe(MarketDataSubscription {
            instrument: "QQQ".into(),
            depth: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::NotConnected(Reconnecting));

    h.ready().await;
    assert_eq!(h.control.subscriptions(), vec![InstrumentKey::from("QQQ")]);
}
